use std::collections::BTreeMap;
use std::fmt;

use crate::gmail::attachment::{Attachment, AttachmentPolicy};
use crate::gmail::parser::parse_message;
use crate::gmail::types;

/// A fetched and decoded Gmail message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub user_id: String,
    pub id: String,
    pub thread_id: String,
    /// Raw `To` header.
    pub recipient: String,
    /// Raw `From` header.
    pub sender: String,
    pub subject: String,
    pub date: String,
    pub snippet: String,
    pub plain: Option<String>,
    pub html: Option<String>,
    pub label_ids: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub headers: BTreeMap<String, String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

impl Message {
    pub fn from_gmail(user_id: &str, message: &types::Message, policy: AttachmentPolicy) -> Self {
        let parsed = parse_message(message, policy);
        let attachments = parsed
            .attachments
            .into_iter()
            .map(|part| Attachment {
                user_id: user_id.to_string(),
                message_id: message.id.clone(),
                id: part.attachment_id,
                filename: part.filename,
                filetype: part.filetype,
                data: part.data,
            })
            .collect();

        Self {
            user_id: user_id.to_string(),
            id: message.id.clone(),
            thread_id: message.thread_id.clone().unwrap_or_default(),
            recipient: parsed.recipient,
            sender: parsed.sender,
            subject: parsed.subject,
            date: parsed.date,
            snippet: parsed.snippet,
            plain: parsed.plain,
            html: parsed.html,
            label_ids: message.label_ids.clone(),
            attachments,
            headers: parsed.headers,
            cc: parsed.cc,
            bcc: parsed.bcc,
        }
    }

    /// Looks up a header by name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The RFC 5322 `Message-ID`, if the message carried one.
    pub fn message_id_header(&self) -> Option<&str> {
        self.header("Message-ID")
    }

    /// The HTML body when present, otherwise the plain one.
    pub fn body(&self) -> Option<&str> {
        self.html.as_deref().or(self.plain.as_deref())
    }

    pub fn has_label(&self, label_id: &str) -> bool {
        self.label_ids.iter().any(|id| id == label_id)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message(to: {}, from: {}, id: {})",
            self.recipient, self.sender, self.id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub user_id: String,
    pub id: String,
    pub snippet: String,
    pub messages: Vec<Message>,
}

impl Thread {
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread(id: {}, messages: {})", self.id, self.messages.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub user_id: String,
    pub id: String,
    pub message: Message,
}
