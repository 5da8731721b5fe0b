use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use mail_builder::MessageBuilder;
use mail_builder::headers::address::Address;
use mail_builder::headers::message_id::MessageId;
use thiserror::Error;

use crate::gmail::parser::{Recipient, parse_recipient, parse_recipient_list};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub email: String,
    pub name: Option<String>,
}

impl EmailAddress {
    pub fn new(name: Option<impl Into<String>>, email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.map(|n| n.into()),
        }
    }

    /// Parses a single `Name <addr>` or bare address header value.
    pub fn parse(value: &str) -> Option<Self> {
        parse_recipient(value).map(Self::from)
    }

    /// Parses a comma-separated address header value.
    pub fn parse_list(value: &str) -> Vec<Self> {
        parse_recipient_list(value)
            .into_iter()
            .map(Self::from)
            .collect()
    }
}

impl From<Recipient> for EmailAddress {
    fn from(recipient: Recipient) -> Self {
        Self {
            email: recipient.email,
            name: recipient.name,
        }
    }
}

impl From<&str> for EmailAddress {
    fn from(email: &str) -> Self {
        Self {
            email: email.to_string(),
            name: None,
        }
    }
}

impl From<String> for EmailAddress {
    fn from(email: String) -> Self {
        Self { email, name: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// An outgoing message before it is rendered to RFC 5322.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeMessage {
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<MimeAttachment>,
}

impl MimeMessage {
    pub fn to_rfc822(self) -> Result<String, MimeBuildError> {
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(MimeBuildError::MissingRecipients);
        }

        let body_plain = self.body_plain.filter(|body| !body.is_empty());
        let body_html = self.body_html.filter(|body| !body.is_empty());
        if body_plain.is_none() && body_html.is_none() && self.attachments.is_empty() {
            return Err(MimeBuildError::MissingBody);
        }

        let mut builder = MessageBuilder::new();
        if let Some(from) = &self.from {
            builder = builder.from(to_header_address(from));
        }
        if !self.to.is_empty() {
            builder = builder.to(address_list(&self.to));
        }
        if !self.cc.is_empty() {
            builder = builder.cc(address_list(&self.cc));
        }
        if !self.bcc.is_empty() {
            builder = builder.bcc(address_list(&self.bcc));
        }
        builder = builder.subject(self.subject.unwrap_or_default());
        if let Some(body) = body_plain {
            builder = builder.text_body(body);
        }
        if let Some(body) = body_html {
            builder = builder.html_body(body);
        }

        let in_reply_to = self.in_reply_to.as_deref().and_then(normalize_message_id);
        if let Some(reply_to) = &in_reply_to {
            builder = builder.in_reply_to(MessageId::new(reply_to.clone()));
        }
        let references = combined_references(&self.references, in_reply_to.as_deref());
        if !references.is_empty() {
            builder = builder.references(MessageId::from(references));
        }

        for attachment in self.attachments {
            let content_type = if attachment.content_type.is_empty() {
                DEFAULT_CONTENT_TYPE.to_string()
            } else {
                attachment.content_type
            };
            builder = builder.attachment(content_type, attachment.filename, attachment.data);
        }

        builder.write_to_string().map_err(MimeBuildError::Io)
    }

    /// Renders the message base64url-encoded, as the Gmail `raw` field expects.
    pub fn to_base64_url(self) -> Result<String, MimeBuildError> {
        let raw = self.to_rfc822()?;
        Ok(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }
}

#[derive(Debug, Error)]
pub enum MimeBuildError {
    #[error("at least one recipient is required")]
    MissingRecipients,
    #[error("a body or attachment is required")]
    MissingBody,
    #[error("failed to build message: {0}")]
    Io(#[from] std::io::Error),
}

fn to_header_address(addr: &EmailAddress) -> Address<'static> {
    Address::new_address(addr.name.clone(), addr.email.clone())
}

fn address_list(addrs: &[EmailAddress]) -> Address<'static> {
    Address::new_list(addrs.iter().map(to_header_address).collect())
}

/// Strips whitespace and angle brackets; `None` when nothing is left.
pub fn normalize_message_id(id: &str) -> Option<String> {
    let trimmed = id.trim().trim_matches('<').trim_matches('>');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Normalizes and de-duplicates ids, keeping the first occurrence of each.
pub fn dedup_message_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for normalized in ids.iter().filter_map(|id| normalize_message_id(id)) {
        if !seen.contains(&normalized) {
            seen.push(normalized);
        }
    }
    seen
}

fn combined_references(existing: &[String], in_reply_to: Option<&str>) -> Vec<String> {
    let mut all_ids = existing.to_vec();
    all_ids.extend(in_reply_to.map(str::to_string));
    dedup_message_ids(all_ids)
}

/// Guesses a MIME type from a file extension.
pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("htm" | "html") => "text/html",
        Some("csv") => "text/csv",
        Some("md") => "text/markdown",
        Some("ics") => "text/calendar",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("ppt") => "application/vnd.ms-powerpoint",
        Some("pptx") => {
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        }
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
