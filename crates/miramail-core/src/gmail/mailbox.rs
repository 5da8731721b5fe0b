//! High-level mailbox operations built on [`GmailClient`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::gmail::attachment::{Attachment, AttachmentError, AttachmentPolicy, AttachmentSource};
use crate::gmail::client::{GmailClient, GmailClientError, ListParams};
use crate::gmail::label::{self, Label, LabelListVisibility, LabelRef, MessageListVisibility};
use crate::gmail::message::{Draft, Message, Thread};
use crate::gmail::mime_builder::{EmailAddress, MimeBuildError, MimeMessage};
use crate::gmail::oauth::TokenStore;
use crate::gmail::parser::decode_base64url;
use crate::gmail::types::{self, CreateLabelRequest};

pub const DEFAULT_FETCH_CONCURRENCY: usize = 12;

static SENDER_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".+\s<(?P<addr>.+@.+\..+)>").expect("sender regex compiles"));

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error(transparent)]
    Client(#[from] GmailClientError),
    #[error("failed to build message: {0}")]
    Mime(#[from] MimeBuildError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("label change on message {message_id} did not apply (labels now {label_ids:?})")]
    LabelMismatch {
        message_id: String,
        label_ids: Vec<String>,
    },
    #[error("gmail response is missing {0}")]
    MissingField(&'static str),
    /// Gmail accepted the message but reading it back failed.
    #[error("message {id} was stored but could not be fetched: {source}")]
    Refetch {
        id: String,
        #[source]
        source: Box<MailboxError>,
    },
}

/// Filters for thread and message listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub labels: Vec<String>,
    pub query: Option<String>,
    pub attachments: AttachmentPolicy,
    pub include_spam_trash: bool,
}

pub type ThreadQuery = ListQuery;
pub type MessageQuery = ListQuery;

impl ListQuery {
    pub fn with_labels<L: LabelRef>(labels: &[L]) -> Self {
        Self {
            labels: label::label_ids(labels),
            ..Self::default()
        }
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn attachments(mut self, policy: AttachmentPolicy) -> Self {
        self.attachments = policy;
        self
    }

    pub fn include_spam_trash(mut self, include: bool) -> Self {
        self.include_spam_trash = include;
        self
    }

    fn params<'a>(&'a self, page_token: Option<&'a str>) -> ListParams<'a> {
        ListParams {
            q: self.query.as_deref(),
            label_ids: &self.labels,
            page_token,
            include_spam_trash: self.include_spam_trash,
            max_results: None,
        }
    }
}

/// A message to send or save as a draft.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    /// `From` header; also used to look up the signature.
    pub sender: String,
    /// `To` header, one or more comma-separated addresses.
    pub to: String,
    pub subject: String,
    pub html: Option<String>,
    pub plain: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub references: Vec<String>,
    pub in_reply_to: Option<String>,
    pub attachments: Vec<AttachmentSource>,
    /// Append the sender's Gmail signature to the HTML body.
    pub signature: bool,
    pub thread_id: Option<String>,
}

pub struct Mailbox<S: TokenStore> {
    client: Arc<GmailClient<S>>,
    fetch_concurrency: usize,
}

impl<S: TokenStore> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            fetch_concurrency: self.fetch_concurrency,
        }
    }
}

impl<S: TokenStore> Mailbox<S> {
    pub fn new(client: GmailClient<S>) -> Self {
        Self {
            client: Arc::new(client),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    pub fn with_fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        self.fetch_concurrency = fetch_concurrency.max(1);
        self
    }

    pub fn client(&self) -> &GmailClient<S> {
        &self.client
    }

    fn user_id(&self) -> &str {
        self.client.user_id()
    }

    /// Lists every matching thread, following pagination, then fetches them
    /// concurrently. Results keep the listing order.
    #[instrument(skip(self), fields(labels = ?query.labels))]
    pub async fn get_threads(&self, query: &ThreadQuery) -> Result<Vec<Thread>, MailboxError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_threads(query.params(page_token.as_deref()))
                .await?;
            ids.extend(page.threads.into_iter().map(|t| t.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(count = ids.len(), "listed threads");

        stream::iter(ids)
            .map(|id| async move { self.get_thread(&id, query.attachments).await })
            .buffered(self.fetch_concurrency)
            .try_collect()
            .await
    }

    pub async fn get_thread(
        &self,
        thread_id: &str,
        policy: AttachmentPolicy,
    ) -> Result<Thread, MailboxError> {
        let thread = self.client.get_thread(thread_id).await?;
        let mut messages = Vec::with_capacity(thread.messages.len());
        for raw in &thread.messages {
            messages.push(self.build_message(raw, policy).await?);
        }

        Ok(Thread {
            user_id: self.user_id().to_string(),
            id: thread.id,
            snippet: thread.snippet.unwrap_or_default(),
            messages,
        })
    }

    #[instrument(skip(self), fields(labels = ?query.labels))]
    pub async fn get_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, MailboxError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_messages(query.params(page_token.as_deref()))
                .await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(count = ids.len(), "listed messages");

        stream::iter(ids)
            .map(|id| async move { self.get_message(&id, query.attachments).await })
            .buffered(self.fetch_concurrency)
            .try_collect()
            .await
    }

    pub async fn get_message(
        &self,
        message_id: &str,
        policy: AttachmentPolicy,
    ) -> Result<Message, MailboxError> {
        let raw = self.client.get_message(message_id).await?;
        self.build_message(&raw, policy).await
    }

    pub async fn get_unread_inbox(
        &self,
        policy: AttachmentPolicy,
    ) -> Result<Vec<Message>, MailboxError> {
        let query = MessageQuery::with_labels(&[label::INBOX, label::UNREAD]).attachments(policy);
        self.get_messages(&query).await
    }

    pub async fn get_unread_messages(
        &self,
        policy: AttachmentPolicy,
    ) -> Result<Vec<Message>, MailboxError> {
        self.get_messages(&MessageQuery::with_labels(&[label::UNREAD]).attachments(policy))
            .await
    }

    pub async fn get_starred_messages(
        &self,
        policy: AttachmentPolicy,
    ) -> Result<Vec<Message>, MailboxError> {
        self.get_messages(&MessageQuery::with_labels(&[label::STARRED]).attachments(policy))
            .await
    }

    pub async fn get_sent_messages(
        &self,
        policy: AttachmentPolicy,
    ) -> Result<Vec<Message>, MailboxError> {
        self.get_messages(&MessageQuery::with_labels(&[label::SENT]).attachments(policy))
            .await
    }

    pub async fn get_drafts(&self, policy: AttachmentPolicy) -> Result<Vec<Draft>, MailboxError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.client.list_drafts(page_token.as_deref()).await?;
            ids.extend(page.drafts.into_iter().map(|d| d.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        stream::iter(ids)
            .map(|id| async move { self.get_draft(&id, policy).await })
            .buffered(self.fetch_concurrency)
            .try_collect()
            .await
    }

    pub async fn get_draft(
        &self,
        draft_id: &str,
        policy: AttachmentPolicy,
    ) -> Result<Draft, MailboxError> {
        let draft = self.client.get_draft(draft_id).await?;
        Ok(Draft {
            user_id: self.user_id().to_string(),
            id: draft.id,
            message: self.build_message(&draft.message, policy).await?,
        })
    }

    async fn build_message(
        &self,
        raw: &types::Message,
        policy: AttachmentPolicy,
    ) -> Result<Message, MailboxError> {
        let mut message = Message::from_gmail(self.user_id(), raw, policy);
        if policy == AttachmentPolicy::Download {
            for attachment in &mut message.attachments {
                self.download_attachment(attachment).await?;
            }
        }
        Ok(message)
    }

    async fn refetch(&self, id: &str) -> Result<Message, MailboxError> {
        self.get_message(id, AttachmentPolicy::Reference)
            .await
            .map_err(|err| MailboxError::Refetch {
                id: id.to_string(),
                source: Box::new(err),
            })
    }

    /// Sends a message and returns it as Gmail stored it.
    #[instrument(skip_all, fields(to = %outgoing.to, thread_id = ?outgoing.thread_id))]
    pub async fn send_message(&self, outgoing: OutgoingMessage) -> Result<Message, MailboxError> {
        let thread_id = outgoing.thread_id.clone();
        let raw = self.compose(outgoing).await?;
        let sent = self.client.send_message(&raw, thread_id.as_deref()).await?;
        self.refetch(&sent.id).await
    }

    #[instrument(skip_all, fields(to = %outgoing.to, thread_id = ?outgoing.thread_id))]
    pub async fn create_draft(&self, outgoing: OutgoingMessage) -> Result<Draft, MailboxError> {
        let thread_id = outgoing.thread_id.clone();
        let raw = self.compose(outgoing).await?;
        let draft = self.client.create_draft(&raw, thread_id.as_deref()).await?;
        let message = self.refetch(&draft.message.id).await?;
        Ok(Draft {
            user_id: self.user_id().to_string(),
            id: draft.id,
            message,
        })
    }

    /// Renders an outgoing message into the base64url `raw` form.
    async fn compose(&self, outgoing: OutgoingMessage) -> Result<String, MailboxError> {
        let mut html = outgoing.html;
        if outgoing.signature {
            let address = sender_address(&outgoing.sender);
            let alias = self.client.get_send_as(address).await?;
            let mut body = html.unwrap_or_default();
            body.push_str("<br /><br />");
            body.push_str(&alias.signature);
            html = Some(body);
        }

        let mut attachments = Vec::with_capacity(outgoing.attachments.len());
        for source in outgoing.attachments {
            attachments.push(source.into_mime().await?);
        }

        let mime = MimeMessage {
            from: EmailAddress::parse(&outgoing.sender),
            to: EmailAddress::parse_list(&outgoing.to),
            cc: outgoing
                .cc
                .iter()
                .flat_map(|addr| EmailAddress::parse_list(addr))
                .collect(),
            bcc: outgoing
                .bcc
                .iter()
                .flat_map(|addr| EmailAddress::parse_list(addr))
                .collect(),
            subject: Some(outgoing.subject),
            body_plain: outgoing.plain,
            body_html: html,
            in_reply_to: outgoing.in_reply_to,
            references: outgoing.references,
            attachments,
        };
        Ok(mime.to_base64_url()?)
    }

    /// Applies label changes and checks Gmail reports the expected result.
    pub async fn modify_labels(
        &self,
        message: &mut Message,
        add: &[String],
        remove: &[String],
    ) -> Result<(), MailboxError> {
        let updated = self.client.modify_message(&message.id, add, remove).await?;
        let applied = add.iter().all(|id| updated.label_ids.contains(id))
            && remove.iter().all(|id| !updated.label_ids.contains(id));
        if !applied {
            return Err(MailboxError::LabelMismatch {
                message_id: message.id.clone(),
                label_ids: updated.label_ids,
            });
        }

        message.label_ids = updated.label_ids;
        Ok(())
    }

    pub async fn add_label(
        &self,
        message: &mut Message,
        label: impl LabelRef,
    ) -> Result<(), MailboxError> {
        self.add_labels(message, &[label]).await
    }

    pub async fn add_labels<L: LabelRef>(
        &self,
        message: &mut Message,
        labels: &[L],
    ) -> Result<(), MailboxError> {
        self.modify_labels(message, &label::label_ids(labels), &[])
            .await
    }

    pub async fn remove_label(
        &self,
        message: &mut Message,
        label: impl LabelRef,
    ) -> Result<(), MailboxError> {
        self.remove_labels(message, &[label]).await
    }

    pub async fn remove_labels<L: LabelRef>(
        &self,
        message: &mut Message,
        labels: &[L],
    ) -> Result<(), MailboxError> {
        self.modify_labels(message, &[], &label::label_ids(labels))
            .await
    }

    pub async fn mark_as_read(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.remove_label(message, label::UNREAD).await
    }

    pub async fn mark_as_unread(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.add_label(message, label::UNREAD).await
    }

    pub async fn mark_as_spam(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.add_label(message, label::SPAM).await
    }

    pub async fn mark_as_not_spam(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.remove_label(message, label::SPAM).await
    }

    pub async fn mark_as_important(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.add_label(message, label::IMPORTANT).await
    }

    pub async fn mark_as_not_important(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.remove_label(message, label::IMPORTANT).await
    }

    pub async fn star(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.add_label(message, label::STARRED).await
    }

    pub async fn unstar(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.remove_label(message, label::STARRED).await
    }

    pub async fn move_to_inbox(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.add_label(message, label::INBOX).await
    }

    pub async fn archive(&self, message: &mut Message) -> Result<(), MailboxError> {
        self.remove_label(message, label::INBOX).await
    }

    /// Moves a message out of the inbox and under `to`.
    pub async fn move_from_inbox(
        &self,
        message: &mut Message,
        to: impl LabelRef,
    ) -> Result<(), MailboxError> {
        self.modify_labels(
            message,
            &[to.label_id().to_string()],
            &[label::INBOX.to_string()],
        )
        .await
    }

    pub async fn trash(&self, message: &mut Message) -> Result<(), MailboxError> {
        let updated = self.client.trash_message(&message.id).await?;
        if !updated.label_ids.iter().any(|id| id == label::TRASH) {
            return Err(MailboxError::LabelMismatch {
                message_id: message.id.clone(),
                label_ids: updated.label_ids,
            });
        }
        message.label_ids = updated.label_ids;
        Ok(())
    }

    pub async fn untrash(&self, message: &mut Message) -> Result<(), MailboxError> {
        let updated = self.client.untrash_message(&message.id).await?;
        if updated.label_ids.iter().any(|id| id == label::TRASH) {
            return Err(MailboxError::LabelMismatch {
                message_id: message.id.clone(),
                label_ids: updated.label_ids,
            });
        }
        message.label_ids = updated.label_ids;
        Ok(())
    }

    pub async fn list_labels(&self) -> Result<Vec<Label>, MailboxError> {
        let response = self.client.list_labels().await?;
        Ok(response.labels.into_iter().map(Label::from).collect())
    }

    pub async fn create_label(
        &self,
        name: &str,
        message_list_visibility: Option<MessageListVisibility>,
        label_list_visibility: Option<LabelListVisibility>,
    ) -> Result<Label, MailboxError> {
        let request = CreateLabelRequest {
            name: name.to_string(),
            message_list_visibility: message_list_visibility.map(|v| v.as_wire().to_string()),
            label_list_visibility: label_list_visibility.map(|v| v.as_wire().to_string()),
        };
        let created = self.client.create_label(&request).await?;
        Ok(Label::from(created))
    }

    pub async fn delete_label(&self, label: impl LabelRef) -> Result<(), MailboxError> {
        self.client.delete_label(label.label_id()).await?;
        Ok(())
    }

    /// Fetches attachment bytes unless they are already present.
    pub async fn download_attachment(
        &self,
        attachment: &mut Attachment,
    ) -> Result<(), MailboxError> {
        if attachment.is_downloaded() {
            return Ok(());
        }

        let body = self
            .client
            .get_attachment(&attachment.message_id, &attachment.id)
            .await?;
        let data = body
            .data
            .as_deref()
            .and_then(decode_base64url)
            .ok_or(MailboxError::MissingField("attachment data"))?;
        attachment.data = Some(data);
        Ok(())
    }

    /// Downloads if needed, then writes the attachment to disk.
    pub async fn save_attachment(
        &self,
        attachment: &mut Attachment,
        path: Option<&Path>,
        overwrite: bool,
    ) -> Result<PathBuf, MailboxError> {
        self.download_attachment(attachment).await?;
        Ok(attachment.save(path, overwrite).await?)
    }
}

/// Extracts `addr` from `Name <addr>`; anything else is returned unchanged.
pub fn sender_address(sender: &str) -> &str {
    SENDER_ADDRESS
        .captures(sender)
        .and_then(|caps| caps.name("addr"))
        .map(|m| m.as_str())
        .unwrap_or(sender)
}
