//! The auto-reply flow: read unread threads, generate a reply for each and
//! send it (or save it as a draft).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::gmail::attachment::AttachmentPolicy;
use crate::gmail::label;
use crate::gmail::mailbox::{Mailbox, MailboxError, OutgoingMessage, ThreadQuery};
use crate::gmail::message::Thread;
use crate::gmail::oauth::TokenStore;
use crate::gmail::parser::split_addresses;
use crate::reply::{ReplyError, ReplyGenerator, strip_html, truncate_text};

const PREVIEW_LENGTH: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    Send,
    #[default]
    Draft,
}

#[derive(Debug, Error)]
#[error("unknown send mode `{0}` (expected `send` or `draft`)")]
pub struct ParseSendModeError(String);

impl FromStr for SendMode {
    type Err = ParseSendModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "send" => Ok(Self::Send),
            "draft" => Ok(Self::Draft),
            _ => Err(ParseSendModeError(s.to_string())),
        }
    }
}

impl fmt::Display for SendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "send",
            Self::Draft => "draft",
        })
    }
}

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("failed to generate reply: {0}")]
    Reply(#[from] ReplyError),
}

/// Counters for one pass over the unread threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RespondStats {
    pub threads: usize,
    pub replied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Shared view of the responder loop, read by the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponderStatus {
    pub passes: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub last_stats: Option<RespondStats>,
    pub last_error: Option<String>,
}

enum ThreadOutcome {
    Replied,
    Skipped,
}

pub struct Responder<S: TokenStore> {
    mailbox: Mailbox<S>,
    send_mode: SendMode,
    query: Option<String>,
}

impl<S: TokenStore> Responder<S> {
    pub fn new(mailbox: Mailbox<S>, send_mode: SendMode) -> Self {
        Self {
            mailbox,
            send_mode,
            query: None,
        }
    }

    /// Narrows the unread threads with an extra Gmail search expression.
    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.trim().is_empty());
        self
    }

    pub fn send_mode(&self) -> SendMode {
        self.send_mode
    }

    /// Replies to every unread thread once.
    #[instrument(skip_all, fields(send_mode = %self.send_mode))]
    pub async fn respond<G>(&self, generator: &G) -> Result<RespondStats, ResponderError>
    where
        G: ReplyGenerator + ?Sized,
    {
        let mut query =
            ThreadQuery::with_labels(&[label::UNREAD]).attachments(AttachmentPolicy::Ignore);
        query.query = self.query.clone();

        let threads = self.mailbox.get_threads(&query).await?;
        let mut stats = RespondStats {
            threads: threads.len(),
            ..RespondStats::default()
        };

        for thread in threads {
            let thread_id = thread.id.clone();
            match self.handle_thread(thread, generator).await {
                Ok(ThreadOutcome::Replied) => stats.replied += 1,
                Ok(ThreadOutcome::Skipped) => stats.skipped += 1,
                Err(ResponderError::Reply(ReplyError::Llm(err))) if err.is_rate_limited() => {
                    warn!(
                        thread_id = %thread_id,
                        retry_after_secs = err.retry_after().map(|d| d.as_secs()),
                        "llm rate limited; leaving remaining threads for the next pass"
                    );
                    stats.failed += 1;
                    break;
                }
                Err(err) => {
                    error!(thread_id = %thread_id, error = %err, "failed to reply to thread");
                    stats.failed += 1;
                }
            }
        }

        info!(
            threads = stats.threads,
            replied = stats.replied,
            skipped = stats.skipped,
            failed = stats.failed,
            "responder pass complete"
        );
        Ok(stats)
    }

    #[instrument(skip_all, fields(thread_id = %thread.id))]
    async fn handle_thread<G>(
        &self,
        mut thread: Thread,
        generator: &G,
    ) -> Result<ThreadOutcome, ResponderError>
    where
        G: ReplyGenerator + ?Sized,
    {
        let bodies: Vec<String> = thread
            .messages
            .iter()
            .filter_map(|m| m.body().map(str::to_string))
            .collect();
        let Some(last) = thread.last_message() else {
            debug!("thread has no messages");
            return Ok(ThreadOutcome::Skipped);
        };

        info!(from = %last.sender, snippet = %last.snippet, "replying to thread");
        let reply = generator.generate(&bodies).await?;
        debug!(preview = %truncate_text(&strip_html(&reply), PREVIEW_LENGTH), "generated reply");

        let in_reply_to = last
            .message_id_header()
            .map(str::to_string)
            .unwrap_or_else(|| last.id.clone());
        let references: Vec<String> = last
            .header("References")
            .map(|refs| refs.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let thread_id = if last.thread_id.is_empty() {
            thread.id.clone()
        } else {
            last.thread_id.clone()
        };

        let outgoing = OutgoingMessage {
            sender: split_addresses(&last.recipient)
                .into_iter()
                .next()
                .unwrap_or_default(),
            to: last.sender.clone(),
            subject: last.subject.clone(),
            plain: Some(strip_html(&reply)),
            html: Some(reply),
            references,
            in_reply_to: Some(in_reply_to),
            thread_id: Some(thread_id),
            ..OutgoingMessage::default()
        };

        // Claim the thread before delivering so a later failure cannot lead to a second reply.
        let unread: Vec<usize> = thread
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_label(label::UNREAD))
            .map(|(idx, _)| idx)
            .collect();
        let mut claimed = Vec::with_capacity(unread.len());
        for idx in unread {
            if let Err(err) = self.mailbox.mark_as_read(&mut thread.messages[idx]).await {
                self.restore_unread(&mut thread, &claimed).await;
                return Err(err.into());
            }
            claimed.push(idx);
        }

        let delivered = match self.send_mode {
            SendMode::Send => self.mailbox.send_message(outgoing).await.map(|sent| {
                info!(message_id = %sent.id, "reply sent");
            }),
            SendMode::Draft => self.mailbox.create_draft(outgoing).await.map(|draft| {
                info!(draft_id = %draft.id, "reply drafted");
            }),
        };
        match delivered {
            Ok(()) => {}
            Err(MailboxError::Refetch { id, source }) => {
                warn!(message_id = %id, error = %source, "reply stored but not read back");
            }
            Err(err) => {
                self.restore_unread(&mut thread, &claimed).await;
                return Err(err.into());
            }
        }

        Ok(ThreadOutcome::Replied)
    }

    async fn restore_unread(&self, thread: &mut Thread, claimed: &[usize]) {
        for &idx in claimed {
            let message = &mut thread.messages[idx];
            if let Err(err) = self.mailbox.mark_as_unread(message).await {
                error!(
                    message_id = %message.id,
                    error = %err,
                    "could not restore UNREAD; thread will not be retried"
                );
            }
        }
    }
}

/// Runs [`Responder::respond`] every `interval` until `shutdown` fires.
pub async fn run_responder<S, G>(
    responder: Responder<S>,
    generator: Arc<G>,
    interval: Duration,
    shutdown: CancellationToken,
    status: Arc<RwLock<ResponderStatus>>,
) where
    S: TokenStore,
    G: ReplyGenerator + ?Sized,
{
    info!(
        interval_secs = interval.as_secs(),
        send_mode = %responder.send_mode,
        "responder started"
    );
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let result = responder.respond(&*generator).await;
        {
            let mut status = status.write().await;
            status.passes += 1;
            status.last_pass_at = Some(Utc::now());
            match result {
                Ok(stats) => {
                    status.last_stats = Some(stats);
                    status.last_error = None;
                }
                Err(err) => {
                    warn!(error = %err, "responder pass failed");
                    status.last_error = Some(err.to_string());
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
    info!("responder stopped");
}
