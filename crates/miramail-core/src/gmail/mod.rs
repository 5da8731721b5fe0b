pub mod attachment;
pub mod client;
pub mod flow;
pub mod label;
pub mod mailbox;
pub mod message;
pub mod mime_builder;
pub mod oauth;
pub mod parser;
pub mod types;

pub use attachment::{
    Attachment, AttachmentData, AttachmentError, AttachmentPolicy, AttachmentSource,
};
pub use client::{GmailClient, GmailClientError, ListParams};
pub use flow::{FlowError, load_or_authorize, run_installed_app_flow};
pub use label::{Label, LabelListVisibility, LabelRef, MessageListVisibility};
pub use mailbox::{Mailbox, MailboxError, MessageQuery, OutgoingMessage, ThreadQuery};
pub use message::{Draft, Message, Thread};
pub use oauth::{
    ClientSecrets, DEFAULT_REFRESH_BUFFER, DEFAULT_SCOPES, FileTokenStore, Grant, NoopTokenStore,
    OAuthError, OAuthTokens, TokenEndpoint, TokenStore,
};
pub use parser::{ParsedMessage, Recipient, parse_message};
