pub mod config;
pub mod gmail;
pub mod llm;
pub mod reply;
pub mod responder;
pub mod telemetry;

pub use config::Config;
pub use reply::{LlmReplyGenerator, ReplyError, ReplyGenerator, ReplyPrompt};
pub use responder::{
    RespondStats, Responder, ResponderError, ResponderStatus, SendMode, run_responder,
};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
