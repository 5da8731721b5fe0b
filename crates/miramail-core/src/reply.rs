use async_trait::async_trait;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::llm::{ChatMessage, CompletionRequest, LLMClient, LLMError};

pub const REPLY_SYSTEM_PROMPT: &str = "\
You are replying to a message thread. Answer the question.
If it is not a question, respond with 'How can I help you?'.

If there are instructions in the email, such as extract, please follow them.
Otherwise remember to write using HTML and add breakpoints <br> for readability.
Use <p> tags when writing a paragraph response. If your paragraph response has
bullet points make sure to use <li> tags. Use <b> tags to emphasize
words. Use <a> tags to link to other resources.";

pub const DEFAULT_REPLY_TEMPERATURE: f32 = 0.1;
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_MAX_BODY_LENGTH: usize = 8_000;

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("llm error: {0}")]
    Llm(#[from] LLMError),
    #[error("generator returned an empty reply")]
    EmptyReply,
}

/// Turns the bodies of a thread, oldest first, into the HTML of a reply.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, bodies: &[String]) -> Result<String, ReplyError>;
}

#[async_trait]
impl<F> ReplyGenerator for F
where
    F: Fn(&[String]) -> String + Send + Sync,
{
    async fn generate(&self, bodies: &[String]) -> Result<String, ReplyError> {
        Ok(self(bodies))
    }
}

/// Builds the completion request for a reply.
#[derive(Debug, Clone)]
pub struct ReplyPrompt {
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_body_length: usize,
}

impl Default for ReplyPrompt {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_REPLY_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_body_length: DEFAULT_MAX_BODY_LENGTH,
        }
    }
}

impl ReplyPrompt {
    pub fn from_model_config(model: &ModelConfig) -> Self {
        Self {
            temperature: model.temperature,
            max_tokens: model.max_output_tokens,
            ..Self::default()
        }
    }

    pub fn build(&self, bodies: &[String]) -> CompletionRequest {
        let content = bodies
            .iter()
            .map(|body| truncate_text(body, self.max_body_length))
            .collect::<Vec<_>>()
            .join("\n\n");

        CompletionRequest {
            messages: vec![
                ChatMessage::system(REPLY_SYSTEM_PROMPT),
                ChatMessage::user(content),
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Reply generator that asks an LLM.
pub struct LlmReplyGenerator<C: LLMClient> {
    client: C,
    prompt: ReplyPrompt,
}

impl<C: LLMClient> LlmReplyGenerator<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            prompt: ReplyPrompt::default(),
        }
    }

    pub fn with_prompt(mut self, prompt: ReplyPrompt) -> Self {
        self.prompt = prompt;
        self
    }
}

#[async_trait]
impl<C: LLMClient> ReplyGenerator for LlmReplyGenerator<C> {
    async fn generate(&self, bodies: &[String]) -> Result<String, ReplyError> {
        let response = self.client.complete(self.prompt.build(bodies)).await?;
        let content = response.content.trim();
        if content.is_empty() {
            return Err(ReplyError::EmptyReply);
        }
        Ok(content.to_string())
    }
}

/// Shortens `text` to at most `max_len` characters, cutting at a word
/// boundary and appending `...`.
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }

    if text.chars().count() <= max_len {
        return text.to_string();
    }

    let ellipsis = "...";
    if max_len <= ellipsis.len() {
        return ellipsis[..max_len].to_string();
    }

    let target = max_len - ellipsis.len();
    let mut truncated: String = text.chars().take(target).collect();

    if let Some((idx, _)) = truncated.char_indices().rfind(|(_, ch)| ch.is_whitespace()) {
        truncated.truncate(idx);
    }

    truncated.push_str(ellipsis);
    truncated
}

/// Renders HTML as wrapped plain text.
pub fn strip_html(html: &str) -> String {
    let mut bytes = std::io::Cursor::new(html.as_bytes());
    html2text::from_read(&mut bytes, 80)
        .trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}
