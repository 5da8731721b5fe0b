pub mod error;
pub mod mock;
pub mod types;

pub use error::LLMError;
pub use mock::MockLLMClient;
pub use types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genai::chat::{ChatMessage as GenaiMessage, ChatOptions, ChatRequest, ChatResponse};
use genai::{Client as GenaiClient, Error as GenaiError, webc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::{debug, warn};

use crate::config::ModelConfig;

/// Anything that can turn a chat prompt into a completion.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;
}

#[async_trait]
impl<T: LLMClient + ?Sized> LLMClient for Arc<T> {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        (**self).complete(request).await
    }
}

/// The provider call behind [`GenaiLLMClient`], split out so tests can stand in for it.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        request: ChatRequest,
        options: &ChatOptions,
    ) -> Result<ChatResponse, GenaiError>;
}

#[async_trait]
impl ChatBackend for GenaiClient {
    async fn chat(
        &self,
        model: &str,
        request: ChatRequest,
        options: &ChatOptions,
    ) -> Result<ChatResponse, GenaiError> {
        self.exec_chat(model, request, Some(options)).await
    }
}

/// Completions through the genai crate. Provider keys are read by genai from
/// its usual environment variables (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, ...).
pub struct GenaiLLMClient {
    backend: Arc<dyn ChatBackend>,
    model: String,
}

impl GenaiLLMClient {
    pub fn new(model: &ModelConfig) -> Self {
        Self::with_backend(model, Arc::new(GenaiClient::default()))
    }

    pub fn with_backend(model: &ModelConfig, backend: Arc<dyn ChatBackend>) -> Self {
        // genai routes "provider::model" to that provider's adapter.
        let model = match model.provider.trim() {
            "" => model.model.clone(),
            provider => format!("{}::{}", provider.to_lowercase(), model.model),
        };
        Self { backend, model }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LLMClient for GenaiLLMClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let options = ChatOptions::default()
            .with_temperature(f64::from(request.temperature))
            .with_max_tokens(request.max_tokens);
        let chat = ChatRequest::from_messages(request.messages.iter().map(to_genai).collect());

        let started = Instant::now();
        let response = self
            .backend
            .chat(&self.model, chat, &options)
            .await
            .map_err(|err| {
                let err = classify(err);
                warn!(model = %self.model, error = %err, "reply completion failed");
                err
            })?;

        let usage = &response.usage;
        let completion = CompletionResponse {
            content: response.first_text().unwrap_or_default().to_string(),
            model: response.provider_model_iden.to_string(),
            input_tokens: usage.prompt_tokens.map_or(0, |n| n.max(0) as u32),
            output_tokens: usage.completion_tokens.map_or(0, |n| n.max(0) as u32),
        };
        debug!(
            model = %completion.model,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reply completion"
        );
        Ok(completion)
    }
}

fn to_genai(message: &ChatMessage) -> GenaiMessage {
    match message.role {
        ChatRole::System => GenaiMessage::system(message.content.clone()),
        ChatRole::User => GenaiMessage::user(message.content.clone()),
    }
}

/// Sorts genai failures into the cases the responder treats differently.
fn classify(err: GenaiError) -> LLMError {
    match err {
        GenaiError::RequiresApiKey { .. }
        | GenaiError::NoAuthResolver { .. }
        | GenaiError::NoAuthData { .. } => LLMError::Unauthorized,
        GenaiError::WebAdapterCall { webc_error, .. }
        | GenaiError::WebModelCall { webc_error, .. } => classify_http(webc_error),
        other => LLMError::Failed(other.to_string()),
    }
}

fn classify_http(err: webc::Error) -> LLMError {
    match err {
        webc::Error::ResponseFailedStatus {
            status, headers, ..
        } => match status {
            StatusCode::TOO_MANY_REQUESTS => LLMError::RateLimited {
                retry_after: retry_after(&headers),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LLMError::Unauthorized,
            status => LLMError::Failed(format!("provider answered {status}")),
        },
        webc::Error::Reqwest(err) if err.is_timeout() => LLMError::Timeout,
        other => LLMError::Failed(other.to_string()),
    }
}

/// `Retry-After` in either of its forms: delta seconds or an HTTP date.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use genai::chat::{MessageContent, Usage};
    use genai::{ModelIden, adapter::AdapterKind};
    use reqwest::header::HeaderValue;
    use std::sync::Mutex;

    fn model_config(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.1,
            max_output_tokens: 1024,
        }
    }

    /// Answers every chat with one canned result and keeps what it was asked.
    struct CannedBackend {
        answer: Mutex<Option<Result<ChatResponse, GenaiError>>>,
        seen: Mutex<Vec<(String, ChatRequest, ChatOptions)>>,
    }

    impl CannedBackend {
        fn new(answer: Result<ChatResponse, GenaiError>) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(answer)),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for CannedBackend {
        async fn chat(
            &self,
            model: &str,
            request: ChatRequest,
            options: &ChatOptions,
        ) -> Result<ChatResponse, GenaiError> {
            self.seen
                .lock()
                .unwrap()
                .push((model.to_string(), request, options.clone()));
            self.answer
                .lock()
                .unwrap()
                .take()
                .expect("backend called once")
        }
    }

    fn status_error(status: StatusCode, headers: HeaderMap) -> GenaiError {
        GenaiError::WebModelCall {
            model_iden: ModelIden::new(AdapterKind::OpenAI, "gpt-4o-mini"),
            webc_error: webc::Error::ResponseFailedStatus {
                status,
                body: String::new(),
                headers: Box::new(headers),
            },
        }
    }

    fn thread_request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![
                ChatMessage::system("write a reply"),
                ChatMessage::user("<p>Can we meet on Friday?</p>"),
            ],
            temperature: 0.1,
            max_tokens: 256,
        }
    }

    #[test]
    fn model_is_prefixed_with_lowercase_provider() {
        let client = GenaiLLMClient::new(&model_config("OpenAI"));
        assert_eq!(client.model(), "openai::gpt-4o-mini");

        let client = GenaiLLMClient::new(&model_config(" "));
        assert_eq!(client.model(), "gpt-4o-mini");
    }

    #[tokio::test]
    async fn complete_sends_thread_and_reads_reply() {
        let backend = CannedBackend::new(Ok(ChatResponse {
            content: MessageContent::from_text("<p>Friday works.</p>"),
            reasoning_content: None,
            model_iden: ModelIden::new(AdapterKind::OpenAI, "gpt-4o-mini"),
            provider_model_iden: ModelIden::new(AdapterKind::OpenAI, "gpt-4o-mini-2024"),
            usage: Usage {
                prompt_tokens: Some(12),
                completion_tokens: Some(-1),
                ..Default::default()
            },
            captured_raw_body: None,
        }));
        let client = GenaiLLMClient::with_backend(&model_config("openai"), backend.clone());

        let completion = client.complete(thread_request()).await.expect("reply");
        assert_eq!(completion.content, "<p>Friday works.</p>");
        assert_eq!((completion.input_tokens, completion.output_tokens), (12, 0));
        assert!(completion.model.contains("gpt-4o-mini-2024"));

        let seen = backend.seen.lock().unwrap();
        let (model, request, options) = &seen[0];
        assert_eq!(model, "openai::gpt-4o-mini");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(
            request.messages[1].content.first_text(),
            Some("<p>Can we meet on Friday?</p>")
        );
        assert_eq!(options.max_tokens, Some(256));
        assert!((options.temperature.unwrap_or_default() - 0.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn too_many_requests_becomes_rate_limit_with_hint() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        let backend = CannedBackend::new(Err(status_error(StatusCode::TOO_MANY_REQUESTS, headers)));
        let client = GenaiLLMClient::with_backend(&model_config("openai"), backend);

        let err = client.complete(thread_request()).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn other_failures_are_classified_by_reaction() {
        assert!(matches!(
            classify(status_error(StatusCode::FORBIDDEN, HeaderMap::new())),
            LLMError::Unauthorized
        ));
        assert!(matches!(
            classify(status_error(StatusCode::BAD_GATEWAY, HeaderMap::new())),
            LLMError::Failed(msg) if msg.contains("502")
        ));
        assert!(matches!(
            classify(GenaiError::RequiresApiKey {
                model_iden: ModelIden::new(AdapterKind::OpenAI, "gpt-4o-mini"),
            }),
            LLMError::Unauthorized
        ));
        assert!(matches!(
            classify(GenaiError::Internal("no choices".into())),
            LLMError::Failed(_)
        ));
    }

    #[test]
    fn retry_after_accepts_seconds_and_ignores_past_dates() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 120 "));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(120)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }
}
