use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LLMClient, LLMError};

/// Scripted client for tests. Responses are returned in the order queued and
/// every request is recorded.
#[derive(Debug, Default, Clone)]
pub struct MockLLMClient {
    responses: Arc<Mutex<VecDeque<Result<CompletionResponse, LLMError>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    call_count: Arc<AtomicUsize>,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, response: Result<CompletionResponse, LLMError>) {
        let mut guard = self.responses.lock().expect("lock responses");
        guard.push_back(response);
    }

    /// Queues a successful completion with the given text.
    pub fn enqueue_text(&self, content: impl Into<String>) {
        self.enqueue_response(Ok(CompletionResponse {
            content: content.into(),
            model: "mock".into(),
            input_tokens: 0,
            output_tokens: 0,
        }));
    }

    /// Returns the number of times `complete` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("lock requests").clone()
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("lock requests").push(request);
        let mut guard = self.responses.lock().expect("lock responses");
        guard.pop_front().unwrap_or_else(|| {
            Err(LLMError::Failed("no scripted response left".to_string()))
        })
    }
}
