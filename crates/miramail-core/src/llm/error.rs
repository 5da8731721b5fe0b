use std::time::Duration;

use thiserror::Error;

/// Failures of a reply completion, grouped by how the responder reacts.
#[derive(Debug, Error)]
pub enum LLMError {
    /// The provider throttled us. The current pass stops here.
    #[error("llm provider rate limited the request{}", RetryHint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("llm provider rejected the credentials")]
    Unauthorized,
    #[error("llm request timed out")]
    Timeout,
    /// Any other failure. The thread stays unread and is tried again next pass.
    #[error("llm request failed: {0}")]
    Failed(String),
}

impl LLMError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

struct RetryHint<'a>(&'a Option<Duration>);

impl std::fmt::Display for RetryHint<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(wait) => write!(f, ", retry in {}s", wait.as_secs()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_carry_a_retry_hint() {
        let limited = LLMError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(
            limited.to_string(),
            "llm provider rate limited the request, retry in 30s"
        );

        let bare = LLMError::RateLimited { retry_after: None };
        assert_eq!(bare.to_string(), "llm provider rate limited the request");

        assert!(!LLMError::Timeout.is_rate_limited());
        assert_eq!(LLMError::Failed("boom".into()).retry_after(), None);
    }
}
