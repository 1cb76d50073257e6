//! LLM error types.

use thiserror::Error;

/// Errors from LLM providers.
#[derive(Debug, Error)]
pub enum LLMError {
    /// Provider-side error response
    #[error("api error: {0}")]
    Api(String),

    /// Network/connection failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Throttled by the provider
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Completion arrived empty
    #[error("empty response")]
    EmptyResponse,

    /// Response body did not match the provider's schema
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),
}

impl LLMError {
    /// Whether a retry is worthwhile: network hiccups, throttling, and
    /// timeouts are; schema and auth problems are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LLMError::Connection(_) | LLMError::RateLimited(_) | LLMError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LLMError::RateLimited("slow down".into()).is_transient());
        assert!(LLMError::Timeout.is_transient());
        assert!(!LLMError::Authentication("bad key".into()).is_transient());
        assert!(!LLMError::InvalidResponse("not json".into()).is_transient());
    }
}
