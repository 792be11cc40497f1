use thiserror::Error;

/// Errors surfaced by an [`LlmProvider`](crate::provider::LlmProvider) adapter.
///
/// This is the only error type the pipeline core's LLM step is aware of; a
/// concrete provider adapter (HTTP client, provider-specific wire format) is
/// expected to map its own failures onto these variants at the boundary.
#[derive(Error, Debug)]
pub enum LLMError {
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("response format error: {message} (raw: {raw_response})")]
    ResponseFormatError {
        message: String,
        raw_response: String,
    },

    #[error("JSON error: {0}")]
    JsonError(String),

    #[error("rate limited, retry after {retry_after_ms:?}ms: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}
