use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for sift.
#[derive(Error, Debug)]
pub enum AppError {
    /// An oracle call exceeded its deadline.
    #[error("Oracle call timed out after {0:?}")]
    OracleTimeout(Duration),

    /// The oracle answered, but the answer could not be understood.
    #[error("Oracle protocol error: {0}")]
    OracleProtocolError(String),

    /// The oracle billed the call but its answer was unusable.
    #[error("Malformed oracle answer ({tokens} tokens billed): {message}")]
    MalformedAnswer { message: String, tokens: u64 },

    /// A synthesized or persisted pattern does not compile.
    #[error("Invalid pattern `{pattern}`: {message}")]
    PatternSyntaxError { pattern: String, message: String },

    /// A job references text that was never supplied.
    #[error("No source text supplied for document '{0}'")]
    MissingInputError(String),

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Rule persistence failed.
    #[error("Rule store error: {0}")]
    StoreError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying by the caller.
    ///
    /// The pipeline itself never retries; failed oracle calls log this so
    /// callers know whether redoing the batch can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::OracleTimeout(_)
            | AppError::RateLimitExceeded => true,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Tokens the provider charged for a call that still failed.
    pub fn billed_tokens(&self) -> u64 {
        match self {
            AppError::MalformedAnswer { tokens, .. } => *tokens,
            _ => 0,
        }
    }
}
