use serde_json::Value;
use thiserror::Error;

/// Error taxonomy for every boundary of the client.
///
/// Public APIs return `anyhow::Result`; callers that need the kind recover it
/// with `err.downcast_ref::<UtcpError>()`. The enum is `Clone` so a stream
/// that hit a terminal error can replay the same error on later `next` calls.
#[derive(Error, Debug, Clone)]
pub enum UtcpError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unresolved variable: ${{{0}}}")]
    UnresolvedVariable(String),
    #[error("unknown provider kind: {0}")]
    UnknownProviderKind(String),
    #[error("provider '{provider}' is not a {expected} provider")]
    TransportKindMismatch {
        provider: String,
        expected: &'static str,
    },
    #[error("provider not found: {0}")]
    ProviderNotFound(String),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("discovery failed for provider '{provider}': {reason}")]
    DiscoveryFailed { provider: String, reason: String },
    #[error("tool call failed: {message}")]
    CallFailed {
        message: String,
        /// Remote-reported error payload, when the wire carried one.
        payload: Option<Value>,
    },
    #[error("transport error (provider '{provider}'): {reason}")]
    TransportError { provider: String, reason: String },
    #[error("response payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOp(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl UtcpError {
    pub fn call_failed(message: impl Into<String>) -> Self {
        UtcpError::CallFailed {
            message: message.into(),
            payload: None,
        }
    }

    pub fn transport(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        UtcpError::TransportError {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn discovery(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        UtcpError::DiscoveryFailed {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

/// Extract the typed error kind from an `anyhow` chain, if present.
pub fn as_utcp_error(err: &anyhow::Error) -> Option<&UtcpError> {
    err.downcast_ref::<UtcpError>()
}
