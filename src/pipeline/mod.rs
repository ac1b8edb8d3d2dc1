pub mod types;
pub mod ledger;
pub mod retry;
pub mod cache;
pub mod stats;
pub mod preprocess;
pub mod prompt;
pub mod parser;
pub mod fallback;
pub mod image_analysis;
pub mod notes_analysis;
pub mod combine;
pub mod structuring;
pub mod specialized;
pub mod confidence;
pub mod orchestrator;
pub mod ollama;

pub use types::*;
pub use ledger::*;
pub use retry::*;
pub use cache::*;
pub use stats::*;
pub use preprocess::*;
pub use parser::*;
pub use combine::*;
pub use structuring::*;
pub use specialized::*;
pub use confidence::*;
pub use orchestrator::*;
pub use ollama::*;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a failed analyzer call. Drives retry and degradation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimit,
    Timeout,
    Authentication,
    ServerError,
    Connection,
    Unknown,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Authentication => "authentication",
            ProviderErrorKind::ServerError => "server_error",
            ProviderErrorKind::Connection => "connection",
            ProviderErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a free-form provider error message into a category.
/// Providers that surface structured status codes should map those directly;
/// this is the last resort for opaque message strings.
pub fn classify_provider_message(message: &str) -> ProviderErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
        ProviderErrorKind::RateLimit
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ProviderErrorKind::Timeout
    } else if lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("api key")
        || lower.contains("401")
        || lower.contains("403")
    {
        ProviderErrorKind::Authentication
    } else if lower.contains("500") || lower.contains("502") || lower.contains("503") || lower.contains("internal server") {
        ProviderErrorKind::ServerError
    } else if lower.contains("connect") || lower.contains("connection refused") || lower.contains("dns") {
        ProviderErrorKind::Connection
    } else {
        ProviderErrorKind::Unknown
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("analyzer response parsing failed: {0}")]
    Parse(String),

    #[error("image processing error: {0}")]
    Image(String),

    #[error("run deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("pipeline failed in both passes — primary: {primary}; fallback: {fallback}")]
    Pipeline { primary: String, fallback: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    /// Shorthand for a categorized provider failure.
    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        AnalysisError::Provider {
            kind,
            message: message.into(),
        }
    }

    /// Only provider failures are worth retrying; validation and parse
    /// failures are deterministic and I/O failures are handled per call site.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::Provider { .. })
    }

    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            AnalysisError::Provider { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_messages() {
        assert_eq!(
            classify_provider_message("HTTP 429 Too Many Requests"),
            ProviderErrorKind::RateLimit
        );
    }

    #[test]
    fn classifies_timeout_messages() {
        assert_eq!(
            classify_provider_message("request timed out after 30s"),
            ProviderErrorKind::Timeout
        );
    }

    #[test]
    fn classifies_auth_messages() {
        assert_eq!(
            classify_provider_message("invalid API key supplied"),
            ProviderErrorKind::Authentication
        );
    }

    #[test]
    fn classifies_connection_messages() {
        assert_eq!(
            classify_provider_message("connection refused by host"),
            ProviderErrorKind::Connection
        );
    }

    #[test]
    fn unrecognized_messages_are_unknown() {
        assert_eq!(
            classify_provider_message("something odd happened"),
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn only_provider_errors_are_retryable() {
        assert!(AnalysisError::provider(ProviderErrorKind::Timeout, "slow").is_retryable());
        assert!(!AnalysisError::Validation("no images".into()).is_retryable());
        assert!(!AnalysisError::Parse("bad json".into()).is_retryable());
    }
}
