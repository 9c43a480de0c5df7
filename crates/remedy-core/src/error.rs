use chrono::{DateTime, Utc};

/// Error taxonomy for the substrate.
///
/// Retryability is a property of the kind, not of the call site: I/O wrappers
/// consult [`Error::is_retryable`] and everything else propagates through
/// `anyhow` with this type at the root.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("rate limited: {reason}")]
    RateLimited {
        reason: String,
        /// Preferred delay from the upstream `retry-after`, if present.
        retry_after_ms: Option<u64>,
    },

    #[error("invalid transition: {entity} {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {operation} after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("circuit '{operation}' open until {reopen_at}")]
    CircuitOpen {
        operation: String,
        reopen_at: DateTime<Utc>,
    },

    #[error("agent provider error: {0}")]
    AgentProvider(String),

    #[error("version control error: {0}")]
    VersionControl(String),

    #[error("feedback parse error: {0}")]
    FeedbackParse(String),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Kinds the retry wrapper is allowed to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::Timeout { .. }
        )
    }

    /// Short machine-readable kind label for user-visible failure lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::Network(_) => "network",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::AgentProvider(_) => "agent_provider",
            Self::VersionControl(_) => "version_control",
            Self::FeedbackParse(_) => "feedback_parse",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Whether an `anyhow` chain bottoms out in a retryable kind.
///
/// Foreign errors (reqwest, io) that did not come through this taxonomy are
/// classified by their message as a last resort: connection resets, socket
/// timeouts and 429s read as transient.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(e) = err.downcast_ref::<Error>() {
        return e.is_retryable();
    }
    let msg = err.to_string().to_lowercase();
    ["connection reset", "connection refused", "timed out", "timeout", "rate limit", "429", "temporarily unavailable", "socket"]
        .iter()
        .any(|p| msg.contains(p))
}

/// Extract a `retry-after` hint (milliseconds) from an error chain, if any.
pub fn retry_after_ms(err: &anyhow::Error) -> Option<u64> {
    match err.downcast_ref::<Error>() {
        Some(Error::RateLimited { retry_after_ms, .. }) => *retry_after_ms,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout { operation: "agent".into(), elapsed_ms: 1 }.is_retryable());
        assert!(Error::RateLimited { reason: "429".into(), retry_after_ms: None }.is_retryable());
        assert!(!Error::CircuitOpen { operation: "host-api".into(), reopen_at: Utc::now() }.is_retryable());
        assert!(!Error::Storage("disk".into()).is_retryable());
        assert!(!Error::InvalidTransition { entity: "issue", from: "merged".into(), to: "queued".into() }.is_retryable());
    }

    #[test]
    fn classifies_foreign_errors_by_message() {
        let err = anyhow::anyhow!("Connection reset by peer");
        assert!(is_retryable(&err));
        let err = anyhow::anyhow!("no such file");
        assert!(!is_retryable(&err));
    }

    #[test]
    fn retry_after_surfaces_through_anyhow() {
        let err = anyhow::Error::new(Error::RateLimited {
            reason: "too many requests".into(),
            retry_after_ms: Some(7_000),
        });
        assert_eq!(retry_after_ms(&err), Some(7_000));
    }
}
