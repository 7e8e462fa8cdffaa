//! Error types for connector operations.
//!
//! Errors are classified by how the runtime reacts to them:
//! - transient errors are offered to a [`RetryPolicy`](crate::RetryPolicy)
//! - stale credentials get one forced retry
//! - an invalid resource invalidates the pooled adapter
//! - fatal and configuration errors surface immediately

use crate::retry::Outcome;
use thiserror::Error;

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by pools, retry execution and runtimes
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Transient failure (connection refused, timeout, broker busy)
    #[error("Retryable error: {message}")]
    Retryable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Transport-level status, e.g. an HTTP response code
    #[error("Transport returned status {code}: {message}")]
    Status { code: u16, message: String },

    /// Credentials were rejected and need to be refreshed
    #[error("Authentication is stale: {0}")]
    AuthenticationStale(String),

    /// An asynchronous operation has not completed yet
    #[error("Operation still pending: {0}")]
    Pending(String),

    /// A pooled resource is known broken and must be rebuilt
    #[error("Resource invalid: {message}")]
    ResourceInvalid {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Unrecoverable failure
    #[error("Fatal error: {message}")]
    Fatal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A message payload the sink cannot process
    #[error("Invalid data: {message}")]
    InvalidData { message: String, payload: Vec<u8> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Rejected before any transport call was made
    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: u64 },

    /// The retry policy stopped permitting attempts
    #[error("Retries exhausted after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<ConnectorError>,
    },

    /// An operation was attempted from a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Singleton lease for {0} is not held by this instance")]
    SingletonNotHeld(String),

    #[error("Adapter pool has been shut down")]
    PoolClosed,

    #[error("Operation cancelled")]
    Cancelled,

    /// Independent failures collected while continuing past each one
    #[error("{context}: {} error(s), first: {}", .errors.len(), first_message(.errors))]
    Multiple {
        context: String,
        errors: Vec<ConnectorError>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn first_message(errors: &[ConnectorError]) -> String {
    errors
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl ConnectorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            source: None,
        }
    }

    pub fn retryable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Retryable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            source: None,
        }
    }

    pub fn fatal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Fatal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn resource_invalid(message: impl Into<String>) -> Self {
        Self::ResourceInvalid {
            message: message.into(),
            source: None,
        }
    }

    pub fn resource_invalid_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ResourceInvalid {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Collapse a list of independent failures. Returns `Ok` when empty and
    /// the error itself when there is exactly one.
    pub fn aggregate(
        context: impl Into<String>,
        mut errors: Vec<ConnectorError>,
    ) -> ConnectorResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple {
                context: context.into(),
                errors,
            }),
        }
    }

    /// Classify the error for a retry policy. `None` means the error must
    /// not be retried at all.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Retryable { .. } => Some(Outcome::Transient),
            Self::Status { code, .. } => Some(Outcome::Status(*code)),
            Self::AuthenticationStale(_) => Some(Outcome::AuthStale),
            Self::Pending(_) => Some(Outcome::Pending),
            _ => None,
        }
    }

    /// Check if the error can be offered to a retry policy
    pub fn is_retryable(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn is_invalid_data(&self) -> bool {
        matches!(self, Self::InvalidData { .. })
    }

    /// Check if a pooled resource involved in the failure must be discarded
    pub fn is_resource_invalid(&self) -> bool {
        matches!(self, Self::ResourceInvalid { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Errors that end a listener consumer instead of being absorbed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Fatal { .. } | Self::Config(_) | Self::ResourceInvalid { .. } | Self::PoolClosed
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retryable { .. } => "retryable",
            Self::Status { .. } => "status",
            Self::AuthenticationStale(_) => "auth_stale",
            Self::Pending(_) => "pending",
            Self::ResourceInvalid { .. } => "resource_invalid",
            Self::Fatal { .. } => "fatal",
            Self::Config(_) => "config",
            Self::InvalidData { .. } => "invalid_data",
            Self::Serialization(_) => "serialization",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::InvalidState(_) => "invalid_state",
            Self::SingletonNotHeld(_) => "singleton_not_held",
            Self::PoolClosed => "pool_closed",
            Self::Cancelled => "cancelled",
            Self::Multiple { .. } => "multiple",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert_eq!(
            ConnectorError::retryable("refused").outcome(),
            Some(Outcome::Transient)
        );
        assert_eq!(
            ConnectorError::status(503, "busy").outcome(),
            Some(Outcome::Status(503))
        );
        assert_eq!(
            ConnectorError::AuthenticationStale("expired".into()).outcome(),
            Some(Outcome::AuthStale)
        );
        assert!(ConnectorError::fatal("boom").outcome().is_none());
        assert!(ConnectorError::config("bad").outcome().is_none());
        assert!(ConnectorError::resource_invalid("broken pipe").outcome().is_none());
    }

    #[test]
    fn test_aggregate() {
        assert!(ConnectorError::aggregate("close", vec![]).is_ok());

        let single = ConnectorError::aggregate("close", vec![ConnectorError::fatal("a")]);
        assert!(matches!(single, Err(ConnectorError::Fatal { .. })));

        let many = ConnectorError::aggregate(
            "close consumers",
            vec![ConnectorError::fatal("a"), ConnectorError::retryable("b")],
        )
        .unwrap_err();
        let text = many.to_string();
        assert!(text.contains("close consumers"));
        assert!(text.contains("2 error(s)"));
    }

    #[test]
    fn test_retry_exhausted_keeps_cause() {
        let err = ConnectorError::RetryExhausted {
            attempts: 3,
            source: Box::new(ConnectorError::status(502, "bad gateway")),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("Transport returned status 502: bad gateway")
        );
    }
}
