//! Error taxonomy for invocations and the provider boundary.
//!
//! Classification drives retry: only [`InvokeError::is_transient`] errors
//! are eligible, and only until the configured retry budget runs out. User
//! errors, dead letters, and fatal transport errors surface immediately.

use crate::wire::ErrorPayload;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The remote function itself raised. Never retried.
    #[error("function error [{name}]: {message}")]
    Function {
        name: String,
        message: String,
        stack: Option<String>,
        extra: BTreeMap<String, String>,
        log_url: Option<String>,
    },

    /// Network, throttling, 5xx, queue timeout. Retried under the policy.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Authentication, quota exhaustion, malformed request. Not retried.
    #[error("fatal transport error: {0}")]
    Fatal(String),

    /// No response within the deadline; retryable until the budget runs out.
    #[error("function timed out after {elapsed:?} (limit {timeout:?})")]
    FunctionTimeout { elapsed: Duration, timeout: Duration },

    /// The provider gave up delivering after its own retries.
    #[error("dead letter: {message}")]
    DeadLetter { message: String, log_url: Option<String> },

    /// Induced by `stop`; the exact message callers match on.
    #[error("Rejected pending request")]
    RejectedPendingRequest,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InvokeError {
    /// Eligible for another attempt, budget permitting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::FunctionTimeout { .. })
    }

    /// Surfaced to the caller as-is; no retry will ever help.
    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::RejectedPendingRequest)
    }

    /// Remote log URL, when the provider supplied one for this failure.
    pub fn log_url(&self) -> Option<&str> {
        match self {
            Self::Function { log_url, .. } | Self::DeadLetter { log_url, .. } => {
                log_url.as_deref()
            }
            _ => None,
        }
    }

    /// Build the user-error variant from a wire payload. Only string-valued
    /// extra properties survive.
    pub fn from_payload(payload: ErrorPayload, log_url: Option<String>) -> Self {
        Self::Function {
            extra: payload.string_properties(),
            name: payload.name,
            message: payload.message,
            stack: payload.stack,
            log_url,
        }
    }
}

/// Errors surfacing from a provider driver, classified at the boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("fatal provider error: {0}")]
    Fatal(String),
    #[error("provider operation cancelled")]
    Cancelled,
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<DriverError> for InvokeError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Transient(msg) => Self::Transient(msg),
            DriverError::Fatal(msg) => Self::Fatal(msg),
            DriverError::Cancelled => Self::RejectedPendingRequest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(InvokeError::Transient("503".into()).is_transient());
        assert!(InvokeError::FunctionTimeout {
            elapsed: Duration::from_secs(61),
            timeout: Duration::from_secs(60)
        }
        .is_transient());
        assert!(!InvokeError::Fatal("bad credentials".into()).is_transient());
        assert!(!InvokeError::RejectedPendingRequest.is_transient());
        assert!(!InvokeError::DeadLetter { message: "gone".into(), log_url: None }
            .is_transient());
    }

    #[test]
    fn terminal_is_the_complement_of_transient() {
        let errors = [
            InvokeError::Transient("reset by peer".into()),
            InvokeError::Fatal("quota exhausted".into()),
            InvokeError::FunctionTimeout {
                elapsed: Duration::from_secs(61),
                timeout: Duration::from_secs(60),
            },
            InvokeError::DeadLetter { message: "gone".into(), log_url: None },
            InvokeError::RejectedPendingRequest,
        ];
        for err in &errors {
            assert_eq!(err.is_terminal(), !err.is_transient(), "{:?}", err);
        }
        assert!(InvokeError::Fatal("bad credentials".into()).is_terminal());
        assert!(!InvokeError::Transient("503".into()).is_terminal());
    }

    #[test]
    fn cancellation_message_is_stable() {
        assert_eq!(InvokeError::RejectedPendingRequest.to_string(), "Rejected pending request");
    }

    #[test]
    fn user_error_carries_log_url_and_extras() {
        let err = InvokeError::from_payload(
            ErrorPayload {
                name: "RangeError".into(),
                message: "out of range".into(),
                stack: Some("at fn".into()),
                extra: BTreeMap::from([("code".to_owned(), serde_json::json!("E42"))]),
            },
            Some("https://logs.example/abc".into()),
        );
        assert_eq!(err.log_url(), Some("https://logs.example/abc"));
        match err {
            InvokeError::Function { name, extra, .. } => {
                assert_eq!(name, "RangeError");
                assert_eq!(extra.get("code").map(String::as_str), Some("E42"));
            }
            other => panic!("expected Function, got {:?}", other),
        }
    }

    #[test]
    fn driver_errors_convert() {
        assert!(matches!(
            InvokeError::from(DriverError::Transient("x".into())),
            InvokeError::Transient(_)
        ));
        assert!(matches!(
            InvokeError::from(DriverError::Cancelled),
            InvokeError::RejectedPendingRequest
        ));
    }
}
