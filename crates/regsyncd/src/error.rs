//! Error types for regsyncd
//!
//! Failure taxonomy for the reconciliation engine. Only `Connection`
//! escalates to the supervisor's reconnect loop; everything else is logged
//! and handled at the call site without aborting the channel.

use thiserror::Error;

/// Errors that can occur in regsyncd
#[derive(Debug, Error)]
pub enum RegsyncError {
    /// Management channel unreachable or authentication rejected.
    /// Fatal for the channel; the supervisor reconnects.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A remote action returned a failure response.
    #[error("Action '{action}' failed: {message}")]
    ActionFailure {
        /// The AMI action name (e.g., "PJSIPRegister").
        action: String,
        /// Failure message text from the response, if any.
        message: String,
    },

    /// The peer is not speaking the management protocol (for example a
    /// wrong or missing handshake banner). Malformed individual records
    /// after the handshake are dropped instead, keeping the channel up.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An action did not complete within the bounded wait.
    /// Treated identically to `ActionFailure` by callers.
    #[error("Action '{action}' timed out after {secs}s")]
    Timeout {
        /// The AMI action name.
        action: String,
        /// The configured timeout in seconds.
        secs: u64,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegsyncError {
    /// True if this failure means the channel itself is dead and the
    /// supervisor must reconnect.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, RegsyncError::Connection(_))
    }
}

/// Result type alias for regsyncd operations
pub type Result<T> = std::result::Result<T, RegsyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_failure_display() {
        let err = RegsyncError::ActionFailure {
            action: "PJSIPRegister".to_string(),
            message: "Registration not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Action 'PJSIPRegister' failed: Registration not found"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = RegsyncError::Timeout {
            action: "PJSIPUnregister".to_string(),
            secs: 5,
        };
        assert!(err.to_string().contains("timed out after 5s"));
    }

    #[test]
    fn test_connection_loss_predicate() {
        assert!(RegsyncError::Connection("eof".into()).is_connection_loss());
        assert!(!RegsyncError::Protocol("bad record".into()).is_connection_loss());
    }
}
