//! Error taxonomy for the broker
//!
//! Every remote-facing failure is surfaced to the caller verbatim; nothing
//! is silently retried. `Internal` is the only variant that maps to a 500.

use thiserror::Error;

/// Errors produced by the session registry and the SSH connection layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// SSH authentication was rejected by the remote host.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// No usable credential: the key file is missing and the agent has none.
    #[error("ssh key unavailable: {0}")]
    KeyUnavailable(String),

    /// TCP connect or name resolution failed.
    #[error("host unreachable: {0}")]
    NetworkUnreachable(String),

    /// A remote-facing call exceeded its deadline.
    #[error("operation timed out after {0}s")]
    Timeout(u64),

    /// The request referenced a session id the registry does not know.
    #[error("session not found")]
    SessionNotFound,

    /// The session was closed (explicitly or by the reaper); open again.
    #[error("session is closed")]
    SessionClosed,

    /// A shell operation was attempted before the PTY was attached.
    #[error("interactive shell not started")]
    ShellNotStarted,

    /// PTY attach or shell I/O failed.
    #[error("shell error: {0}")]
    Shell(String),

    /// The policy engine refused the command. Always audited.
    #[error("command blocked: {reason}")]
    SecurityBlocked { reason: String, command: String },

    /// Programming or OS failure. Logged with context, never leaks credentials.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    /// Classify an ssh2 error raised during connection establishment.
    pub(crate) fn from_auth(err: ssh2::Error) -> Self {
        BrokerError::AuthFailure(err.message().to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BrokerError::SessionNotFound.to_string(),
            "session not found"
        );
        assert_eq!(BrokerError::Timeout(30).to_string(), "operation timed out after 30s");

        let blocked = BrokerError::SecurityBlocked {
            reason: "full disk wipe risk".to_string(),
            command: "dd if=/dev/zero of=/dev/sda".to_string(),
        };
        assert_eq!(blocked.to_string(), "command blocked: full disk wipe risk");
    }
}
