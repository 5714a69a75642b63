use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MailError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Authentication failed: {response}")]
    Auth {
        /// Server response code (e.g. "AUTHENTICATIONFAILED"), when present.
        code: Option<String>,
        /// Human-readable server response text.
        response: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MailError>;

impl MailError {
    /// True for faults worth retrying: timeouts, resets, refused
    /// connections, DNS failures, unreachable hosts, dropped sockets.
    /// Authentication and protocol errors are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            MailError::Timeout(_) => true,
            MailError::Network(msg) => is_transient_message(msg),
            _ => false,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, MailError::Auth { .. })
    }

    pub fn auth(response: impl Into<String>) -> Self {
        MailError::Auth {
            code: None,
            response: response.into(),
        }
    }
}

/// Message-level classification of the transient error set.
pub fn is_transient_message(msg: &str) -> bool {
    const TRANSIENT: &[&str] = &[
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "connection aborted",
        "connection lost",
        "broken pipe",
        "socket hang up",
        "host unreachable",
        "network unreachable",
        "dns error",
        "failed to lookup",
        "name or service not known",
        "temporary failure in name resolution",
    ];
    let lower = msg.to_ascii_lowercase();
    TRANSIENT.iter().any(|p| lower.contains(p))
}

impl From<std::io::Error> for MailError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                MailError::Timeout(err.to_string())
            }
            _ => MailError::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MailError {
    fn from(err: serde_json::Error) -> Self {
        MailError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_set_matches() {
        assert!(is_transient_message("Connection reset by peer"));
        assert!(is_transient_message("operation timed out"));
        assert!(is_transient_message("Connection refused (os error 111)"));
        assert!(is_transient_message(
            "failed to lookup address information"
        ));
        assert!(is_transient_message("socket hang up"));
        assert!(!is_transient_message("invalid credentials"));
        assert!(!is_transient_message("BAD command syntax"));
    }

    #[test]
    fn auth_errors_never_transient() {
        let err = MailError::auth("[AUTHENTICATIONFAILED] Invalid credentials");
        assert!(!err.is_transient());
        assert!(err.is_auth_failure());
    }

    #[test]
    fn io_timeout_maps_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err: MailError = io.into();
        assert!(matches!(err, MailError::Timeout(_)));
        assert!(err.is_transient());
    }
}
