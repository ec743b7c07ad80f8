use std::borrow::Cow;
use std::fmt;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Status code returned across the host command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum Status {
    Ok,
    False,
    Error(i32),
}

impl Status {
    /// Generic failure code used when no more specific code is known.
    pub const E_FAIL: Status = Status::Error(0x8000_4005_u32 as i32);

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "S_OK"),
            Status::False => write!(f, "S_FALSE"),
            Status::Error(code) => write!(f, "0x{:08X}", *code as u32),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum BridgeError {
    #[error("Malformed launch options: {0}")]
    #[diagnostic(
        code(sdb_bridge::malformed_options),
        help("The launch payload must be JSON with at least `exe`, `host` and `port`.")
    )]
    MalformedOptions(Cow<'static, str>),

    #[error("Invalid attach request: {0}")]
    #[diagnostic(code(sdb_bridge::invalid_attach))]
    InvalidAttachRequest(Cow<'static, str>),

    #[error("Connection to target failed after {attempts} attempt(s): {reason}")]
    #[diagnostic(code(sdb_bridge::connection_failed))]
    ConnectionFailed { attempts: u32, reason: String },

    #[error("Protocol misuse: {0}")]
    #[diagnostic(code(sdb_bridge::protocol_misuse))]
    ProtocolMisuse(Cow<'static, str>),

    #[error("Failed to create and register thread {thread_id}: {reason}")]
    #[diagnostic(code(sdb_bridge::thread_registration_failed))]
    ThreadRegistrationFailed { thread_id: i64, reason: String },

    #[error("Failed to package session: {0}")]
    #[diagnostic(code(sdb_bridge::serialization_failed))]
    SerializationFailed(String),

    #[error("Transport token is corrupt: {0}")]
    #[diagnostic(
        code(sdb_bridge::transport_corrupt),
        help("Tokens are only valid for the launch that produced them.")
    )]
    TransportCorrupt(String),

    #[error("Transport token has already been claimed")]
    #[diagnostic(code(sdb_bridge::token_already_claimed))]
    TokenAlreadyClaimed,

    #[error("Remote session call failed: {0}")]
    #[diagnostic(code(sdb_bridge::remote))]
    Remote(String),

    #[error("Inner engine returned {0}")]
    #[diagnostic(code(sdb_bridge::engine))]
    Engine(Status),

    #[error("I/O error: {0}")]
    #[diagnostic(code(sdb_bridge::io))]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Status code reported to the host for this error.
    pub fn status(&self) -> Status {
        match self {
            BridgeError::Engine(status) => *status,
            BridgeError::InvalidAttachRequest(_) => Status::False,
            _ => Status::E_FAIL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Status::Ok, "S_OK")]
    #[case(Status::False, "S_FALSE")]
    #[case(Status::E_FAIL, "0x80004005")]
    fn test_status_display(#[case] status: Status, #[case] expected: &str) {
        assert_eq!(status.to_string(), expected);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            BridgeError::Engine(Status::Error(7)).status(),
            Status::Error(7)
        );
        assert_eq!(
            BridgeError::InvalidAttachRequest(Cow::Borrowed("two programs")).status(),
            Status::False
        );
        assert_eq!(BridgeError::TokenAlreadyClaimed.status(), Status::E_FAIL);
    }

    #[test]
    fn test_error_messages() {
        let err = BridgeError::ConnectionFailed {
            attempts: 3,
            reason: "refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Connection to target failed after 3 attempt(s): refused"
        );
    }
}
