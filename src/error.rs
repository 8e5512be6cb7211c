//! Error taxonomy shared by every component.
//!
//! Local failures (bad input, bad control request, no connection) are returned synchronously
//! from the call that caused them. Server-reported failures travel through the event router as
//! [`ServerError`] values attached to the operation's message id.

use std::fmt;

use crate::ldap_protocol::LdapResult;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Transport could not be created (bad URI, unsupported scheme or protocol version).
    #[error("cannot initialize LDAP connection: {0}")]
    Init(String),

    /// StartTLS negotiation or TLS handshake failed.
    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    /// Credentials rejected.
    #[error("bind failed: {0}")]
    Bind(ServerError),

    /// Peer unreachable or connection reset. The connection has already been torn down.
    #[error("can't contact LDAP server: {0}")]
    ServerDown(String),

    #[error("invalid control request: {0}")]
    Control(String),

    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("no active LDAP connection")]
    NotConnected,

    /// Non-zero result code of an operation.
    #[error("{0}")]
    Operation(ServerError),
}

impl Error {
    /// Result code when the error came from the server.
    pub fn result_code(&self) -> Option<i32> {
        match self {
            Error::Bind(e) | Error::Operation(e) => Some(e.code),
            _ => None,
        }
    }
}

/// A non-zero LDAPResult as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: i32,
    pub message: String,
    pub diagnostic: String,
    pub matched_dn: String,
}

impl ServerError {
    /// `None` for success (result code 0).
    pub fn from_result(result: &LdapResult) -> Option<Self> {
        if result.result_code == result_code::SUCCESS {
            return None;
        }
        Some(Self {
            code: result.result_code,
            message: err2string(result.result_code).to_string(),
            diagnostic: result.diagnostic_message.clone(),
            matched_dn: result.matched_dn.clone(),
        })
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)?;
        if !self.diagnostic.is_empty() {
            write!(f, ": {}", self.diagnostic)?;
        }
        Ok(())
    }
}

pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const OPERATIONS_ERROR: i32 = 1;
    pub const PROTOCOL_ERROR: i32 = 2;
    pub const SIZE_LIMIT_EXCEEDED: i32 = 4;
    pub const UNAVAILABLE_CRITICAL_EXTENSION: i32 = 12;
    pub const NO_SUCH_OBJECT: i32 = 32;
    pub const INVALID_CREDENTIALS: i32 = 49;
    pub const UNAVAILABLE: i32 = 52;
    pub const UNWILLING_TO_PERFORM: i32 = 53;
    pub const VLV_ERROR: i32 = 76;
    pub const OTHER: i32 = 80;
    pub const SYNC_REFRESH_REQUIRED: i32 = 4096;
}

/// Standard text for an LDAP result code.
pub fn err2string(code: i32) -> &'static str {
    match code {
        0 => "Success",
        1 => "Operations error",
        2 => "Protocol error",
        3 => "Time limit exceeded",
        4 => "Size limit exceeded",
        5 => "Compare False",
        6 => "Compare True",
        7 => "Authentication method not supported",
        8 => "Strong(er) authentication required",
        10 => "Referral",
        11 => "Administrative limit exceeded",
        12 => "Critical extension is unavailable",
        13 => "Confidentiality required",
        14 => "SASL bind in progress",
        16 => "No such attribute",
        17 => "Undefined attribute type",
        18 => "Inappropriate matching",
        19 => "Constraint violation",
        20 => "Type or value exists",
        21 => "Invalid syntax",
        32 => "No such object",
        33 => "Alias problem",
        34 => "Invalid DN syntax",
        36 => "Alias dereferencing problem",
        48 => "Inappropriate authentication",
        49 => "Invalid credentials",
        50 => "Insufficient access",
        51 => "Server is busy",
        52 => "Server is unavailable",
        53 => "Server is unwilling to perform",
        54 => "Loop detected",
        64 => "Naming violation",
        65 => "Object class violation",
        66 => "Operation not allowed on non-leaf",
        67 => "Operation not allowed on RDN",
        68 => "Already exists",
        69 => "Cannot modify object class",
        71 => "Results too large",
        76 => "Virtual List View error",
        80 => "Other (e.g., implementation specific) error",
        4096 => "Content Sync Refresh Required",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_not_an_error() {
        assert!(ServerError::from_result(&LdapResult::success()).is_none());
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::from_result(&LdapResult::with_code(32, "entry missing")).unwrap();
        assert_eq!(err.to_string(), "No such object (32): entry missing");
        assert_eq!(Error::Operation(err).result_code(), Some(32));
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(err2string(9999), "Unknown error");
        assert_eq!(err2string(result_code::SYNC_REFRESH_REQUIRED), "Content Sync Refresh Required");
    }
}
