// Error taxonomy for the codec, protocol and dispatch layers

use std::io;

use thiserror::Error;

use crate::result_code::ResultCode;

/// Failure to turn bytes into a BER value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not enough bytes for the tag, the length, or the declared content.
    #[error("not enough data to decode a complete value")]
    PartialData,
    #[error("indefinite length encoding is not supported")]
    IndefiniteLength,
    #[error("malformed BER: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub fn malformed(message: impl Into<String>) -> Self {
        DecodeError::Malformed(message.into())
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, DecodeError::PartialData)
    }
}

/// A well-formed BER value that does not fit the expected LDAP grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol error: {message}")]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(err: DecodeError) -> Self {
        ProtocolError::new(format!("invalid nested encoding: {}", err))
    }
}

/// A request-level failure carrying an LDAP result code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct OperationError {
    pub code: ResultCode,
    pub message: String,
}

impl OperationError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn short_name(&self) -> &'static str {
        self.code.short_name()
    }

    pub fn description(&self) -> &'static str {
        self.code.description()
    }
}

impl From<ProtocolError> for OperationError {
    fn from(err: ProtocolError) -> Self {
        OperationError::new(ResultCode::PROTOCOL_ERROR, err.message)
    }
}

/// The server answered with `referral`; the caller decides whether to chase it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("referral: {message} ({})", .referrals.join(", "))]
pub struct ReferralError {
    pub referrals: Vec<String>,
    pub message: String,
}

impl ReferralError {
    pub fn code(&self) -> ResultCode {
        ResultCode::REFERRAL
    }
}

#[derive(Debug, Error)]
pub enum LdapError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Referral(#[from] ReferralError),
    /// A message with ID 0 arrived where a correlated response was expected.
    #[error("unsolicited notification {oid}: {message} ({code})")]
    Unsolicited {
        oid: String,
        code: ResultCode,
        message: String,
    },
    #[error("operation cancelled by request")]
    CancelRequest,
    #[error("sync cancelled by request")]
    CancelSync,
    #[error("timed out waiting for data")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("message wrapping failed: {0}")]
    Wrap(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LdapError {
    /// Errors after which the connection cannot be reused.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            LdapError::Decode(_)
                | LdapError::Timeout
                | LdapError::ConnectionClosed
                | LdapError::Wrap(_)
                | LdapError::Tls(_)
                | LdapError::Io(_)
        )
    }

    /// The result code a server should answer with for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            LdapError::Operation(e) => e.code,
            LdapError::Referral(_) => ResultCode::REFERRAL,
            LdapError::Unsolicited { code, .. } => *code,
            LdapError::Decode(_) | LdapError::Protocol(_) => ResultCode::PROTOCOL_ERROR,
            LdapError::CancelRequest | LdapError::CancelSync => ResultCode::CANCELED,
            _ => ResultCode::OTHER,
        }
    }
}

pub type Result<T, E = LdapError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_meaning() {
        let err = OperationError::new(ResultCode::INVALID_CREDENTIALS, "Invalid credentials");
        assert_eq!(err.short_name(), "invalidCredentials");
        assert_eq!(err.to_string(), "Invalid credentials (invalidCredentials (49))");
    }

    #[test]
    fn test_decode_error_classification() {
        assert!(DecodeError::PartialData.is_partial());
        assert!(!DecodeError::IndefiniteLength.is_partial());
        let err: LdapError = DecodeError::malformed("bad length").into();
        assert!(err.is_connection_fatal());
        assert_eq!(err.result_code(), ResultCode::PROTOCOL_ERROR);
    }

    #[test]
    fn test_protocol_error_becomes_operation_error() {
        let op: OperationError = ProtocolError::new("missing child").into();
        assert_eq!(op.code, ResultCode::PROTOCOL_ERROR);
        assert_eq!(op.message, "missing child");
    }

    #[test]
    fn test_referral_error_code() {
        let err = ReferralError {
            referrals: vec!["ldap://other.example.com/".into()],
            message: "go elsewhere".into(),
        };
        assert_eq!(err.code(), ResultCode::REFERRAL);
        assert!(err.to_string().contains("ldap://other.example.com/"));
    }
}
