//! NMS protocol errors and their stable numeric codes.
//!
//! `ProtocolError` is what the codecs and the key exchange return.
//! `ErrorCode` is the small number you put in logs or CLI output to explain
//! *why* a frame was dropped or a handshake aborted.

use core::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame signature verification failed")]
    SignatureInvalid,

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("frame does not match any handshake state")]
    UnexpectedState,

    #[error("peer failed challenge authentication")]
    AuthenticationFailure,

    #[error("failed to decrypt session message")]
    DecryptionFailure,

    #[error("read past end of buffer: needed {needed}, {remaining} remaining")]
    OutOfBounds { needed: usize, remaining: usize },

    #[error("session key has not been derived yet")]
    NoSessionKey,

    #[error("key exchange already linked to a peer")]
    AlreadyLinked,

    #[error("key exchange not linked to a peer")]
    NotLinked,
}

/// Stable numeric error codes.
///
/// Layout:
///   1xxx = framing / codec
///   2xxx = handshake
///   3xxx = session crypto
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // 1xxx: framing
    SignatureInvalid = 1001,
    MalformedFrame = 1002,
    OutOfBounds = 1003,

    // 2xxx: handshake
    UnexpectedState = 2001,
    AuthenticationFailure = 2002,
    AlreadyLinked = 2003,
    NotLinked = 2004,

    // 3xxx: session
    DecryptionFailure = 3001,
    NoSessionKey = 3002,
}

impl ErrorCode {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Short human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::SignatureInvalid => "frame signature invalid",
            ErrorCode::MalformedFrame => "malformed frame",
            ErrorCode::OutOfBounds => "truncated frame",

            ErrorCode::UnexpectedState => "no matching handshake state",
            ErrorCode::AuthenticationFailure => "challenge authentication failed",
            ErrorCode::AlreadyLinked => "key exchange already linked",
            ErrorCode::NotLinked => "key exchange not linked",

            ErrorCode::DecryptionFailure => "session message failed to decrypt",
            ErrorCode::NoSessionKey => "session key not established",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.description())
    }
}

impl From<&ProtocolError> for ErrorCode {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::SignatureInvalid => ErrorCode::SignatureInvalid,
            ProtocolError::MalformedFrame(_) => ErrorCode::MalformedFrame,
            ProtocolError::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            ProtocolError::UnexpectedState => ErrorCode::UnexpectedState,
            ProtocolError::AuthenticationFailure => ErrorCode::AuthenticationFailure,
            ProtocolError::AlreadyLinked => ErrorCode::AlreadyLinked,
            ProtocolError::NotLinked => ErrorCode::NotLinked,
            ProtocolError::DecryptionFailure => ErrorCode::DecryptionFailure,
            ProtocolError::NoSessionKey => ErrorCode::NoSessionKey,
        }
    }
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }

    /// Decryption failures are handled like failed authentication.
    pub fn is_auth_class(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthenticationFailure | ProtocolError::DecryptionFailure
        )
    }
}
