//! Time sync errors

use thiserror::Error;

/// Errors raised by the time sync core
///
/// Everything except [`SyncError::DuplicateInitialization`] is recovered
/// locally: the caller logs it and retries on the next cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Configuration not loaded yet")]
    ConfigUnavailable,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(Malformed),

    #[error("Encoding limit exceeded: {0}")]
    EncodingLimitExceeded(EncodingLimit),

    #[error("Send failed: {0}")]
    SendFailure(String),

    #[error("Clock authority already constructed for this process")]
    DuplicateInitialization,
}

/// Why an inbound buffer was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Malformed {
    #[error("empty buffer")]
    Empty,

    #[error("unknown type tag {0}")]
    UnknownTag(u8),

    #[error("truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} bytes exceeds the message size limit")]
    Oversized(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid sender id")]
    InvalidSenderId,

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Which outbound limit a message violated
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingLimit {
    #[error("sender id is empty or whitespace")]
    BlankSenderId,

    #[error("sender id is {0} bytes")]
    SenderIdTooLong(usize),

    #[error("message is {0} bytes")]
    MessageTooLarge(usize),
}

impl From<Malformed> for SyncError {
    fn from(e: Malformed) -> Self {
        SyncError::MalformedMessage(e)
    }
}

impl From<EncodingLimit> for SyncError {
    fn from(e: EncodingLimit) -> Self {
        SyncError::EncodingLimitExceeded(e)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
