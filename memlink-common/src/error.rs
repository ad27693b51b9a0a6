//! # Error Types
//!
//! Errors that belong to the wire vocabulary itself: key rules, framing, and
//! the semantic statuses a server can answer with. Transport and
//! configuration errors live in the client crate.

use thiserror::Error;

/// A key was rejected before any I/O took place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,
    #[error("key is {len} bytes (namespace included), limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("key contains whitespace or control bytes")]
    InvalidCharacter,
}

/// Framing and encoding faults.
///
/// A decode error means the byte stream can no longer be trusted; the
/// connection that produced it must be reset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("frame truncated")]
    Truncated,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("command arguments do not fit in {0} bytes")]
    CommandTooLarge(usize),
    #[error("unexpected opcode 0x{0:02x}")]
    UnexpectedOpcode(u8),
}

impl CodecError {
    pub fn malformed(message: impl Into<String>) -> Self {
        CodecError::Malformed(message.into())
    }
}

/// Semantic answers reflecting real server state; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerStatus {
    #[error("key not found")]
    NotFound,
    #[error("key exists")]
    Exists,
    #[error("item not stored")]
    NotStored,
    #[error("value too large")]
    ValueTooLarge,
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("increment or decrement on a non-numeric value")]
    NonNumeric,
    #[error("server out of memory")]
    OutOfMemory,
    #[error("unknown command")]
    UnknownCommand,
    #[error("client error: {0}")]
    ClientError(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("unrecognised status 0x{0:04x}")]
    Other(u16),
}

pub const STATUS_SUCCESS: u16 = 0x00;
pub const STATUS_KEY_NOT_FOUND: u16 = 0x01;
pub const STATUS_KEY_EXISTS: u16 = 0x02;
pub const STATUS_VALUE_TOO_LARGE: u16 = 0x03;
pub const STATUS_INVALID_ARGUMENTS: u16 = 0x04;
pub const STATUS_ITEM_NOT_STORED: u16 = 0x05;
pub const STATUS_NON_NUMERIC: u16 = 0x06;
pub const STATUS_UNKNOWN_COMMAND: u16 = 0x81;
pub const STATUS_OUT_OF_MEMORY: u16 = 0x82;

impl ServerStatus {
    /// Maps a binary status field. Returns `None` for success.
    pub fn from_binary(code: u16) -> Option<Self> {
        let status = match code {
            STATUS_SUCCESS => return None,
            STATUS_KEY_NOT_FOUND => ServerStatus::NotFound,
            STATUS_KEY_EXISTS => ServerStatus::Exists,
            STATUS_VALUE_TOO_LARGE => ServerStatus::ValueTooLarge,
            STATUS_INVALID_ARGUMENTS => ServerStatus::InvalidArguments,
            STATUS_ITEM_NOT_STORED => ServerStatus::NotStored,
            STATUS_NON_NUMERIC => ServerStatus::NonNumeric,
            STATUS_UNKNOWN_COMMAND => ServerStatus::UnknownCommand,
            STATUS_OUT_OF_MEMORY => ServerStatus::OutOfMemory,
            other => ServerStatus::Other(other),
        };
        Some(status)
    }

    /// Binary status code for this answer. Text-only statuses map to the
    /// closest binary code.
    pub fn binary_code(&self) -> u16 {
        match self {
            ServerStatus::NotFound => STATUS_KEY_NOT_FOUND,
            ServerStatus::Exists => STATUS_KEY_EXISTS,
            ServerStatus::NotStored => STATUS_ITEM_NOT_STORED,
            ServerStatus::ValueTooLarge => STATUS_VALUE_TOO_LARGE,
            ServerStatus::InvalidArguments | ServerStatus::ClientError(_) => STATUS_INVALID_ARGUMENTS,
            ServerStatus::NonNumeric => STATUS_NON_NUMERIC,
            ServerStatus::OutOfMemory | ServerStatus::ServerError(_) => STATUS_OUT_OF_MEMORY,
            ServerStatus::UnknownCommand => STATUS_UNKNOWN_COMMAND,
            ServerStatus::Other(code) => *code,
        }
    }
}
