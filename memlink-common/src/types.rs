//! # Command and Response Types
//!
//! Core request/response vocabulary shared by the text and binary codecs.
//!
//! ## Design Principles
//!
//! 1. **Borrowed Commands**: A `Command` borrows its key and payload from the
//!    caller; it is built per call, encoded once, and dropped.
//!
//! 2. **Namespace Outside the Command**: The key stored in a command is the
//!    caller's logical key. The namespace is applied by the encoder, so the
//!    same command can be mirrored to replicas without rebuilding it.
//!
//! 3. **Key Rules Per Protocol**: The text protocol limits keys to 250 bytes
//!    and forbids whitespace; the binary protocol only bounds the length by
//!    the 16-bit header field. The namespace always counts toward the limit.
//!
//! 4. **Semantic Replies Are Values**: `NOT_FOUND`, `EXISTS` and friends are
//!    decoded into `Response::Error` instead of failing the decoder; they
//!    reflect server state, not a broken stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, ServerStatus};

/// Maximum text protocol key length, namespace included.
pub const MAX_TEXT_KEY_LENGTH: usize = 250;

/// Maximum binary protocol key length, namespace included.
pub const MAX_BINARY_KEY_LENGTH: usize = u16::MAX as usize;

/// Wire format spoken to every server of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Text,
    Binary,
}

impl Protocol {
    /// Longest key (namespace included) the protocol can carry.
    pub const fn max_key_length(self) -> usize {
        match self {
            Protocol::Text => MAX_TEXT_KEY_LENGTH,
            Protocol::Binary => MAX_BINARY_KEY_LENGTH,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Text => "text",
            Protocol::Binary => "binary",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks `key` before any byte reaches the network.
///
/// The length check always runs. When `verify` is set, text keys are also
/// checked for whitespace and control bytes, which would split the command
/// line on the server.
///
/// # Errors
/// `KeyError::Empty`, `KeyError::TooLong`, or `KeyError::InvalidCharacter`.
pub fn validate_key(
    key: &[u8],
    namespace: &[u8],
    protocol: Protocol,
    verify: bool,
) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }

    let len = namespace.len() + key.len();
    let max = protocol.max_key_length();
    if len > max {
        return Err(KeyError::TooLong { len, max });
    }

    if verify && protocol == Protocol::Text {
        let invalid = |byte: &u8| byte.is_ascii_whitespace() || byte.is_ascii_control();
        if key.iter().any(invalid) || namespace.iter().any(invalid) {
            return Err(KeyError::InvalidCharacter);
        }
    }

    Ok(())
}

/// Operation carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Gets,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Delete,
    Increment,
    Decrement,
    Touch,
    FlushAll,
    Version,
    Noop,
    Quit,
}

impl Verb {
    /// Commands that carry a value payload.
    pub const fn is_storage(self) -> bool {
        matches!(
            self,
            Verb::Set | Verb::Add | Verb::Replace | Verb::Append | Verb::Prepend | Verb::Cas
        )
    }

    /// Commands that fetch items.
    pub const fn is_read(self) -> bool {
        matches!(self, Verb::Get | Verb::Gets)
    }

    /// Commands whose repeated application leaves the same server state.
    pub const fn is_idempotent(self) -> bool {
        matches!(
            self,
            Verb::Get
                | Verb::Gets
                | Verb::Set
                | Verb::Replace
                | Verb::Delete
                | Verb::Touch
                | Verb::Version
                | Verb::Noop
        )
    }

    /// Commands that address a key (and therefore a single server).
    pub const fn is_keyed(self) -> bool {
        !matches!(self, Verb::FlushAll | Verb::Version | Verb::Noop | Verb::Quit)
    }

    /// Text protocol command word. `Noop` has none.
    pub const fn text_name(self) -> Option<&'static str> {
        let name = match self {
            Verb::Get => "get",
            Verb::Gets => "gets",
            Verb::Set => "set",
            Verb::Add => "add",
            Verb::Replace => "replace",
            Verb::Append => "append",
            Verb::Prepend => "prepend",
            Verb::Cas => "cas",
            Verb::Delete => "delete",
            Verb::Increment => "incr",
            Verb::Decrement => "decr",
            Verb::Touch => "touch",
            Verb::FlushAll => "flush_all",
            Verb::Version => "version",
            Verb::Quit => "quit",
            Verb::Noop => return None,
        };
        Some(name)
    }

    /// Parses a text protocol command word.
    pub fn from_text_name(name: &[u8]) -> Option<Self> {
        let verb = match name {
            b"get" => Verb::Get,
            b"gets" => Verb::Gets,
            b"set" => Verb::Set,
            b"add" => Verb::Add,
            b"replace" => Verb::Replace,
            b"append" => Verb::Append,
            b"prepend" => Verb::Prepend,
            b"cas" => Verb::Cas,
            b"delete" => Verb::Delete,
            b"incr" => Verb::Increment,
            b"decr" => Verb::Decrement,
            b"touch" => Verb::Touch,
            b"flush_all" => Verb::FlushAll,
            b"version" => Verb::Version,
            b"quit" => Verb::Quit,
            _ => return None,
        };
        Some(verb)
    }
}

/// One operation to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub verb: Verb,
    /// Logical key, namespace not included.
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub flags: u32,
    /// Expiration in seconds (or a unix timestamp, server-interpreted).
    /// `flush_all` uses it as its delay.
    pub expiration: u32,
    pub cas: u64,
    /// Offset for increment/decrement.
    pub delta: u64,
    /// Counter seed for increment/decrement; binary protocol only.
    pub initial: Option<u64>,
    pub no_reply: bool,
}

impl<'a> Command<'a> {
    pub fn new(verb: Verb, key: &'a [u8]) -> Self {
        Command {
            verb,
            key,
            value: &[],
            flags: 0,
            expiration: 0,
            cas: 0,
            delta: 0,
            initial: None,
            no_reply: false,
        }
    }

    /// A command that addresses no key.
    pub fn keyless(verb: Verb) -> Self {
        Self::new(verb, &[])
    }

    pub fn store(verb: Verb, key: &'a [u8], value: &'a [u8], flags: u32, expiration: u32) -> Self {
        Command {
            value,
            flags,
            expiration,
            ..Self::new(verb, key)
        }
    }

    pub fn counter(verb: Verb, key: &'a [u8], delta: u64) -> Self {
        Command {
            delta,
            ..Self::new(verb, key)
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_expiration(mut self, expiration: u32) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_initial(mut self, initial: u64, expiration: u32) -> Self {
        self.initial = Some(initial);
        self.expiration = expiration;
        self
    }

    pub fn with_no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    /// Returns true when the server will answer this command.
    ///
    /// `quit` is never read back: the server may close before answering.
    pub fn expects_reply(&self) -> bool {
        !self.no_reply && self.verb != Verb::Quit
    }
}

/// A fetched item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    /// Key as echoed by the server. The client replaces it with the caller's
    /// logical key, namespace removed.
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u32,
    /// Zero when the server did not send a cas token.
    pub cas: u64,
}

/// One decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Stored,
    Deleted,
    Touched,
    /// `OK` (flush_all) or a binary success without a body (noop, quit).
    Ok,
    /// One item of a retrieval; a text retrieval is closed by `End`.
    Value(Item),
    End,
    /// New counter value after increment/decrement.
    Numeric(u64),
    Version(String),
    /// Semantic failure reported by the server.
    Error(ServerStatus),
}

impl Response {
    /// Converts a semantic failure into `Err`.
    pub fn into_result(self) -> Result<Response, ServerStatus> {
        match self {
            Response::Error(status) => Err(status),
            other => Ok(other),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}
