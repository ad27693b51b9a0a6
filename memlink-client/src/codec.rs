//! # Protocol Codec
//!
//! Purpose: Turn a `Command` into wire segments and a read buffer back into a
//! `Response`, for either protocol.
//!
//! ## Design Principles
//! 1. **Scatter-Gather**: A `Frame` is an ordered list of segments. Keys,
//!    namespaces and payloads are borrowed; only formatted bytes (numbers,
//!    binary headers) are written into a small scratch buffer.
//! 2. **Explicit Completeness**: Decoders return `NeedMoreData` until a whole
//!    message is buffered and never consume partial input.
//! 3. **Pure Functions**: Nothing here touches a socket.

use std::fmt;
use std::io::{IoSlice, Write as _};
use std::ops::Range;

use memlink_common::{CodecError, Command, Protocol, Response, Verb};

use crate::{binary, text};

/// Outcome of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A full message; `consumed` bytes belong to it.
    Complete { value: T, consumed: usize },
    /// The buffer holds only part of a message.
    NeedMoreData,
}

impl<T> Decoded<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Decoded::Complete { value, consumed } => Decoded::Complete {
                value: f(value),
                consumed,
            },
            Decoded::NeedMoreData => Decoded::NeedMoreData,
        }
    }
}

#[derive(Debug, Clone)]
enum Part<'a> {
    Borrowed(&'a [u8]),
    Scratch(Range<usize>),
}

/// An encoded command as an ordered list of byte segments.
#[derive(Debug, Clone, Default)]
pub struct Frame<'a> {
    scratch: Vec<u8>,
    parts: Vec<Part<'a>>,
}

impl<'a> Frame<'a> {
    pub fn new() -> Self {
        Frame {
            scratch: Vec::with_capacity(64),
            parts: Vec::with_capacity(8),
        }
    }

    /// Appends a borrowed segment. Empty slices are skipped.
    pub fn push(&mut self, bytes: &'a [u8]) {
        if !bytes.is_empty() {
            self.parts.push(Part::Borrowed(bytes));
        }
    }

    /// Copies `bytes` into the scratch buffer, merging with a preceding
    /// scratch segment.
    pub fn push_owned(&mut self, bytes: &[u8]) {
        let start = self.scratch.len();
        self.scratch.extend_from_slice(bytes);
        self.extend_scratch(start);
    }

    /// Formats into the scratch buffer.
    pub fn push_fmt(&mut self, args: fmt::Arguments<'_>) {
        let start = self.scratch.len();
        // Writing into a Vec cannot fail.
        let _ = self.scratch.write_fmt(args);
        self.extend_scratch(start);
    }

    fn extend_scratch(&mut self, start: usize) {
        let end = self.scratch.len();
        if start == end {
            return;
        }
        match self.parts.last_mut() {
            Some(Part::Scratch(range)) if range.end == start => range.end = end,
            _ => self.parts.push(Part::Scratch(start..end)),
        }
    }

    /// Appends every segment of `other`.
    pub fn append(&mut self, other: Frame<'a>) {
        for part in other.parts {
            match part {
                Part::Borrowed(bytes) => self.parts.push(Part::Borrowed(bytes)),
                Part::Scratch(range) => self.push_owned(&other.scratch[range]),
            }
        }
    }

    /// Segments in wire order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.parts.iter().map(move |part| match part {
            Part::Borrowed(bytes) => *bytes,
            Part::Scratch(range) => &self.scratch[range.clone()],
        })
    }

    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.segments().map(IoSlice::new).collect()
    }

    pub fn segment_count(&self) -> usize {
        self.parts.len()
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        self.segments().map(<[u8]>::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Concatenates the segments. Only tests and diagnostics need this.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for segment in self.segments() {
            out.extend_from_slice(segment);
        }
        out
    }
}

/// Whether `verb` can be sent without a reply under `protocol`.
///
/// Retrievals always answer. The binary protocol has no quiet form of
/// touch, version or noop.
pub fn supports_no_reply(protocol: Protocol, verb: Verb) -> bool {
    match protocol {
        Protocol::Text => !matches!(verb, Verb::Get | Verb::Gets | Verb::Version | Verb::Noop),
        Protocol::Binary => {
            !verb.is_read() && binary::opcode_for(verb, false).quiet().is_quiet()
        }
    }
}

/// Encodes one command. `namespace` is prefixed to the key.
///
/// # Errors
/// `CodecError::Malformed` for commands the protocol cannot express and
/// `CodecError::CommandTooLarge` when a binary body overflows its length
/// field.
pub fn encode<'a>(
    protocol: Protocol,
    command: &Command<'a>,
    namespace: &'a [u8],
) -> Result<Frame<'a>, CodecError> {
    match protocol {
        Protocol::Text => text::encode(command, namespace),
        Protocol::Binary => binary::encode(command, namespace),
    }
}

/// Encodes a retrieval of several keys held by one server.
pub fn encode_multi_get<'a>(
    protocol: Protocol,
    verb: Verb,
    keys: &[&'a [u8]],
    namespace: &'a [u8],
) -> Result<Frame<'a>, CodecError> {
    match protocol {
        Protocol::Text => Ok(text::encode_multi_get(verb, keys, namespace)),
        Protocol::Binary => binary::encode_multi_get(keys, namespace),
    }
}

/// Decodes one response from the front of `buf`.
pub fn decode_response(protocol: Protocol, buf: &[u8]) -> Result<Decoded<Response>, CodecError> {
    match protocol {
        Protocol::Text => text::decode_response(buf),
        Protocol::Binary => binary::decode_response(buf),
    }
}

/// Number of responses a multi-key retrieval produces, if fixed.
///
/// Text retrievals end with `END`; binary retrievals send one frame per key.
pub fn multi_get_replies(protocol: Protocol, key_count: usize) -> Option<usize> {
    match protocol {
        Protocol::Text => None,
        Protocol::Binary => Some(key_count),
    }
}
