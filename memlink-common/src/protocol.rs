//! # Binary Protocol Structures
//!
//! Purpose: Define the fixed 24-byte header, opcode table, and extras layouts
//! of the binary memcached protocol.
//!
//! ## Design Principles
//!
//! 1. **Network Byte Order**: Every multi-byte field is big-endian on the wire;
//!    conversion happens only in `encode`/`decode`.
//! 2. **Length Before Trust**: A frame is complete only once `24 + body_len`
//!    bytes are buffered, which keeps stream framing safe.
//! 3. **Quiet Variants**: Each reply-suppressing opcode is derived from its
//!    loud counterpart instead of being flagged separately.
//!
//! ## Memory Layout Example
//!
//! ```text
//! Header (24 bytes total):
//! +-------+--------+---------+--------+----------+------------------+
//! | magic | opcode | key_len | ext_len| datatype | vbucket / status |
//! +-------+--------+---------+--------+----------+------------------+
//! | 1B    | 1B     | 2B      | 1B     | 1B       | 2B               |
//! +-------+--------+---------+--------+----------+------------------+
//! | body_len:4B    | opaque:4B        | cas:8B                      |
//! +----------------+------------------+-----------------------------+
//!
//! Increment/Decrement request extras (20 bytes):
//! +----------+------------+---------------+
//! | delta:8B | initial:8B | expiration:4B |
//! +----------+------------+---------------+
//!
//! Set/Add/Replace request extras (8 bytes):
//! +----------+---------------+
//! | flags:4B | expiration:4B |
//! +----------+---------------+
//!
//! Frame:
//! +------------+-----------------+-------------+-------------------+
//! | header:24B | extras:ext_len  | key:key_len | value:(rest)      |
//! +------------+-----------------+-------------+-------------------+
//! ```

use crate::error::CodecError;

/// Magic byte of request frames.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte of response frames.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Size of the fixed header.
pub const HEADER_LEN: usize = 24;

/// Raw bytes data type (the only one defined).
pub const DATATYPE_RAW_BYTES: u8 = 0x00;

/// Expiration telling the server not to create a missing counter.
pub const EXPIRATION_NOT_ADD: u32 = 0xffff_ffff;

/// Extras length of increment/decrement requests.
pub const INCR_EXTRAS_LEN: u8 = 20;

/// Extras length of set/add/replace requests.
pub const STORE_EXTRAS_LEN: u8 = 8;

/// Extras length of touch and flush requests.
pub const EXPIRATION_EXTRAS_LEN: u8 = 4;

/// Extras length of get responses (flags).
pub const GET_EXTRAS_LEN: u8 = 4;

/// Binary protocol opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Touch = 0x1c,
}

impl Opcode {
    /// Convert opcode to its wire byte
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to create an opcode from its wire byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x09 => Opcode::GetQ,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            0x0c => Opcode::GetK,
            0x0d => Opcode::GetKQ,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x11 => Opcode::SetQ,
            0x12 => Opcode::AddQ,
            0x13 => Opcode::ReplaceQ,
            0x14 => Opcode::DeleteQ,
            0x15 => Opcode::IncrementQ,
            0x16 => Opcode::DecrementQ,
            0x17 => Opcode::QuitQ,
            0x18 => Opcode::FlushQ,
            0x19 => Opcode::AppendQ,
            0x1a => Opcode::PrependQ,
            0x1c => Opcode::Touch,
            _ => return None,
        };
        Some(opcode)
    }

    /// Reply-suppressing variant, or `self` when none exists.
    pub const fn quiet(self) -> Self {
        match self {
            Opcode::Get => Opcode::GetQ,
            Opcode::GetK => Opcode::GetKQ,
            Opcode::Set => Opcode::SetQ,
            Opcode::Add => Opcode::AddQ,
            Opcode::Replace => Opcode::ReplaceQ,
            Opcode::Delete => Opcode::DeleteQ,
            Opcode::Increment => Opcode::IncrementQ,
            Opcode::Decrement => Opcode::DecrementQ,
            Opcode::Quit => Opcode::QuitQ,
            Opcode::Flush => Opcode::FlushQ,
            Opcode::Append => Opcode::AppendQ,
            Opcode::Prepend => Opcode::PrependQ,
            other => other,
        }
    }

    /// Loud counterpart of a quiet opcode, or `self`.
    pub const fn loud(self) -> Self {
        match self {
            Opcode::GetQ => Opcode::Get,
            Opcode::GetKQ => Opcode::GetK,
            Opcode::SetQ => Opcode::Set,
            Opcode::AddQ => Opcode::Add,
            Opcode::ReplaceQ => Opcode::Replace,
            Opcode::DeleteQ => Opcode::Delete,
            Opcode::IncrementQ => Opcode::Increment,
            Opcode::DecrementQ => Opcode::Decrement,
            Opcode::QuitQ => Opcode::Quit,
            Opcode::FlushQ => Opcode::Flush,
            Opcode::AppendQ => Opcode::Append,
            Opcode::PrependQ => Opcode::Prepend,
            other => other,
        }
    }

    /// Returns true for reply-suppressing opcodes.
    pub const fn is_quiet(self) -> bool {
        self.loud().as_u8() != self.as_u8()
    }
}

/// Fixed header shared by request and response frames.
///
/// `status` is the vbucket id in requests and the status code in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Builds a request header. `body_len` covers extras, key, and value.
    pub fn request(opcode: Opcode, key_len: u16, extras_len: u8, body_len: u32) -> Self {
        Header {
            magic: REQUEST_MAGIC,
            opcode: opcode.as_u8(),
            key_len,
            extras_len,
            data_type: DATATYPE_RAW_BYTES,
            status: 0,
            body_len,
            opaque: 0,
            cas: 0,
        }
    }

    /// Builds a response header.
    pub fn response(opcode: Opcode, status: u16, key_len: u16, extras_len: u8, body_len: u32) -> Self {
        Header {
            magic: RESPONSE_MAGIC,
            opcode: opcode.as_u8(),
            key_len,
            extras_len,
            data_type: DATATYPE_RAW_BYTES,
            status,
            body_len,
            opaque: 0,
            cas: 0,
        }
    }

    /// Serializes the header in network byte order.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.magic;
        out[1] = self.opcode;
        out[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        out[4] = self.extras_len;
        out[5] = self.data_type;
        out[6..8].copy_from_slice(&self.status.to_be_bytes());
        out[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        out[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        out[16..24].copy_from_slice(&self.cas.to_be_bytes());
        out
    }

    /// Parses a header from the first 24 bytes of `buf`.
    ///
    /// # Errors
    /// `CodecError::Truncated` when fewer than 24 bytes are available.
    /// Magic is not checked here; callers know which direction they expect.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated);
        }
        Ok(Header {
            magic: buf[0],
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extras_len: buf[4],
            data_type: buf[5],
            status: u16::from_be_bytes([buf[6], buf[7]]),
            body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Total frame length (header + body).
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }

    /// Length of the value part of the body.
    ///
    /// # Errors
    /// `CodecError::Malformed` when extras and key exceed the body.
    pub fn value_len(&self) -> Result<usize, CodecError> {
        let prefix = self.extras_len as usize + self.key_len as usize;
        (self.body_len as usize)
            .checked_sub(prefix)
            .ok_or_else(|| CodecError::malformed("extras and key exceed body length"))
    }
}

/// Extras of an increment/decrement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterExtras {
    pub delta: u64,
    pub initial: u64,
    pub expiration: u32,
}

impl CounterExtras {
    pub fn encode(&self) -> [u8; INCR_EXTRAS_LEN as usize] {
        let mut out = [0u8; INCR_EXTRAS_LEN as usize];
        out[0..8].copy_from_slice(&self.delta.to_be_bytes());
        out[8..16].copy_from_slice(&self.initial.to_be_bytes());
        out[16..20].copy_from_slice(&self.expiration.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != INCR_EXTRAS_LEN as usize {
            return Err(CodecError::malformed("counter extras must be 20 bytes"));
        }
        Ok(CounterExtras {
            delta: read_u64(&buf[0..8]),
            initial: read_u64(&buf[8..16]),
            expiration: read_u32(&buf[16..20]),
        })
    }
}

/// Extras of a set/add/replace request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreExtras {
    pub flags: u32,
    pub expiration: u32,
}

impl StoreExtras {
    pub fn encode(&self) -> [u8; STORE_EXTRAS_LEN as usize] {
        let mut out = [0u8; STORE_EXTRAS_LEN as usize];
        out[0..4].copy_from_slice(&self.flags.to_be_bytes());
        out[4..8].copy_from_slice(&self.expiration.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != STORE_EXTRAS_LEN as usize {
            return Err(CodecError::malformed("store extras must be 8 bytes"));
        }
        Ok(StoreExtras {
            flags: read_u32(&buf[0..4]),
            expiration: read_u32(&buf[4..8]),
        })
    }
}

/// Reads a big-endian u32 from exactly four bytes.
#[inline]
pub fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Reads a big-endian u64 from exactly eight bytes.
#[inline]
pub fn read_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes([buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7]])
}
