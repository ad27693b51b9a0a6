//! # memlink Client
//!
//! Purpose: A synchronous memcached client that spreads keys across
//! independent servers and speaks both the text and the binary protocol.
//!
//! ## Design Principles
//! 1. **Layered Modules**: Codecs are pure, connections own sockets, and the
//!    client routes; each layer is testable without the one above it.
//! 2. **Lazy Resources**: No socket is opened until a server is first used.
//! 3. **Minimal Allocation**: Keys and values are written from the caller's
//!    buffers through vectored I/O.
//! 4. **Protocol Clarity**: Both wire formats are encoded and parsed
//!    explicitly, including the request side used by test servers.

pub mod binary;
mod client;
pub mod codec;
mod config;
mod connection;
mod error;
mod server;
pub mod text;

pub use client::{Client, Reply};
pub use codec::{Decoded, Frame};
pub use config::{ClientConfig, ServerConfig, DEFAULT_PORT};
pub use connection::{
    ConnectionSnapshot, ConnectionState, Connector, FailurePolicy, TcpConnector, Timeouts, Transport,
    WRITE_BUFFER_SIZE,
};
pub use error::{ClientError, ClientResult, ConfigError};
pub use memlink_common::{Command, Item, Protocol, Response, ServerStatus, Verb};
pub use memlink_hash::{Distribution, HashAlgorithm, HashKit};
