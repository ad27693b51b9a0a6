//! # Client Errors
//!
//! Four kinds of failure reach the caller, and each one is handled differently:
//!
//! - `Config` is fatal to the call and never retried.
//! - `Transport`/`Timeout` feed the server's failure accounting and may be
//!   retried on another server.
//! - `Protocol` resets the connection, since the stream can no longer be
//!   framed.
//! - `Server` is returned verbatim because it reflects real server state.

use std::io;

use memlink_common::{CodecError, KeyError, ServerStatus, Verb};
use memlink_hash::{DistributionError, HashError};
use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Invalid configuration or a call the configuration cannot serve.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid key: {0}")]
    Key(#[from] KeyError),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error("{0} requires the binary protocol")]
    BinaryProtocolRequired(&'static str),
    #[error("{0:?} addresses no key and cannot be routed")]
    Unroutable(Verb),
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("no servers configured")]
    NoServers,
    #[error("invalid server `{0}`")]
    InvalidServer(String),
    #[error("server `{0}` is already configured")]
    DuplicateServer(String),
    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error on {server}: {source}")]
    Transport {
        server: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out talking to {server}")]
    Timeout { server: String },
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("server replied: {0}")]
    Server(#[from] ServerStatus),
    #[error("no servers available")]
    NoServersAvailable,
}

impl ClientError {
    /// Classifies an I/O failure on `server`.
    pub fn io(server: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ClientError::Timeout {
                server: server.to_string(),
            },
            _ => ClientError::Transport {
                server: server.to_string(),
                source,
            },
        }
    }

    /// Returns true for failures that another attempt might not hit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport { .. } | ClientError::Timeout { .. })
    }

    /// Returns true when the server answered with `NOT_FOUND`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Server(ServerStatus::NotFound))
    }
}

impl From<KeyError> for ClientError {
    fn from(err: KeyError) -> Self {
        ClientError::Config(ConfigError::Key(err))
    }
}

impl From<HashError> for ClientError {
    fn from(err: HashError) -> Self {
        ClientError::Config(ConfigError::Hash(err))
    }
}

impl From<DistributionError> for ClientError {
    fn from(err: DistributionError) -> Self {
        match err {
            DistributionError::NoServersAvailable => ClientError::NoServersAvailable,
        }
    }
}
