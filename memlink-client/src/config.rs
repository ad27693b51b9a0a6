//! # Client Configuration
//!
//! Purpose: Describe the server list and operating modes a `Client` is built
//! from. Every field has a default so a partial JSON document is enough.
//!
//! ## Design Principles
//! 1. **Plain Data**: Configuration is a serde struct; parsing option strings
//!    or URIs belongs to whoever hands the document over.
//! 2. **Validate Once**: `validate` runs at construction; request paths trust
//!    the values afterwards.

use std::time::Duration;

use memlink_common::Protocol;
use memlink_hash::{Distribution, HashAlgorithm, HashKit};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default memcached port.
pub const DEFAULT_PORT: u16 = 11211;

/// One server as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerConfig {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Parses `host[:port[:weight]]`.
    ///
    /// ```rust
    /// use memlink_client::ServerConfig;
    ///
    /// let server = ServerConfig::parse("cache-1:11212:3").unwrap();
    /// assert_eq!((server.host.as_str(), server.port, server.weight), ("cache-1", 11212, 3));
    /// ```
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidServer(entry.to_string());
        let mut parts = entry.trim().split(':');

        let host = parts.next().filter(|host| !host.is_empty()).ok_or_else(invalid)?;
        let port = match parts.next() {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        let weight = match parts.next() {
            Some(weight) => weight.parse::<u32>().map_err(|_| invalid())?,
            None => 1,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(ServerConfig {
            host: host.to_string(),
            port,
            weight,
        })
    }

    /// `host:port` label used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub servers: Vec<ServerConfig>,
    pub protocol: Protocol,
    pub distribution: Distribution,
    pub hash: HashAlgorithm,
    /// Queue commands locally until a read or an explicit flush.
    pub buffer_requests: bool,
    /// Send mutations without asking for a reply.
    pub no_reply: bool,
    /// Extra servers each stored key is mirrored to.
    pub replicas: usize,
    /// Prefix applied to every key on the wire.
    pub namespace: String,
    /// Reject text keys containing whitespace or control bytes.
    pub verify_key: bool,
    /// Socket deadlines; each must be non-zero.
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Failures within `failure_window_ms` that mark a server dead.
    /// Zero disables dead marking.
    pub server_failure_limit: u32,
    pub failure_window_ms: u64,
    /// How long a dead server is skipped before one probe is allowed.
    pub retry_timeout_ms: u64,
    /// Upper bound on servers tried for one request.
    pub max_attempts: usize,
    /// Retry idempotent writes (set/replace/delete/touch) on another server.
    pub retry_writes: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: Vec::new(),
            protocol: Protocol::Text,
            distribution: Distribution::Modula,
            hash: HashAlgorithm::Default,
            buffer_requests: false,
            no_reply: false,
            replicas: 0,
            namespace: String::new(),
            verify_key: false,
            connect_timeout_ms: 4_000,
            read_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            server_failure_limit: 5,
            failure_window_ms: 10_000,
            retry_timeout_ms: 2_000,
            max_attempts: 3,
            retry_writes: false,
        }
    }
}

impl ClientConfig {
    /// Configuration for a list of `host[:port[:weight]]` strings.
    pub fn with_servers<I, S>(servers: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let servers = servers
            .into_iter()
            .map(|entry| ServerConfig::parse(entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClientConfig {
            servers,
            ..ClientConfig::default()
        })
    }

    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values no request could succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        for (position, server) in self.servers.iter().enumerate() {
            if server.host.is_empty() || server.port == 0 {
                return Err(ConfigError::InvalidServer(server.label()));
            }
            let duplicate = self.servers[..position]
                .iter()
                .any(|other| other.host == server.host && other.port == server.port);
            if duplicate {
                return Err(ConfigError::DuplicateServer(server.label()));
            }
        }
        if self.namespace.len() >= self.protocol.max_key_length() {
            return Err(ConfigError::Key(memlink_common::KeyError::TooLong {
                len: self.namespace.len(),
                max: self.protocol.max_key_length(),
            }));
        }
        if self.hash != HashAlgorithm::Custom {
            HashKit::new(self.hash)?;
        }
        for (name, ms) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_weight() -> u32 {
    1
}
