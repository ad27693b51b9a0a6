//! # Server List
//!
//! Purpose: Hold the configured servers and their connections, and count
//! structural changes so routing knows when to rebuild.
//!
//! ## Design Principles
//! 1. **Generation Counter**: Every add or remove bumps `generation`; indices
//!    are stable within one generation.
//! 2. **Unique Identity**: No two entries share `host:port`.

use std::time::Instant;

use memlink_hash::RingNode;
use tracing::info;

use crate::config::ServerConfig;
use crate::connection::{Connection, FailurePolicy, Timeouts};
use crate::error::ConfigError;

/// One configured server and its connection.
#[derive(Debug)]
pub struct ServerEntry {
    pub config: ServerConfig,
    pub index: usize,
    pub connection: Connection,
}

/// Ordered servers of one client.
#[derive(Debug)]
pub struct ServerList {
    entries: Vec<ServerEntry>,
    generation: u64,
    timeouts: Timeouts,
    policy: FailurePolicy,
}

impl ServerList {
    pub fn new(timeouts: Timeouts, policy: FailurePolicy) -> Self {
        ServerList {
            entries: Vec::new(),
            generation: 0,
            timeouts,
            policy,
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ServerEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ServerEntry> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerEntry> {
        self.entries.iter_mut()
    }

    /// Index of `host:port`, if configured.
    pub fn position(&self, host: &str, port: u16) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.config.host == host && entry.config.port == port)
    }

    /// Appends a server and starts a new generation.
    pub fn add(&mut self, config: ServerConfig) -> Result<usize, ConfigError> {
        if self.position(&config.host, config.port).is_some() {
            return Err(ConfigError::DuplicateServer(config.label()));
        }
        let index = self.entries.len();
        let connection = Connection::new(config.host.clone(), config.port, self.timeouts, self.policy);
        info!(server = %connection.label(), index, weight = config.weight, "server added");
        self.entries.push(ServerEntry {
            config,
            index,
            connection,
        });
        self.generation += 1;
        Ok(index)
    }

    /// Removes a server and starts a new generation. Later entries shift
    /// down by one.
    pub fn remove(&mut self, index: usize) -> Option<ServerEntry> {
        if index >= self.entries.len() {
            return None;
        }
        let entry = self.entries.remove(index);
        for (position, remaining) in self.entries.iter_mut().enumerate().skip(index) {
            remaining.index = position;
        }
        self.generation += 1;
        info!(server = %entry.connection.label(), index, "server removed");
        Some(entry)
    }

    /// Ring view of the current generation.
    pub fn ring_nodes(&self) -> Vec<RingNode<'_>> {
        self.entries
            .iter()
            .map(|entry| RingNode {
                host: &entry.config.host,
                port: entry.config.port,
                weight: entry.config.weight,
            })
            .collect()
    }

    /// Returns true unless the server is marked dead and still cooling down.
    pub fn is_available(&self, index: usize, now: Instant) -> bool {
        self.entries
            .get(index)
            .is_some_and(|entry| entry.connection.is_available(now))
    }

    /// Servers with an open socket.
    pub fn connected_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.connection.is_connected())
            .count()
    }
}
