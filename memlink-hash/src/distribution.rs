//! # Distributor
//!
//! Purpose: Map a group key to a server index, redistribute around servers
//! that are currently unavailable, and derive replica targets.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `Distribution` picks modulo or ring placement;
//!    callers only ever see server indices.
//! 2. **Generation Cache**: The ring is rebuilt only when the server list
//!    generation changes.
//! 3. **One Probe Order**: Redistribution and replica selection walk the same
//!    deterministic sequence, so fallbacks are stable across calls.
//!
//! ## Probe Order
//!
//! - modulo: `(digest + probe) % n` for `probe = 0, 1, ..`
//! - ring: successive ring entries starting at the ceiling of the digest,
//!   skipping servers already visited.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::continuum::{Continuum, RingNode};
use crate::kit::HashKit;

/// Key placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// `digest % server_count`.
    #[default]
    Modula,
    /// Unweighted ring, points hashed with the configured algorithm.
    Consistent,
    /// Weighted (ketama) ring, points hashed with MD5.
    ConsistentWeighted,
}

impl Distribution {
    /// Returns true for the ring-based strategies.
    pub fn is_consistent(self) -> bool {
        !matches!(self, Distribution::Modula)
    }
}

/// Errors raised while selecting a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DistributionError {
    /// Every candidate is unavailable, or the list is empty.
    #[error("no servers available")]
    NoServersAvailable,
}

/// Maps digests to server indices.
#[derive(Debug, Clone)]
pub struct Distributor {
    mode: Distribution,
    kit: HashKit,
    ring: Continuum,
    generation: Option<u64>,
    server_count: usize,
}

impl Distributor {
    /// Creates a distributor. Call [`Distributor::refresh`] before routing.
    pub fn new(mode: Distribution, kit: HashKit) -> Self {
        Distributor {
            mode,
            kit,
            ring: Continuum::default(),
            generation: None,
            server_count: 0,
        }
    }

    #[inline]
    pub fn mode(&self) -> Distribution {
        self.mode
    }

    #[inline]
    pub fn kit(&self) -> &HashKit {
        &self.kit
    }

    /// Generation the cached layout was built for.
    #[inline]
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// The cached ring (empty in modulo mode).
    #[inline]
    pub fn continuum(&self) -> &Continuum {
        &self.ring
    }

    /// Rebuilds the cached layout when `generation` differs from the one it
    /// was built for. Returns true when a rebuild happened.
    pub fn refresh(&mut self, generation: u64, nodes: &[RingNode<'_>]) -> bool {
        if self.generation == Some(generation) {
            return false;
        }
        self.ring = match self.mode {
            Distribution::Modula => Continuum::default(),
            Distribution::Consistent => Continuum::unweighted(nodes, &self.kit),
            Distribution::ConsistentWeighted => Continuum::weighted(nodes),
        };
        self.server_count = nodes.len();
        self.generation = Some(generation);
        true
    }

    /// Digest of a group key under the configured algorithm.
    #[inline]
    pub fn digest(&self, group_key: &[u8]) -> u32 {
        self.kit.digest(group_key)
    }

    /// Server owning `digest` ignoring availability.
    pub fn owner(&self, digest: u32) -> Option<usize> {
        self.probe(digest).next()
    }

    /// Distinct available servers in probe order. The first entry is the
    /// (possibly redistributed) primary; the rest are fallbacks.
    pub fn candidates<F>(&self, digest: u32, is_available: F) -> Vec<usize>
    where
        F: Fn(usize) -> bool,
    {
        self.probe(digest).filter(|&index| is_available(index)).collect()
    }

    /// Picks the server for `group_key`, skipping unavailable ones.
    ///
    /// # Errors
    /// Returns `DistributionError::NoServersAvailable` when no candidate is
    /// available.
    pub fn select_server<F>(&self, group_key: &[u8], is_available: F) -> Result<usize, DistributionError>
    where
        F: Fn(usize) -> bool,
    {
        let digest = self.digest(group_key);
        self.probe(digest)
            .find(|&index| is_available(index))
            .ok_or(DistributionError::NoServersAvailable)
    }

    /// The `count` servers following the owner of `digest` in probe order,
    /// regardless of availability.
    pub fn replicas(&self, digest: u32, count: usize) -> Vec<usize> {
        self.probe(digest).skip(1).take(count).collect()
    }

    fn probe(&self, digest: u32) -> Probe<'_> {
        match self.mode {
            Distribution::Modula => Probe::Modula {
                digest,
                count: self.server_count,
                next: 0,
            },
            _ => Probe::Ring {
                ring: &self.ring,
                start: self.ring.ceiling(digest).unwrap_or(0),
                step: 0,
                seen: vec![false; self.server_count],
                remaining: self.server_count,
            },
        }
    }
}

/// Iterator over distinct server indices in probe order.
enum Probe<'a> {
    Modula {
        digest: u32,
        count: usize,
        next: usize,
    },
    Ring {
        ring: &'a Continuum,
        start: usize,
        step: usize,
        seen: Vec<bool>,
        remaining: usize,
    },
}

impl Iterator for Probe<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            Probe::Modula { digest, count, next } => {
                if *next >= *count {
                    return None;
                }
                let index = ((u64::from(*digest) + *next as u64) % *count as u64) as usize;
                *next += 1;
                Some(index)
            }
            Probe::Ring {
                ring,
                start,
                step,
                seen,
                remaining,
            } => {
                let points = ring.points();
                while *remaining > 0 && *step < points.len() {
                    let index = points[(*start + *step) % points.len()].index;
                    *step += 1;
                    if let Some(slot) = seen.get_mut(index) {
                        if !*slot {
                            *slot = true;
                            *remaining -= 1;
                            return Some(index);
                        }
                    }
                }
                None
            }
        }
    }
}
