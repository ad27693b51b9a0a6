//! # memlink-hash
//!
//! Purpose: Key hashing and server placement for the memlink client.
//!
//! ## Design Principles
//! 1. **Pure Core**: No I/O; everything here is deterministic and testable in
//!    isolation.
//! 2. **Configuration-Time Failure**: Unsupported algorithms fail when a
//!    `HashKit` is built, never while routing a request.
//! 3. **Interoperable Layout**: Ring points are derived the same way other
//!    memcached clients derive them.

pub mod continuum;
pub mod distribution;
pub mod functions;
pub mod kit;

pub use continuum::{Continuum, Point, RingNode};
pub use distribution::{Distribution, DistributionError, Distributor};
pub use kit::{digest, HashAlgorithm, HashError, HashFn, HashKit};
