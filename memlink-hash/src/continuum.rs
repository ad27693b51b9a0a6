//! # Continuum
//!
//! Purpose: Build the sorted ring of points used by consistent distribution
//! and answer ceiling lookups against it.
//!
//! ## Design Principles
//! 1. **Reproducible Layout**: Points derive only from (host, port, weight,
//!    algorithm), so any client built the same way routes keys identically.
//! 2. **Flat Storage**: One sorted `Vec<Point>`; lookups are a binary search.
//! 3. **Stable Ties**: Equal point values keep insertion order.
//!
//! ## Point Layout
//!
//! ```text
//! unweighted: 100 points per server,  point i = digest("host:port-i")
//! weighted:   floor(w/W * 40 * n + 1e-10) * 4 points per server,
//!             md5("host:port-i") -> 4 points (one per 32-bit word)
//! ```
//!
//! The `:port` part is omitted when the server listens on the default port.

use std::fmt::Write as _;

use crate::functions::md5_point;
use crate::kit::HashKit;

/// Points per server on an unweighted ring.
pub const POINTS_PER_SERVER: u32 = 100;

/// Nominal points per server on a weighted ring.
pub const POINTS_PER_SERVER_KETAMA: u32 = 160;

/// Points taken from a single MD5 digest on a weighted ring.
pub const POINTS_PER_HASH: u32 = 4;

/// Port that is left out of point labels.
pub const DEFAULT_PORT: u16 = 11211;

/// One entry on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    /// Position on the 32-bit ring.
    pub value: u32,
    /// Index of the owning server in the server list.
    pub index: usize,
}

/// Identity and weight of a server as seen by the ring builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingNode<'a> {
    pub host: &'a str,
    pub port: u16,
    pub weight: u32,
}

/// Sorted ring of points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Continuum {
    points: Vec<Point>,
}

impl Continuum {
    /// Builds an unweighted ring: every server gets the same number of points,
    /// each hashed with `kit`.
    pub fn unweighted(nodes: &[RingNode<'_>], kit: &HashKit) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * POINTS_PER_SERVER as usize);
        let mut label = String::with_capacity(64);

        for (index, node) in nodes.iter().enumerate() {
            for pointer in 0..POINTS_PER_SERVER {
                point_label(&mut label, node, pointer);
                points.push(Point {
                    value: kit.digest(label.as_bytes()),
                    index,
                });
            }
        }

        Self::from_points(points)
    }

    /// Builds a weighted ring: a server's share of points follows its share of
    /// the total weight. Points always come from MD5, whatever key algorithm
    /// is configured.
    pub fn weighted(nodes: &[RingNode<'_>]) -> Self {
        let total_weight: u64 = nodes.iter().map(|node| u64::from(node.weight)).sum();
        let live = nodes.len();
        let mut points = Vec::with_capacity(live * POINTS_PER_SERVER_KETAMA as usize);
        let mut label = String::with_capacity(64);

        for (index, node) in nodes.iter().enumerate() {
            let per_server = weighted_point_count(node.weight, total_weight, live);
            for pointer in 0..per_server / POINTS_PER_HASH {
                point_label(&mut label, node, pointer);
                let digest = md5::compute(label.as_bytes()).0;
                for alignment in 0..POINTS_PER_HASH as usize {
                    points.push(Point {
                        value: md5_point(&digest, alignment),
                        index,
                    });
                }
            }
        }

        Self::from_points(points)
    }

    fn from_points(mut points: Vec<Point>) -> Self {
        // sort_by_key is stable, so equal values keep insertion order.
        points.sort_by_key(|point| point.value);
        Continuum { points }
    }

    /// Number of points on the ring.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true when the ring has no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All points in ring order.
    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Position of the first point with `value >= digest`, wrapping to the
    /// first point past the end.
    pub fn ceiling(&self, digest: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let position = self.points.partition_point(|point| point.value < digest);
        Some(if position == self.points.len() { 0 } else { position })
    }

    /// Server index owning `digest`.
    pub fn lookup(&self, digest: u32) -> Option<usize> {
        self.ceiling(digest).map(|position| self.points[position].index)
    }

    /// Server indices in ring order starting at the ceiling of `digest`,
    /// visiting each point once.
    pub fn walk(&self, digest: u32) -> impl Iterator<Item = usize> + '_ {
        let start = self.ceiling(digest).unwrap_or(0);
        let len = self.points.len();
        (0..len).map(move |step| self.points[(start + step) % len].index)
    }
}

/// Points granted to one server on a weighted ring.
pub fn weighted_point_count(weight: u32, total_weight: u64, live_servers: usize) -> u32 {
    if total_weight == 0 {
        return 0;
    }
    // The whole product stays in f32; only the epsilon is added in f64.
    let pct = weight as f32 / total_weight as f32;
    let scaled: f32 =
        pct * POINTS_PER_SERVER_KETAMA as f32 / POINTS_PER_HASH as f32 * live_servers as f32;
    let groups = (f64::from(scaled) + 0.000_000_000_1).floor() as u32;
    groups * POINTS_PER_HASH
}

fn point_label(label: &mut String, node: &RingNode<'_>, pointer: u32) {
    label.clear();
    // Writing into a String cannot fail.
    let _ = if node.port == DEFAULT_PORT {
        write!(label, "{}-{}", node.host, pointer)
    } else {
        write!(label, "{}:{}-{}", node.host, node.port, pointer)
    };
}
