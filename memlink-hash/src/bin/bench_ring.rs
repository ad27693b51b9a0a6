//! # Ring Benchmark Harness
//!
//! Purpose: Provide a repeatable driver for digest throughput, ring lookup
//! latency, and key balance so distribution changes can be compared over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys to keep setup costs off the hot path.
//! 3. **Zero-Cost Dispatch**: Built-in algorithms are called through plain
//!    function pointers, as the client does.
//!
//! Usage: `cargo run -p memlink-hash --features bench --bin bench_ring -- [keys] [ops] [servers] [key_size]`
//! (set `RUST_LOG=debug` for per-server shares).

use std::env;
use std::hint::black_box;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use memlink_hash::{Distribution, Distributor, HashAlgorithm, HashKit, RingNode};

const DEFAULT_KEY_COUNT: usize = 1 << 16;
const DEFAULT_OP_COUNT: usize = 1_000_000;
const DEFAULT_SERVER_COUNT: usize = 8;
const DEFAULT_KEY_SIZE: usize = 16;

struct BenchConfig {
    requested_keys: usize,
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    server_count: usize,
    key_size: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let requested_keys = parse_usize(args.next(), DEFAULT_KEY_COUNT);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let server_count = parse_usize(args.next(), DEFAULT_SERVER_COUNT);
        let key_size = parse_usize(args.next(), DEFAULT_KEY_SIZE);

        let key_count = normalize_power_of_two(requested_keys);
        let key_mask = key_count - 1;

        BenchConfig {
            requested_keys,
            key_count,
            key_mask,
            op_count,
            server_count,
            key_size,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn normalize_power_of_two(value: usize) -> usize {
    let value = value.max(1);
    if value.is_power_of_two() {
        value
    } else {
        value.next_power_of_two()
    }
}

/// Tiny deterministic PRNG keeping the workload reproducible.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn build_keys(count: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = XorShift64::new(seed);
    (0..count)
        .map(|_| {
            (0..size)
                .map(|_| b'a' + (rng.next_u64() % 26) as u8)
                .collect()
        })
        .collect()
}

fn report(label: &str, ops: usize, elapsed: std::time::Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("bench_ring failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args();
    ensure!(config.server_count >= 2, "need at least two servers");

    let keys = build_keys(config.key_count, config.key_size, 0xA5A5_A5A5_A5A5_A5A5);
    let hosts: Vec<String> = (0..config.server_count)
        .map(|i| format!("10.0.{}.{}", i / 250, i % 250 + 1))
        .collect();
    let nodes: Vec<RingNode<'_>> = hosts
        .iter()
        .map(|host| RingNode { host: host.as_str(), port: 11211, weight: 1 })
        .collect();

    println!(
        "keys: requested={}, actual={}, ops={}, servers={}, key_size={}",
        config.requested_keys, config.key_count, config.op_count, config.server_count, config.key_size
    );

    for algorithm in HashAlgorithm::ALL {
        let Ok(kit) = HashKit::new(algorithm) else {
            info!(%algorithm, "skipping unsupported algorithm");
            continue;
        };
        let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
        let start = Instant::now();
        for _ in 0..config.op_count {
            let idx = rng.next_index(config.key_mask);
            black_box(kit.digest(&keys[idx]));
        }
        report(&format!("DIGEST {algorithm}"), config.op_count, start.elapsed());
    }

    for mode in [Distribution::Modula, Distribution::Consistent, Distribution::ConsistentWeighted] {
        let kit = HashKit::new(HashAlgorithm::Md5).context("md5 must be available")?;
        let mut distributor = Distributor::new(mode, kit.clone());
        distributor.refresh(1, &nodes);

        let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
        let start = Instant::now();
        for _ in 0..config.op_count {
            let idx = rng.next_index(config.key_mask);
            black_box(distributor.select_server(&keys[idx], |_| true)?);
        }
        report(&format!("SELECT {mode:?}"), config.op_count, start.elapsed());

        let mut shares = vec![0usize; config.server_count];
        let before: Vec<usize> = keys
            .iter()
            .map(|key| distributor.select_server(key, |_| true))
            .collect::<Result<_, _>>()?;
        for &index in &before {
            shares[index] += 1;
        }
        for (index, share) in shares.iter().enumerate() {
            debug!(?mode, server = %hosts[index], keys = share, "key share");
        }

        // Drop the last server and count how many keys change owner.
        let mut shrunk = Distributor::new(mode, kit);
        shrunk.refresh(2, &nodes[..nodes.len() - 1]);
        let mut moved = 0usize;
        for (key, &old) in keys.iter().zip(&before) {
            let new = shrunk.select_server(key, |_| true)?;
            if hosts[old] != hosts[new] {
                moved += 1;
            }
        }
        let max_share = shares.iter().copied().max().unwrap_or(0);
        let min_share = shares.iter().copied().min().unwrap_or(0);
        println!(
            "BALANCE {mode:?}: min={min_share} max={max_share} moved_on_removal={:.2}%",
            moved as f64 * 100.0 / config.key_count as f64
        );
    }

    Ok(())
}
