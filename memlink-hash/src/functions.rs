//! # Digest Functions
//!
//! Purpose: One plain function per supported algorithm, each mapping a byte
//! string to a 32-bit digest.
//!
//! ## Design Principles
//! 1. **Pure Functions**: No state, no allocation, no failure paths.
//! 2. **Bit Compatibility**: Every function reproduces the digests other
//!    memcached clients compute, so independently built rings agree.
//! 3. **Independently Testable**: Nothing here knows about `HashKit`.
//!
//! Wide digests (MD5, FNV-64) are folded to 32 bits the same way the classic
//! client libraries do it, described next to each function.

use std::hash::Hasher;

const FNV_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV_32_INIT: u32 = 2_166_136_261;
const FNV_32_PRIME: u32 = 16_777_619;

/// Initial value fed into lookup3 by the `Jenkins` algorithm.
pub const JENKINS_INITVAL: u32 = 13;

/// Bob Jenkins' one-at-a-time hash (the default algorithm).
///
/// Bytes are widened as signed chars before mixing, which only matters for
/// keys containing bytes >= 0x80.
pub fn one_at_a_time(key: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &byte in key {
        value = value.wrapping_add(byte as i8 as u32);
        value = value.wrapping_add(value << 10);
        value ^= value >> 6;
    }
    value = value.wrapping_add(value << 3);
    value ^= value >> 11;
    value = value.wrapping_add(value << 15);
    value
}

/// MD5 folded to the first four digest bytes, little-endian.
pub fn md5(key: &[u8]) -> u32 {
    let digest = md5::compute(key).0;
    md5_point(&digest, 0)
}

/// Extracts the `alignment`-th little-endian word of an MD5 digest.
///
/// Weighted rings take four points from every digest this way.
#[inline]
pub fn md5_point(digest: &[u8; 16], alignment: usize) -> u32 {
    let base = alignment * 4;
    u32::from_le_bytes([
        digest[base],
        digest[base + 1],
        digest[base + 2],
        digest[base + 3],
    ])
}

/// CRC-32 (IEEE), keeping 15 bits of the upper half.
pub fn crc32(key: &[u8]) -> u32 {
    (crc32fast::hash(key) >> 16) & 0x7fff
}

/// 64-bit FNV-1 truncated to 32 bits.
pub fn fnv1_64(key: &[u8]) -> u32 {
    let mut hash = FNV_64_INIT;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_64_PRIME);
        hash ^= u64::from(byte);
    }
    hash as u32
}

/// 64-bit FNV-1a truncated to 32 bits.
pub fn fnv1a_64(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key);
    hasher.finish() as u32
}

/// 32-bit FNV-1.
pub fn fnv1_32(key: &[u8]) -> u32 {
    let mut hash = FNV_32_INIT;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_32_PRIME);
        hash ^= u32::from(byte);
    }
    hash
}

/// 32-bit FNV-1a.
pub fn fnv1a_32(key: &[u8]) -> u32 {
    let mut hash = FNV_32_INIT;
    for &byte in key {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_32_PRIME);
    }
    hash
}

/// Jenkins lookup3 (`hashlittle`) seeded with [`JENKINS_INITVAL`].
pub fn jenkins(key: &[u8]) -> u32 {
    lookup3(key, JENKINS_INITVAL)
}

/// Jenkins lookup3 `hashlittle` with an explicit initial value.
///
/// Reads the key byte-wise, which yields the same digest as the aligned
/// word paths on little-endian hosts.
pub fn lookup3(key: &[u8], initval: u32) -> u32 {
    let seed = 0xdead_beef_u32
        .wrapping_add(key.len() as u32)
        .wrapping_add(initval);
    let (mut a, mut b, mut c) = (seed, seed, seed);

    let mut rest = key;
    while rest.len() > 12 {
        a = a.wrapping_add(le_word(&rest[0..4]));
        b = b.wrapping_add(le_word(&rest[4..8]));
        c = c.wrapping_add(le_word(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    if rest.is_empty() {
        return c;
    }

    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(le_word(&tail[0..4]));
    b = b.wrapping_add(le_word(&tail[4..8]));
    c = c.wrapping_add(le_word(&tail[8..12]));
    final_mix(&mut a, &mut b, &mut c);
    c
}

#[inline]
fn le_word(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline]
fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

/// MurmurHash2 with a length-derived seed.
#[cfg(feature = "murmur")]
pub fn murmur(key: &[u8]) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = key.len() as u32;
    let seed = 0xdead_beef_u32.wrapping_mul(length);
    let mut h = seed ^ length;

    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = le_word(chunk);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Paul Hsieh's SuperFastHash.
#[cfg(feature = "hsieh")]
pub fn hsieh(key: &[u8]) -> u32 {
    if key.is_empty() {
        return 0;
    }

    let mut hash = key.len() as u32;
    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        hash = hash.wrapping_add(u32::from(u16::from_le_bytes([chunk[0], chunk[1]])));
        let tmp = (u32::from(u16::from_le_bytes([chunk[2], chunk[3]])) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        hash = hash.wrapping_add(hash >> 11);
    }

    let tail = chunks.remainder();
    match tail.len() {
        3 => {
            hash = hash.wrapping_add(u32::from(u16::from_le_bytes([tail[0], tail[1]])));
            hash ^= hash << 16;
            hash ^= (tail[2] as i8 as u32) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(u32::from(u16::from_le_bytes([tail[0], tail[1]])));
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(tail[0] as i8 as u32);
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash = hash.wrapping_add(hash >> 6);
    hash
}
