//! # Hash Kit
//!
//! Purpose: Resolve a configured algorithm once into a callable digest so the
//! request path never re-checks capabilities.
//!
//! ## Design Principles
//! 1. **Resolve Early**: `HashKit::new` is the only place that can fail; a
//!    disabled algorithm is a configuration error, never a silent zero.
//! 2. **Enum Dispatch**: Built-in algorithms resolve to plain function
//!    pointers; only `Custom` pays for dynamic dispatch.
//! 3. **Closure Context**: A custom function captures whatever context it
//!    needs instead of threading an untyped pointer through the API.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::functions;

/// Selectable digest algorithms.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// One-at-a-time.
    #[default]
    Default,
    Md5,
    Crc,
    #[serde(rename = "fnv1_64")]
    Fnv1_64,
    #[serde(rename = "fnv1a_64")]
    Fnv1a_64,
    #[serde(rename = "fnv1_32")]
    Fnv1_32,
    #[serde(rename = "fnv1a_32")]
    Fnv1a_32,
    Hsieh,
    Murmur,
    Jenkins,
    /// Caller-supplied function, see [`HashKit::with_function`].
    Custom,
}

impl HashAlgorithm {
    /// Every algorithm, in declaration order.
    pub const ALL: [HashAlgorithm; 11] = [
        HashAlgorithm::Default,
        HashAlgorithm::Md5,
        HashAlgorithm::Crc,
        HashAlgorithm::Fnv1_64,
        HashAlgorithm::Fnv1a_64,
        HashAlgorithm::Fnv1_32,
        HashAlgorithm::Fnv1a_32,
        HashAlgorithm::Hsieh,
        HashAlgorithm::Murmur,
        HashAlgorithm::Jenkins,
        HashAlgorithm::Custom,
    ];

    /// Returns the stable lowercase name used in configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Default => "default",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Crc => "crc",
            HashAlgorithm::Fnv1_64 => "fnv1_64",
            HashAlgorithm::Fnv1a_64 => "fnv1a_64",
            HashAlgorithm::Fnv1_32 => "fnv1_32",
            HashAlgorithm::Fnv1a_32 => "fnv1a_32",
            HashAlgorithm::Hsieh => "hsieh",
            HashAlgorithm::Murmur => "murmur",
            HashAlgorithm::Jenkins => "jenkins",
            HashAlgorithm::Custom => "custom",
        }
    }

    /// Returns true when this build can digest with the algorithm directly.
    pub fn is_supported(self) -> bool {
        builtin(self).is_ok()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while resolving a hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HashError {
    /// The algorithm was compiled out of this build.
    #[error("hash algorithm `{0}` is not supported by this build")]
    Unsupported(HashAlgorithm),
    /// `Custom` was requested without registering a function.
    #[error("custom hash algorithm selected without a hash function")]
    MissingCustomFunction,
}

/// Caller-supplied digest function.
pub type HashFn = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>;

#[derive(Clone)]
enum Resolved {
    Builtin(fn(&[u8]) -> u32),
    Custom(HashFn),
}

/// A resolved digest function.
///
/// Cloning is cheap: built-ins are function pointers and custom functions are
/// reference counted.
#[derive(Clone)]
pub struct HashKit {
    algorithm: HashAlgorithm,
    function: Resolved,
}

impl HashKit {
    /// Resolves a built-in algorithm.
    ///
    /// # Errors
    /// Returns `HashError::Unsupported` for algorithms compiled out of this
    /// build and `HashError::MissingCustomFunction` for `Custom`.
    pub fn new(algorithm: HashAlgorithm) -> Result<Self, HashError> {
        Ok(HashKit {
            algorithm,
            function: Resolved::Builtin(builtin(algorithm)?),
        })
    }

    /// Installs a caller-supplied digest function.
    ///
    /// ```rust
    /// use memlink_hash::{HashAlgorithm, HashKit};
    ///
    /// let salt = 7u32;
    /// let kit = HashKit::with_function(move |key| key.len() as u32 ^ salt);
    /// assert_eq!(kit.algorithm(), HashAlgorithm::Custom);
    /// assert_eq!(kit.digest(b"abc"), 3 ^ 7);
    /// ```
    pub fn with_function<F>(function: F) -> Self
    where
        F: Fn(&[u8]) -> u32 + Send + Sync + 'static,
    {
        HashKit {
            algorithm: HashAlgorithm::Custom,
            function: Resolved::Custom(Arc::new(function)),
        }
    }

    /// Returns the algorithm this kit digests with.
    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Computes the 32-bit digest of `key`.
    #[inline]
    pub fn digest(&self, key: &[u8]) -> u32 {
        match &self.function {
            Resolved::Builtin(function) => function(key),
            Resolved::Custom(function) => function(key),
        }
    }
}

impl Default for HashKit {
    fn default() -> Self {
        HashKit {
            algorithm: HashAlgorithm::Default,
            function: Resolved::Builtin(functions::one_at_a_time),
        }
    }
}

impl fmt::Debug for HashKit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashKit")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Two kits compare equal when they run the same built-in algorithm.
/// Custom kits are only equal to clones of themselves.
impl PartialEq for HashKit {
    fn eq(&self, other: &Self) -> bool {
        match (&self.function, &other.function) {
            (Resolved::Builtin(_), Resolved::Builtin(_)) => self.algorithm == other.algorithm,
            (Resolved::Custom(left), Resolved::Custom(right)) => Arc::ptr_eq(left, right),
            _ => false,
        }
    }
}

/// One-shot digest with a built-in algorithm.
pub fn digest(algorithm: HashAlgorithm, key: &[u8]) -> Result<u32, HashError> {
    builtin(algorithm).map(|function| function(key))
}

fn builtin(algorithm: HashAlgorithm) -> Result<fn(&[u8]) -> u32, HashError> {
    let function: fn(&[u8]) -> u32 = match algorithm {
        HashAlgorithm::Default => functions::one_at_a_time,
        HashAlgorithm::Md5 => functions::md5,
        HashAlgorithm::Crc => functions::crc32,
        HashAlgorithm::Fnv1_64 => functions::fnv1_64,
        HashAlgorithm::Fnv1a_64 => functions::fnv1a_64,
        HashAlgorithm::Fnv1_32 => functions::fnv1_32,
        HashAlgorithm::Fnv1a_32 => functions::fnv1a_32,
        HashAlgorithm::Jenkins => functions::jenkins,
        #[cfg(feature = "murmur")]
        HashAlgorithm::Murmur => functions::murmur,
        #[cfg(feature = "hsieh")]
        HashAlgorithm::Hsieh => functions::hsieh,
        HashAlgorithm::Custom => return Err(HashError::MissingCustomFunction),
        #[allow(unreachable_patterns)]
        unsupported => return Err(HashError::Unsupported(unsupported)),
    };
    Ok(function)
}
