//! Content identities for layers.
//!
//! Every layer carries two digests:
//!
//!  - a [`DiffId`], the hash of the uncompressed diff archive of that one layer, and
//!  - a [`ChainId`], which identifies the layer together with all of its ancestors.
//!
//! Both are written in the usual `algorithm:hex` notation.  The chain id of a base layer is its
//! diff id; for any other layer it is the hash of `"<parent chain id> <diff id>"`.  This notation
//! ends up in persisted metadata, so it must never change.
//!
//! The physical location of a layer inside a storage driver is a [`CacheId`], which is random and
//! has no relationship to either digest.

use core::fmt;
use std::{io, str::FromStr};

use sha2::{Digest as _, Sha256, Sha384, Sha512};
use thiserror::Error;

/// A digest string could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest {0:?} is missing the ':' algorithm separator")]
    MissingSeparator(String),
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("digest {digest:?} has {found} hex characters, expected {expected}")]
    InvalidLength {
        digest: String,
        expected: usize,
        found: usize,
    },
    #[error("digest {0:?} contains characters other than lowercase hex")]
    InvalidHex(String),
}

/// The hash algorithms registered for OCI content digests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub const fn id(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Number of hex characters in an encoded digest of this algorithm.
    pub const fn hex_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha384 => 96,
            Algorithm::Sha512 => 128,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "sha256" => Some(Algorithm::Sha256),
            "sha384" => Some(Algorithm::Sha384),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// An incremental hasher producing a [`Digest`].
///
/// This also implements [`io::Write`], so it can be the target of [`io::copy()`].
#[derive(Clone, Debug)]
pub enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        let (algorithm, hex) = match self {
            Hasher::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            Hasher::Sha384(h) => (Algorithm::Sha384, hex::encode(h.finalize())),
            Hasher::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest {
            value: format!("{algorithm}:{hex}"),
            algorithm,
        }
    }
}

impl io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A content digest in canonical `algorithm:hex` form.
///
/// Parsing checks the form but never normalizes: two digests are equal only if their strings are
/// byte-for-byte equal.  Uppercase hex is rejected rather than folded.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    value: String,
    algorithm: Algorithm,
}

impl Digest {
    /// Hashes `data` with the given algorithm.
    pub fn from_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The encoded part after the `algorithm:` prefix.
    pub fn hex(&self) -> &str {
        &self.value[self.algorithm.id().len() + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Starts an incremental hash using the same algorithm as this digest.
    pub fn hasher(&self) -> Hasher {
        self.algorithm.hasher()
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, hex)) = s.split_once(':') else {
            return Err(DigestError::MissingSeparator(s.to_string()));
        };
        let algorithm = Algorithm::from_id(algorithm)
            .ok_or_else(|| DigestError::UnsupportedAlgorithm(algorithm.to_string()))?;
        if hex.len() != algorithm.hex_len() {
            return Err(DigestError::InvalidLength {
                digest: s.to_string(),
                expected: algorithm.hex_len(),
                found: hex.len(),
            });
        }
        if !hex.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::InvalidHex(s.to_string()));
        }
        Ok(Digest {
            value: s.to_string(),
            algorithm,
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

macro_rules! digest_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Digest);

        impl $name {
            pub fn digest(&self) -> &Digest {
                &self.0
            }

            pub fn algorithm(&self) -> Algorithm {
                self.0.algorithm()
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<Digest> for $name {
            fn from(value: Digest) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Digest {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = DigestError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }
    };
}

digest_newtype! {
    /// The digest of one layer's own uncompressed diff archive.
    DiffId
}

digest_newtype! {
    /// The digest identifying a layer together with its whole ancestry.
    ChainId
}

impl ChainId {
    /// Computes the chain id of a layer from its parent's chain id and its own diff id.
    ///
    /// A layer without parent has a chain id equal to its diff id.  Otherwise the chain id is the
    /// hash, using the diff id's algorithm, of the parent chain id and the diff id separated by a
    /// single space.
    pub fn compute(parent: Option<&ChainId>, diff_id: &DiffId) -> ChainId {
        match parent {
            None => ChainId(diff_id.0.clone()),
            Some(parent) => {
                let input = format!("{parent} {diff_id}");
                ChainId(Digest::from_bytes(diff_id.algorithm(), input.as_bytes()))
            }
        }
    }

    /// Computes the chain id of the topmost layer of a stack of diffs, listed base first.
    ///
    /// Returns None for an empty list.
    pub fn from_diff_ids(diff_ids: &[DiffId]) -> Option<ChainId> {
        let (base, rest) = diff_ids.split_first()?;
        Some(rest.iter().fold(ChainId::compute(None, base), |parent, diff_id| {
            ChainId::compute(Some(&parent), diff_id)
        }))
    }
}

/// Where a storage driver keeps the data of one layer.
///
/// Cache ids are generated on each host and are never derived from content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(String);

impl CacheId {
    /// Generates a fresh random cache id: 32 random bytes, hex encoded.
    pub fn generate() -> Self {
        CacheId(hex::encode(rand::random::<[u8; 32]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheId {
    fn from(value: String) -> Self {
        CacheId(value)
    }
}

impl From<&str> for CacheId {
    fn from(value: &str) -> Self {
        CacheId(value.to_string())
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache:{}", self.0)
    }
}
