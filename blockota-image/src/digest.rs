//! Content digests used for verification and stash identity.

use sha2::{Digest, Sha256, Sha384};
use snafu::Snafu;
use std::fmt;
use std::str::FromStr;

/// Digest algorithm for block content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn hasher(self) -> ContentHasher {
        match self {
            Self::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Self::Sha384 => ContentHasher::Sha384(Sha384::new()),
        }
    }

    /// Digests a single buffer.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }

    /// Length of the hex rendering of a digest.
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha384 => 96,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
        })
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("unknown hash algorithm {name:?}"))]
pub struct UnknownAlgorithmError {
    name: String,
}

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            _ => UnknownAlgorithmSnafu { name: s }.fail(),
        }
    }
}

/// Streaming digest over one of the supported algorithms.
#[derive(Clone)]
pub enum ContentHasher {
    Sha256(Sha256),
    Sha384(Sha384),
}

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
        }
    }

    /// Finishes the digest and renders it as lowercase hex.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha384(h) => hex::encode(h.finalize()),
        }
    }
}

impl fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self {
            Self::Sha256(_) => HashAlgorithm::Sha256,
            Self::Sha384(_) => HashAlgorithm::Sha384,
        };

        f.debug_struct("ContentHasher")
            .field("algorithm", &algorithm)
            .finish_non_exhaustive()
    }
}
