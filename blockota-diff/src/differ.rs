//! Interface to the binary diff tools.

use snafu::Snafu;
use std::fmt;

/// Extensions of container formats that get the image-aware diff.
const IMGDIFF_EXTENSIONS: &[&str] = &["zip", "gz", "lz4", "hap"];

/// Patch format, named after the transfer list opcode that applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffMode {
    /// Plain byte-level patch.
    Bsdiff,
    /// Patch that understands compressed containers.
    Imgdiff,
}

impl DiffMode {
    /// Picks the mode for a target file by its extension.
    #[must_use]
    pub fn for_target(name: &str) -> Self {
        let base = name.rsplit('/').next().unwrap_or(name);

        match base.rsplit_once('.') {
            Some((_, ext)) if IMGDIFF_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {
                Self::Imgdiff
            }
            _ => Self::Bsdiff,
        }
    }

    #[must_use]
    pub const fn opcode(self) -> &'static str {
        match self {
            Self::Bsdiff => "bsdiff",
            Self::Imgdiff => "imgdiff",
        }
    }
}

impl fmt::Display for DiffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode())
    }
}

/// Computes binary patches.
///
/// Implementations are shared across the worker threads computing patches,
/// so `diff` takes `&self`.
pub trait Differ: Send + Sync {
    /// Returns a patch turning `source` into `target`.
    fn diff(&self, source: &[u8], target: &[u8], mode: DiffMode) -> Result<Vec<u8>, DiffError>;
}

impl<D: Differ + ?Sized> Differ for &D {
    fn diff(&self, source: &[u8], target: &[u8], mode: DiffMode) -> Result<Vec<u8>, DiffError> {
        (**self).diff(source, target, mode)
    }
}

/// Errors from a [`Differ`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DiffError {
    #[snafu(display("cannot stage diff input or output"))]
    Io { source: std::io::Error },

    #[snafu(display("cannot run {program}"))]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[snafu(display("{program} exited with {status}: {output}"))]
    ToolFailed {
        program: String,
        status: String,
        output: String,
    },
}
