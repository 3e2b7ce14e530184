//! Library for building incremental block updates from image directories.
//!
//! This crate drives [`blockota_diff`] from the filesystem: it memory maps
//! source and target images, runs an external diff tool, and writes the
//! `<partition>.new.dat`, `<partition>.patch.dat` and
//! `<partition>.transfer.list` files for each partition.
//!
//! # Overview
//!
//! The main entry point is [`IncrementalBuilder`], which takes
//! [`BuildOptions`], a [`Differ`](blockota_diff::Differ), an
//! [`UpdateProgress`] implementation and [`ScriptHooks`] for the device-side
//! script.
//!
//! # Features
//!
//! - `console`: [`ConsoleProgress`], an indicatif progress bar.
//!
//! # Example
//!
//! ```no_run
//! use blockota_util::{BuildOptions, ExternalDiffer, IncrementalBuilder, NoScript, SilentProgress};
//!
//! let options =
//!     BuildOptions::new("source", "target", "out").with_partitions(["system", "vendor"]);
//! let differ = ExternalDiffer::new("diff");
//! let builder = IncrementalBuilder::new(&options, differ, SilentProgress, NoScript);
//! let report = unsafe { builder.build() }.expect("build failed");
//!
//! for (name, reason) in &report.skipped {
//!     eprintln!("{name}: {reason}");
//! }
//! ```

pub mod artifacts;
pub mod build;
pub mod external;
pub mod progress;
pub mod script;

pub use self::artifacts::{PartitionArtifacts, WriteArtifactsError, write_artifacts};
pub use self::build::{BuildError, BuildOptions, BuildReport, IncrementalBuilder};
pub use self::external::ExternalDiffer;
pub use self::progress::{SilentProgress, UpdateProgress};
pub use self::script::{NoScript, ScriptHooks};

#[cfg(feature = "console")]
pub use self::progress::ConsoleProgress;

use blockota_image::{ImageOptions, SparseImage};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};

/// The image and block map of one partition in an image directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePaths {
    pub image: PathBuf,
    pub map: PathBuf,
}

impl ImagePaths {
    /// Returns `<dir>/<partition>.img` and `<dir>/<partition>.map`.
    pub fn new(dir: &Path, partition: &str) -> Self {
        Self {
            image: dir.join(format!("{partition}.img")),
            map: dir.join(format!("{partition}.map")),
        }
    }

    /// Returns the first of the two files that does not exist.
    #[must_use]
    pub fn missing(&self) -> Option<&Path> {
        [&self.image, &self.map]
            .into_iter()
            .find(|p| !p.is_file())
            .map(PathBuf::as_path)
    }
}

/// Errors that can occur when opening an image from disk.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenImageError {
    #[snafu(display("failed to open {}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to memory map {}", path.display()))]
    MmapFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to read block map {}", path.display()))]
    ReadMap {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse image"))]
    ParseImage { source: blockota_image::OpenError },
}

/// Opens an image and its block map from disk, memory mapping the image.
///
/// # Safety
///
/// The caller must ensure the image file is not modified or truncated while
/// the returned image is in use.
pub unsafe fn open_image(
    paths: &ImagePaths,
    options: &ImageOptions,
) -> Result<SparseImage<memmap2::Mmap>, OpenImageError> {
    let path = &paths.image;
    let file = std::fs::File::open(path).context(OpenFileSnafu { path })?;
    let raw = unsafe { memmap2::Mmap::map(&file).context(MmapFileSnafu { path })? };

    let map = std::fs::read_to_string(&paths.map).context(ReadMapSnafu { path: &paths.map })?;

    SparseImage::open(raw, &map, options).context(ParseImageSnafu)
}
