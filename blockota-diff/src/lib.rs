//! A library for generating block-level OTA updates.
//!
//! Given a source and a target [`SparseImage`], this crate plans one transfer
//! per target file, orders the transfers so the update can be applied in
//! place, and emits a transfer list together with the new-data and
//! patch-data streams it references.
//!
//! # Features
//!
//! - File matching by exact and digit-normalized names
//! - Dependency ordering with stash repair of conflicting overwrites
//! - Move detection through content digests
//! - Binary diffs through a pluggable [`Differ`], computed in parallel
//! - Stash accounting with a scratch space high-water mark
//!
//! # Example
//!
//! ```no_run
//! use blockota_diff::differ::{DiffError, DiffMode, Differ};
//! use blockota_diff::{UpdateConfig, generate_update};
//! use blockota_image::{ImageOptions, SparseImage};
//!
//! struct Replace;
//!
//! impl Differ for Replace {
//!     fn diff(&self, _: &[u8], target: &[u8], _: DiffMode) -> Result<Vec<u8>, DiffError> {
//!         Ok(target.to_vec())
//!     }
//! }
//!
//! let options = ImageOptions::default();
//! let source = SparseImage::open(
//!     std::fs::read("source/system.img").unwrap(),
//!     &std::fs::read_to_string("source/system.map").unwrap(),
//!     &options,
//! )
//! .unwrap();
//! let target = SparseImage::open(
//!     std::fs::read("target/system.img").unwrap(),
//!     &std::fs::read_to_string("target/system.map").unwrap(),
//!     &options,
//! )
//! .unwrap();
//!
//! let mut new_data = Vec::new();
//! let mut patch_data = Vec::new();
//! let update = generate_update(
//!     &source,
//!     &target,
//!     &Replace,
//!     &UpdateConfig::default(),
//!     &mut new_data,
//!     &mut patch_data,
//! )
//! .unwrap();
//!
//! print!("{}", update.transfer_list);
//! ```

use self::generate::{GenerateError, PartitionUpdate, PatchGenerator};
use self::graph::DependencyGraph;
use blockota_image::{HashAlgorithm, SparseImage};
use snafu::{ResultExt, Snafu, ensure};
use std::io::Write;
use std::num::NonZeroUsize;

pub use self::action::{Action, ActionKind};
pub use self::differ::Differ;

pub mod action;
pub mod differ;
pub mod generate;
pub mod graph;
pub mod plan;
pub mod transfer;

/// Options for generating a partition update.
#[derive(Debug, Clone)]
#[must_use]
pub struct UpdateConfig {
    hash_algorithm: HashAlgorithm,
    max_blocks_per_command: u64,
    worker_threads: usize,
    transfer_list_version: u32,
}

impl UpdateConfig {
    /// Digest used for content comparison and stash identity.
    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    /// Largest block count a single zero, new or erase command may cover.
    pub fn with_max_blocks_per_command(mut self, blocks: u64) -> Self {
        self.max_blocks_per_command = blocks.max(1);
        self
    }

    /// Threads computing digests and patches. `1` computes them inline.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_transfer_list_version(mut self, version: u32) -> Self {
        self.transfer_list_version = version;
        self
    }

    #[must_use]
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    #[must_use]
    pub fn max_blocks_per_command(&self) -> u64 {
        self.max_blocks_per_command
    }

    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    #[must_use]
    pub fn transfer_list_version(&self) -> u32 {
        self.transfer_list_version
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);

        Self {
            hash_algorithm: HashAlgorithm::default(),
            max_blocks_per_command: 1024,
            worker_threads: (cpus / 2).max(1),
            transfer_list_version: 1,
        }
    }
}

/// Generates the update turning `source` into `target`.
///
/// New data and patches are streamed to `new_data` and `patch_data` in the
/// order the transfer list references them.
///
/// # Errors
///
/// Returns [`Error::BlockSizeMismatch`] if the images use different block
/// sizes, or the first error hit while generating.
pub fn generate_update<S, T, D, N, P>(
    source: &SparseImage<S>,
    target: &SparseImage<T>,
    differ: &D,
    config: &UpdateConfig,
    new_data: N,
    patch_data: P,
) -> Result<PartitionUpdate, Error>
where
    S: AsRef<[u8]> + Sync,
    T: AsRef<[u8]> + Sync,
    D: Differ,
    N: Write,
    P: Write,
{
    ensure!(
        source.block_size() == target.block_size(),
        BlockSizeMismatchSnafu {
            source_size: source.block_size(),
            target_size: target.block_size(),
        }
    );

    let actions = plan::plan(source.file_map(), target.file_map());
    let graph = DependencyGraph::build(actions);

    PatchGenerator::new(source, target, differ, config)
        .generate(graph.into_ordered(), new_data, patch_data)
        .context(GenerateSnafu)
}

/// Errors from [`generate_update`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("block size mismatch: source {source_size}, target {target_size}"))]
    BlockSizeMismatch { source_size: u32, target_size: u32 },

    #[snafu(display("cannot generate transfer list"))]
    Generate { source: GenerateError },
}
