//! Turning ordered actions into a transfer list and its data streams.
//!
//! Generation runs in two phases. Content digests and patches for diffable
//! actions have no dependencies on each other and are computed on a worker
//! pool. Stash bookkeeping, opcode emission and appends to the new-data and
//! patch-data streams then happen on the calling thread, strictly in action
//! order.

use crate::UpdateConfig;
use crate::action::{Action, ActionKind};
use crate::differ::{DiffError, DiffMode, Differ};
use crate::graph::disjoint;
use crate::transfer::{Command, SourceDescriptor, TransferList, split};
use blockota_image::{RangeSet, ReadRangeError, SparseImage, WriteRangeError};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::collections::HashMap;
use std::io::{self, Write};
use tracing::{debug, info};

use generate_error::*;

/// Everything produced for one partition.
#[derive(Debug, Clone)]
pub struct PartitionUpdate {
    pub transfer_list: TransferList,
    /// Source blocks read by stash and move/diff commands.
    pub touched_source: RangeSet,
    /// Digest of the source content of [`touched_source`](Self::touched_source).
    pub touched_source_hash: String,
    /// The final actions, in execution order.
    pub actions: Vec<Action>,
    pub new_data_len: u64,
    pub patch_data_len: u64,
}

/// Result of the parallel phase for one diffable action.
#[derive(Debug)]
enum Payload {
    Identical {
        target_hash: String,
    },
    Patch {
        mode: DiffMode,
        source_hash: String,
        target_hash: String,
        patch: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy)]
struct StashEntry {
    refs: usize,
    blocks: u64,
}

/// Live stashes keyed by content digest.
#[derive(Debug, Default)]
struct StashTable {
    entries: HashMap<String, StashEntry>,
    blocks: u64,
    max_blocks: u64,
    max_entries: usize,
}

impl StashTable {
    /// Adds a reference to `hash`, returning `true` if the content has to be
    /// stashed now.
    fn stash(&mut self, hash: &str, blocks: u64) -> bool {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.refs += 1;
            return false;
        }

        self.entries.insert(hash.to_owned(), StashEntry { refs: 1, blocks });
        self.blocks += blocks;
        self.max_blocks = self.max_blocks.max(self.blocks);
        self.max_entries = self.max_entries.max(self.entries.len());
        true
    }

    /// Drops a reference to `hash`, returning the blocks released if this
    /// was the last one.
    fn release(&mut self, hash: &str) -> Result<Option<u64>, StashError> {
        let entry = self
            .entries
            .get_mut(hash)
            .context(MissingStashSnafu { hash })?;

        entry.refs -= 1;

        if entry.refs > 0 {
            return Ok(None);
        }

        let blocks = entry.blocks;
        self.entries.remove(hash);
        Ok(Some(blocks))
    }

    fn finish(&self) -> Result<(), StashError> {
        ensure!(
            self.entries.is_empty(),
            LeakedStashesSnafu {
                count: self.entries.len(),
            }
        );
        Ok(())
    }

    /// Accounts for an in-place move/diff whose source overlaps its target:
    /// the applier has to hold the whole source in scratch space.
    fn note_in_place(&mut self, source_blocks: u64) {
        self.max_blocks = self.max_blocks.max(self.blocks + source_blocks);
    }
}

/// Counts bytes passing through a writer.
struct Counted<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for Counted<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Generates the transfer list for a pair of images.
pub struct PatchGenerator<'a, S: AsRef<[u8]>, T: AsRef<[u8]>, D: Differ> {
    source: &'a SparseImage<S>,
    target: &'a SparseImage<T>,
    differ: &'a D,
    config: &'a UpdateConfig,
}

impl<S: AsRef<[u8]>, T: AsRef<[u8]>, D: Differ> std::fmt::Debug for PatchGenerator<'_, S, T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchGenerator")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'a, S, T, D> PatchGenerator<'a, S, T, D>
where
    S: AsRef<[u8]> + Sync,
    T: AsRef<[u8]> + Sync,
    D: Differ,
{
    pub fn new(
        source: &'a SparseImage<S>,
        target: &'a SparseImage<T>,
        differ: &'a D,
        config: &'a UpdateConfig,
    ) -> Self {
        Self {
            source,
            target,
            differ,
            config,
        }
    }

    /// Emits the transfer list for `actions`, which must be in execution
    /// order. Literal target data goes to `new_data` and patches to
    /// `patch_data`.
    ///
    /// # Errors
    ///
    /// Any failure aborts the whole partition: a diff tool error, an I/O
    /// error on either stream, broken stash accounting or a failed output
    /// self-check.
    pub fn generate<N, P>(
        &self,
        mut actions: Vec<Action>,
        new_data: N,
        patch_data: P,
    ) -> Result<PartitionUpdate, GenerateError>
    where
        N: Write,
        P: Write,
    {
        let mut payloads = self.compute_payloads(&actions)?;
        let algorithm = self.config.hash_algorithm();
        let limit = self.config.max_blocks_per_command();
        let block_size = u64::from(self.target.block_size());

        let mut new_data = Counted {
            inner: new_data,
            written: 0,
        };
        let mut patch_data = Counted {
            inner: patch_data,
            written: 0,
        };

        let mut stashes = StashTable::default();
        let mut digests: HashMap<RangeSet, String> = HashMap::new();
        let mut touched = RangeSet::new();
        let mut commands = Vec::new();
        let mut total_blocks = 0;
        let mut new_blocks = 0;
        let mut patch_end = 0;

        for action in &mut actions {
            for (_, ranges) in &action.stash_before {
                let hash = self.source_digest(&mut digests, ranges)?;

                if stashes.stash(&hash, ranges.size()) {
                    touched = touched.union(ranges);
                    commands.push(Command::Stash {
                        hash,
                        ranges: ranges.clone(),
                    });
                }
            }

            let mut frees = Vec::new();
            let mut freed_blocks = 0;
            let source = self.describe_source(action, &mut digests, &mut stashes, |hash, blocks| {
                frees.push(Command::Free { hash });
                freed_blocks += blocks;
            })?;

            match action.kind {
                ActionKind::Zero => {
                    let to_zero = action.target_ranges.subtract(&action.source_ranges);
                    total_blocks += to_zero.size();
                    commands.extend(split_checked(&to_zero, limit)?.into_iter().map(Command::Zero));
                }
                ActionKind::New => {
                    self.target
                        .write_range_to(&action.target_ranges, &mut new_data)
                        .context(WriteNewDataSnafu {
                            target: &action.target_name,
                        })?;

                    new_blocks += action.target_ranges.size();
                    total_blocks += action.target_ranges.size();
                    commands.extend(
                        split_checked(&action.target_ranges, limit)?
                            .into_iter()
                            .map(Command::New),
                    );
                }
                ActionKind::Different | ActionKind::Move => {
                    let payload = payloads.remove(&action.id).context(SelfCheckSnafu {
                        message: format!("no payload computed for {action}"),
                    })?;

                    if action.source_ranges == action.target_ranges
                        && matches!(payload, Payload::Identical { .. })
                    {
                        // Already in place.
                        action.kind = ActionKind::Move;
                    } else {
                        if action.source_ranges.overlaps(&action.target_ranges) {
                            stashes.note_in_place(action.source_ranges.size());
                        }

                        touched = touched.union(&action.source_ranges);
                        total_blocks += action.target_ranges.size();

                        match payload {
                            Payload::Identical { target_hash } => {
                                action.kind = ActionKind::Move;
                                commands.push(Command::Move {
                                    target_hash,
                                    target: action.target_ranges.clone(),
                                    source,
                                });
                            }
                            Payload::Patch {
                                mode,
                                source_hash,
                                target_hash,
                                patch,
                            } => {
                                patch_data.write_all(&patch).context(WritePatchDataSnafu {
                                    target: &action.target_name,
                                })?;

                                commands.push(Command::Diff {
                                    mode,
                                    patch_offset: patch_end,
                                    patch_len: patch.len() as u64,
                                    source_hash,
                                    target_hash,
                                    target: action.target_ranges.clone(),
                                    source,
                                });
                                patch_end += patch.len() as u64;
                            }
                        }
                    }
                }
            }

            debug!(action = %action, order = action.order, "emitted transfer");

            commands.extend(frees);
            stashes.blocks -= freed_blocks;
        }

        stashes.finish().context(StashSnafu)?;

        let touched_source_hash = self
            .source
            .digest(&touched, algorithm)
            .context(ReadSourceSnafu {
                target: "touched source blocks",
            })?;

        let extended = self.target.extended_ranges();
        if !extended.is_empty() {
            total_blocks += extended.size();
            commands.extend(split_checked(extended, limit)?.into_iter().map(Command::Zero));
        }

        let all = RangeSet::from_range(0, self.target.total_blocks());
        let not_care = all.subtract(extended).subtract(self.target.care_ranges());
        let erase_first = not_care.subtract(&touched);
        let erase_last = not_care.subtract(&erase_first);

        if !erase_first.is_empty() {
            let pieces = split_checked(&erase_first, limit)?;
            commands.splice(0..0, pieces.into_iter().map(Command::Erase));
        }
        if !erase_last.is_empty() {
            commands.extend(split_checked(&erase_last, limit)?.into_iter().map(Command::Erase));
        }

        ensure!(
            new_data.written == new_blocks * block_size,
            SelfCheckSnafu {
                message: format!(
                    "new data is {} bytes, expected {} blocks of {block_size}",
                    new_data.written, new_blocks
                ),
            }
        );
        ensure!(
            patch_data.written == patch_end,
            SelfCheckSnafu {
                message: format!(
                    "patch data is {} bytes, last patch ends at {patch_end}",
                    patch_data.written
                ),
            }
        );

        new_data.flush().context(FlushSnafu)?;
        patch_data.flush().context(FlushSnafu)?;

        let transfer_list = TransferList {
            version: self.config.transfer_list_version(),
            total_blocks,
            max_stash_entries: stashes.max_entries,
            max_stashed_blocks: stashes.max_blocks,
            commands,
        };

        info!(
            total_blocks,
            new_blocks,
            patch_bytes = patch_end,
            max_stashed_blocks = stashes.max_blocks,
            commands = transfer_list.commands.len(),
            "generated transfer list"
        );

        Ok(PartitionUpdate {
            transfer_list,
            touched_source: touched,
            touched_source_hash,
            actions,
            new_data_len: new_data.written,
            patch_data_len: patch_end,
        })
    }

    /// Builds the source descriptor of `action`, releasing the stashes it
    /// reads. `on_free` is called for every stash whose last reference goes.
    fn describe_source<F>(
        &self,
        action: &Action,
        digests: &mut HashMap<RangeSet, String>,
        stashes: &mut StashTable,
        mut on_free: F,
    ) -> Result<SourceDescriptor, GenerateError>
    where
        F: FnMut(String, u64),
    {
        let source = &action.source_ranges;
        let mut descriptor = SourceDescriptor {
            total_blocks: source.size(),
            live: None,
            mapped_live: None,
            stashes: Vec::new(),
        };
        let mut live = source.clone();

        for (_, ranges) in &action.use_stash {
            live = live.subtract(ranges);

            let mapped = source
                .map_within(ranges)
                .context(OutsideSourceSnafu {
                    target: &action.target_name,
                })
                .context(StashSnafu)?;
            let hash = self.source_digest(digests, ranges)?;

            if let Some(blocks) = stashes.release(&hash).context(StashSnafu)? {
                on_free(hash.clone(), blocks);
            }

            descriptor.stashes.push((hash, mapped));
        }

        if action.use_stash.is_empty() {
            if !live.is_empty() {
                descriptor.live = Some(live);
            }
            return Ok(descriptor);
        }

        let mut pieces: Vec<&RangeSet> = descriptor.stashes.iter().map(|(_, m)| m).collect();
        let mapped_live;

        if !live.is_empty() {
            mapped_live = source
                .map_within(&live)
                .context(OutsideSourceSnafu {
                    target: &action.target_name,
                })
                .context(StashSnafu)?;
            pieces.push(&mapped_live);
        } else {
            mapped_live = RangeSet::new();
        }

        check_partition(&pieces, source.size(), &action.target_name).context(StashSnafu)?;

        if !live.is_empty() {
            descriptor.mapped_live = Some(mapped_live);
            descriptor.live = Some(live);
        }

        Ok(descriptor)
    }

    fn source_digest(
        &self,
        cache: &mut HashMap<RangeSet, String>,
        ranges: &RangeSet,
    ) -> Result<String, GenerateError> {
        if let Some(hash) = cache.get(ranges) {
            return Ok(hash.clone());
        }

        let hash = self
            .source
            .digest(ranges, self.config.hash_algorithm())
            .context(ReadSourceSnafu { target: "stash" })?;
        cache.insert(ranges.clone(), hash.clone());

        Ok(hash)
    }

    /// Digests and diffs every diffable action on the worker pool.
    fn compute_payloads(
        &self,
        actions: &[Action],
    ) -> Result<HashMap<usize, Payload>, GenerateError> {
        let pending: Vec<&Action> = actions
            .iter()
            .filter(|a| matches!(a.kind, ActionKind::Different | ActionKind::Move))
            .collect();
        let threads = self.config.worker_threads();

        let payloads: Vec<(usize, Payload)> = if threads <= 1 || pending.len() <= 1 {
            pending
                .iter()
                .map(|a| self.compute_payload(a).map(|p| (a.id, p)))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("blockota-diff-{i}"))
                .build()
                .context(ThreadPoolSnafu)?;

            pool.install(|| {
                pending
                    .par_iter()
                    .map(|a| self.compute_payload(a).map(|p| (a.id, p)))
                    .collect::<Result<Vec<_>, _>>()
            })?
        };

        Ok(payloads.into_iter().collect())
    }

    fn compute_payload(&self, action: &Action) -> Result<Payload, GenerateError> {
        let algorithm = self.config.hash_algorithm();
        let target = &action.target_name;

        let source_hash = self
            .source
            .digest(&action.source_ranges, algorithm)
            .context(ReadSourceSnafu { target })?;
        let target_hash = self
            .target
            .digest(&action.target_ranges, algorithm)
            .context(ReadTargetSnafu { target })?;

        if source_hash == target_hash {
            return Ok(Payload::Identical { target_hash });
        }

        let source_data = self
            .source
            .read_to_vec(&action.source_ranges)
            .context(ReadSourceSnafu { target })?;
        let target_data = self
            .target
            .read_to_vec(&action.target_ranges)
            .context(ReadTargetSnafu { target })?;

        let mode = DiffMode::for_target(target);
        let patch = self
            .differ
            .diff(&source_data, &target_data, mode)
            .context(DiffSnafu { target })?;

        debug!(
            file = %target,
            %mode,
            source_bytes = source_data.len(),
            target_bytes = target_data.len(),
            patch_bytes = patch.len(),
            "computed patch"
        );

        Ok(Payload::Patch {
            mode,
            source_hash,
            target_hash,
            patch,
        })
    }
}

fn split_checked(ranges: &RangeSet, limit: u64) -> Result<Vec<RangeSet>, GenerateError> {
    let pieces = split(ranges, limit);
    let refs: Vec<&RangeSet> = pieces.iter().collect();
    let covered = pieces.iter().fold(RangeSet::new(), |acc, p| acc.union(p));

    ensure!(
        disjoint(&refs) && &covered == ranges && pieces.iter().all(|p| p.size() <= limit.max(1)),
        SelfCheckSnafu {
            message: format!("split of {ranges} does not cover it exactly"),
        }
    );

    Ok(pieces)
}

/// Checks that `pieces` are disjoint and cover `[0, size)` exactly.
fn check_partition(pieces: &[&RangeSet], size: u64, target: &str) -> Result<(), StashError> {
    ensure!(disjoint(pieces), OverlappingSourcePartsSnafu { target });

    let covered = pieces.iter().fold(RangeSet::new(), |acc, p| acc.union(p));
    ensure!(
        covered == RangeSet::from_range(0, size),
        IncompleteSourceCoverSnafu { target }
    );

    Ok(())
}

/// Inconsistent stash bookkeeping. Always an internal bug.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum StashError {
    #[snafu(display("stash {hash} is read but was never stashed"))]
    MissingStash { hash: String },

    #[snafu(display("{count} stashes are never freed"))]
    LeakedStashes { count: usize },

    #[snafu(display("stashed blocks of {target} are not part of its source"))]
    OutsideSource { target: String },

    #[snafu(display("source parts of {target} overlap"))]
    OverlappingSourceParts { target: String },

    #[snafu(display("source parts of {target} do not cover its source"))]
    IncompleteSourceCover { target: String },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum GenerateError {
    #[snafu(display("cannot read source blocks of {target}"))]
    ReadSource {
        target: String,
        source: ReadRangeError,
    },

    #[snafu(display("cannot read target blocks of {target}"))]
    ReadTarget {
        target: String,
        source: ReadRangeError,
    },

    #[snafu(display("cannot diff {target}"))]
    Diff { target: String, source: DiffError },

    #[snafu(display("cannot write new data of {target}"))]
    WriteNewData {
        target: String,
        source: WriteRangeError,
    },

    #[snafu(display("cannot write patch of {target}"))]
    WritePatchData {
        target: String,
        source: std::io::Error,
    },

    #[snafu(display("cannot flush output streams"))]
    Flush { source: std::io::Error },

    #[snafu(display("stash accounting failed"))]
    Stash { source: StashError },

    #[snafu(display("self-check failed: {message}"))]
    SelfCheck { message: String },

    #[snafu(display("cannot start diff workers"))]
    ThreadPool { source: rayon::ThreadPoolBuildError },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(text: &str) -> RangeSet {
        text.parse().unwrap()
    }

    #[test]
    fn stash_table_counts_references() {
        let mut table = StashTable::default();

        assert!(table.stash("h1", 2));
        assert!(!table.stash("h1", 2));
        assert!(table.stash("h2", 3));
        assert_eq!(table.blocks, 5);
        assert_eq!(table.max_entries, 2);

        assert_eq!(table.release("h1").unwrap(), None);
        assert_eq!(table.release("h1").unwrap(), Some(2));
        assert!(matches!(
            table.release("h1"),
            Err(StashError::MissingStash { .. })
        ));
        assert!(matches!(
            table.finish(),
            Err(StashError::LeakedStashes { count: 1 })
        ));

        assert_eq!(table.release("h2").unwrap(), Some(3));
        table.finish().unwrap();
        assert_eq!(table.max_blocks, 5);
    }

    #[test]
    fn in_place_reads_raise_high_water_mark() {
        let mut table = StashTable::default();
        table.stash("h", 2);
        table.note_in_place(10);

        assert_eq!(table.max_blocks, 12);
        assert_eq!(table.blocks, 2);
    }

    #[test]
    fn source_parts_must_partition() {
        let a = rs("0-1");
        let b = rs("2-3");
        let c = rs("1-2");

        check_partition(&[&a, &b], 4, "f").unwrap();
        assert!(matches!(
            check_partition(&[&a, &c], 4, "f"),
            Err(StashError::OverlappingSourceParts { .. })
        ));
        assert!(matches!(
            check_partition(&[&a], 4, "f"),
            Err(StashError::IncompleteSourceCover { .. })
        ));
    }

    #[test]
    fn checked_split_covers_input() {
        let pieces = split_checked(&rs("0-9 20-24"), 4).unwrap();

        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces.iter().map(RangeSet::size).sum::<u64>(), 15);
    }
}
