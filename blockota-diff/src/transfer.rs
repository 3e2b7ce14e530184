//! Transfer list opcodes and rendering.
//!
//! A transfer list is a text script: four header lines (format version,
//! blocks written, maximum simultaneous stash entries, maximum stashed
//! blocks) followed by one opcode per line. Block sets are always written in
//! the canonical `<count>,<v0>,<v1>,...` form.

use crate::differ::DiffMode;
use blockota_image::RangeSet;
use std::fmt;

/// Where a move or diff reads its source blocks from.
///
/// Rendered as `<blocks> <live|-> [<mapped live>] <hash>:<mapped> ...`, where
/// mapped sets are offsets into the concatenated source blocks. The mapped
/// live set is only present when stashes are read as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub total_blocks: u64,
    pub live: Option<RangeSet>,
    pub mapped_live: Option<RangeSet>,
    pub stashes: Vec<(String, RangeSet)>,
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.total_blocks)?;

        match &self.live {
            Some(live) => write!(f, " {}", live.to_raw_string())?,
            None => f.write_str(" -")?,
        }

        if let Some(mapped) = &self.mapped_live {
            write!(f, " {}", mapped.to_raw_string())?;
        }

        for (hash, mapped) in &self.stashes {
            write!(f, " {hash}:{}", mapped.to_raw_string())?;
        }

        Ok(())
    }
}

/// A single transfer list instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Zero(RangeSet),
    New(RangeSet),
    Erase(RangeSet),
    Move {
        target_hash: String,
        target: RangeSet,
        source: SourceDescriptor,
    },
    Diff {
        mode: DiffMode,
        patch_offset: u64,
        patch_len: u64,
        source_hash: String,
        target_hash: String,
        target: RangeSet,
        source: SourceDescriptor,
    },
    Stash {
        hash: String,
        ranges: RangeSet,
    },
    Free {
        hash: String,
    },
}

impl Command {
    /// Returns the opcode name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zero(_) => "zero",
            Self::New(_) => "new",
            Self::Erase(_) => "erase",
            Self::Move { .. } => "move",
            Self::Diff { mode, .. } => mode.opcode(),
            Self::Stash { .. } => "stash",
            Self::Free { .. } => "free",
        }
    }

    /// Returns the blocks this command writes to the target, if any.
    #[must_use]
    pub fn target(&self) -> Option<&RangeSet> {
        match self {
            Self::Zero(r) | Self::New(r) | Self::Erase(r) => Some(r),
            Self::Move { target, .. } | Self::Diff { target, .. } => Some(target),
            Self::Stash { .. } | Self::Free { .. } => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();

        match self {
            Self::Zero(r) | Self::New(r) | Self::Erase(r) => {
                write!(f, "{name} {}", r.to_raw_string())
            }
            Self::Move {
                target_hash,
                target,
                source,
            } => write!(f, "{name} {target_hash} {} {source}", target.to_raw_string()),
            Self::Diff {
                patch_offset,
                patch_len,
                source_hash,
                target_hash,
                target,
                source,
                ..
            } => write!(
                f,
                "{name} {patch_offset} {patch_len} {source_hash} {target_hash} {} {source}",
                target.to_raw_string()
            ),
            Self::Stash { hash, ranges } => write!(f, "{name} {hash} {}", ranges.to_raw_string()),
            Self::Free { hash } => write!(f, "{name} {hash}"),
        }
    }
}

/// A complete transfer list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferList {
    pub version: u32,
    /// Blocks written by zero, new, move and diff commands.
    pub total_blocks: u64,
    pub max_stash_entries: usize,
    pub max_stashed_blocks: u64,
    pub commands: Vec<Command>,
}

impl TransferList {
    /// Returns the commands with the given opcode name.
    pub fn commands_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Command> {
        self.commands.iter().filter(move |c| c.name() == name)
    }
}

impl fmt::Display for TransferList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.version)?;
        writeln!(f, "{}", self.total_blocks)?;
        writeln!(f, "{}", self.max_stash_entries)?;
        writeln!(f, "{}", self.max_stashed_blocks)?;

        for command in &self.commands {
            writeln!(f, "{command}")?;
        }

        Ok(())
    }
}

/// Splits `ranges` into pieces of at most `limit` blocks, lowest blocks
/// first.
pub(crate) fn split(ranges: &RangeSet, limit: u64) -> Vec<RangeSet> {
    let limit = limit.max(1);
    let mut rest = ranges.clone();
    let mut out = Vec::new();

    while !rest.is_empty() {
        let piece = rest.first_n_blocks(limit);
        rest = rest.subtract(&piece);
        out.push(piece);
    }

    out
}
