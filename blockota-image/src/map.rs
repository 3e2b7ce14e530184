//! Block maps: which blocks of an image belong to which file.
//!
//! A block map is a text file with one `<name> <ranges>` line per file, where
//! `<ranges>` uses the token form of [`RangeSet`]. Blocks that the map does
//! not claim end up in synthetic entries:
//!
//! - [`ZERO_KEY`] holds blocks whose content is all zeros.
//! - `__NONZERO-<n>` entries hold the remaining blocks, in groups of bounded
//!   size.
//! - [`COPY_KEY`] holds reserved blocks that are always rewritten verbatim.

use crate::ranges::{ParseError, RangeSet};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::collections::HashMap;
use tracing::debug;

/// Name of the all-zero pseudo-file.
pub const ZERO_KEY: &str = "__ZERO";
/// Prefix of the non-zero group pseudo-files.
pub const NONZERO_KEY: &str = "__NONZERO";
/// Name of the reserved pseudo-file.
pub const COPY_KEY: &str = "__COPY";

/// Errors when building a [`FileMap`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MapError {
    #[snafu(display("block map line {line} has no block ranges"))]
    MalformedLine { line: usize },

    #[snafu(display("block map line {line} has invalid block ranges"))]
    InvalidRanges { line: usize, source: ParseError },

    #[snafu(display("{name} is listed more than once in the block map"))]
    DuplicateEntry { name: String },

    #[snafu(display("blocks {ranges} of {name} are not unclaimed blocks of the image"))]
    NotInCareMap { name: String, ranges: RangeSet },
}

type Result<T, E = MapError> = std::result::Result<T, E>;

/// Ordered mapping from file name to the blocks it occupies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMap {
    entries: Vec<(String, RangeSet)>,
    index: HashMap<String, usize>,
}

impl FileMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the complete file map of an image.
    ///
    /// `entries` come from [`parse_block_map()`]. Each must only claim blocks
    /// of `care` that no earlier entry claimed. `reserved` is carved out next,
    /// then every leftover block is sorted by `is_zero` into the zero entry or
    /// into non-zero groups of at most `max_group` blocks.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NotInCareMap`] if an entry (or `reserved`) claims a
    /// block outside the unclaimed care blocks.
    pub fn build<F>(
        entries: Vec<(String, RangeSet)>,
        care: &RangeSet,
        reserved: &RangeSet,
        max_group: u64,
        mut is_zero: F,
    ) -> Result<Self>
    where
        F: FnMut(u64) -> bool,
    {
        let mut map = Self::new();
        let mut remaining = care.clone();

        for (name, ranges) in entries {
            claim(&mut remaining, &name, &ranges)?;
            map.insert(name, ranges)?;
        }

        claim(&mut remaining, COPY_KEY, reserved)?;

        let max_group = max_group.max(1);
        let mut zero = Vec::new();
        let mut groups = Vec::new();
        let mut group = Vec::new();
        let mut group_len = 0;

        for block in remaining.blocks() {
            if is_zero(block) {
                zero.extend([block, block + 1]);
                continue;
            }

            group.extend([block, block + 1]);
            group_len += 1;

            if group_len >= max_group {
                groups.push(std::mem::take(&mut group));
                group_len = 0;
            }
        }

        if !group.is_empty() {
            groups.push(group);
        }

        if !zero.is_empty() {
            map.insert(ZERO_KEY.into(), RangeSet::from_endpoints(zero))?;
        }

        for (i, group) in groups.into_iter().enumerate() {
            map.insert(format!("{NONZERO_KEY}-{i}"), RangeSet::from_endpoints(group))?;
        }

        if !reserved.is_empty() {
            map.insert(COPY_KEY.into(), reserved.clone())?;
        }

        debug!(
            files = map.len(),
            zero_blocks = map.get(ZERO_KEY).map_or(0, RangeSet::size),
            "built file map"
        );

        Ok(map)
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Fails if `name` is already present.
    pub fn insert(&mut self, name: String, ranges: RangeSet) -> Result<()> {
        ensure!(
            !self.index.contains_key(&name),
            DuplicateEntrySnafu { name }
        );

        self.index.insert(name.clone(), self.entries.len());
        self.entries.push((name, ranges));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RangeSet> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RangeSet)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses block map text into `(name, ranges)` pairs. Blank lines are
/// skipped.
pub fn parse_block_map(text: &str) -> Result<Vec<(String, RangeSet)>> {
    let mut entries = Vec::new();

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        let (name, ranges) = line
            .split_once(char::is_whitespace)
            .context(MalformedLineSnafu { line: line_no })?;
        let ranges =
            RangeSet::parse_tokens(ranges).context(InvalidRangesSnafu { line: line_no })?;

        entries.push((name.to_owned(), ranges));
    }

    Ok(entries)
}

fn claim(remaining: &mut RangeSet, name: &str, ranges: &RangeSet) -> Result<()> {
    let outside = ranges.subtract(remaining);

    ensure!(
        outside.is_empty(),
        NotInCareMapSnafu {
            name,
            ranges: outside,
        }
    );

    *remaining = remaining.subtract(ranges);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(text: &str) -> RangeSet {
        text.parse().unwrap()
    }

    #[test]
    fn parses_map_lines() {
        let entries = parse_block_map("/system/bin/sh 0-3 7\n\n/etc/hosts 4\n").unwrap();

        assert_eq!(
            entries,
            [
                ("/system/bin/sh".to_owned(), rs("0-3 7")),
                ("/etc/hosts".to_owned(), rs("4")),
            ]
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            parse_block_map("a 0-1\nlonely\n"),
            Err(MapError::MalformedLine { line: 2 })
        ));
        assert!(matches!(
            parse_block_map("a 5-1"),
            Err(MapError::InvalidRanges { line: 1, .. })
        ));
    }

    #[test]
    fn classifies_leftover_blocks() {
        let entries = parse_block_map("a 0-1\nb 2").unwrap();
        let zeros = [3u64, 4, 8];

        let map = FileMap::build(entries, &rs("0-9"), &rs("9"), 2, |b| zeros.contains(&b)).unwrap();
        let names: Vec<&str> = map.iter().map(|(n, _)| n).collect();

        assert_eq!(
            names,
            ["a", "b", ZERO_KEY, "__NONZERO-0", "__NONZERO-1", COPY_KEY]
        );
        assert_eq!(map.get(ZERO_KEY), Some(&rs("3-4 8")));
        assert_eq!(map.get("__NONZERO-0"), Some(&rs("5-6")));
        assert_eq!(map.get("__NONZERO-1"), Some(&rs("7")));
        assert_eq!(map.get(COPY_KEY), Some(&rs("9")));
    }

    #[test]
    fn rejects_blocks_outside_care_map() {
        let entries = parse_block_map("a 0-9").unwrap();

        let err =
            FileMap::build(entries, &rs("0-7"), &RangeSet::new(), 512, |_| false).unwrap_err();
        match err {
            MapError::NotInCareMap { name, ranges } => {
                assert_eq!(name, "a");
                assert_eq!(ranges, rs("8-9"));
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn rejects_blocks_claimed_twice() {
        let entries = parse_block_map("a 0-3\nb 3-5").unwrap();

        assert!(matches!(
            FileMap::build(entries, &rs("0-9"), &RangeSet::new(), 512, |_| false),
            Err(MapError::NotInCareMap { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let entries = parse_block_map("a 0-1\na 2-3").unwrap();

        assert!(matches!(
            FileMap::build(entries, &rs("0-9"), &RangeSet::new(), 512, |_| false),
            Err(MapError::DuplicateEntry { .. })
        ));
    }
}
