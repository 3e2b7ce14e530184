//! Sets of disjoint, half-open block ranges.
//!
//! A [`RangeSet`] stores its ranges as a flat list of endpoints
//! `[s0, e0, s1, e1, ...]` with `s0 < e0 < s1 < e1 < ...`. Adjacent ranges
//! are always merged, so two equal sets always have identical endpoints.
//!
//! Most set operations are built on a single construction primitive: sort a
//! multiset of endpoints and cancel values that repeat. Reading the result as
//! alternating start/end points yields the symmetric difference of the inputs,
//! from which union and subtraction follow.

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::num::ParseIntError;
use std::str::FromStr;

/// Errors when parsing range text.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("invalid block number {text:?}"))]
    InvalidNumber { text: String, source: ParseIntError },

    #[snafu(display("range {start}-{end} ends before it starts"))]
    ReversedRange { start: u64, end: u64 },

    #[snafu(display("block {block} is too large"))]
    BlockOverflow { block: u64 },

    #[snafu(display("range header announces {expected} values but {actual} follow"))]
    CountMismatch { expected: usize, actual: usize },

    #[snafu(display("odd number of range endpoints ({count})"))]
    OddCount { count: usize },
}

/// An immutable set of disjoint block ranges.
#[derive(Clone)]
#[must_use]
pub struct RangeSet {
    data: Vec<u64>,
    /// Whether the input was already canonical when this set was built.
    monotonic: bool,
}

impl RangeSet {
    /// Returns the empty set.
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            monotonic: true,
        }
    }

    /// Returns the set holding the single range `[start, end)`.
    pub fn from_range(start: u64, end: u64) -> Self {
        if start >= end {
            return Self::new();
        }

        Self {
            data: vec![start, end],
            monotonic: true,
        }
    }

    /// Builds a set from an unordered list of endpoints.
    ///
    /// The endpoints are sorted and values that repeat are cancelled in
    /// pairs. Feeding the endpoints of several sets at once therefore
    /// produces their symmetric difference.
    ///
    /// # Panics
    ///
    /// Panics if `endpoints` has an odd length.
    pub fn from_endpoints(mut endpoints: Vec<u64>) -> Self {
        assert!(
            endpoints.len() % 2 == 0,
            "range endpoints must come in pairs"
        );

        let monotonic = endpoints.windows(2).all(|w| w[0] < w[1]);

        if monotonic {
            return Self {
                data: endpoints,
                monotonic,
            };
        }

        endpoints.sort_unstable();

        Self {
            data: remove_repeated_pairs(&endpoints),
            monotonic,
        }
    }

    /// Parses the canonical `"<count>,<v0>,<v1>,..."` form.
    pub fn parse_raw(text: &str) -> Result<Self, ParseError> {
        let mut values = text.trim().split(',').map(parse_number);

        let count = match values.next() {
            Some(v) => v? as usize,
            None => 0,
        };

        let endpoints = values.collect::<Result<Vec<u64>, ParseError>>()?;

        ensure!(
            endpoints.len() == count,
            CountMismatchSnafu {
                expected: count,
                actual: endpoints.len(),
            }
        );
        ensure!(count % 2 == 0, OddCountSnafu { count });

        Ok(Self::from_endpoints(endpoints))
    }

    /// Parses whitespace separated `N` (single block) and `A-B` (inclusive)
    /// tokens, as found in block map files.
    pub fn parse_tokens(text: &str) -> Result<Self, ParseError> {
        let mut endpoints = Vec::new();
        let mut monotonic = true;
        let mut last = 0;

        for token in text.split_whitespace() {
            let (start, end) = match token.split_once('-') {
                Some((s, e)) => {
                    let start = parse_number(s)?;
                    let end = parse_number(e)?;
                    ensure!(start <= end, ReversedRangeSnafu { start, end });
                    (start, end)
                }
                None => {
                    let block = parse_number(token)?;
                    (block, block)
                }
            };

            let end = end
                .checked_add(1)
                .context(BlockOverflowSnafu { block: end })?;

            if start >= last && (endpoints.is_empty() || start > last) {
                last = end;
            } else {
                monotonic = false;
            }

            endpoints.push(start);
            endpoints.push(end);
        }

        endpoints.sort_unstable();

        Ok(Self {
            data: remove_repeated_pairs(&endpoints),
            monotonic,
        })
    }

    /// Whether the set was built from already canonical input.
    ///
    /// This is only a hint; every operation works on any set.
    #[must_use]
    pub fn is_monotonic(&self) -> bool {
        self.monotonic
    }

    /// Returns the raw endpoint list.
    #[must_use]
    pub fn endpoints(&self) -> &[u64] {
        &self.data
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the total number of blocks in the set.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.iter().map(|(s, e)| e - s).sum()
    }

    /// Returns the end of the last range, or zero for an empty set.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.data.last().copied().unwrap_or(0)
    }

    /// Iterates over the `(start, end)` pairs in ascending order.
    pub fn iter(&self) -> Ranges<'_> {
        Ranges {
            inner: self.data.chunks_exact(2),
        }
    }

    /// Iterates over every block index in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.iter().flat_map(|(s, e)| s..e)
    }

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let common = self.intersect(other);
        let mut endpoints =
            Vec::with_capacity(self.data.len() + other.data.len() + common.data.len());

        endpoints.extend_from_slice(&self.data);
        endpoints.extend_from_slice(&other.data);
        endpoints.extend_from_slice(&common.data);

        Self::from_endpoints(endpoints)
    }

    /// Returns the blocks present in both sets.
    ///
    /// Every pair of ranges is classified by sorting its four endpoints: the
    /// pair is disjoint iff the sorted order equals one of the two "entirely
    /// before" orders, otherwise the middle two points bound the overlap.
    /// Ranges that merely touch are disjoint.
    pub fn intersect(&self, other: &RangeSet) -> RangeSet {
        let theirs: Vec<(u64, u64)> = other.iter().collect();
        let mut out = Vec::new();
        let mut first = 0;

        for (a1, a2) in self.iter() {
            for &(b1, b2) in &theirs[first..] {
                if b1 >= a2 {
                    break;
                }

                if let Some((s, e)) = overlap(a1, a2, b1, b2) {
                    out.push(s);
                    out.push(e);
                }
            }

            // Ranges of `other` ending here can not reach the next range.
            while first < theirs.len() && theirs[first].1 <= a2 {
                first += 1;
            }
        }

        Self::from_endpoints(out)
    }

    /// Returns the blocks of `self` that are not in `other`.
    ///
    /// Relies on `self ∩ other ⊆ self`: merging the endpoints of `self` with
    /// those of the intersection cancels exactly the shared blocks.
    pub fn subtract(&self, other: &RangeSet) -> RangeSet {
        let common = self.intersect(other);

        if common.is_empty() {
            return self.clone();
        }

        let mut endpoints = Vec::with_capacity(self.data.len() + common.data.len());

        endpoints.extend_from_slice(&self.data);
        endpoints.extend_from_slice(&common.data);

        Self::from_endpoints(endpoints)
    }

    #[must_use]
    pub fn overlaps(&self, other: &RangeSet) -> bool {
        self.iter().any(|(a1, a2)| {
            other
                .iter()
                .take_while(|&(b1, _)| b1 < a2)
                .any(|(b1, b2)| overlap(a1, a2, b1, b2).is_some())
        })
    }

    /// Returns `true` if every block of `other` is also in `self`.
    #[must_use]
    pub fn contains(&self, other: &RangeSet) -> bool {
        other.subtract(self).is_empty()
    }

    /// Grows every range by `n` blocks on both sides (clamped at block 0),
    /// merging ranges that meet as a result.
    pub fn extend_by(&self, n: u64) -> RangeSet {
        let mut out: Vec<u64> = Vec::with_capacity(self.data.len());

        for (s, e) in self.iter() {
            let s = s.saturating_sub(n);
            let e = e.saturating_add(n);

            match out.last_mut() {
                Some(last) if s <= *last => *last = (*last).max(e),
                _ => {
                    out.push(s);
                    out.push(e);
                }
            }
        }

        Self {
            data: out,
            monotonic: true,
        }
    }

    /// Renumbers `other` as offsets into the concatenation of the ranges of
    /// `self`.
    ///
    /// For `self = {10-19, 30-39}` and `other = {15-19, 30-34}` the result is
    /// `{5-14}`. Returns `None` if `other` is not a subset of `self`.
    #[must_use]
    pub fn map_within(&self, other: &RangeSet) -> Option<RangeSet> {
        let mut out = Vec::with_capacity(other.data.len());
        let mut ours = self.iter().peekable();
        let mut offset = 0;

        for (s, e) in other.iter() {
            // Skip our ranges lying entirely before `s`.
            while let Some(&(a1, a2)) = ours.peek() {
                if a2 <= s {
                    offset += a2 - a1;
                    ours.next();
                } else {
                    break;
                }
            }

            let &(a1, a2) = ours.peek()?;

            if s < a1 || e > a2 {
                return None;
            }

            out.push(offset + (s - a1));
            out.push(offset + (e - a1));
        }

        Some(Self::from_endpoints(out))
    }

    /// Inverse of [`map_within()`](Self::map_within): turns offsets into the
    /// concatenated ranges of `self` back into block numbers.
    ///
    /// Returns `None` if an offset lies past [`size()`](Self::size).
    #[must_use]
    pub fn unmap_within(&self, offsets: &RangeSet) -> Option<RangeSet> {
        let mut out = Vec::new();
        let mut ours = self.iter().peekable();
        let mut base = 0;

        for (mut s, e) in offsets.iter() {
            while s < e {
                let &(a1, a2) = ours.peek()?;
                let len = a2 - a1;

                if s >= base + len {
                    base += len;
                    ours.next();
                    continue;
                }

                let piece_end = e.min(base + len);

                out.push(a1 + (s - base));
                out.push(a1 + (piece_end - base));
                s = piece_end;
            }
        }

        Some(Self::from_endpoints(out))
    }

    /// Returns the lowest `n` blocks of the set (or the whole set if it is
    /// smaller).
    pub fn first_n_blocks(&self, n: u64) -> RangeSet {
        if self.size() <= n {
            return self.clone();
        }

        let mut out = Vec::new();
        let mut remaining = n;

        for (s, e) in self.iter() {
            if remaining == 0 {
                break;
            }

            let take = remaining.min(e - s);
            out.push(s);
            out.push(s + take);
            remaining -= take;
        }

        Self::from_endpoints(out)
    }

    /// Renders the canonical `"<count>,<v0>,<v1>,..."` form.
    #[must_use]
    pub fn to_raw_string(&self) -> String {
        let mut out = self.data.len().to_string();

        for v in &self.data {
            out.push(',');
            out.push_str(&v.to_string());
        }

        out
    }
}

impl Default for RangeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RangeSet {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for RangeSet {}

impl Hash for RangeSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RangeSet(\"{self}\")")
    }
}

/// Renders the block map token form, e.g. `0-9 12 20-29`.
impl Display for RangeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("empty");
        }

        for (i, (s, e)) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }

            if e - s == 1 {
                write!(f, "{s}")?;
            } else {
                write!(f, "{}-{}", s, e - 1)?;
            }
        }

        Ok(())
    }
}

/// Accepts both the canonical form (anything containing a comma) and the
/// token form. Note that the token text `"0"` means block 0.
impl FromStr for RangeSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(',') {
            Self::parse_raw(s)
        } else {
            Self::parse_tokens(s)
        }
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = (u64, u64);
    type IntoIter = Ranges<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the ranges of a [`RangeSet`].
#[derive(Debug, Clone)]
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Ranges<'a> {
    inner: std::slice::ChunksExact<'a, u64>,
}

impl Iterator for Ranges<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|p| (p[0], p[1]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Ranges<'_> {}

/// Drops values that occur twice in a row, keeping one of every odd run.
///
/// `sorted` must be sorted for the output to be a valid endpoint list.
#[must_use]
pub fn remove_repeated_pairs(sorted: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(sorted.len());
    let mut last: Option<u64> = None;

    for &v in sorted {
        if last == Some(v) {
            last = None;
        } else {
            if let Some(prev) = last {
                out.push(prev);
            }
            last = Some(v);
        }
    }

    if let Some(prev) = last {
        out.push(prev);
    }

    out
}

fn overlap(a1: u64, a2: u64, b1: u64, b2: u64) -> Option<(u64, u64)> {
    let mut points = [a1, a2, b1, b2];
    points.sort_unstable();

    if points == [a1, a2, b1, b2] || points == [b1, b2, a1, a2] {
        None
    } else {
        Some((points[1], points[2]))
    }
}

fn parse_number(text: &str) -> Result<u64, ParseError> {
    let text = text.trim();
    text.parse().context(InvalidNumberSnafu { text })
}
