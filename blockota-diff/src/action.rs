use blockota_image::RangeSet;
use std::collections::BTreeMap;
use std::fmt;

/// How a target file is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Written from literal data.
    New,
    /// Zero-filled.
    Zero,
    /// Patched from a source file.
    Different,
    /// Copied from identical source content.
    Move,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Zero => "zero",
            Self::Different => "diff",
            Self::Move => "move",
        })
    }
}

/// One planned transfer producing a target file.
///
/// Actions refer to each other by [`id()`](Self::id), which is their
/// position in the planner's output.
#[derive(Debug, Clone)]
pub struct Action {
    pub(crate) id: usize,
    pub(crate) kind: ActionKind,
    pub(crate) target_name: String,
    pub(crate) source_name: Option<String>,
    pub(crate) target_ranges: RangeSet,
    pub(crate) source_ranges: RangeSet,
    /// Actions that must run before this one, with the overlap size.
    pub(crate) parents: BTreeMap<usize, u64>,
    /// Actions that must run after this one, with the overlap size.
    pub(crate) children: BTreeMap<usize, u64>,
    /// Stashes to set aside before this action writes its target.
    pub(crate) stash_before: Vec<(usize, RangeSet)>,
    /// Stashes this action reads instead of the live source blocks.
    pub(crate) use_stash: Vec<(usize, RangeSet)>,
    pub(crate) order: usize,
}

impl Action {
    pub(crate) fn new(
        id: usize,
        kind: ActionKind,
        target_name: String,
        source_name: Option<String>,
        target_ranges: RangeSet,
        source_ranges: RangeSet,
    ) -> Self {
        Self {
            id,
            kind,
            target_name,
            source_name,
            target_ranges,
            source_ranges,
            parents: BTreeMap::new(),
            children: BTreeMap::new(),
            stash_before: Vec::new(),
            use_stash: Vec::new(),
            order: id,
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    #[must_use]
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    #[must_use]
    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }

    pub fn target_ranges(&self) -> &RangeSet {
        &self.target_ranges
    }

    pub fn source_ranges(&self) -> &RangeSet {
        &self.source_ranges
    }

    pub fn parents(&self) -> &BTreeMap<usize, u64> {
        &self.parents
    }

    pub fn children(&self) -> &BTreeMap<usize, u64> {
        &self.children
    }

    #[must_use]
    pub fn stash_before(&self) -> &[(usize, RangeSet)] {
        &self.stash_before
    }

    #[must_use]
    pub fn use_stash(&self) -> &[(usize, RangeSet)] {
        &self.use_stash
    }

    /// Position of this action in the final sequence.
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target_name)?;

        if let Some(source) = &self.source_name {
            write!(f, " <- {source}")?;
        }

        Ok(())
    }
}
