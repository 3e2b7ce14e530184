//! Matching target files to source files.

use crate::action::{Action, ActionKind};
use blockota_image::map::{COPY_KEY, ZERO_KEY};
use blockota_image::{FileMap, RangeSet};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::{debug, info};

/// Plans one action per non-empty target file.
///
/// The zero pseudo-file becomes a [`ActionKind::Zero`] action reading the
/// source zero pseudo-file, and the reserved pseudo-file is always new data.
/// Any other file is diffed against the source file of the same name, or
/// failing that, against the single source file with the same
/// [normalized name](normalize_name). Files without a match are new.
#[must_use]
pub fn plan(source: &FileMap, target: &FileMap) -> Vec<Action> {
    let normalized = normalized_names(source);
    let mut actions = Vec::with_capacity(target.len());

    for (name, target_ranges) in target.iter() {
        if target_ranges.is_empty() {
            debug!(file = name, "skipping empty target file");
            continue;
        }

        let id = actions.len();
        let action = if name == ZERO_KEY {
            let source_ranges = source.get(ZERO_KEY).cloned().unwrap_or_default();
            let source_name = source.contains(ZERO_KEY).then(|| ZERO_KEY.to_owned());

            Action::new(
                id,
                ActionKind::Zero,
                name.into(),
                source_name,
                target_ranges.clone(),
                source_ranges,
            )
        } else if name == COPY_KEY {
            new_action(id, name, target_ranges)
        } else if let Some(source_ranges) = source.get(name) {
            Action::new(
                id,
                ActionKind::Different,
                name.into(),
                Some(name.into()),
                target_ranges.clone(),
                source_ranges.clone(),
            )
        } else if let Some(Some(source_name)) = normalized.get(&normalize_name(name)) {
            // Present whenever the name is in the normalized table.
            let source_ranges = source.get(source_name).cloned().unwrap_or_default();

            Action::new(
                id,
                ActionKind::Different,
                name.into(),
                Some((*source_name).to_owned()),
                target_ranges.clone(),
                source_ranges,
            )
        } else {
            new_action(id, name, target_ranges)
        };

        debug!(action = %action, blocks = target_ranges.size(), "planned transfer");
        actions.push(action);
    }

    info!(
        actions = actions.len(),
        new = actions.iter().filter(|a| a.kind == ActionKind::New).count(),
        diff = actions.iter().filter(|a| a.kind == ActionKind::Different).count(),
        "planned transfers"
    );

    actions
}

fn new_action(id: usize, name: &str, target_ranges: &RangeSet) -> Action {
    Action::new(
        id,
        ActionKind::New,
        name.into(),
        None,
        target_ranges.clone(),
        RangeSet::new(),
    )
}

/// Maps normalized source names to the source file carrying them, or `None`
/// when several source files share the normalized name.
fn normalized_names(source: &FileMap) -> HashMap<String, Option<&str>> {
    let mut table: HashMap<String, Option<&str>> = HashMap::new();

    for (name, _) in source.iter() {
        match table.entry(normalize_name(name)) {
            Entry::Occupied(mut e) => {
                e.insert(None);
            }
            Entry::Vacant(e) => {
                e.insert(Some(name));
            }
        }
    }

    table
}

/// Replaces every run of digits in the last path component with `#`, so
/// that `lib/libfoo.so.1.2` and `lib/libfoo.so.1.3` compare equal.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let (dir, base) = match name.rfind('/') {
        Some(i) => name.split_at(i + 1),
        None => ("", name),
    };

    let mut out = String::with_capacity(name.len());
    out.push_str(dir);

    let mut in_digits = false;
    for c in base.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
        } else {
            out.push(c);
            in_digits = false;
        }
    }

    out
}
