//! Ordering actions so that no source block is overwritten before it is read.
//!
//! An edge `a -> b` (`b` in `a.children`) means `a` reads blocks that `b`
//! writes, so `a` has to run first. Actions are ordered by a depth-first
//! topological sort. Cycles are expected; every edge that still points
//! backwards afterwards is repaired by stashing the contested blocks before
//! the writer runs and letting the reader consume the stash instead.

use crate::action::{Action, ActionKind};
use blockota_image::map::ZERO_KEY;
use blockota_image::RangeSet;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Ordered actions with their stash assignments.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    actions: Vec<Action>,
    sequence: Vec<usize>,
    stashes: usize,
}

impl DependencyGraph {
    /// Builds the graph over `actions`, orders it and repairs backward edges.
    ///
    /// `actions` must be indexed by their id, as returned by
    /// [`plan()`](crate::plan::plan).
    pub fn build(actions: Vec<Action>) -> Self {
        let mut graph = Self {
            actions,
            sequence: Vec::new(),
            stashes: 0,
        };

        graph.add_edges();
        graph.assign_order();
        graph.reverse_backward_edges();

        graph
    }

    fn add_edges(&mut self) {
        // Block -> actions reading it.
        let mut readers: Vec<Vec<usize>> = Vec::new();

        for action in &self.actions {
            for block in action.source_ranges.blocks() {
                let block = block as usize;
                if block >= readers.len() {
                    readers.resize_with(block + 1, Vec::new);
                }
                readers[block].push(action.id);
            }
        }

        let mut edges = 0;

        for b in 0..self.actions.len() {
            let mut producers = BTreeSet::new();

            for block in self.actions[b].target_ranges.blocks() {
                if let Some(ids) = readers.get(block as usize) {
                    producers.extend(ids.iter().copied().filter(|&a| a != b));
                }
            }

            for a in producers {
                let size = if self.actions[a].source_name.as_deref() == Some(ZERO_KEY) {
                    0
                } else {
                    self.actions[b]
                        .target_ranges
                        .intersect(&self.actions[a].source_ranges)
                        .size()
                };

                self.actions[a].children.insert(b, size);
                self.actions[b].parents.insert(a, size);
                edges += 1;
            }
        }

        debug!(actions = self.actions.len(), edges, "built dependency graph");
    }

    /// Depth-first topological sort over `children`, without recursion.
    ///
    /// Roots and children are visited from the highest id down, so actions
    /// without constraints keep their planned order.
    fn assign_order(&mut self) {
        let n = self.actions.len();
        let mut visited = vec![false; n];
        let mut postorder = Vec::with_capacity(n);
        let mut stack: Vec<(usize, Vec<usize>)> = Vec::new();

        for root in (0..n).rev() {
            if visited[root] {
                continue;
            }

            visited[root] = true;
            stack.push((root, self.pending_children(root)));

            while let Some((node, pending)) = stack.last_mut() {
                match pending.pop() {
                    Some(child) if !visited[child] => {
                        visited[child] = true;
                        let next = self.pending_children(child);
                        stack.push((child, next));
                    }
                    Some(_) => {}
                    None => {
                        postorder.push(*node);
                        stack.pop();
                    }
                }
            }
        }

        self.sequence = postorder.into_iter().rev().collect();

        for (order, &id) in self.sequence.iter().enumerate() {
            self.actions[id].order = order;
        }
    }

    /// Children in the order they should be popped: lowest id last.
    fn pending_children(&self, id: usize) -> Vec<usize> {
        self.actions[id].children.keys().copied().collect()
    }

    /// Turns every edge pointing to an earlier action into a stash.
    fn reverse_backward_edges(&mut self) {
        let mut stashed_blocks = 0;

        for position in 0..self.sequence.len() {
            let xf = self.sequence[position];
            let backward: Vec<usize> = self.actions[xf]
                .children
                .keys()
                .copied()
                .filter(|&u| self.actions[u].order <= self.actions[xf].order)
                .collect();

            for u in backward {
                let overlap = self.actions[xf]
                    .source_ranges
                    .intersect(&self.actions[u].target_ranges);

                let size = self.actions[xf].children.remove(&u).unwrap_or_default();
                self.actions[u].parents.remove(&xf);

                if overlap.is_empty() {
                    continue;
                }

                if self.actions[xf].kind == ActionKind::Zero {
                    // Zero-fill reads nothing; it just stops skipping those blocks.
                    let shrunk = self.actions[xf].source_ranges.subtract(&overlap);
                    self.actions[xf].source_ranges = shrunk;
                    continue;
                }

                let id = self.stashes;
                self.stashes += 1;
                stashed_blocks += overlap.size();

                debug!(
                    stash = id,
                    writer = %self.actions[u],
                    reader = %self.actions[xf],
                    blocks = overlap.size(),
                    "stashing contested blocks"
                );

                self.actions[u].stash_before.push((id, overlap.clone()));
                self.actions[xf].use_stash.push((id, overlap));

                self.actions[u].children.insert(xf, size);
                self.actions[xf].parents.insert(u, size);
            }
        }

        info!(
            actions = self.actions.len(),
            stashes = self.stashes,
            stashed_blocks,
            "ordered transfers"
        );
    }

    /// Returns the actions indexed by id.
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Iterates over the actions in execution order.
    pub fn ordered(&self) -> impl Iterator<Item = &Action> {
        self.sequence.iter().map(|&id| &self.actions[id])
    }

    /// Returns the number of stashes created by the repair pass.
    #[must_use]
    pub fn stash_count(&self) -> usize {
        self.stashes
    }

    /// Consumes the graph, returning the actions in execution order.
    #[must_use]
    pub fn into_ordered(self) -> Vec<Action> {
        let mut actions = self.actions;
        actions.sort_by_key(|a| a.order);
        actions
    }
}

/// Total blocks read through stashes by `actions`.
#[must_use]
pub fn stashed_blocks(actions: &[Action]) -> u64 {
    actions
        .iter()
        .flat_map(|a| &a.use_stash)
        .map(|(_, r)| r.size())
        .sum()
}

/// Returns `true` if `ranges` are pairwise disjoint.
pub(crate) fn disjoint(ranges: &[&RangeSet]) -> bool {
    let mut seen = RangeSet::new();

    for r in ranges {
        if seen.overlaps(r) {
            return false;
        }
        seen = seen.union(r);
    }

    true
}
