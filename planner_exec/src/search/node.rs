//! Per-state search records and the open list ordering.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;

use crate::lattice::{Cost, Edge, StateId, INFINITE_COST};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Search data for one state, stored in an arena indexed by [`StateId`].
#[derive(Debug, Clone, Copy)]
pub struct SearchNode {
    /// Cost-to-goal estimate
    pub g: Cost,

    /// One step lookahead of `g`
    pub rhs: Cost,

    /// The edge `rhs` was computed through
    pub next: Option<Edge>,

    /// Stamp of the valid open list entry for this state, if it's in the open list
    pub open_stamp: Option<u64>,

    pub in_incons: bool,

    /// Search iteration in which this state was last closed
    pub closed_iter: u64,
}

/// Priority of a state in the open list.
///
/// Sorts by `f` ascending, then underconsistent states first, then by `g` descending. The same
/// order decides when the search may stop, so an underconsistent state tied on `f` with the start
/// is always expanded before the start is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub f: u64,
    pub underconsistent: bool,
    pub g: u64,
}

/// An entry in the open list. Entries whose stamp no longer matches their node are stale and
/// skipped when popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenEntry {
    pub key: Key,
    pub id: StateId,
    pub stamp: u64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SearchNode {
    fn default() -> Self {
        Self {
            g: INFINITE_COST,
            rhs: INFINITE_COST,
            next: None,
            open_stamp: None,
            in_incons: false,
            closed_iter: 0,
        }
    }
}

impl SearchNode {
    pub fn is_consistent(&self) -> bool {
        self.g == self.rhs
    }

    pub fn is_overconsistent(&self) -> bool {
        self.g > self.rhs
    }

    pub fn is_open(&self) -> bool {
        self.open_stamp.is_some()
    }
}

impl Key {
    /// Key of a state for the given inflation factor and heuristic.
    pub fn of(node: &SearchNode, h: Cost, epsilon: f64) -> Self {
        if node.is_overconsistent() {
            Self {
                f: add_inf(node.rhs, (epsilon * h as f64).floor() as u64),
                underconsistent: false,
                g: node.rhs as u64,
            }
        } else {
            Self {
                f: add_inf(node.g, h as u64),
                underconsistent: node.g < node.rhs,
                g: node.g as u64,
            }
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f
            .cmp(&other.f)
            .then_with(|| other.underconsistent.cmp(&self.underconsistent))
            .then_with(|| other.g.cmp(&self.g))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Note that we flip the order here so that the heap will be a min-heap, not a max-heap
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Add to a cost, keeping infinite costs infinite.
fn add_inf(cost: Cost, add: u64) -> u64 {
    if cost == INFINITE_COST {
        u64::MAX
    } else {
        (cost as u64).saturating_add(add)
    }
}
