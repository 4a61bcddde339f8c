//! # Change query
//!
//! Answers "which states are affected by these changed cells?" for the incremental search.
//! A changed cell can only alter the cost of edges whose primitive footprint covers it, so the
//! affected states are the sources and targets of those edges. Only states the environment has
//! already instantiated are reported, a state which has never been generated carries no search
//! information to repair.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::cell::OnceCell;

use log::debug;

use crate::lattice::{ChangedCellSet, LatticeEnvironment, StateId};
use crate::map::Cell;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The states affected by a set of changed cells in one environment.
///
/// Borrows the environment, so it cannot be kept across a map update.
pub struct ChangeQuery<'e> {
    env: &'e dyn LatticeEnvironment,

    changed_cells: ChangedCellSet,

    successors: OnceCell<Vec<StateId>>,

    predecessors: OnceCell<Vec<StateId>>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<'e> ChangeQuery<'e> {
    pub fn new(env: &'e dyn LatticeEnvironment, changed_cells: ChangedCellSet) -> Self {
        Self {
            env,
            changed_cells,
            successors: OnceCell::new(),
            predecessors: OnceCell::new(),
        }
    }

    pub fn changed_cells(&self) -> &ChangedCellSet {
        &self.changed_cells
    }

    /// Number of changed cells.
    pub fn len(&self) -> usize {
        self.changed_cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changed_cells.is_empty()
    }

    /// Generation of the environment this query was made against.
    pub fn generation(&self) -> u64 {
        self.env.generation()
    }

    /// States whose outgoing edges may have changed cost, sorted by id.
    pub fn successors(&self) -> &[StateId] {
        self.successors.get_or_init(|| {
            let ids = self.collect(|source, _| source);
            debug!(
                "{} changed cells affect the outgoing edges of {} states",
                self.len(),
                ids.len()
            );
            ids
        })
    }

    /// States whose incoming edges may have changed cost, sorted by id.
    pub fn predecessors(&self) -> &[StateId] {
        self.predecessors.get_or_init(|| {
            let ids = self.collect(|_, target| target);
            debug!(
                "{} changed cells affect the incoming edges of {} states",
                self.len(),
                ids.len()
            );
            ids
        })
    }

    fn collect(
        &self,
        pick: impl Fn(Option<StateId>, Option<StateId>) -> Option<StateId>,
    ) -> Vec<StateId> {
        let mut ids = Vec::new();

        for &cell in self.changed_cells.iter() {
            self.visit(cell, &mut |source, target| {
                if let Some(id) = pick(source, target) {
                    ids.push(id);
                }
            });
        }

        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn visit(&self, cell: Cell, f: &mut dyn FnMut(Option<StateId>, Option<StateId>)) {
        self.env
            .for_each_edge_through(cell, &mut |source, _, target| f(source, target));
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
