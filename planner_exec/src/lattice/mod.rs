//! # Lattice
//!
//! The discretised state space the planner searches. States are `(x, y, heading)` triples over
//! the cells of a [`CostMap`], and edges between them are instances of motion primitives.
//!
//! Environments only hand out ids for states they have actually generated. Ids are dense and
//! never change for the lifetime of an environment instance, so search data can be stored in
//! plain arenas indexed by [`StateId`].

// ------------------------------------------------------------------------------------------------
// MODS
// ------------------------------------------------------------------------------------------------

/// Motion primitive parsing and precomputation
mod mprim;

/// The `(x, y, heading)` lattice
mod xytheta;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use mprim::{MotionPrimitive, MotionPrimitiveTable, PrimitiveId, PrimitiveTiming, SetupError};
pub use xytheta::XyThetaLattice;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{collections::BTreeSet, f64::consts::TAU, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    map::{Cell, CellUpdate, CostMap, CostMapError},
    pose::Pose2,
};
use util::maths::norm_angle_2pi;

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// Dense identifier of a state within one environment instance.
pub type StateId = usize;

/// Traversal cost, in milliseconds scaled by the cell costs.
pub type Cost = u32;

/// Cost of something that cannot be reached.
pub const INFINITE_COST: Cost = Cost::MAX;

/// Cells whose cost has changed since the last search.
pub type ChangedCellSet = BTreeSet<Cell>;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DiscreteState {
    pub id: StateId,
    pub x: i32,
    pub y: i32,
    pub heading: u16,
}

/// One application of a motion primitive between two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub source: StateId,
    pub target: StateId,
    pub primitive: PrimitiveId,
    pub cost: Cost,
}

/// Configuration shared by all environment variants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatticeParams {
    pub num_heading_buckets: u16,

    pub timing: PrimitiveTiming,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Available environment variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentKind {
    XyTheta,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidPoseError {
    #[error("Pose ({:.3}, {:.3}) is outside the map", .0.x(), .0.y())]
    OutsideMap(Pose2),

    #[error("Pose ({:.3}, {:.3}) is in cell ({}, {}) which cannot be traversed", .0.x(), .0.y(), .1.x, .1.y)]
    LethalCell(Pose2, Cell),
}

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// The state space interface used by the search and the trajectory extractor.
///
/// Queries take `&self` and may instantiate new states internally. Anything which modifies
/// the map takes `&mut self`, so no query result can be held across a map update.
pub trait LatticeEnvironment {
    fn kind(&self) -> EnvironmentKind;

    /// Set the start state from a continuous pose.
    ///
    /// On error the previous start is kept.
    fn set_start(&mut self, pose: &Pose2) -> Result<StateId, InvalidPoseError>;

    /// Set the goal state from a continuous pose.
    ///
    /// On error the previous goal is kept.
    fn set_goal(&mut self, pose: &Pose2) -> Result<StateId, InvalidPoseError>;

    fn start(&self) -> Option<StateId>;

    fn goal(&self) -> Option<StateId>;

    /// Write new cell costs into the map, returning the number of cells whose cost changed.
    ///
    /// Changed cells are accumulated until [`take_changed_cells`](Self::take_changed_cells) is
    /// called. If any update is outside the map nothing is applied.
    fn update_cost_map(&mut self, updates: &[CellUpdate]) -> Result<usize, CostMapError>;

    /// Cells changed since the last call to this function.
    fn take_changed_cells(&mut self) -> ChangedCellSet;

    /// Peek at the cells changed since the last call to `take_changed_cells`.
    fn changed_cells(&self) -> &ChangedCellSet;

    /// All valid outgoing edges of a state, in primitive order.
    fn successors(&self, state: StateId) -> Vec<Edge>;

    /// All valid incoming edges of a state, in primitive order.
    fn predecessors(&self, state: StateId) -> Vec<Edge>;

    /// The edge made by applying a primitive at a state, if it's currently valid.
    fn edge(&self, source: StateId, primitive: PrimitiveId) -> Option<Edge>;

    /// Lower bound on the cost of travelling between two states.
    fn heuristic(&self, from: StateId, to: StateId) -> Cost;

    fn state(&self, id: StateId) -> Option<DiscreteState>;

    /// Find an already instantiated state.
    fn find_state(&self, cell: Cell, heading: u16) -> Option<StateId>;

    fn num_states(&self) -> usize;

    fn primitives(&self) -> &MotionPrimitiveTable;

    fn primitive(&self, id: PrimitiveId) -> Option<&MotionPrimitive> {
        self.primitives().get(id)
    }

    /// Unique number of this environment instance. State ids from different generations are
    /// unrelated.
    fn generation(&self) -> u64;

    fn cost_map(&self) -> &CostMap;

    /// The cell and heading bucket containing the pose.
    fn discretise(&self, pose: &Pose2) -> (Cell, u16);

    /// The continuous pose at the centre of a state.
    fn state_pose(&self, id: StateId) -> Option<Pose2>;

    /// Visit every primitive application whose footprint covers the given cell and which has at
    /// least one instantiated end.
    ///
    /// The visitor receives the source state, the primitive and the target state, each end
    /// only if it has been instantiated.
    fn for_each_edge_through(
        &self,
        cell: Cell,
        visitor: &mut dyn FnMut(Option<StateId>, &MotionPrimitive, Option<StateId>),
    );
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Build an environment of the given kind over a cost map.
pub fn create_environment(
    kind: EnvironmentKind,
    cost_map: CostMap,
    primitives: Arc<MotionPrimitiveTable>,
    params: &LatticeParams,
) -> Result<Box<dyn LatticeEnvironment>, SetupError> {
    match kind {
        EnvironmentKind::XyTheta => Ok(Box::new(XyThetaLattice::new(
            cost_map, primitives, params,
        )?)),
    }
}

/// Round a continuous heading to the nearest of `num_headings` buckets.
///
/// A heading exactly between two buckets goes to the lower one.
pub fn discretise_heading(heading_rad: f64, num_headings: u16) -> u16 {
    let bin = TAU / num_headings as f64;
    let b = (norm_angle_2pi(heading_rad) / bin - 0.5).ceil() as i64;

    b.rem_euclid(num_headings as i64) as u16
}

/// The continuous heading at the centre of a bucket.
pub fn heading_of_bucket(bucket: u16, num_headings: u16) -> f64 {
    bucket as f64 * TAU / num_headings as f64
}

/// Cell offset of a position given relative to a cell centre.
pub fn discretise_offset(offset_m: f64, resolution_m: f64) -> i32 {
    (offset_m / resolution_m + 0.5).floor() as i32
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_discretise_heading() {
        assert_eq!(discretise_heading(0.0, 16), 0);
        assert_eq!(discretise_heading(PI / 2.0, 4), 1);
        assert_eq!(discretise_heading(-PI / 2.0, 4), 3);
        assert_eq!(discretise_heading(TAU - 0.01, 16), 0);
        assert_eq!(discretise_heading(3.0 * TAU + PI, 8), 4);

        // Exact ties go to the lower bucket
        assert_eq!(discretise_heading(PI / 4.0, 4), 0);
        assert_eq!(discretise_heading(PI / 8.0, 8), 0);

        // Just past the tie goes up
        assert_eq!(discretise_heading(PI / 4.0 + 1e-9, 4), 1);
    }

    #[test]
    fn test_discretise_offset() {
        assert_eq!(discretise_offset(0.0, 0.05), 0);
        assert_eq!(discretise_offset(0.024, 0.05), 0);
        assert_eq!(discretise_offset(0.026, 0.05), 1);
        assert_eq!(discretise_offset(-0.026, 0.05), -1);
        assert_eq!(discretise_offset(-0.5, 1.0), 0);
    }
}
