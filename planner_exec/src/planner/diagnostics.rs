//! Planner diagnostics
//!
//! Statistics of each plan, maps of where the search spent its effort, and random valid poses
//! for exercising the planner.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use nalgebra::Vector2;
use ndarray::Array2;
use rand::Rng;
use serde::Serialize;

use crate::{
    lattice::{Cost, LatticeEnvironment, StateId},
    pose::Pose2,
    search::{SearchOutcome, SearchStatus, SolutionRecord},
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Expansion map value of a cell which was never expanded.
pub const UNEXPANDED: i8 = -1;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Statistics of a single call to the planner.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStats {
    /// Number of this plan since the planner was created
    pub plan_index: usize,

    pub timestamp: DateTime<Utc>,

    pub start: Pose2,

    pub goal: Pose2,

    pub status: SearchStatus,

    pub solution_cost: Option<Cost>,

    /// Number of primitives in the solution
    pub solution_size: Option<usize>,

    pub solution_epsilon: Option<f64>,

    pub final_epsilon: f64,

    pub expansions: usize,

    pub first_iteration_expansions: usize,

    pub search_time_s: f64,

    pub solutions: Vec<SolutionRecord>,

    /// Cells changed since the previous plan
    pub changed_cells: usize,

    /// True if the previous search was repaired
    pub reused: bool,

    pub num_states: usize,

    /// States instantiated during this plan
    pub generated_states: usize,
}

/// Where the search expanded or generated states, as an occupancy style grid.
///
/// Each cell holds the percentage of headings present in it, or [`UNEXPANDED`].
#[derive(Debug, Clone, Serialize)]
pub struct ExpansionMap {
    pub resolution_m: f64,

    pub origin_m: Vector2<f64>,

    /// Indexed `[x, y]`
    pub data: Array2<i8>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl PlanStats {
    pub fn new(
        plan_index: usize,
        start: Pose2,
        goal: Pose2,
        outcome: &SearchOutcome,
        changed_cells: usize,
        num_states: usize,
        generated_states: usize,
    ) -> Self {
        Self {
            plan_index,
            timestamp: Utc::now(),
            start,
            goal,
            status: outcome.status,
            solution_cost: outcome.cost,
            solution_size: outcome.path.as_ref().map(|p| p.num_hops()),
            solution_epsilon: outcome.solution_epsilon,
            final_epsilon: outcome.final_epsilon,
            expansions: outcome.expansions,
            first_iteration_expansions: outcome.first_iteration_expansions,
            search_time_s: outcome.elapsed.as_secs_f64(),
            solutions: outcome.solutions.clone(),
            changed_cells,
            reused: outcome.reused,
            num_states,
            generated_states,
        }
    }
}

impl ExpansionMap {
    /// Build the map of the given states.
    pub fn from_states(env: &dyn LatticeEnvironment, states: &[StateId]) -> Self {
        let map = env.cost_map();
        let num_cells = map.num_cells();
        let num_headings = env.primitives().num_headings() as usize;

        // Count distinct headings per cell
        let mut seen = Array2::from_elem((num_cells.x, num_cells.y * num_headings), false);
        let mut counts = Array2::<usize>::zeros((num_cells.x, num_cells.y));

        for s in states.iter().filter_map(|&id| env.state(id)) {
            if s.x < 0 || s.y < 0 || s.x as usize >= num_cells.x || s.y as usize >= num_cells.y {
                continue;
            }
            let (x, y) = (s.x as usize, s.y as usize);
            let flag = &mut seen[[x, y * num_headings + s.heading as usize]];
            if !*flag {
                *flag = true;
                counts[[x, y]] += 1;
            }
        }

        let data = counts.mapv(|c| {
            if c == 0 {
                UNEXPANDED
            } else {
                ((100 * c) / num_headings.max(1)).min(100) as i8
            }
        });

        Self {
            resolution_m: map.resolution(),
            origin_m: map.params().origin_m,
            data,
        }
    }

    /// Number of cells with at least one expansion.
    pub fn num_expanded_cells(&self) -> usize {
        self.data.iter().filter(|&&v| v != UNEXPANDED).count()
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Draw random poses whose discrete state is inside the map and traversable.
///
/// Makes at most `max_tries` draws, so fewer than `num` poses may be returned.
pub fn sample_valid_poses<R: Rng>(
    env: &dyn LatticeEnvironment,
    num: usize,
    max_tries: usize,
    rng: &mut R,
) -> Vec<Pose2> {
    let map = env.cost_map();
    let extent = map.num_cells().cast::<f64>() * map.resolution();
    let origin = map.params().origin_m;

    let mut poses = Vec::with_capacity(num);
    for _ in 0..max_tries {
        if poses.len() >= num {
            break;
        }

        let pose = Pose2::new(
            origin.x + rng.gen::<f64>() * extent.x,
            origin.y + rng.gen::<f64>() * extent.y,
            rng.gen_range(0.0..std::f64::consts::TAU),
        );

        let (cell, _) = env.discretise(&pose);
        if map.is_traversable(cell) {
            poses.push(pose);
        }
    }

    poses
}
