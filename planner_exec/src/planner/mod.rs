//! # Trajectory planner
//!
//! [`TrajPlanner`] ties the lattice, the anytime search and the trajectory extractor together
//! behind a single [`TrajPlanner::make_trajectory`] call. It owns the environment and the search
//! between calls so that replanning after small map changes can reuse earlier work.
//!
//! Map changes reach the planner either as a whole new [`CostMap`] via
//! [`TrajPlanner::ingest_cost_map`], which is diffed against the current map, or directly as
//! [`CellUpdate`]s. If the map geometry changes the environment is rebuilt and all search data is
//! dropped.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod diagnostics;
mod params;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use diagnostics::{sample_valid_poses, ExpansionMap, PlanStats, UNEXPANDED};
pub use params::{DynamicParams, PlannerParams};

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{ops::Range, path::PathBuf, sync::Arc};

use log::{debug, info, warn};
use rand::Rng;

use crate::{
    change_query::ChangeQuery,
    lattice::{
        create_environment, InvalidPoseError, LatticeEnvironment, MotionPrimitiveTable,
        SetupError, StateId,
    },
    map::{CellUpdate, CostMap, CostMapError},
    pose::Pose2,
    search::{AnytimeSearch, SearchStatus},
    trajectory::{self, ExtractError, Trajectory},
};
use util::{module::State, params::LoadError, session::Session};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Session relative path plan statistics are saved to.
const STATS_SAVE_PATH: &str = "planner/stats.json";

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

pub struct TrajPlanner {
    params: PlannerParams,

    /// Contents of the motion primitive file, parsed once the map resolution is known
    primitive_source: Option<String>,

    /// Most recently built primitive table
    primitives: Option<Arc<MotionPrimitiveTable>>,

    env: Option<Box<dyn LatticeEnvironment>>,

    search: AnytimeSearch,

    last_stats: Option<PlanStats>,

    num_plans: usize,
}

/// One planning request for [`State::proc`].
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub start: Pose2,

    pub goal: Pose2,

    /// A full new map, if one is available
    pub cost_map: Option<CostMap>,

    /// Individual cell changes, applied after `cost_map`
    pub cell_updates: Vec<CellUpdate>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Planner setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("Invalid start or goal: {0}")]
    InvalidPose(#[from] InvalidPoseError),

    #[error("No path exists between the start and the goal")]
    Infeasible,

    #[error("No path was found within the allocated time")]
    TimedOut,

    #[error("Could not build the trajectory: {0}")]
    Extract(#[from] ExtractError),

    #[error("No environment has been created, ingest a cost map first")]
    NoEnvironment,

    #[error("Cost map error: {0}")]
    Map(#[from] CostMapError),

    #[error("Could not load parameters: {0}")]
    ParamLoad(LoadError),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for TrajPlanner {
    /// A planner with default parameters, to be configured by [`State::init`].
    fn default() -> Self {
        Self {
            params: PlannerParams::default(),
            primitive_source: None,
            primitives: None,
            env: None,
            search: AnytimeSearch::new(),
            last_stats: None,
            num_plans: 0,
        }
    }
}

impl TrajPlanner {
    /// Create a new planner. The motion primitive file is read when the first environment is
    /// created, or by [`State::init`].
    pub fn new(params: PlannerParams) -> Result<Self, PlanError> {
        params.validate().map_err(PlanError::InvalidParams)?;

        Ok(Self {
            params,
            ..Default::default()
        })
    }

    /// Create a planner using an already built primitive table.
    pub fn with_primitives(
        params: PlannerParams,
        primitives: MotionPrimitiveTable,
    ) -> Result<Self, PlanError> {
        let mut planner = Self::new(params)?;
        planner.primitives = Some(Arc::new(primitives));
        Ok(planner)
    }

    pub fn params(&self) -> &PlannerParams {
        &self.params
    }

    pub fn planning_frame(&self) -> &str {
        &self.params.planning_frame
    }

    /// Change the parameters which may vary between plans.
    pub fn set_dynamic_params(&mut self, dynamic: DynamicParams) -> Result<(), PlanError> {
        dynamic.validate().map_err(PlanError::InvalidParams)?;

        if dynamic != self.params.dynamic() {
            info!(
                "Dynamic parameters updated: allocated time {} s, initial epsilon {}, force scratch limit {}",
                dynamic.allocated_time_s, dynamic.initial_epsilon, dynamic.force_scratch_limit
            );
        }
        self.params.apply_dynamic(&dynamic);

        Ok(())
    }

    pub fn environment(&self) -> Option<&dyn LatticeEnvironment> {
        self.env.as_deref()
    }

    /// Build a new environment over the given map, dropping all search data.
    pub fn create_and_initialize_environment(
        &mut self,
        cost_map: CostMap,
    ) -> Result<(), PlanError> {
        let cost_map = cost_map.with_lethal_threshold(self.params.lethal_threshold)?;
        let primitives = self.primitive_table(cost_map.resolution())?;

        let env = create_environment(
            self.params.environment,
            cost_map,
            primitives,
            &self.params.lattice_params(),
        )?;

        info!(
            "Created {:?} environment (generation {})",
            env.kind(),
            env.generation()
        );

        self.env = Some(env);
        self.search.reset();

        Ok(())
    }

    /// Bring the environment up to date with a new map.
    ///
    /// Returns the number of cells whose cost changed, or `None` if the environment had to be
    /// rebuilt.
    pub fn ingest_cost_map(&mut self, cost_map: &CostMap) -> Result<Option<usize>, PlanError> {
        let cost_map = cost_map
            .clone()
            .with_lethal_threshold(self.params.lethal_threshold)?;

        if let Some(env) = self.env.as_mut() {
            if env.cost_map().same_geometry(&cost_map) {
                let updates = env.cost_map().diff(&cost_map)?;
                let changed = env.update_cost_map(&updates)?;
                debug!("Ingested cost map, {} cells changed", changed);
                return Ok(Some(changed));
            }
            info!("Cost map geometry changed, rebuilding the environment");
        }

        self.create_and_initialize_environment(cost_map)?;
        Ok(None)
    }

    /// Apply individual cell cost changes, returning the number of cells which changed.
    pub fn apply_cell_updates(&mut self, updates: &[CellUpdate]) -> Result<usize, PlanError> {
        let env = self.env.as_mut().ok_or(PlanError::NoEnvironment)?;
        Ok(env.update_cost_map(updates)?)
    }

    /// Plan a trajectory from `start` to `goal` over the current environment.
    pub fn make_trajectory(
        &mut self,
        start: &Pose2,
        goal: &Pose2,
    ) -> Result<Trajectory, PlanError> {
        let env = self.env.as_mut().ok_or(PlanError::NoEnvironment)?;

        let start_id = env.set_start(start)?;
        let goal_id = env.set_goal(goal)?;
        let changed_cells = env.take_changed_cells();

        let num_changed = changed_cells.len();
        let search_params = self.params.search_params();

        let env = self.env.as_deref().ok_or(PlanError::NoEnvironment)?;
        let outcome = if num_changed >= self.params.force_scratch_limit {
            if num_changed > 0 {
                warn!(
                    "{} cells changed (limit {}), planning from scratch",
                    num_changed, self.params.force_scratch_limit
                );
            }
            self.search
                .plan(env, start_id, goal_id, &search_params, None)
        } else {
            let query = ChangeQuery::new(env, changed_cells);
            self.search
                .plan(env, start_id, goal_id, &search_params, Some(&query))
        };

        self.num_plans += 1;
        let stats = PlanStats::new(
            self.num_plans,
            *start,
            *goal,
            &outcome,
            num_changed,
            env.num_states(),
            self.search.generated_states().len(),
        );
        self.publish_stats(&stats);
        self.last_stats = Some(stats);

        match (outcome.status, outcome.path) {
            (SearchStatus::Solved, Some(path)) => {
                Ok(trajectory::extract(env, &path, &self.params.planning_frame)?)
            }
            (SearchStatus::TimedOut, _) => Err(PlanError::TimedOut),
            _ => Err(PlanError::Infeasible),
        }
    }

    /// Statistics of the last plan.
    pub fn last_stats(&self) -> Option<&PlanStats> {
        self.last_stats.as_ref()
    }

    /// States expanded by the last plan.
    pub fn expanded_states(&self, first_iteration_only: bool) -> &[StateId] {
        if first_iteration_only {
            self.search.first_iteration_expanded_states()
        } else {
            self.search.expanded_states()
        }
    }

    /// Map of the cells the last plan expanded states in.
    pub fn expansion_map(&self, first_iteration_only: bool) -> Option<ExpansionMap> {
        let env = self.env.as_deref()?;
        Some(ExpansionMap::from_states(
            env,
            self.expanded_states(first_iteration_only),
        ))
    }

    /// States instantiated by the last plan.
    pub fn generated_states(&self, first_iteration_only: bool) -> Range<StateId> {
        if first_iteration_only {
            self.search.first_iteration_generated_states()
        } else {
            self.search.generated_states()
        }
    }

    /// Map of the cells the last plan generated new states in.
    pub fn generation_map(&self, first_iteration_only: bool) -> Option<ExpansionMap> {
        let env = self.env.as_deref()?;
        let states: Vec<StateId> = self.generated_states(first_iteration_only).collect();
        Some(ExpansionMap::from_states(env, &states))
    }

    /// Random poses which could be used as a start or goal.
    pub fn sample_valid_poses<R: Rng>(
        &self,
        num: usize,
        max_tries: usize,
        rng: &mut R,
    ) -> Result<Vec<Pose2>, PlanError> {
        let env = self.env.as_deref().ok_or(PlanError::NoEnvironment)?;
        Ok(sample_valid_poses(env, num, max_tries, rng))
    }

    fn publish_stats(&self, stats: &PlanStats) {
        info!(
            "Plan {}: {:?}, cost {:?}, {} hops, epsilon {:?}, {} expansions in {:.3} s",
            stats.plan_index,
            stats.status,
            stats.solution_cost,
            stats.solution_size.unwrap_or(0),
            stats.solution_epsilon,
            stats.expansions,
            stats.search_time_s
        );

        if self.params.save_stats && util::session::is_active() {
            util::session::save_with_timestamp(STATS_SAVE_PATH, stats.clone());
        }
    }

    /// Get a primitive table for the given resolution, reusing the current one if it matches.
    fn primitive_table(
        &mut self,
        resolution_m: f64,
    ) -> Result<Arc<MotionPrimitiveTable>, PlanError> {
        if let Some(table) = &self.primitives {
            if (table.resolution() - resolution_m).abs() <= 1e-6 {
                return Ok(table.clone());
            }
        }

        let source = match &self.primitive_source {
            Some(s) => s.clone(),
            None => {
                let path = self.params.primitive_file_path();
                let source = read_primitive_file(&path)?;
                self.primitive_source = Some(source.clone());
                source
            }
        };

        let table = Arc::new(MotionPrimitiveTable::parse(
            &source,
            self.params.num_heading_buckets,
            resolution_m,
            self.params.lattice_params().timing,
        )?);
        self.primitives = Some(table.clone());

        Ok(table)
    }
}

impl State for TrajPlanner {
    /// Path to the parameter file
    type InitData = PathBuf;
    type InitError = PlanError;

    type InputData = PlanRequest;
    type OutputData = Trajectory;
    type StatusReport = Option<PlanStats>;
    type ProcError = PlanError;

    /// Load the parameters and the motion primitive file.
    fn init(&mut self, init_data: PathBuf, session: Option<&Session>) -> Result<(), PlanError> {
        let params: PlannerParams =
            util::params::load_file(&init_data).map_err(PlanError::ParamLoad)?;
        params.validate().map_err(PlanError::InvalidParams)?;

        let path = params.primitive_file_path();
        self.primitive_source = Some(read_primitive_file(&path)?);
        self.primitives = None;
        self.params = params;
        self.reset();

        if let Some(s) = session {
            info!("Planner initialised in session {:?}", s.session_root);
        }

        Ok(())
    }

    fn proc(&mut self, input: &PlanRequest) -> Result<(Trajectory, Option<PlanStats>), PlanError> {
        if let Some(map) = &input.cost_map {
            self.ingest_cost_map(map)?;
        }
        if !input.cell_updates.is_empty() {
            self.apply_cell_updates(&input.cell_updates)?;
        }

        let traj = self.make_trajectory(&input.start, &input.goal)?;
        Ok((traj, self.last_stats.clone()))
    }

    fn reset(&mut self) {
        self.env = None;
        self.search.reset();
        self.last_stats = None;
    }
}

fn read_primitive_file(path: &std::path::Path) -> Result<String, SetupError> {
    std::fs::read_to_string(path).map_err(|e| SetupError::FileLoad(path.to_path_buf(), e))
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        map::{Cell, CostMapParams, LETHAL_OBSTACLE},
        test_utils::{cell_pose, free_map, test_planner, test_planner_params},
    };
    use nalgebra::Vector2;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_no_environment() {
        let mut planner = test_planner();
        assert!(matches!(
            planner.make_trajectory(&cell_pose(0, 0, 0), &cell_pose(1, 0, 0)),
            Err(PlanError::NoEnvironment)
        ));
        assert!(matches!(
            planner.apply_cell_updates(&[]),
            Err(PlanError::NoEnvironment)
        ));
    }

    #[test]
    fn test_make_trajectory() {
        let mut planner = test_planner();
        planner.ingest_cost_map(&free_map(10, 10)).unwrap();

        let traj = planner
            .make_trajectory(&cell_pose(0, 0, 0), &cell_pose(9, 9, 0))
            .unwrap();

        assert_eq!(traj.frame_id, "map");
        assert_eq!(traj.total_cost(), 22000);

        let stats = planner.last_stats().unwrap();
        assert_eq!(stats.status, SearchStatus::Solved);
        assert_eq!(stats.solution_cost, Some(22000));
        assert_eq!(stats.plan_index, 1);
        assert!(!stats.reused);

        let expansions = planner.expansion_map(false).unwrap();
        assert!(expansions.num_expanded_cells() > 0);
        assert!(expansions.data[[9, 9]] >= 25);
        assert_eq!(expansions.data.dim(), (10, 10));

        let generated = planner.generation_map(false).unwrap();
        let generated_first = planner.generation_map(true).unwrap();
        assert_eq!(generated.data.dim(), (10, 10));
        assert!(generated.num_expanded_cells() > 0);
        assert!(generated_first.num_expanded_cells() <= generated.num_expanded_cells());
        assert_eq!(stats.generated_states, planner.generated_states(false).len());
    }

    #[test]
    fn test_invalid_endpoints() {
        let mut map = free_map(10, 10);
        map.set(Cell::new(5, 5), LETHAL_OBSTACLE).unwrap();
        let mut planner = test_planner();
        planner.ingest_cost_map(&map).unwrap();

        assert!(matches!(
            planner.make_trajectory(&cell_pose(0, 0, 0), &cell_pose(5, 5, 0)),
            Err(PlanError::InvalidPose(InvalidPoseError::LethalCell(..)))
        ));
        assert!(matches!(
            planner.make_trajectory(&cell_pose(0, 0, 0), &cell_pose(12, 5, 0)),
            Err(PlanError::InvalidPose(InvalidPoseError::OutsideMap(..)))
        ));
    }

    #[test]
    fn test_infeasible_is_recoverable() {
        let mut map = free_map(10, 10);
        map.fill_rect(Cell::new(5, 0), Cell::new(5, 9), LETHAL_OBSTACLE);
        let mut planner = test_planner();
        planner.ingest_cost_map(&map).unwrap();

        let start = cell_pose(1, 5, 0);
        let goal = cell_pose(8, 5, 0);
        assert!(matches!(
            planner.make_trajectory(&start, &goal),
            Err(PlanError::Infeasible)
        ));

        // Open a gap in the wall and try again
        let mut gap = map.clone();
        gap.set(Cell::new(5, 5), 0).unwrap();
        assert_eq!(planner.ingest_cost_map(&gap).unwrap(), Some(1));

        let traj = planner.make_trajectory(&start, &goal).unwrap();
        assert_eq!(traj.total_cost(), 7000);
        assert!(planner.last_stats().unwrap().reused);
    }

    #[test]
    fn test_incremental_replan() {
        let mut planner = test_planner();
        planner.ingest_cost_map(&free_map(20, 20)).unwrap();

        let start = cell_pose(2, 2, 0);
        let goal = cell_pose(8, 2, 0);
        planner.make_trajectory(&start, &goal).unwrap();
        let scratch_expansions = planner.last_stats().unwrap().expansions;

        planner
            .apply_cell_updates(&[
                CellUpdate::new(Cell::new(18, 18), LETHAL_OBSTACLE),
                CellUpdate::new(Cell::new(17, 18), LETHAL_OBSTACLE),
            ])
            .unwrap();
        planner.make_trajectory(&start, &goal).unwrap();

        let stats = planner.last_stats().unwrap();
        assert!(stats.reused);
        assert_eq!(stats.changed_cells, 2);
        assert!(stats.expansions < scratch_expansions);
    }

    #[test]
    fn test_force_scratch_limit() {
        let mut planner = test_planner();
        planner.ingest_cost_map(&free_map(20, 20)).unwrap();
        let mut dynamic = planner.params().dynamic();
        dynamic.force_scratch_limit = 2;
        planner.set_dynamic_params(dynamic).unwrap();

        let start = cell_pose(2, 2, 0);
        let goal = cell_pose(8, 2, 0);
        planner.make_trajectory(&start, &goal).unwrap();

        planner
            .apply_cell_updates(&[
                CellUpdate::new(Cell::new(18, 18), LETHAL_OBSTACLE),
                CellUpdate::new(Cell::new(17, 18), LETHAL_OBSTACLE),
            ])
            .unwrap();
        planner.make_trajectory(&start, &goal).unwrap();

        assert!(!planner.last_stats().unwrap().reused);
    }

    #[test]
    fn test_geometry_change_rebuilds() {
        let mut planner = test_planner();
        assert_eq!(planner.ingest_cost_map(&free_map(10, 10)).unwrap(), None);
        let generation = planner.environment().unwrap().generation();

        assert_eq!(planner.ingest_cost_map(&free_map(10, 10)).unwrap(), Some(0));
        assert_eq!(planner.environment().unwrap().generation(), generation);

        let bigger = CostMap::new(CostMapParams {
            resolution_m: 1.0,
            num_cells: Vector2::new(12, 10),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(planner.ingest_cost_map(&bigger).unwrap(), None);
        assert_ne!(planner.environment().unwrap().generation(), generation);

        // A map at another resolution needs a different primitive table
        let fine = CostMap::new(CostMapParams {
            resolution_m: 0.5,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            planner.ingest_cost_map(&fine),
            Err(PlanError::Setup(_))
        ));
    }

    #[test]
    fn test_dynamic_params() {
        let mut planner = test_planner();
        let mut dynamic = planner.params().dynamic();
        dynamic.initial_epsilon = 0.5;
        assert!(matches!(
            planner.set_dynamic_params(dynamic),
            Err(PlanError::InvalidParams(_))
        ));

        dynamic.initial_epsilon = 4.0;
        dynamic.allocated_time_s = 1e30;
        assert!(matches!(
            planner.set_dynamic_params(dynamic),
            Err(PlanError::InvalidParams(_))
        ));
        assert_eq!(planner.params().allocated_time_s, 30.0);

        dynamic.allocated_time_s = 5.0;
        planner.set_dynamic_params(dynamic).unwrap();
        assert_eq!(planner.params().initial_epsilon, 4.0);

        // Planning still works after the rejected update
        planner.ingest_cost_map(&free_map(6, 6)).unwrap();
        let traj = planner
            .make_trajectory(&cell_pose(1, 1, 0), &cell_pose(4, 1, 0))
            .unwrap();
        assert_eq!(traj.total_cost(), 3000);
        assert_eq!(planner.planning_frame(), "map");
    }

    #[test]
    fn test_state_lifecycle() {
        let mut planner = test_planner();
        let request = PlanRequest {
            start: cell_pose(1, 1, 0),
            goal: cell_pose(4, 1, 0),
            cost_map: Some(free_map(6, 6)),
            cell_updates: vec![CellUpdate::new(Cell::new(5, 5), LETHAL_OBSTACLE)],
        };

        let (traj, stats) = planner.proc(&request).unwrap();
        assert_eq!(traj.total_cost(), 3000);
        assert_eq!(stats.unwrap().solution_cost, Some(3000));

        planner.reset();
        assert!(planner.environment().is_none());
        assert!(planner.last_stats().is_none());

        let mut params = test_planner_params();
        params.motion_primitive_file = "/definitely/not/a/real/file.mprim".into();
        let mut planner = TrajPlanner::new(params).unwrap();
        assert!(matches!(
            planner.ingest_cost_map(&free_map(4, 4)),
            Err(PlanError::Setup(SetupError::FileLoad(..)))
        ));
    }

    #[test]
    fn test_sample_valid_poses() {
        let mut planner = test_planner();
        let mut rng = StdRng::seed_from_u64(7);
        assert!(planner.sample_valid_poses(1, 10, &mut rng).is_err());

        planner.ingest_cost_map(&free_map(8, 8)).unwrap();
        let poses = planner.sample_valid_poses(5, 50, &mut rng).unwrap();
        assert_eq!(poses.len(), 5);
    }
}
