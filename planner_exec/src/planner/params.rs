//! Trajectory planner parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    lattice::{EnvironmentKind, LatticeParams, PrimitiveTiming},
    search::{SearchParams, MAX_TIME_BUDGET_S},
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the trajectory planner, normally loaded from `planner.toml`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PlannerParams {
    /// Frame the trajectories are given in
    pub planning_frame: String,

    /// Which lattice to plan over
    pub environment: EnvironmentKind,

    /// Path to the `.mprim` file, relative to the params directory unless absolute
    pub motion_primitive_file: String,

    /// Number of discrete headings, must match the primitive file
    pub num_heading_buckets: u16,

    /// Nominal translational speed of the robot
    pub nominal_vel_ms: f64,

    /// Time taken for the robot to turn on the spot through 45 degrees
    pub time_to_turn_45_s: f64,

    /// Cells with a cost at or above this value can't be traversed
    pub lethal_threshold: u8,

    /// Wall clock time allowed for each plan
    pub allocated_time_s: f64,

    /// Heuristic inflation for the first solution
    pub initial_epsilon: f64,

    /// Amount epsilon is reduced by between solutions
    pub epsilon_decrement: f64,

    /// If at least this many cells changed since the last plan, plan from scratch
    pub force_scratch_limit: usize,

    /// Return the first solution found rather than improving it
    pub search_until_first_solution: bool,

    /// Save the statistics of each plan into the session
    pub save_stats: bool,
}

/// The subset of parameters which may be changed between plans.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct DynamicParams {
    pub allocated_time_s: f64,

    pub initial_epsilon: f64,

    pub force_scratch_limit: usize,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for PlannerParams {
    fn default() -> Self {
        Self {
            planning_frame: "map".into(),
            environment: EnvironmentKind::XyTheta,
            motion_primitive_file: "prims/unicycle_8.mprim".into(),
            num_heading_buckets: 8,
            nominal_vel_ms: 0.2,
            time_to_turn_45_s: 1.5,
            lethal_threshold: 253,
            allocated_time_s: 2.0,
            initial_epsilon: 3.0,
            epsilon_decrement: 0.2,
            force_scratch_limit: 500,
            search_until_first_solution: false,
            save_stats: true,
        }
    }
}

impl PlannerParams {
    /// Check the parameters make sense, returning a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_heading_buckets == 0 {
            return Err("num_heading_buckets must be at least 1".into());
        }
        if !(self.nominal_vel_ms > 0.0) {
            return Err("nominal_vel_ms must be positive".into());
        }
        if !(self.time_to_turn_45_s > 0.0) {
            return Err("time_to_turn_45_s must be positive".into());
        }
        if self.lethal_threshold == 0 {
            return Err("lethal_threshold must be at least 1".into());
        }

        self.dynamic().validate()?;

        if !(self.epsilon_decrement > 0.0) {
            return Err("epsilon_decrement must be positive".into());
        }

        Ok(())
    }

    /// Resolve the motion primitive file path.
    pub fn primitive_file_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.motion_primitive_file);
        if path.is_absolute() {
            return path;
        }

        match util::params::params_dir() {
            Ok(dir) => dir.join(path),
            Err(_) => path,
        }
    }

    pub fn lattice_params(&self) -> LatticeParams {
        LatticeParams {
            num_heading_buckets: self.num_heading_buckets,
            timing: PrimitiveTiming {
                nominal_vel_ms: self.nominal_vel_ms,
                time_to_turn_45_s: self.time_to_turn_45_s,
            },
        }
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            time_budget: Duration::from_secs_f64(self.allocated_time_s),
            initial_epsilon: self.initial_epsilon,
            epsilon_decrement: self.epsilon_decrement,
            first_solution_only: self.search_until_first_solution,
        }
    }

    pub fn dynamic(&self) -> DynamicParams {
        DynamicParams {
            allocated_time_s: self.allocated_time_s,
            initial_epsilon: self.initial_epsilon,
            force_scratch_limit: self.force_scratch_limit,
        }
    }

    pub fn apply_dynamic(&mut self, dynamic: &DynamicParams) {
        self.allocated_time_s = dynamic.allocated_time_s;
        self.initial_epsilon = dynamic.initial_epsilon;
        self.force_scratch_limit = dynamic.force_scratch_limit;
    }
}

impl DynamicParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.allocated_time_s >= 0.0 && self.allocated_time_s <= MAX_TIME_BUDGET_S as f64) {
            return Err(format!(
                "allocated_time_s must be between 0 and {} seconds",
                MAX_TIME_BUDGET_S
            ));
        }
        if !(self.initial_epsilon >= 1.0) {
            return Err("initial_epsilon must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PARAMS: &str = r#"
planning_frame = "map"
environment = "XyTheta"
motion_primitive_file = "prims/unicycle_8.mprim"
num_heading_buckets = 8
nominal_vel_ms = 0.2
time_to_turn_45_s = 1.5
lethal_threshold = 253
allocated_time_s = 2.0
initial_epsilon = 3.0
epsilon_decrement = 0.2
force_scratch_limit = 500
search_until_first_solution = false
save_stats = true
"#;

    #[test]
    fn test_load() {
        let p: PlannerParams = util::params::from_str(PARAMS).unwrap();

        assert_eq!(p.environment, EnvironmentKind::XyTheta);
        assert_eq!(p.num_heading_buckets, 8);
        assert!(p.validate().is_ok());
        assert_eq!(p, PlannerParams::default());

        let sp = p.search_params();
        assert_eq!(sp.time_budget, Duration::from_secs(2));
        assert!(!sp.first_solution_only);
    }

    #[test]
    fn test_validate() {
        let mut p: PlannerParams = util::params::from_str(PARAMS).unwrap();

        p.initial_epsilon = 0.5;
        assert!(p.validate().is_err());

        p.initial_epsilon = 2.0;
        p.epsilon_decrement = 0.0;
        assert!(p.validate().is_err());

        p.epsilon_decrement = 0.5;
        assert_ne!(p, PlannerParams::default());
        p.apply_dynamic(&DynamicParams {
            allocated_time_s: 0.5,
            initial_epsilon: 5.0,
            force_scratch_limit: 10,
        });
        assert!(p.validate().is_ok());
        assert_eq!(p.dynamic().force_scratch_limit, 10);

        for bad in [-1.0, f64::NAN, f64::INFINITY, 1e30] {
            p.allocated_time_s = bad;
            assert!(p.validate().is_err(), "{} accepted", bad);
        }

        p.allocated_time_s = MAX_TIME_BUDGET_S as f64;
        assert!(p.validate().is_ok());
        assert_eq!(
            p.search_params().time_budget,
            Duration::from_secs(MAX_TIME_BUDGET_S)
        );
    }
}
