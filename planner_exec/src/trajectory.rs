//! # Trajectory
//!
//! Converts a path of lattice states into a timed sequence of continuous poses by laying the
//! intermediate poses of each primitive end to end.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::{
    lattice::{Cost, LatticeEnvironment, PrimitiveId, StateId},
    pose::Pose2,
    search::LatticePath,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajPoint {
    pub pose: Pose2,

    /// Time since the start of the trajectory
    pub time_s: f64,
}

/// The part of a trajectory produced by one primitive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajSegment {
    /// Index of the first point of the segment, shared with the previous segment
    pub first_point: usize,

    /// Index of the last point of the segment, inclusive
    pub last_point: usize,

    pub primitive: PrimitiveId,

    pub cost: Cost,

    pub duration_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Frame the poses are expressed in
    pub frame_id: String,

    pub points: Vec<TrajPoint>,

    pub segments: Vec<TrajSegment>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractError {
    #[error("Cannot make a trajectory from an empty path")]
    EmptyPath,

    #[error("Path has {states} states but {hops} hops")]
    LengthMismatch { states: usize, hops: usize },

    #[error("State {0} is not known to the environment")]
    UnknownState(StateId),

    #[error("Primitive {0} is not known to the environment")]
    UnknownPrimitive(PrimitiveId),

    #[error("Hop {0} does not connect consecutive path states")]
    Discontinuous(usize),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Trajectory {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn duration_s(&self) -> f64 {
        self.points.last().map(|p| p.time_s).unwrap_or(0.0)
    }

    /// Length of the polyline through all points.
    pub fn length_m(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| w[0].pose.distance_m(&w[1].pose))
            .sum()
    }

    pub fn total_cost(&self) -> Cost {
        self.segments
            .iter()
            .fold(0, |acc: Cost, s| acc.saturating_add(s.cost))
    }

    /// Poses only, in order, as shown on a GUI.
    pub fn to_gui_path(&self) -> Vec<Pose2> {
        self.points.iter().map(|p| p.pose).collect()
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Build the trajectory following a path through the environment.
pub fn extract(
    env: &dyn LatticeEnvironment,
    path: &LatticePath,
    frame_id: &str,
) -> Result<Trajectory, ExtractError> {
    let first_state = *path.states.first().ok_or(ExtractError::EmptyPath)?;

    if path.states.len() != path.hops.len() + 1 {
        return Err(ExtractError::LengthMismatch {
            states: path.states.len(),
            hops: path.hops.len(),
        });
    }

    let start_pose = env
        .state_pose(first_state)
        .ok_or(ExtractError::UnknownState(first_state))?;

    let mut points = vec![TrajPoint {
        pose: start_pose,
        time_s: 0.0,
    }];
    let mut segments = Vec::with_capacity(path.hops.len());

    for (i, hop) in path.hops.iter().enumerate() {
        if hop.source != path.states[i] || hop.target != path.states[i + 1] {
            return Err(ExtractError::Discontinuous(i));
        }

        let origin = env
            .state_pose(hop.source)
            .ok_or(ExtractError::UnknownState(hop.source))?;
        let prim = env
            .primitive(hop.primitive)
            .ok_or(ExtractError::UnknownPrimitive(hop.primitive))?;

        let first_point = points.len() - 1;
        let t0 = points[first_point].time_s;
        let num_intervals = (prim.intermediate_poses.len() - 1).max(1) as f64;

        // The first intermediate pose is the end of the previous segment
        for (j, p) in prim.intermediate_poses.iter().enumerate().skip(1) {
            points.push(TrajPoint {
                pose: Pose2 {
                    position_m: origin.position_m + p.position_m,
                    heading_rad: p.heading_rad,
                },
                time_s: t0 + prim.traversal_time_s * j as f64 / num_intervals,
            });
        }

        segments.push(TrajSegment {
            first_point,
            last_point: points.len() - 1,
            primitive: hop.primitive,
            cost: hop.cost,
            duration_s: prim.traversal_time_s,
        });
    }

    Ok(Trajectory {
        frame_id: frame_id.to_string(),
        points,
        segments,
    })
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
