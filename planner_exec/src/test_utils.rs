//! Shared fixtures for the unit tests

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    f64::consts::FRAC_PI_2,
    fmt::Write,
    sync::Arc,
};

use nalgebra::Vector2;

use crate::{
    lattice::{
        create_environment, Cost, EnvironmentKind, LatticeEnvironment, LatticeParams,
        MotionPrimitiveTable, PrimitiveTiming, StateId,
    },
    map::{CostMap, CostMapParams},
    planner::{PlannerParams, TrajPlanner},
    pose::Pose2,
};

/// One meter per second, one second per 45 degrees of turn.
pub const TEST_TIMING: PrimitiveTiming = PrimitiveTiming {
    nominal_vel_ms: 1.0,
    time_to_turn_45_s: 1.0,
};

/// A 4 heading primitive file at 1 m resolution.
///
/// For each heading, in order: forward one cell, turn left in place, turn right in place, and
/// back one cell at five times the cost.
pub fn four_heading_mprim() -> String {
    const DIRS: [(i32, i32); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

    let mut s = String::new();
    writeln!(s, "resolution_m: 1.000000").unwrap();
    writeln!(s, "numberofangles: 4").unwrap();
    writeln!(s, "totalnumberofprimitives: 16").unwrap();

    let mut id = 0;
    for h in 0..4i32 {
        let theta = h as f64 * FRAC_PI_2;
        let (dx, dy) = DIRS[h as usize];

        // (end dx, end dy, end heading, cost mult, poses)
        let (fx, fy) = (dx as f64, dy as f64);
        let prims = [
            (
                dx,
                dy,
                h,
                1,
                [
                    (0.0, 0.0, theta),
                    (0.5 * fx, 0.5 * fy, theta),
                    (fx, fy, theta),
                ],
            ),
            (
                0,
                0,
                (h + 1) % 4,
                1,
                [
                    (0.0, 0.0, theta),
                    (0.0, 0.0, theta + 0.5 * FRAC_PI_2),
                    (0.0, 0.0, theta + FRAC_PI_2),
                ],
            ),
            (
                0,
                0,
                (h + 3) % 4,
                1,
                [
                    (0.0, 0.0, theta),
                    (0.0, 0.0, theta - 0.5 * FRAC_PI_2),
                    (0.0, 0.0, theta - FRAC_PI_2),
                ],
            ),
            (
                -dx,
                -dy,
                h,
                5,
                [
                    (0.0, 0.0, theta),
                    (-0.5 * fx, -0.5 * fy, theta),
                    (-fx, -fy, theta),
                ],
            ),
        ];

        for (ex, ey, eh, mult, poses) in prims.iter() {
            writeln!(s, "primID: {}", id).unwrap();
            writeln!(s, "startangle_c: {}", h).unwrap();
            writeln!(s, "endpose_c: {} {} {}", ex, ey, eh).unwrap();
            writeln!(s, "additionalactioncostmult: {}", mult).unwrap();
            writeln!(s, "intermediateposes: {}", poses.len()).unwrap();
            for (x, y, t) in poses.iter() {
                writeln!(s, "{:.6} {:.6} {:.6}", x, y, t).unwrap();
            }
            id += 1;
        }
    }

    s
}

pub fn test_table() -> MotionPrimitiveTable {
    MotionPrimitiveTable::parse(&four_heading_mprim(), 4, 1.0, TEST_TIMING).unwrap()
}

/// A free map of 1 m cells with its origin at zero.
pub fn free_map(width: usize, height: usize) -> CostMap {
    CostMap::new(CostMapParams {
        resolution_m: 1.0,
        num_cells: Vector2::new(width, height),
        origin_m: Vector2::zeros(),
        lethal_threshold: 253,
    })
    .unwrap()
}

pub fn test_lattice(map: CostMap) -> Box<dyn LatticeEnvironment> {
    create_environment(
        EnvironmentKind::XyTheta,
        map,
        Arc::new(test_table()),
        &LatticeParams {
            num_heading_buckets: 4,
            timing: TEST_TIMING,
        },
    )
    .unwrap()
}

/// Pose at the centre of a cell of a [`free_map`], facing the given one of 4 headings.
pub fn cell_pose(x: i32, y: i32, heading: u16) -> Pose2 {
    Pose2::new(x as f64 + 0.5, y as f64 + 0.5, heading as f64 * FRAC_PI_2)
}

pub fn test_planner_params() -> PlannerParams {
    PlannerParams {
        planning_frame: "map".into(),
        environment: EnvironmentKind::XyTheta,
        motion_primitive_file: "test.mprim".into(),
        num_heading_buckets: 4,
        nominal_vel_ms: TEST_TIMING.nominal_vel_ms,
        time_to_turn_45_s: TEST_TIMING.time_to_turn_45_s,
        lethal_threshold: 253,
        allocated_time_s: 30.0,
        initial_epsilon: 3.0,
        epsilon_decrement: 0.5,
        force_scratch_limit: 1000,
        search_until_first_solution: false,
        save_stats: false,
    }
}

pub fn test_planner() -> TrajPlanner {
    TrajPlanner::with_primitives(test_planner_params(), test_table()).unwrap()
}

/// Optimal cost from `start` to `goal` by a plain forward Dijkstra search.
pub fn brute_force_cost(
    env: &dyn LatticeEnvironment,
    start: StateId,
    goal: StateId,
) -> Option<Cost> {
    let mut dist: HashMap<StateId, Cost> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(start, 0);
    heap.push(Reverse((0, start)));

    while let Some(Reverse((d, id))) = heap.pop() {
        if id == goal {
            return Some(d);
        }
        if dist.get(&id).map_or(false, |&best| d > best) {
            continue;
        }

        for e in env.successors(id) {
            let nd = d.saturating_add(e.cost);
            if dist.get(&e.target).map_or(true, |&best| nd < best) {
                dist.insert(e.target, nd);
                heap.push(Reverse((nd, e.target)));
            }
        }
    }

    None
}
