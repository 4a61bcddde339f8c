//! Planner executable entry point.
//!
//! Plans a single trajectory over a cost map, then optionally marks some cells as lethal and
//! replans incrementally. The map, trajectories, plan statistics, expansion and generation maps
//! are all saved into the session directory.
//!
//! # Usage
//!
//! ```text
//! planner_exec --start 0.5 0.5 0 --goal 8.5 8.0 1.57 --block 60 60 --block 61 60
//! ```
//!
//! Without `--map` a demo map matching the default primitive file resolution is used.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::{info, warn};
use nalgebra::Vector2;
use std::path::PathBuf;
use structopt::StructOpt;

// Internal
use planner_lib::{
    map::{Cell, CellUpdate, CostMap, CostMapParams, LETHAL_OBSTACLE},
    planner::{PlanError, PlanRequest, TrajPlanner},
    pose::Pose2,
    trajectory::Trajectory,
};
use util::{
    logger::{logger_init, LevelFilter},
    module::State,
    session::Session,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Cell size of the demo map, matching the default primitive file.
const DEMO_RESOLUTION_M: f64 = 0.05;

/// Number of cells along each side of the demo map.
const DEMO_SIZE_CELLS: usize = 200;

// ---------------------------------------------------------------------------
// ARGUMENTS
// ---------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "planner_exec", about = "Lattice trajectory planner")]
struct Args {
    /// Planner parameter file, defaults to `planner.toml` in the params directory
    #[structopt(long, parse(from_os_str))]
    params: Option<PathBuf>,

    /// Cost map JSON file, a demo map is used if not given
    #[structopt(long, parse(from_os_str))]
    map: Option<PathBuf>,

    /// Start pose as `x y heading`, in meters and radians
    #[structopt(long, number_of_values = 3, allow_hyphen_values = true, required = true)]
    start: Vec<f64>,

    /// Goal pose as `x y heading`, in meters and radians
    #[structopt(long, number_of_values = 3, allow_hyphen_values = true, required = true)]
    goal: Vec<f64>,

    /// A cell `x y` to make lethal before replanning, may be repeated
    #[structopt(long, number_of_values = 2)]
    block: Vec<i32>,

    /// Directory sessions are created in, relative to the software root
    #[structopt(long, default_value = "sessions")]
    sessions_dir: String,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let args = Args::from_args();

    // ---- EARLY INITIALISATION ----

    let session =
        Session::new("planner_exec", &args.sessions_dir).wrap_err("Failed to create the session")?;

    // The search logs every iteration at debug, which swamps the log
    logger_init(
        LevelFilter::Debug,
        &[("planner_lib::search", LevelFilter::Info)],
        &session,
    )
    .wrap_err("Failed to initialise logging")?;

    info!("Lattice Planner Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params_path = match args.params {
        Some(p) => p,
        None => util::params::params_dir()
            .wrap_err("Could not find the params directory")?
            .join("planner.toml"),
    };

    let mut planner = TrajPlanner::default();
    planner
        .init(params_path, Some(&session))
        .wrap_err("Failed to initialise the planner")?;

    info!("Planner parameters loaded");

    // ---- LOAD MAP ----

    let cost_map = match &args.map {
        Some(path) => {
            info!("Loading cost map from {:?}", path);
            CostMap::load(path).wrap_err("Could not load the cost map")?
        }
        None => {
            info!("No cost map given, using the demo map");
            demo_map().wrap_err("Could not build the demo map")?
        }
    };
    session.save("planner/cost_map.json", cost_map.clone());

    let start = pose_from_args(&args.start).wrap_err("Invalid start pose")?;
    let goal = pose_from_args(&args.goal).wrap_err("Invalid goal pose")?;

    // ---- INITIAL PLAN ----

    let request = PlanRequest {
        start,
        goal,
        cost_map: Some(cost_map),
        cell_updates: Vec::new(),
    };
    let (traj, _) = planner.proc(&request).wrap_err("Initial plan failed")?;
    report(&session, &planner, &traj, "initial");

    // ---- INCREMENTAL REPLAN ----

    if !args.block.is_empty() {
        let cell_updates: Vec<CellUpdate> = args
            .block
            .chunks(2)
            .map(|c| CellUpdate::new(Cell::new(c[0], c[1]), LETHAL_OBSTACLE))
            .collect();

        info!("Replanning with {} newly lethal cells", cell_updates.len());

        let request = PlanRequest {
            start,
            goal,
            cost_map: None,
            cell_updates,
        };

        match planner.proc(&request) {
            Ok((traj, _)) => report(&session, &planner, &traj, "replan"),
            Err(e @ PlanError::Infeasible) | Err(e @ PlanError::TimedOut) => {
                warn!("Replan found no trajectory: {}", e)
            }
            Err(e) => return Err(e).wrap_err("Replan failed"),
        }
    }

    info!("End of execution");
    session.exit();

    Ok(())
}

fn pose_from_args(values: &[f64]) -> Result<Pose2, Report> {
    match values {
        [x, y, heading] => Ok(Pose2::new(*x, *y, *heading)),
        _ => Err(eyre!("Expected 3 values but got {}", values.len())),
    }
}

/// Log and save the results of one plan.
fn report(session: &Session, planner: &TrajPlanner, traj: &Trajectory, name: &str) {
    info!(
        "{} trajectory: {} points, {:.2} m, {:.1} s, cost {}",
        name,
        traj.len(),
        traj.length_m(),
        traj.duration_s(),
        traj.total_cost()
    );

    session.save(format!("planner/{}_trajectory.json", name), traj.clone());
    session.save(format!("planner/{}_gui_path.json", name), traj.to_gui_path());

    if let Some(map) = planner.expansion_map(false) {
        info!("{} cells expanded", map.num_expanded_cells());
        session.save(format!("planner/{}_expansions.json", name), map);
    }

    if let Some(map) = planner.generation_map(false) {
        info!("New states generated in {} cells", map.num_expanded_cells());
        session.save(format!("planner/{}_generations.json", name), map);
    }
}

/// An open area with a few rectangular obstacles.
fn demo_map() -> Result<CostMap, Report> {
    let mut map = CostMap::new(CostMapParams {
        resolution_m: DEMO_RESOLUTION_M,
        num_cells: Vector2::new(DEMO_SIZE_CELLS, DEMO_SIZE_CELLS),
        ..Default::default()
    })?;

    map.fill_rect(Cell::new(40, 0), Cell::new(45, 140), LETHAL_OBSTACLE);
    map.fill_rect(Cell::new(100, 60), Cell::new(105, 199), LETHAL_OBSTACLE);
    map.fill_rect(Cell::new(140, 20), Cell::new(180, 40), LETHAL_OBSTACLE);

    // Rough ground around the obstacles
    map.fill_rect(Cell::new(30, 140), Cell::new(60, 160), 120);
    map.fill_rect(Cell::new(90, 40), Cell::new(120, 60), 80);

    Ok(map)
}
