//! # Motion primitives
//!
//! Parses motion primitive files in the SBPL `.mprim` format and precomputes everything the
//! lattice needs per primitive: the cells it sweeps, its base cost and its traversal time.
//!
//! A file looks like:
//!
//! ```text
//! resolution_m: 0.050000
//! numberofangles: 16
//! totalnumberofprimitives: 80
//! primID: 0
//! startangle_c: 0
//! endpose_c: 1 0 0
//! additionalactioncostmult: 1
//! intermediateposes: 10
//! 0.0000 0.0000 0.0000
//! ...
//! ```
//!
//! Intermediate poses are in meters relative to the centre of the start cell, with absolute
//! headings in radians.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    f64::consts::FRAC_PI_4,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, info};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use super::{discretise_heading, discretise_offset, heading_of_bucket, Cost};
use crate::{map::Cell, pose::Pose2};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Largest allowed difference between the file resolution and the map resolution.
const RESOLUTION_TOLERANCE_M: f64 = 1e-6;

/// Footprint samples are taken at most this fraction of a cell apart.
const FOOTPRINT_SAMPLES_PER_CELL: f64 = 4.0;

/// Costs are stored in milliseconds of traversal time.
const COST_PER_SECOND: f64 = 1000.0;

/// Counts read from a file only size allocations up to this, the rest grow as entries are read.
const MAX_PREALLOCATED: usize = 64;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Index of a primitive within its [`MotionPrimitiveTable`].
pub type PrimitiveId = usize;

/// Robot properties used to turn primitive geometry into time and cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveTiming {
    /// Nominal translational velocity
    pub nominal_vel_ms: f64,

    /// Time taken to turn through 45 degrees
    pub time_to_turn_45_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionPrimitive {
    /// Index in the table
    pub id: PrimitiveId,

    /// `primID` as given in the file, unique only within a start heading
    pub file_id: usize,

    pub start_heading: u16,

    /// Cell offset of the end of the primitive from its start cell
    pub end_offset: Cell,

    pub end_heading: u16,

    pub cost_multiplier: u32,

    pub intermediate_poses: Vec<Pose2>,

    /// Cell offsets swept by the primitive, in order of first visit
    pub footprint: Vec<Cell>,

    /// Cost of the primitive over completely free cells
    pub base_cost: Cost,

    pub traversal_time_s: f64,
}

/// The full set of motion primitives for one lattice.
#[derive(Debug, Clone)]
pub struct MotionPrimitiveTable {
    resolution_m: f64,

    num_headings: u16,

    primitives: Vec<MotionPrimitive>,

    /// Primitive ids indexed by start heading
    by_start: Vec<Vec<PrimitiveId>>,

    /// Primitive ids indexed by end heading
    by_end: Vec<Vec<PrimitiveId>>,
}

/// Walks whitespace separated tokens while remembering which line each came from.
struct Tokens<'a> {
    iter: Box<dyn Iterator<Item = (usize, &'a str)> + 'a>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Errors which make it impossible to build the lattice. These are fatal for planning.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Cannot read the motion primitive file {0:?}: {1}")]
    FileLoad(PathBuf, std::io::Error),

    #[error("Expected key `{expected}` on line {line}, found `{found}`")]
    MissingKey {
        line: usize,
        expected: &'static str,
        found: String,
    },

    #[error("File ended while expecting `{0}`")]
    UnexpectedEof(&'static str),

    #[error("Cannot parse `{value}` as the {what} on line {line}")]
    Parse {
        line: usize,
        what: &'static str,
        value: String,
    },

    #[error("File has {file} heading buckets but the lattice is configured for {expected}")]
    HeadingCountMismatch { file: u16, expected: u16 },

    #[error("File resolution {file} m does not match the map resolution {expected} m")]
    ResolutionMismatch { file: f64, expected: f64 },

    #[error("File declares {declared} primitives but contains {found}")]
    PrimitiveCountMismatch { declared: usize, found: usize },

    #[error("Primitive {prim} has start heading {heading} which is out of range")]
    StartHeadingOutOfRange { prim: usize, heading: i64 },

    #[error("No primitive starts at heading bucket {0}")]
    MissingHeading(u16),

    #[error("Primitive {0} has a zero cost multiplier")]
    ZeroCostMultiplier(usize),

    #[error("Primitive {prim} has {count} intermediate poses, at least 2 are needed")]
    TooFewIntermediatePoses { prim: usize, count: usize },

    #[error("The first intermediate pose of primitive {0} is not at the start cell and heading")]
    BadFirstPose(usize),

    #[error("The last intermediate pose of primitive {0} is not at the declared end pose")]
    BadLastPose(usize),

    #[error("Primitive {0} neither moves nor turns")]
    NoMotion(usize),

    #[error("Invalid primitive timing: {0}")]
    InvalidTiming(String),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            iter: Box::new(
                text.lines()
                    .enumerate()
                    .flat_map(|(i, l)| l.split_whitespace().map(move |t| (i + 1, t))),
            ),
        }
    }

    fn next(&mut self, expected: &'static str) -> Result<(usize, &'a str), SetupError> {
        self.iter.next().ok_or(SetupError::UnexpectedEof(expected))
    }

    /// Consume a `key:` token. The trailing colon is optional.
    fn key(&mut self, key: &'static str) -> Result<(), SetupError> {
        let (line, tok) = self.next(key)?;
        if tok.trim_end_matches(':') == key {
            Ok(())
        } else {
            Err(SetupError::MissingKey {
                line,
                expected: key,
                found: tok.to_string(),
            })
        }
    }

    fn value<T: FromStr>(&mut self, what: &'static str) -> Result<T, SetupError> {
        let (line, tok) = self.next(what)?;
        tok.parse().map_err(|_| SetupError::Parse {
            line,
            what,
            value: tok.to_string(),
        })
    }

    fn keyed_value<T: FromStr>(&mut self, key: &'static str) -> Result<T, SetupError> {
        self.key(key)?;
        self.value(key)
    }
}

impl PrimitiveTiming {
    fn validate(&self) -> Result<(), SetupError> {
        if !(self.nominal_vel_ms > 0.0) {
            return Err(SetupError::InvalidTiming(format!(
                "nominal velocity must be positive, got {}",
                self.nominal_vel_ms
            )));
        }
        if !(self.time_to_turn_45_s > 0.0) {
            return Err(SetupError::InvalidTiming(format!(
                "time to turn 45 degrees must be positive, got {}",
                self.time_to_turn_45_s
            )));
        }
        Ok(())
    }
}

impl MotionPrimitive {
    /// Total length of the intermediate pose polyline.
    pub fn path_length_m(&self) -> f64 {
        polyline_length(&self.intermediate_poses)
    }

    /// True if the primitive changes the position of the robot.
    pub fn is_translation(&self) -> bool {
        self.end_offset != Cell::new(0, 0)
    }
}

impl MotionPrimitiveTable {
    /// Load a table from a `.mprim` file.
    ///
    /// `expected_headings` and `expected_resolution_m` come from the lattice configuration and
    /// the cost map respectively, the file must agree with both.
    pub fn load<P: AsRef<Path>>(
        path: P,
        expected_headings: u16,
        expected_resolution_m: f64,
        timing: PrimitiveTiming,
    ) -> Result<Self, SetupError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SetupError::FileLoad(path.to_path_buf(), e))?;

        let table = Self::parse(&text, expected_headings, expected_resolution_m, timing)?;

        info!(
            "Loaded {} motion primitives over {} headings from {:?}",
            table.len(),
            table.num_headings(),
            path
        );

        Ok(table)
    }

    /// Parse a table from the contents of a `.mprim` file.
    pub fn parse(
        text: &str,
        expected_headings: u16,
        expected_resolution_m: f64,
        timing: PrimitiveTiming,
    ) -> Result<Self, SetupError> {
        timing.validate()?;

        let mut tokens = Tokens::new(text);

        // Header
        let resolution_m: f64 = tokens.keyed_value("resolution_m")?;
        if (resolution_m - expected_resolution_m).abs() > RESOLUTION_TOLERANCE_M {
            return Err(SetupError::ResolutionMismatch {
                file: resolution_m,
                expected: expected_resolution_m,
            });
        }

        let num_headings: u16 = tokens.keyed_value("numberofangles")?;
        if num_headings != expected_headings {
            return Err(SetupError::HeadingCountMismatch {
                file: num_headings,
                expected: expected_headings,
            });
        }

        let declared: usize = tokens.keyed_value("totalnumberofprimitives")?;

        // Primitives
        let mut primitives = Vec::with_capacity(declared.min(MAX_PREALLOCATED));
        for id in 0..declared {
            match tokens.key("primID") {
                Ok(()) => (),
                Err(SetupError::UnexpectedEof(_)) => {
                    return Err(SetupError::PrimitiveCountMismatch {
                        declared,
                        found: id,
                    })
                }
                Err(e) => return Err(e),
            }

            primitives.push(parse_primitive(
                &mut tokens,
                id,
                num_headings,
                resolution_m,
                &timing,
            )?);
        }

        // Anything more than the declared number of primitives is an error, other trailing
        // content is ignored.
        let extra = std::iter::from_fn(|| tokens.iter.next())
            .filter(|(_, t)| t.trim_end_matches(':') == "primID")
            .count();
        if extra > 0 {
            return Err(SetupError::PrimitiveCountMismatch {
                declared,
                found: declared + extra,
            });
        }

        // Build the per-heading lookups
        let mut by_start = vec![Vec::new(); num_headings as usize];
        let mut by_end = vec![Vec::new(); num_headings as usize];
        for p in primitives.iter() {
            by_start[p.start_heading as usize].push(p.id);
            by_end[p.end_heading as usize].push(p.id);
        }

        if let Some(h) = by_start.iter().position(|v| v.is_empty()) {
            return Err(SetupError::MissingHeading(h as u16));
        }

        debug!(
            "Primitive base costs: min {:?}, max {:?}",
            primitives.iter().map(|p| p.base_cost).min(),
            primitives.iter().map(|p| p.base_cost).max()
        );

        Ok(Self {
            resolution_m,
            num_headings,
            primitives,
            by_start,
            by_end,
        })
    }

    pub fn resolution(&self) -> f64 {
        self.resolution_m
    }

    pub fn num_headings(&self) -> u16 {
        self.num_headings
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn get(&self, id: PrimitiveId) -> Option<&MotionPrimitive> {
        self.primitives.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MotionPrimitive> {
        self.primitives.iter()
    }

    /// All primitives starting at the given heading bucket, in file order.
    pub fn for_heading(&self, heading: u16) -> impl Iterator<Item = &MotionPrimitive> {
        self.ids_for(&self.by_start, heading)
    }

    /// All primitives ending at the given heading bucket, in file order.
    pub fn ending_at(&self, heading: u16) -> impl Iterator<Item = &MotionPrimitive> {
        self.ids_for(&self.by_end, heading)
    }

    fn ids_for<'a>(
        &'a self,
        lookup: &'a [Vec<PrimitiveId>],
        heading: u16,
    ) -> impl Iterator<Item = &'a MotionPrimitive> {
        lookup
            .get(heading as usize)
            .into_iter()
            .flatten()
            .map(move |&id| &self.primitives[id])
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn parse_primitive(
    tokens: &mut Tokens,
    id: PrimitiveId,
    num_headings: u16,
    resolution_m: f64,
    timing: &PrimitiveTiming,
) -> Result<MotionPrimitive, SetupError> {
    let file_id: usize = tokens.value("primID")?;

    let start: i64 = tokens.keyed_value("startangle_c")?;
    if start < 0 || start >= num_headings as i64 {
        return Err(SetupError::StartHeadingOutOfRange {
            prim: id,
            heading: start,
        });
    }
    let start_heading = start as u16;

    tokens.key("endpose_c")?;
    let end_dx: i32 = tokens.value("end pose x")?;
    let end_dy: i32 = tokens.value("end pose y")?;
    let end_theta: i64 = tokens.value("end pose heading")?;
    let end_offset = Cell::new(end_dx, end_dy);
    let end_heading = end_theta.rem_euclid(num_headings as i64) as u16;

    let cost_multiplier: u32 = tokens.keyed_value("additionalactioncostmult")?;
    if cost_multiplier == 0 {
        return Err(SetupError::ZeroCostMultiplier(id));
    }

    let count: usize = tokens.keyed_value("intermediateposes")?;
    let mut intermediate_poses = Vec::with_capacity(count.min(MAX_PREALLOCATED));
    for _ in 0..count {
        let x: f64 = tokens.value("intermediate pose x")?;
        let y: f64 = tokens.value("intermediate pose y")?;
        let theta: f64 = tokens.value("intermediate pose heading")?;
        intermediate_poses.push(Pose2::new(x, y, theta));
    }

    if count < 2 {
        return Err(SetupError::TooFewIntermediatePoses { prim: id, count });
    }

    // Endpoints must agree with the discrete start and end
    let discretise = |p: &Pose2| {
        (
            Cell::new(
                discretise_offset(p.x(), resolution_m),
                discretise_offset(p.y(), resolution_m),
            ),
            discretise_heading(p.heading_rad, num_headings),
        )
    };
    if discretise(&intermediate_poses[0]) != (Cell::new(0, 0), start_heading) {
        return Err(SetupError::BadFirstPose(id));
    }
    if discretise(&intermediate_poses[count - 1]) != (end_offset, end_heading) {
        return Err(SetupError::BadLastPose(id));
    }

    // Timing and cost
    let linear_m = polyline_length(&intermediate_poses).max(
        Vector2::new(end_dx as f64, end_dy as f64).norm() * resolution_m,
    );
    // Turn measured in whole buckets so that exact turns give exact times
    let turn_buckets = (end_heading as i64 - start_heading as i64).rem_euclid(num_headings as i64);
    let turn_buckets = turn_buckets.min(num_headings as i64 - turn_buckets) as u16;
    let angular_rad = heading_of_bucket(turn_buckets, num_headings);
    let traversal_time_s = (linear_m / timing.nominal_vel_ms)
        .max(angular_rad / FRAC_PI_4 * timing.time_to_turn_45_s);

    if end_offset == Cell::new(0, 0) && end_heading == start_heading {
        return Err(SetupError::NoMotion(id));
    }

    let base_cost = ((COST_PER_SECOND * traversal_time_s).ceil() as Cost)
        .max(1)
        .saturating_mul(cost_multiplier);

    let footprint = sweep_footprint(&intermediate_poses, end_offset, resolution_m);

    Ok(MotionPrimitive {
        id,
        file_id,
        start_heading,
        end_offset,
        end_heading,
        cost_multiplier,
        intermediate_poses,
        footprint,
        base_cost,
        traversal_time_s,
    })
}

fn polyline_length(poses: &[Pose2]) -> f64 {
    poses.windows(2).map(|w| w[0].distance_m(&w[1])).sum()
}

/// Cells visited by the polyline through the given poses.
fn sweep_footprint(poses: &[Pose2], end_offset: Cell, resolution_m: f64) -> Vec<Cell> {
    let max_step = resolution_m / FOOTPRINT_SAMPLES_PER_CELL;
    let mut footprint = vec![Cell::new(0, 0)];

    let mut push = |p: Vector2<f64>| {
        let cell = Cell::new(
            discretise_offset(p.x, resolution_m),
            discretise_offset(p.y, resolution_m),
        );
        if !footprint.contains(&cell) {
            footprint.push(cell);
        }
    };

    for w in poses.windows(2) {
        let (a, b) = (w[0].position_m, w[1].position_m);
        let steps = ((b - a).norm() / max_step).ceil().max(1.0) as usize;
        for i in 0..=steps {
            push(a + (b - a) * (i as f64 / steps as f64));
        }
    }

    if !footprint.contains(&end_offset) {
        footprint.push(end_offset);
    }

    footprint
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{four_heading_mprim, TEST_TIMING};

    fn parse(text: &str) -> Result<MotionPrimitiveTable, SetupError> {
        MotionPrimitiveTable::parse(text, 4, 1.0, TEST_TIMING)
    }

    #[test]
    fn test_parse_four_headings() {
        let table = parse(&four_heading_mprim()).unwrap();

        assert_eq!(table.num_headings(), 4);
        assert_eq!(table.len(), 16);
        for h in 0..4 {
            assert_eq!(table.for_heading(h).count(), 4);
            assert!(table.for_heading(h).all(|p| p.start_heading == h));
            assert!(table.ending_at(h).all(|p| p.end_heading == h));
        }

        // Forward east: one cell, one second
        let fwd = table.for_heading(0).next().unwrap();
        assert_eq!(fwd.end_offset, Cell::new(1, 0));
        assert_eq!(fwd.base_cost, 1000);
        assert_eq!(fwd.footprint, vec![Cell::new(0, 0), Cell::new(1, 0)]);

        // Turn in place through 90 degrees at one second per 45
        let turn = table.for_heading(0).nth(1).unwrap();
        assert_eq!(turn.end_heading, 1);
        assert_eq!(turn.base_cost, 2000);
        assert!((turn.traversal_time_s - 2.0).abs() < 1e-9);
        assert_eq!(turn.footprint, vec![Cell::new(0, 0)]);

        // Right turn from heading 0 wraps to heading 3
        let right = table.for_heading(0).nth(2).unwrap();
        assert_eq!(right.end_heading, 3);

        // Reversing costs five times as much
        let back = table.for_heading(1).nth(3).unwrap();
        assert_eq!(back.end_offset, Cell::new(0, -1));
        assert_eq!(back.base_cost, 5000);
    }

    #[test]
    fn test_header_mismatch() {
        let text = four_heading_mprim();

        assert!(matches!(
            MotionPrimitiveTable::parse(&text, 8, 1.0, TEST_TIMING),
            Err(SetupError::HeadingCountMismatch {
                file: 4,
                expected: 8
            })
        ));
        assert!(matches!(
            MotionPrimitiveTable::parse(&text, 4, 0.5, TEST_TIMING),
            Err(SetupError::ResolutionMismatch { .. })
        ));
        assert!(matches!(
            parse("numberofangles: 4"),
            Err(SetupError::MissingKey {
                line: 1,
                expected: "resolution_m",
                ..
            })
        ));
        assert!(matches!(
            parse("resolution_m: one"),
            Err(SetupError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_primitive_count() {
        let text = four_heading_mprim().replace(
            "totalnumberofprimitives: 16",
            "totalnumberofprimitives: 17",
        );
        assert!(matches!(
            parse(&text),
            Err(SetupError::PrimitiveCountMismatch {
                declared: 17,
                found: 16
            })
        ));

        let text = four_heading_mprim().replace(
            "totalnumberofprimitives: 16",
            "totalnumberofprimitives: 15",
        );
        assert!(matches!(
            parse(&text),
            Err(SetupError::PrimitiveCountMismatch {
                declared: 15,
                found: 16
            })
        ));
    }

    #[test]
    fn test_huge_counts() {
        let huge = usize::MAX.to_string();

        let text = four_heading_mprim().replace(
            "totalnumberofprimitives: 16",
            &format!("totalnumberofprimitives: {}", huge),
        );
        assert!(matches!(
            parse(&text),
            Err(SetupError::PrimitiveCountMismatch { found: 16, .. })
        ));

        let text = four_heading_mprim().replacen(
            "intermediateposes: 3",
            &format!("intermediateposes: {}", huge),
            1,
        );
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_invalid_primitives() {
        let zero_mult = four_heading_mprim().replacen(
            "additionalactioncostmult: 1",
            "additionalactioncostmult: 0",
            1,
        );
        assert!(matches!(
            parse(&zero_mult),
            Err(SetupError::ZeroCostMultiplier(0))
        ));

        let bad_end = four_heading_mprim().replacen("endpose_c: 1 0 0", "endpose_c: 2 0 0", 1);
        assert!(matches!(parse(&bad_end), Err(SetupError::BadLastPose(0))));

        let bad_start = four_heading_mprim().replacen("startangle_c: 0", "startangle_c: 9", 1);
        assert!(matches!(
            parse(&bad_start),
            Err(SetupError::StartHeadingOutOfRange {
                prim: 0,
                heading: 9
            })
        ));

        let bad_timing = PrimitiveTiming {
            nominal_vel_ms: 0.0,
            time_to_turn_45_s: 1.0,
        };
        assert!(matches!(
            MotionPrimitiveTable::parse(&four_heading_mprim(), 4, 1.0, bad_timing),
            Err(SetupError::InvalidTiming(_))
        ));
    }

    #[test]
    fn test_footprint_sampling() {
        // A two cell diagonal move sweeps through the cells it crosses
        let poses = vec![Pose2::new(0.0, 0.0, 0.0), Pose2::new(2.0, 1.0, 0.0)];
        let footprint = sweep_footprint(&poses, Cell::new(2, 1), 1.0);

        assert_eq!(footprint[0], Cell::new(0, 0));
        assert_eq!(*footprint.last().unwrap(), Cell::new(2, 1));
        assert!(footprint.contains(&Cell::new(1, 0)) || footprint.contains(&Cell::new(1, 1)));

        let mut dedup = footprint.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), footprint.len());
    }
}
