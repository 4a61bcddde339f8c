//! # Cost Map
//!
//! A 2D grid of per-cell traversal costs, using the same value conventions as the navigation
//! stack's costmap layers:
//!
//! ```text
//!   0                    free space
//!   1 .. threshold-1     traversable, higher is worse
//!   threshold .. 254     lethal (inscribed/lethal obstacle)
//!   255                  no information, never traversed
//! ```
//!
//! Cell `(0, 0)` is the cell whose lower-left corner sits at `origin_m`. The X index increases
//! along the planning frame X axis, Y along the Y axis.

// ------------------------------------------------------------------------------------------------
// INCLUDES
// ------------------------------------------------------------------------------------------------

use log::debug;
use nalgebra::Vector2;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Cost of a completely free cell
pub const FREE_SPACE: u8 = 0;

/// Cost of a cell inside the inscribed radius of an obstacle
pub const INSCRIBED_INFLATED_OBSTACLE: u8 = 253;

/// Cost of a cell containing an obstacle
pub const LETHAL_OBSTACLE: u8 = 254;

/// Cost of a cell which has not been observed
pub const NO_INFORMATION: u8 = 255;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Index of a single cell in the map.
///
/// Signed so that offsets from motion primitives can be applied before bounds checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

/// A new cost for a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub cell: Cell,
    pub cost: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMapParams {
    /// Side length of each (square) cell in meters.
    pub resolution_m: f64,

    /// Number of cells along the X and Y axes.
    pub num_cells: Vector2<usize>,

    /// Position of the lower-left corner of cell (0, 0) in the planning frame.
    pub origin_m: Vector2<f64>,

    /// Any cost greater than or equal to this is lethal.
    pub lethal_threshold: u8,
}

/// Cost Map
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CostMap {
    params: CostMapParams,

    /// Raw costs, indexed `[x, y]`
    data: Array2<u8>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Classification of a single cell for planning purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellClass {
    /// Zero cost
    Free,

    /// Traversable with a non-zero cost
    Cost(u8),

    /// Cannot be traversed, at or above the lethal threshold
    Lethal,

    /// Has never been observed
    Unknown,

    /// The cell isn't part of the map
    OutsideMap,
}

/// Errors that can arise from processing costs maps.
#[derive(Debug, thiserror::Error)]
pub enum CostMapError {
    #[error("Cell ({}, {}) is outside the cost map", .0.x, .0.y)]
    OutsideMap(Cell),

    #[error("Invalid cost map parameters: {0}")]
    InvalidParams(String),

    #[error(
        "Cannot process {0}, since this CostMap is of shape {1}, but the target is of shape {2}"
    )]
    ShapeMismatch(String, Vector2<usize>, Vector2<usize>),

    #[error("Cost map IO failed: {0}")]
    Io(std::io::Error),

    #[error("Cost map (de)serialisation failed: {0}")]
    Serde(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Cell {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Return this cell offset by the given amount.
    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

impl CellUpdate {
    pub fn new(cell: Cell, cost: u8) -> Self {
        Self { cell, cost }
    }
}

impl Default for CostMapParams {
    fn default() -> Self {
        Self {
            resolution_m: 0.05,
            num_cells: Vector2::new(100, 100),
            origin_m: Vector2::zeros(),
            lethal_threshold: INSCRIBED_INFLATED_OBSTACLE,
        }
    }
}

impl CostMap {
    /// Create a new map with the given parameters where every cell is free.
    pub fn new(params: CostMapParams) -> Result<Self, CostMapError> {
        Self::validate(&params)?;

        let data = Array2::from_elem((params.num_cells.x, params.num_cells.y), FREE_SPACE);

        Ok(Self { params, data })
    }

    /// Create a new map from existing cost data, indexed `[x, y]`.
    pub fn from_cells(params: CostMapParams, data: Array2<u8>) -> Result<Self, CostMapError> {
        Self::validate(&params)?;

        let shape = Vector2::new(data.nrows(), data.ncols());
        if shape != params.num_cells {
            return Err(CostMapError::ShapeMismatch(
                "cell data".into(),
                params.num_cells,
                shape,
            ));
        }

        Ok(Self { params, data })
    }

    /// Load a map previously written with [`CellMapExt::save`](super::CellMapExt::save).
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, CostMapError> {
        let file = std::fs::File::open(path).map_err(CostMapError::Io)?;
        let map: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(CostMapError::Serde)?;

        // Deserialised data bypasses the constructors, so check it here
        Self::from_cells(map.params, map.data)
    }

    fn validate(params: &CostMapParams) -> Result<(), CostMapError> {
        if !(params.resolution_m > 0.0) {
            return Err(CostMapError::InvalidParams(format!(
                "resolution must be positive, got {}",
                params.resolution_m
            )));
        }
        if params.num_cells.x == 0 || params.num_cells.y == 0 {
            return Err(CostMapError::InvalidParams("map has no cells".into()));
        }
        if params.num_cells.x > i32::MAX as usize || params.num_cells.y > i32::MAX as usize {
            return Err(CostMapError::InvalidParams("map is too large".into()));
        }
        if params.lethal_threshold == 0 {
            return Err(CostMapError::InvalidParams(
                "lethal threshold of 0 makes every cell lethal".into(),
            ));
        }

        Ok(())
    }

    /// Use a different lethal threshold, keeping the cell data.
    pub fn with_lethal_threshold(mut self, lethal_threshold: u8) -> Result<Self, CostMapError> {
        self.params.lethal_threshold = lethal_threshold;
        Self::validate(&self.params)?;
        Ok(self)
    }

    pub fn params(&self) -> &CostMapParams {
        &self.params
    }

    pub fn resolution(&self) -> f64 {
        self.params.resolution_m
    }

    pub fn num_cells(&self) -> Vector2<usize> {
        self.params.num_cells
    }

    /// True if both maps cover the same cells at the same resolution.
    pub fn same_geometry(&self, other: &CostMap) -> bool {
        self.params.num_cells == other.params.num_cells
            && self.params.resolution_m == other.params.resolution_m
            && self.params.origin_m == other.params.origin_m
            && self.params.lethal_threshold == other.params.lethal_threshold
    }

    pub fn in_bounds(&self, cell: Cell) -> bool {
        cell.x >= 0
            && cell.y >= 0
            && (cell.x as usize) < self.params.num_cells.x
            && (cell.y as usize) < self.params.num_cells.y
    }

    /// Get the cell containing the given position, even if it lies outside the map.
    pub fn position_to_cell(&self, position_m: Vector2<f64>) -> Cell {
        let rel = (position_m - self.params.origin_m) / self.params.resolution_m;
        Cell::new(rel.x.floor() as i32, rel.y.floor() as i32)
    }

    /// Get the cell containing the given position, or `None` if it's outside the map.
    pub fn index(&self, position_m: Vector2<f64>) -> Option<Cell> {
        let cell = self.position_to_cell(position_m);
        if self.in_bounds(cell) {
            Some(cell)
        } else {
            None
        }
    }

    /// Position of the centre of the given cell in the planning frame.
    pub fn cell_centre(&self, cell: Cell) -> Vector2<f64> {
        self.params.origin_m
            + Vector2::new(cell.x as f64 + 0.5, cell.y as f64 + 0.5) * self.params.resolution_m
    }

    /// Get the raw cost of a cell.
    pub fn get(&self, cell: Cell) -> Option<u8> {
        if self.in_bounds(cell) {
            Some(self.data[[cell.x as usize, cell.y as usize]])
        } else {
            None
        }
    }

    /// Set the raw cost of a cell, returning whether or not the stored value changed.
    pub fn set(&mut self, cell: Cell, cost: u8) -> Result<bool, CostMapError> {
        if !self.in_bounds(cell) {
            return Err(CostMapError::OutsideMap(cell));
        }

        let value = &mut self.data[[cell.x as usize, cell.y as usize]];
        let changed = *value != cost;
        *value = cost;

        Ok(changed)
    }

    /// Set every cell in the inclusive rectangle between `min` and `max` to the given cost.
    ///
    /// The rectangle is clipped to the map.
    pub fn fill_rect(&mut self, min: Cell, max: Cell, cost: u8) {
        let x_max = (max.x).min(self.params.num_cells.x as i32 - 1);
        let y_max = (max.y).min(self.params.num_cells.y as i32 - 1);

        for x in min.x.max(0)..=x_max {
            for y in min.y.max(0)..=y_max {
                self.data[[x as usize, y as usize]] = cost;
            }
        }
    }

    pub fn classify(&self, cell: Cell) -> CellClass {
        match self.get(cell) {
            None => CellClass::OutsideMap,
            Some(NO_INFORMATION) => CellClass::Unknown,
            Some(c) if c >= self.params.lethal_threshold => CellClass::Lethal,
            Some(FREE_SPACE) => CellClass::Free,
            Some(c) => CellClass::Cost(c),
        }
    }

    /// The cost of the cell if it can be traversed, otherwise `None`.
    pub fn traversable_cost(&self, cell: Cell) -> Option<u8> {
        match self.classify(cell) {
            CellClass::Free => Some(FREE_SPACE),
            CellClass::Cost(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_traversable(&self, cell: Cell) -> bool {
        self.traversable_cost(cell).is_some()
    }

    /// Iterate over every cell index in the map, X major.
    pub fn cells(&self) -> impl Iterator<Item = Cell> {
        let num_x = self.params.num_cells.x as i32;
        let num_y = self.params.num_cells.y as i32;
        (0..num_x).flat_map(move |x| (0..num_y).map(move |y| Cell::new(x, y)))
    }

    /// List the updates which would turn this map into `other`.
    pub fn diff(&self, other: &CostMap) -> Result<Vec<CellUpdate>, CostMapError> {
        if !self.same_geometry(other) {
            return Err(CostMapError::ShapeMismatch(
                "CostMap diff".into(),
                self.params.num_cells,
                other.params.num_cells,
            ));
        }

        let updates: Vec<CellUpdate> = self
            .data
            .indexed_iter()
            .zip(other.data.iter())
            .filter(|((_, old), new)| old != new)
            .map(|(((x, y), _), &new)| CellUpdate::new(Cell::new(x as i32, y as i32), new))
            .collect();

        debug!("CostMap diff found {} changed cells", updates.len());

        Ok(updates)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
