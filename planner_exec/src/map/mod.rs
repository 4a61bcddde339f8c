//! # Map
//!
//! This module implements the [`CostMap`] type, the grid of traversal costs that the lattice
//! environment plans over.

// ------------------------------------------------------------------------------------------------
// MODS
// ------------------------------------------------------------------------------------------------

/// Implements the [`CostMap`] type
mod cost_map;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

use std::{fs::File, io::BufWriter, path::Path};

pub use cost_map::{
    Cell, CellClass, CellUpdate, CostMap, CostMapError, CostMapParams, FREE_SPACE,
    INSCRIBED_INFLATED_OBSTACLE, LETHAL_OBSTACLE, NO_INFORMATION,
};
use serde::Serialize;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

pub trait CellMapExt: Serialize {
    /// Saves self as pretty printed JSON.
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CostMapError> {
        let file = File::create(path).map_err(CostMapError::Io)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self).map_err(CostMapError::Serde)
    }
}

impl CellMapExt for CostMap {}
