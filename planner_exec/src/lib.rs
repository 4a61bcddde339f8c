//! # Planner library
//!
//! Incremental, anytime trajectory planning over a state lattice. The library is split into:
//!
//! - [`map`]: the 2D cost map the lattice is built over
//! - [`lattice`]: motion primitives and the lattice environment generated from them
//! - [`change_query`]: finds the states affected by cost map changes
//! - [`search`]: the anytime repairing search which plans over the lattice
//! - [`trajectory`]: turns lattice paths into timed poses
//! - [`planner`]: the planner which ties them together

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod change_query;

/// State lattice environments and their motion primitives
pub mod lattice;

/// Cost maps
pub mod map;

pub mod planner;

/// 2D poses
pub mod pose;

pub mod search;

pub mod trajectory;

#[cfg(test)]
pub(crate) mod test_utils;
