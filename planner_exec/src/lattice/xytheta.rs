//! # XY-Theta lattice
//!
//! Lattice of `(x, y, heading)` states over a cost map. Edges are generated on demand from the
//! motion primitive table; an edge is valid only if every cell swept by its primitive is
//! traversable, and its cost is the primitive's base cost scaled by the worst cell it crosses.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, trace};

use super::{
    discretise_heading, heading_of_bucket, ChangedCellSet, Cost, DiscreteState, Edge,
    EnvironmentKind, InvalidPoseError, LatticeEnvironment, LatticeParams, MotionPrimitive,
    MotionPrimitiveTable, PrimitiveId, SetupError, StateId,
};
use crate::{
    map::{Cell, CellUpdate, CostMap, CostMapError},
    pose::Pose2,
};

// ------------------------------------------------------------------------------------------------
// STATICS
// ------------------------------------------------------------------------------------------------

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct XyThetaLattice {
    cost_map: CostMap,

    primitives: Arc<MotionPrimitiveTable>,

    nominal_vel_ms: f64,

    generation: u64,

    /// Instantiated states. Grows during queries, hence the interior mutability.
    states: RefCell<StateTable>,

    start: Option<StateId>,

    goal: Option<StateId>,

    changed_cells: ChangedCellSet,
}

#[derive(Default)]
struct StateTable {
    states: Vec<DiscreteState>,

    index: HashMap<(Cell, u16), StateId>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl StateTable {
    fn get_or_insert(&mut self, cell: Cell, heading: u16) -> StateId {
        let states = &mut self.states;
        *self.index.entry((cell, heading)).or_insert_with(|| {
            let id = states.len();
            states.push(DiscreteState {
                id,
                x: cell.x,
                y: cell.y,
                heading,
            });
            id
        })
    }
}

impl XyThetaLattice {
    pub fn new(
        cost_map: CostMap,
        primitives: Arc<MotionPrimitiveTable>,
        params: &LatticeParams,
    ) -> Result<Self, SetupError> {
        if (primitives.resolution() - cost_map.resolution()).abs() > 1e-6 {
            return Err(SetupError::ResolutionMismatch {
                file: primitives.resolution(),
                expected: cost_map.resolution(),
            });
        }
        if primitives.num_headings() != params.num_heading_buckets {
            return Err(SetupError::HeadingCountMismatch {
                file: primitives.num_headings(),
                expected: params.num_heading_buckets,
            });
        }
        if !(params.timing.nominal_vel_ms > 0.0) {
            return Err(SetupError::InvalidTiming(format!(
                "nominal velocity must be positive, got {}",
                params.timing.nominal_vel_ms
            )));
        }

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Created XyTheta lattice generation {} over {}x{} cells, {} headings",
            generation,
            cost_map.num_cells().x,
            cost_map.num_cells().y,
            primitives.num_headings()
        );

        Ok(Self {
            cost_map,
            primitives,
            nominal_vel_ms: params.timing.nominal_vel_ms,
            generation,
            states: RefCell::new(StateTable::default()),
            start: None,
            goal: None,
            changed_cells: ChangedCellSet::new(),
        })
    }

    fn cell_of(state: &DiscreteState) -> Cell {
        Cell::new(state.x, state.y)
    }

    fn get_or_create(&self, cell: Cell, heading: u16) -> StateId {
        self.states.borrow_mut().get_or_insert(cell, heading)
    }

    /// Cost of applying a primitive at the given cell, or `None` if it crosses a cell which
    /// cannot be traversed.
    fn primitive_cost(&self, source: Cell, primitive: &MotionPrimitive) -> Option<Cost> {
        let mut worst: u8 = 0;
        for offset in primitive.footprint.iter() {
            let cost = self
                .cost_map
                .traversable_cost(source.offset(offset.x, offset.y))?;
            worst = worst.max(cost);
        }

        Some(primitive.base_cost.saturating_mul(worst as Cost + 1))
    }

    /// Check a pose can be used as an endpoint and return its state.
    fn endpoint_state(&self, pose: &Pose2) -> Result<StateId, InvalidPoseError> {
        let (cell, heading) = self.discretise(pose);

        if !self.cost_map.in_bounds(cell) {
            return Err(InvalidPoseError::OutsideMap(*pose));
        }
        if !self.cost_map.is_traversable(cell) {
            return Err(InvalidPoseError::LethalCell(*pose, cell));
        }

        Ok(self.get_or_create(cell, heading))
    }
}

impl LatticeEnvironment for XyThetaLattice {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::XyTheta
    }

    fn set_start(&mut self, pose: &Pose2) -> Result<StateId, InvalidPoseError> {
        let id = self.endpoint_state(pose)?;
        self.start = Some(id);
        Ok(id)
    }

    fn set_goal(&mut self, pose: &Pose2) -> Result<StateId, InvalidPoseError> {
        let id = self.endpoint_state(pose)?;
        self.goal = Some(id);
        Ok(id)
    }

    fn start(&self) -> Option<StateId> {
        self.start
    }

    fn goal(&self) -> Option<StateId> {
        self.goal
    }

    fn update_cost_map(&mut self, updates: &[CellUpdate]) -> Result<usize, CostMapError> {
        if let Some(u) = updates.iter().find(|u| !self.cost_map.in_bounds(u.cell)) {
            return Err(CostMapError::OutsideMap(u.cell));
        }

        let mut num_changed = 0;
        for u in updates {
            if self.cost_map.set(u.cell, u.cost)? {
                self.changed_cells.insert(u.cell);
                num_changed += 1;
            }
        }

        trace!(
            "Applied {} cell updates, {} changed",
            updates.len(),
            num_changed
        );

        Ok(num_changed)
    }

    fn take_changed_cells(&mut self) -> ChangedCellSet {
        std::mem::take(&mut self.changed_cells)
    }

    fn changed_cells(&self) -> &ChangedCellSet {
        &self.changed_cells
    }

    fn successors(&self, state: StateId) -> Vec<Edge> {
        let s = match self.state(state) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let cell = Self::cell_of(&s);

        self.primitives
            .for_heading(s.heading)
            .filter_map(|p| {
                let cost = self.primitive_cost(cell, p)?;
                let target = self.get_or_create(
                    cell.offset(p.end_offset.x, p.end_offset.y),
                    p.end_heading,
                );
                Some(Edge {
                    source: state,
                    target,
                    primitive: p.id,
                    cost,
                })
            })
            .collect()
    }

    fn predecessors(&self, state: StateId) -> Vec<Edge> {
        let s = match self.state(state) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let cell = Self::cell_of(&s);

        self.primitives
            .ending_at(s.heading)
            .filter_map(|p| {
                let source_cell = cell.offset(-p.end_offset.x, -p.end_offset.y);
                let cost = self.primitive_cost(source_cell, p)?;
                let source = self.get_or_create(source_cell, p.start_heading);
                Some(Edge {
                    source,
                    target: state,
                    primitive: p.id,
                    cost,
                })
            })
            .collect()
    }

    fn edge(&self, source: StateId, primitive: PrimitiveId) -> Option<Edge> {
        let s = self.state(source)?;
        let p = self.primitives.get(primitive)?;
        if p.start_heading != s.heading {
            return None;
        }

        let cell = Self::cell_of(&s);
        let cost = self.primitive_cost(cell, p)?;
        let target = self.get_or_create(
            cell.offset(p.end_offset.x, p.end_offset.y),
            p.end_heading,
        );

        Some(Edge {
            source,
            target,
            primitive,
            cost,
        })
    }

    fn heuristic(&self, from: StateId, to: StateId) -> Cost {
        let (a, b) = match (self.state(from), self.state(to)) {
            (Some(a), Some(b)) => (a, b),
            _ => return 0,
        };

        let dist_m = (self.cost_map.cell_centre(Self::cell_of(&b))
            - self.cost_map.cell_centre(Self::cell_of(&a)))
        .norm();

        (1000.0 * dist_m / self.nominal_vel_ms).floor() as Cost
    }

    fn state(&self, id: StateId) -> Option<DiscreteState> {
        self.states.borrow().states.get(id).copied()
    }

    fn find_state(&self, cell: Cell, heading: u16) -> Option<StateId> {
        self.states.borrow().index.get(&(cell, heading)).copied()
    }

    fn num_states(&self) -> usize {
        self.states.borrow().states.len()
    }

    fn primitives(&self) -> &MotionPrimitiveTable {
        &self.primitives
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn cost_map(&self) -> &CostMap {
        &self.cost_map
    }

    fn discretise(&self, pose: &Pose2) -> (Cell, u16) {
        (
            self.cost_map.position_to_cell(pose.position_m),
            discretise_heading(pose.heading_rad, self.primitives.num_headings()),
        )
    }

    fn state_pose(&self, id: StateId) -> Option<Pose2> {
        let s = self.state(id)?;
        let centre = self.cost_map.cell_centre(Self::cell_of(&s));

        Some(Pose2 {
            position_m: centre,
            heading_rad: heading_of_bucket(s.heading, self.primitives.num_headings()),
        })
    }

    fn for_each_edge_through(
        &self,
        cell: Cell,
        visitor: &mut dyn FnMut(Option<StateId>, &MotionPrimitive, Option<StateId>),
    ) {
        for p in self.primitives.iter() {
            for offset in p.footprint.iter() {
                let source_cell = cell.offset(-offset.x, -offset.y);
                let source = self.find_state(source_cell, p.start_heading);
                let target = self.find_state(
                    source_cell.offset(p.end_offset.x, p.end_offset.y),
                    p.end_heading,
                );

                if source.is_some() || target.is_some() {
                    visitor(source, p, target);
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
