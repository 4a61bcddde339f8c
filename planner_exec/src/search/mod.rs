//! # Anytime search
//!
//! Anytime Dynamic A* over a [`LatticeEnvironment`]. The search runs backwards from the goal, so
//! the `g` value of each state is its cost-to-goal and stays valid when the start moves. Each
//! call to [`AnytimeSearch::plan`] first finds a solution with an inflated heuristic, then keeps
//! deflating it towards 1 while time allows, reusing the work of every previous iteration.
//!
//! Between calls the search keeps its state. If the environment reports which states had their
//! outgoing edges changed (via a [`ChangeQuery`]) only those states are repaired, otherwise the
//! search starts again from scratch.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod node;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BinaryHeap,
    ops::Range,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    change_query::ChangeQuery,
    lattice::{Cost, Edge, LatticeEnvironment, StateId, INFINITE_COST},
};
use node::{Key, OpenEntry, SearchNode};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// The deadline is checked once every this many expansions.
const DEADLINE_CHECK_PERIOD: usize = 32;

/// Longest time budget a single call will honour, longer budgets are clamped to it.
pub const MAX_TIME_BUDGET_S: u64 = 3600;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters of a single call to [`AnytimeSearch::plan`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Wall clock time allowed for the call
    pub time_budget: Duration,

    /// Heuristic inflation of the first iteration, at least 1
    pub initial_epsilon: f64,

    /// Amount epsilon is reduced by after each solution
    pub epsilon_decrement: f64,

    /// Stop after the first solution instead of improving it
    pub first_solution_only: bool,
}

/// A sequence of states and the edges between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatticePath {
    pub states: Vec<StateId>,

    /// `hops[i]` connects `states[i]` to `states[i + 1]`
    pub hops: Vec<Edge>,
}

/// One solution found during a call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SolutionRecord {
    pub epsilon: f64,
    pub cost: Cost,
    pub num_hops: usize,

    /// Expansions made in the call when this solution was found
    pub expansions: usize,

    /// Time since the start of the call
    pub time_s: f64,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub status: SearchStatus,

    /// The best solution found, if any
    pub path: Option<LatticePath>,

    pub cost: Option<Cost>,

    /// Epsilon the returned path was found with
    pub solution_epsilon: Option<f64>,

    /// Smallest epsilon the search reached
    pub final_epsilon: f64,

    /// Every accepted solution, in order. Costs never increase.
    pub solutions: Vec<SolutionRecord>,

    pub expansions: usize,

    pub first_iteration_expansions: usize,

    /// True if the previous search was repaired rather than restarted
    pub reused: bool,

    pub elapsed: Duration,
}

/// The anytime search driver.
///
/// Search data lives in an arena indexed by state id, so the driver can only be reused with the
/// environment instance it last searched.
pub struct AnytimeSearch {
    nodes: Vec<SearchNode>,

    open: BinaryHeap<OpenEntry>,

    incons: Vec<StateId>,

    next_stamp: u64,

    /// Current iteration, states closed in earlier iterations count as open-able
    iteration: u64,

    epsilon: f64,

    status: SearchStatus,

    goal: Option<StateId>,

    generation: Option<u64>,

    expanded: Vec<StateId>,

    expanded_first: Vec<StateId>,

    /// States the environment instantiated during the last call
    generated: Range<StateId>,

    generated_first: Range<StateId>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchStatus {
    /// No search data is held
    Idle,

    Searching,

    /// A path was found, possibly with epsilon above 1
    Solved,

    /// The budget expired before any path was found
    TimedOut,

    /// The start cannot reach the goal
    Infeasible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImproveResult {
    Done,
    TimedOut,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(5),
            initial_epsilon: 3.0,
            epsilon_decrement: 0.2,
            first_solution_only: false,
        }
    }
}

impl LatticePath {
    /// Sum of the hop costs.
    pub fn cost(&self) -> Cost {
        self.hops
            .iter()
            .fold(0, |acc: Cost, h| acc.saturating_add(h.cost))
    }

    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }
}

impl Default for AnytimeSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl AnytimeSearch {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            open: BinaryHeap::new(),
            incons: Vec::new(),
            next_stamp: 0,
            iteration: 1,
            epsilon: 1.0,
            status: SearchStatus::Idle,
            goal: None,
            generation: None,
            expanded: Vec::new(),
            expanded_first: Vec::new(),
            generated: 0..0,
            generated_first: 0..0,
        }
    }

    pub fn status(&self) -> SearchStatus {
        self.status
    }

    /// The epsilon the last call finished with.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// States expanded during the last call.
    pub fn expanded_states(&self) -> &[StateId] {
        &self.expanded
    }

    /// States expanded during the first iteration of the last call.
    pub fn first_iteration_expanded_states(&self) -> &[StateId] {
        &self.expanded_first
    }

    /// States first instantiated by the environment during the last call.
    ///
    /// State ids are handed out in order, so these form a contiguous range. States which already
    /// existed from earlier calls are not included.
    pub fn generated_states(&self) -> Range<StateId> {
        self.generated.clone()
    }

    /// States first instantiated during the first iteration of the last call.
    pub fn first_iteration_generated_states(&self) -> Range<StateId> {
        self.generated_first.clone()
    }

    /// Drop all search data.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Plan from `start` to `goal`.
    ///
    /// `changes` describes the map changes since the last call against the same environment.
    /// Passing `None` forces a search from scratch.
    pub fn plan(
        &mut self,
        env: &dyn LatticeEnvironment,
        start: StateId,
        goal: StateId,
        params: &SearchParams,
        changes: Option<&ChangeQuery>,
    ) -> SearchOutcome {
        let t0 = Instant::now();
        let deadline = t0 + params.time_budget.min(Duration::from_secs(MAX_TIME_BUDGET_S));

        let reused = self.status != SearchStatus::Idle
            && changes.is_some()
            && self.goal == Some(goal)
            && self.generation == Some(env.generation());

        if !reused {
            if self.status != SearchStatus::Idle {
                debug!("Search state cannot be reused, searching from scratch");
            }
            self.start_fresh(env, goal);
        }

        self.status = SearchStatus::Searching;
        self.epsilon = params.initial_epsilon.max(1.0);
        self.iteration += 1;
        self.expanded.clear();
        self.expanded_first.clear();

        let first_new_state = env.num_states();
        self.generated = first_new_state..first_new_state;
        self.generated_first = first_new_state..first_new_state;

        if start >= env.num_states() || goal >= env.num_states() {
            warn!("Start or goal state is unknown to the environment");
            self.status = SearchStatus::Infeasible;
            return self.outcome(SearchStatus::Infeasible, None, Vec::new(), 0, 0, reused, t0);
        }

        // Repair the states whose outgoing edges changed. An edge which became valid may start
        // at a state never generated, so reached targets also announce their predecessors.
        if let Some(query) = changes.filter(|_| reused) {
            let mut affected = query.successors().to_vec();
            for &target in query.predecessors() {
                if self.get(target).g != INFINITE_COST {
                    affected.extend(env.predecessors(target).into_iter().map(|e| e.source));
                }
            }
            affected.sort_unstable();
            affected.dedup();

            for &id in affected.iter() {
                if Some(id) != self.goal {
                    self.recompute_rhs(env, id);
                    self.update_membership(env, start, id);
                }
            }
            debug!("Repaired {} states", affected.len());
        }

        self.rebuild_open(env, start);

        let mut expansions = 0;
        let mut first_iteration_expansions = None;
        let mut best: Option<(LatticePath, f64)> = None;
        let mut solutions: Vec<SolutionRecord> = Vec::new();

        let status = loop {
            let result = self.improve_path(env, start, deadline, &mut expansions);

            if first_iteration_expansions.is_none() {
                first_iteration_expansions = Some(expansions);
                self.expanded_first = self.expanded.clone();
                self.generated_first = first_new_state..env.num_states();
            }

            if result == ImproveResult::TimedOut {
                debug!("Search budget expired at epsilon {:.2}", self.epsilon);
                break match best {
                    Some(_) => SearchStatus::Solved,
                    None => SearchStatus::TimedOut,
                };
            }

            match self.extract_path(env, start, goal) {
                Some(path) => {
                    let cost = path.cost();
                    let best_cost = best.as_ref().map(|(p, _)| p.cost());

                    debug!(
                        "Solution at epsilon {:.2}: cost {}, {} hops, {} expansions",
                        self.epsilon,
                        cost,
                        path.num_hops(),
                        expansions
                    );

                    if best_cost.map_or(true, |b| cost <= b) {
                        solutions.push(SolutionRecord {
                            epsilon: self.epsilon,
                            cost,
                            num_hops: path.num_hops(),
                            expansions,
                            time_s: t0.elapsed().as_secs_f64(),
                        });
                        best = Some((path, self.epsilon));
                    }
                }
                None => {
                    break match best {
                        Some(_) => SearchStatus::Solved,
                        None => SearchStatus::Infeasible,
                    }
                }
            }

            if params.first_solution_only || self.epsilon <= 1.0 || Instant::now() >= deadline {
                break SearchStatus::Solved;
            }

            // Next iteration
            self.epsilon = if params.epsilon_decrement > 0.0 {
                (self.epsilon - params.epsilon_decrement).max(1.0)
            } else {
                1.0
            };
            self.iteration += 1;
            self.rebuild_open(env, start);
        };

        self.status = status;
        self.generated = first_new_state..env.num_states();

        let first = first_iteration_expansions.unwrap_or(expansions);
        let outcome = self.outcome(status, best, solutions, expansions, first, reused, t0);

        info!(
            "Search {:?} in {:.3} s: cost {:?}, epsilon {:.2}, {} expansions{}",
            outcome.status,
            outcome.elapsed.as_secs_f64(),
            outcome.cost,
            outcome.final_epsilon,
            outcome.expansions,
            if reused { " (repaired)" } else { "" }
        );

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn outcome(
        &self,
        status: SearchStatus,
        best: Option<(LatticePath, f64)>,
        solutions: Vec<SolutionRecord>,
        expansions: usize,
        first_iteration_expansions: usize,
        reused: bool,
        t0: Instant,
    ) -> SearchOutcome {
        let (path, solution_epsilon) = match best {
            Some((p, e)) => (Some(p), Some(e)),
            None => (None, None),
        };

        SearchOutcome {
            status,
            cost: path.as_ref().map(|p| p.cost()),
            path,
            solution_epsilon,
            final_epsilon: self.epsilon,
            solutions,
            expansions,
            first_iteration_expansions,
            reused,
            elapsed: t0.elapsed(),
        }
    }

    /// Clear all data and seed the search with the goal.
    fn start_fresh(&mut self, env: &dyn LatticeEnvironment, goal: StateId) {
        self.reset();
        self.goal = Some(goal);
        self.generation = Some(env.generation());

        let n = self.node(goal);
        n.rhs = 0;
        self.incons.push(goal);
        self.node(goal).in_incons = true;
    }

    fn node(&mut self, id: StateId) -> &mut SearchNode {
        if id >= self.nodes.len() {
            self.nodes.resize(id + 1, SearchNode::default());
        }
        &mut self.nodes[id]
    }

    fn get(&self, id: StateId) -> SearchNode {
        self.nodes.get(id).copied().unwrap_or_default()
    }

    fn key(&self, env: &dyn LatticeEnvironment, start: StateId, id: StateId) -> Key {
        Key::of(&self.get(id), env.heuristic(start, id), self.epsilon)
    }

    fn push_open(&mut self, env: &dyn LatticeEnvironment, start: StateId, id: StateId) {
        let key = self.key(env, start, id);
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        self.node(id).open_stamp = Some(stamp);
        self.open.push(OpenEntry { key, id, stamp });
    }

    /// The lowest valid entry in the open list, discarding stale entries on the way.
    fn peek_open(&mut self) -> Option<OpenEntry> {
        while let Some(top) = self.open.peek().copied() {
            if self.get(top.id).open_stamp == Some(top.stamp) {
                return Some(top);
            }
            self.open.pop();
        }
        None
    }

    /// Place a state in OPEN or INCONS if it's inconsistent, or take it out of OPEN if not.
    fn update_membership(&mut self, env: &dyn LatticeEnvironment, start: StateId, id: StateId) {
        let n = self.get(id);

        if n.is_consistent() {
            self.node(id).open_stamp = None;
        } else if n.closed_iter != self.iteration {
            self.push_open(env, start, id);
        } else if !n.in_incons {
            self.node(id).in_incons = true;
            self.incons.push(id);
        }
    }

    fn recompute_rhs(&mut self, env: &dyn LatticeEnvironment, id: StateId) {
        let mut best_cost = INFINITE_COST;
        let mut best_edge = None;

        for e in env.successors(id) {
            let c = add_cost(e.cost, self.get(e.target).g);
            if c < best_cost {
                best_cost = c;
                best_edge = Some(e);
            }
        }

        let n = self.node(id);
        n.rhs = best_cost;
        n.next = best_edge;
    }

    /// Move INCONS into OPEN and recompute every key for the current epsilon.
    fn rebuild_open(&mut self, env: &dyn LatticeEnvironment, start: StateId) {
        let entries = std::mem::take(&mut self.open).into_vec();
        let incons = std::mem::take(&mut self.incons);

        let mut ids: Vec<StateId> = entries
            .into_iter()
            .filter(|e| self.get(e.id).open_stamp == Some(e.stamp))
            .map(|e| e.id)
            .collect();
        ids.extend(incons);

        for &id in ids.iter() {
            let n = self.node(id);
            n.open_stamp = None;
            n.in_incons = false;
        }

        for id in ids {
            let n = self.get(id);
            if !n.is_consistent() && !n.is_open() {
                self.push_open(env, start, id);
            }
        }

        debug!(
            "Open list rebuilt at epsilon {:.2} with {} states",
            self.epsilon,
            self.open.len()
        );
    }

    fn improve_path(
        &mut self,
        env: &dyn LatticeEnvironment,
        start: StateId,
        deadline: Instant,
        expansions: &mut usize,
    ) -> ImproveResult {
        while let Some(top) = self.peek_open() {
            let start_node = self.get(start);
            if top.key >= self.key(env, start, start) && start_node.is_consistent() {
                break;
            }

            self.open.pop();
            self.node(top.id).open_stamp = None;
            self.expand(env, start, top.id);

            *expansions += 1;
            self.expanded.push(top.id);

            if *expansions % DEADLINE_CHECK_PERIOD == 0 && Instant::now() >= deadline {
                return ImproveResult::TimedOut;
            }
        }

        ImproveResult::Done
    }

    fn expand(&mut self, env: &dyn LatticeEnvironment, start: StateId, id: StateId) {
        let n = self.get(id);

        if n.is_overconsistent() {
            let g = n.rhs;
            let iteration = self.iteration;
            let node = self.node(id);
            node.g = g;
            node.closed_iter = iteration;

            for e in env.predecessors(id) {
                if Some(e.source) == self.goal {
                    continue;
                }
                let c = add_cost(e.cost, g);
                if c < self.get(e.source).rhs {
                    let pred = self.node(e.source);
                    pred.rhs = c;
                    pred.next = Some(e);
                    self.update_membership(env, start, e.source);
                }
            }
        } else {
            self.node(id).g = INFINITE_COST;
            if Some(id) != self.goal {
                self.recompute_rhs(env, id);
            }
            self.update_membership(env, start, id);

            for e in env.predecessors(id) {
                if Some(e.source) == self.goal {
                    continue;
                }
                if self.get(e.source).next.map(|n| n.target) == Some(id) {
                    self.recompute_rhs(env, e.source);
                    self.update_membership(env, start, e.source);
                }
            }
        }
    }

    /// Follow the best next hops from the start to the goal.
    ///
    /// Hop costs are read back from the environment rather than trusted from the search.
    fn extract_path(
        &self,
        env: &dyn LatticeEnvironment,
        start: StateId,
        goal: StateId,
    ) -> Option<LatticePath> {
        let mut path = LatticePath {
            states: vec![start],
            hops: Vec::new(),
        };

        let mut current = start;
        while current != goal {
            if path.hops.len() > self.nodes.len() {
                warn!("Loop detected while extracting the path");
                return None;
            }

            let next = self.nodes.get(current)?.next?;
            let hop = env.edge(current, next.primitive)?;

            path.hops.push(hop);
            path.states.push(hop.target);
            current = hop.target;
        }

        Some(path)
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn add_cost(cost: Cost, g: Cost) -> Cost {
    if g == INFINITE_COST {
        INFINITE_COST
    } else {
        cost.saturating_add(g)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        map::{Cell, CellUpdate, FREE_SPACE, LETHAL_OBSTACLE},
        test_utils::{brute_force_cost, cell_pose, free_map, test_lattice},
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn params(initial_epsilon: f64) -> SearchParams {
        SearchParams {
            time_budget: Duration::from_secs(30),
            initial_epsilon,
            epsilon_decrement: 0.5,
            first_solution_only: false,
        }
    }

    #[test]
    fn test_free_grid_optimal() {
        let mut env = test_lattice(free_map(10, 10));
        let start = env.set_start(&cell_pose(0, 0, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(9, 9, 0)).unwrap();

        let mut search = AnytimeSearch::new();
        let outcome = search.plan(&*env, start, goal, &params(1.0), None);

        assert_eq!(outcome.status, SearchStatus::Solved);
        assert_eq!(outcome.cost, brute_force_cost(&*env, start, goal));

        // Nine cells each way plus two quarter turns
        assert_eq!(outcome.cost, Some(22000));

        let path = outcome.path.unwrap();
        assert_eq!(path.states.first(), Some(&start));
        assert_eq!(path.states.last(), Some(&goal));
        assert_eq!(path.states.len(), path.hops.len() + 1);
    }

    #[test]
    fn test_anytime_bound_and_monotonicity() {
        let mut map = free_map(12, 12);
        map.fill_rect(Cell::new(3, 0), Cell::new(3, 8), LETHAL_OBSTACLE);
        map.fill_rect(Cell::new(7, 3), Cell::new(7, 11), LETHAL_OBSTACLE);
        map.fill_rect(Cell::new(5, 5), Cell::new(6, 5), 120);
        let mut env = test_lattice(map);

        let start = env.set_start(&cell_pose(1, 1, 1)).unwrap();
        let goal = env.set_goal(&cell_pose(10, 1, 3)).unwrap();

        let mut search = AnytimeSearch::new();
        let outcome = search.plan(&*env, start, goal, &params(3.0), None);
        let optimal = brute_force_cost(&*env, start, goal).unwrap();

        assert_eq!(outcome.status, SearchStatus::Solved);
        assert!(!outcome.solutions.is_empty());
        for s in outcome.solutions.iter() {
            assert!(s.cost as f64 <= s.epsilon * optimal as f64);
        }
        assert!(outcome
            .solutions
            .windows(2)
            .all(|w| w[1].cost <= w[0].cost));

        // Epsilon reaches 1 within the budget, so the final answer is optimal
        assert_eq!(outcome.final_epsilon, 1.0);
        assert_eq!(outcome.cost, Some(optimal));
    }

    #[test]
    fn test_first_solution_only() {
        let mut env = test_lattice(free_map(10, 10));
        let start = env.set_start(&cell_pose(0, 0, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(9, 5, 2)).unwrap();

        let mut p = params(2.0);
        p.first_solution_only = true;

        let mut search = AnytimeSearch::new();
        let outcome = search.plan(&*env, start, goal, &p, None);

        assert_eq!(outcome.status, SearchStatus::Solved);
        assert_eq!(outcome.solutions.len(), 1);
        assert_eq!(outcome.solution_epsilon, Some(2.0));
        assert_eq!(outcome.expansions, outcome.first_iteration_expansions);
        assert_eq!(
            search.expanded_states().len(),
            search.first_iteration_expanded_states().len()
        );
        assert_eq!(
            search.generated_states(),
            search.first_iteration_generated_states()
        );
    }

    #[test]
    fn test_generated_states() {
        let mut env = test_lattice(free_map(10, 10));
        let start = env.set_start(&cell_pose(0, 0, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(9, 9, 0)).unwrap();
        let known = env.num_states();

        let mut search = AnytimeSearch::new();
        search.plan(&*env, start, goal, &params(3.0), None);

        let all = search.generated_states();
        let first = search.first_iteration_generated_states();
        assert_eq!(all.start, known);
        assert_eq!(all.end, env.num_states());
        assert!(!all.is_empty());
        assert_eq!(first.start, all.start);
        assert!(first.end <= all.end);

        // Replanning over the same states instantiates nothing new
        let cells = env.take_changed_cells();
        let query = ChangeQuery::new(&*env, cells);
        search.plan(&*env, start, goal, &params(1.0), Some(&query));
        assert!(search.generated_states().is_empty());
    }

    #[test]
    fn test_wall_is_infeasible() {
        let mut map = free_map(10, 10);
        map.fill_rect(Cell::new(5, 0), Cell::new(5, 9), LETHAL_OBSTACLE);
        let mut env = test_lattice(map);

        let start = env.set_start(&cell_pose(1, 5, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(8, 5, 0)).unwrap();

        let mut search = AnytimeSearch::new();
        let outcome = search.plan(&*env, start, goal, &params(2.0), None);

        assert_eq!(outcome.status, SearchStatus::Infeasible);
        assert!(outcome.path.is_none());
        assert_eq!(search.status(), SearchStatus::Infeasible);
    }

    #[test]
    fn test_start_is_goal() {
        let mut env = test_lattice(free_map(5, 5));
        let start = env.set_start(&cell_pose(2, 2, 1)).unwrap();
        let goal = env.set_goal(&cell_pose(2, 2, 1)).unwrap();
        assert_eq!(start, goal);

        let mut search = AnytimeSearch::new();
        let outcome = search.plan(&*env, start, goal, &params(2.0), None);

        assert_eq!(outcome.status, SearchStatus::Solved);
        assert_eq!(outcome.cost, Some(0));
        let path = outcome.path.unwrap();
        assert_eq!(path.states, vec![start]);
        assert!(path.hops.is_empty());
    }

    #[test]
    fn test_timeout() {
        let mut env = test_lattice(free_map(60, 60));
        let start = env.set_start(&cell_pose(0, 0, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(59, 59, 2)).unwrap();

        let mut p = params(1.0);
        p.time_budget = Duration::from_secs(0);

        let mut search = AnytimeSearch::new();
        let outcome = search.plan(&*env, start, goal, &p, None);

        assert_eq!(outcome.status, SearchStatus::TimedOut);
        assert!(outcome.path.is_none());
        assert_eq!(outcome.expansions, DEADLINE_CHECK_PERIOD);

        // The search can pick up where it left off
        let cells = env.take_changed_cells();
        let query = ChangeQuery::new(&*env, cells);
        let outcome = search.plan(&*env, start, goal, &params(1.0), Some(&query));
        assert!(outcome.reused);
        assert_eq!(outcome.status, SearchStatus::Solved);
        assert_eq!(outcome.cost, brute_force_cost(&*env, start, goal));
    }

    #[test]
    fn test_far_changes_need_fewer_expansions() {
        let mut env = test_lattice(free_map(20, 20));
        let start = env.set_start(&cell_pose(2, 2, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(8, 2, 0)).unwrap();

        let mut search = AnytimeSearch::new();
        let first = search.plan(&*env, start, goal, &params(1.0), None);
        assert_eq!(first.status, SearchStatus::Solved);

        env.update_cost_map(&[
            CellUpdate::new(Cell::new(18, 18), LETHAL_OBSTACLE),
            CellUpdate::new(Cell::new(18, 17), LETHAL_OBSTACLE),
        ])
        .unwrap();
        let cells = env.take_changed_cells();

        let incremental = {
            let query = ChangeQuery::new(&*env, cells);
            search.plan(&*env, start, goal, &params(1.0), Some(&query))
        };
        let scratch = AnytimeSearch::new().plan(&*env, start, goal, &params(1.0), None);

        assert!(incremental.reused);
        assert!(!scratch.reused);
        assert_eq!(incremental.cost, scratch.cost);
        assert!(incremental.expansions < scratch.expansions);
    }

    #[test]
    fn test_repair_blocked_path() {
        let mut env = test_lattice(free_map(12, 8));
        let start = env.set_start(&cell_pose(1, 3, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(10, 3, 0)).unwrap();

        let mut search = AnytimeSearch::new();
        let first = search.plan(&*env, start, goal, &params(1.0), None);
        assert_eq!(first.cost, Some(9000));

        // Block the straight line, and make a detour more expensive
        env.update_cost_map(&[
            CellUpdate::new(Cell::new(5, 3), LETHAL_OBSTACLE),
            CellUpdate::new(Cell::new(5, 4), 60),
        ])
        .unwrap();
        let cells = env.take_changed_cells();
        let query = ChangeQuery::new(&*env, cells);
        let second = search.plan(&*env, start, goal, &params(1.0), Some(&query));

        assert!(second.reused);
        assert_eq!(second.status, SearchStatus::Solved);
        assert_eq!(second.cost, brute_force_cost(&*env, start, goal));
        assert!(second.cost > first.cost);

        // Clearing the cells again restores the original cost
        drop(query);
        env.update_cost_map(&[
            CellUpdate::new(Cell::new(5, 3), 0),
            CellUpdate::new(Cell::new(5, 4), 0),
        ])
        .unwrap();
        let cells = env.take_changed_cells();
        let query = ChangeQuery::new(&*env, cells);
        let third = search.plan(&*env, start, goal, &params(1.0), Some(&query));

        assert!(third.reused);
        assert_eq!(third.cost, Some(9000));
    }

    #[test]
    fn test_new_goal_restarts() {
        let mut env = test_lattice(free_map(10, 10));
        let start = env.set_start(&cell_pose(0, 0, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(5, 0, 0)).unwrap();

        let mut search = AnytimeSearch::new();
        search.plan(&*env, start, goal, &params(1.0), None);

        let goal = env.set_goal(&cell_pose(7, 0, 0)).unwrap();
        let cells = env.take_changed_cells();
        let query = ChangeQuery::new(&*env, cells);
        let outcome = search.plan(&*env, start, goal, &params(1.0), Some(&query));

        assert!(!outcome.reused);
        assert_eq!(outcome.cost, Some(7000));
    }

    #[test]
    fn test_repair_blocked_path_ahead_of_start() {
        let mut env = test_lattice(free_map(10, 10));
        let start = env.set_start(&cell_pose(2, 8, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(8, 8, 0)).unwrap();

        let mut search = AnytimeSearch::new();
        let first = search.plan(&*env, start, goal, &params(1.0), None);
        assert_eq!(first.cost, Some(6000));

        env.update_cost_map(&[CellUpdate::new(Cell::new(5, 8), LETHAL_OBSTACLE)]).unwrap();
        let cells = env.take_changed_cells();
        let query = ChangeQuery::new(&*env, cells);
        let second = search.plan(&*env, start, goal, &params(1.0), Some(&query));

        // Around the block through a neighbouring row, four quarter turns and eight cells
        assert!(second.reused);
        assert_eq!(second.status, SearchStatus::Solved);
        assert_eq!(second.cost, Some(16000));
        assert_eq!(second.cost, brute_force_cost(&*env, start, goal));
    }

    #[test]
    fn test_repair_blocked_path_geometries() {
        // (start, goal, cell on the straight line between them)
        let cases = [
            ((1, 1, 0), (8, 1, 0), (4, 1)),
            ((1, 5, 0), (8, 5, 0), (2, 5)),
            ((1, 5, 0), (8, 5, 0), (7, 5)),
            ((5, 1, 1), (5, 8, 1), (5, 4)),
            ((8, 3, 2), (1, 3, 2), (3, 3)),
            ((2, 0, 0), (7, 0, 0), (5, 0)),
        ];

        for (s, g, block) in cases.iter() {
            let mut env = test_lattice(free_map(10, 10));
            let start = env.set_start(&cell_pose(s.0, s.1, s.2)).unwrap();
            let goal = env.set_goal(&cell_pose(g.0, g.1, g.2)).unwrap();

            let mut search = AnytimeSearch::new();
            let first = search.plan(&*env, start, goal, &params(1.0), None);
            assert_eq!(first.cost, brute_force_cost(&*env, start, goal));

            let blocked = CellUpdate::new(Cell::new(block.0, block.1), LETHAL_OBSTACLE);
            env.update_cost_map(&[blocked]).unwrap();
            let cells = env.take_changed_cells();
            let query = ChangeQuery::new(&*env, cells);
            let second = search.plan(&*env, start, goal, &params(1.0), Some(&query));

            assert!(second.reused);
            assert_eq!(second.status, SearchStatus::Solved, "blocking {:?}", block);
            assert_eq!(
                second.cost,
                brute_force_cost(&*env, start, goal),
                "blocking {:?}",
                block
            );
            assert!(second.cost > first.cost);
        }
    }

    #[test]
    fn test_random_replans_match_brute_force() {
        let start_cell = Cell::new(1, 1);
        let goal_cell = Cell::new(6, 6);

        for seed in 0..40 {
            let mut rng = StdRng::seed_from_u64(seed);

            let mut env = test_lattice(free_map(8, 8));
            let start = env.set_start(&cell_pose(1, 1, 0)).unwrap();
            let goal = env.set_goal(&cell_pose(6, 6, 1)).unwrap();

            let mut search = AnytimeSearch::new();
            let first = search.plan(&*env, start, goal, &params(1.0), None);
            assert_eq!(first.cost, brute_force_cost(&*env, start, goal));

            for round in 0..8 {
                let mut updates = Vec::new();
                while updates.len() < 3 {
                    let cell = Cell::new(rng.gen_range(0..8), rng.gen_range(0..8));
                    if cell == start_cell || cell == goal_cell {
                        continue;
                    }
                    let cost = match rng.gen_range(0..4) {
                        0 => FREE_SPACE,
                        1 => 100,
                        _ => LETHAL_OBSTACLE,
                    };
                    updates.push(CellUpdate::new(cell, cost));
                }

                env.update_cost_map(&updates).unwrap();
                let cells = env.take_changed_cells();
                let query = ChangeQuery::new(&*env, cells);
                let outcome = search.plan(&*env, start, goal, &params(1.0), Some(&query));

                let expected = brute_force_cost(&*env, start, goal);
                assert_eq!(outcome.cost, expected, "seed {} round {}", seed, round);
                assert_eq!(
                    outcome.status,
                    if expected.is_some() {
                        SearchStatus::Solved
                    } else {
                        SearchStatus::Infeasible
                    },
                    "seed {} round {}",
                    seed,
                    round
                );
            }
        }
    }

    #[test]
    fn test_huge_time_budget() {
        let mut env = test_lattice(free_map(5, 5));
        let start = env.set_start(&cell_pose(0, 0, 0)).unwrap();
        let goal = env.set_goal(&cell_pose(4, 0, 0)).unwrap();

        let mut p = params(1.0);
        p.time_budget = Duration::MAX;

        let outcome = AnytimeSearch::new().plan(&*env, start, goal, &p, None);
        assert_eq!(outcome.cost, Some(4000));
    }
}
