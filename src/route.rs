//! # Route Optimization
//!
//! Orders a portal subset into a low-cost open visiting path.
//!
//! Small inputs are solved exactly by a pruned permutation search. Larger ones
//! get a nearest-neighbour construction followed by 2-opt: each pass applies
//! the single best improving segment reversal, until a pass finds nothing or
//! the pass/time budget runs out.
//!
//! Costs always come from a [`DistanceProvider`]. Provider failures never
//! abort a route: the leg is priced with a straight-line estimate instead and
//! counted in [`Route::degraded_legs`].
//!
//! The time budget covers the whole optimization, construction included. Once
//! it is spent the provider is no longer consulted: legs not yet priced fall
//! back to the straight-line estimate, the improvement phase stops, and the
//! best complete path so far is returned.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::RouteConfig;
use crate::distance::{DistanceProvider, StraightLineProvider};
use crate::types::Portal;

/// Improvements smaller than this are treated as noise (meters).
const IMPROVEMENT_EPSILON: f64 = 1e-9;

/// An ordered visiting sequence. Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub portal_ids: Vec<String>,
    /// Sum of leg costs along the path
    pub total_cost: f64,
    /// Cost of the nearest-neighbour construction
    pub initial_cost: f64,
    /// 2-opt passes that applied an improvement
    pub passes: usize,
    /// Legs priced by fallback after a provider failure or once the time
    /// budget was spent
    pub degraded_legs: usize,
    /// Whether the result came from exhaustive search
    pub exhaustive: bool,
    /// Whether the time budget ran out before optimization finished
    pub timed_out: bool,
}

impl Route {
    fn trivial(portals: &[&Portal]) -> Self {
        Self {
            portal_ids: portals.iter().map(|p| p.id.clone()).collect(),
            total_cost: 0.0,
            initial_cost: 0.0,
            passes: 0,
            degraded_legs: 0,
            exhaustive: false,
            timed_out: false,
        }
    }
}

// ============================================================================
// Time budget
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(budget_ms: Option<u64>) -> Self {
        Self(budget_ms.map(|ms| Instant::now() + Duration::from_millis(ms)))
    }

    fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

// ============================================================================
// Lazy cost matrix
// ============================================================================

/// Symmetric pairwise costs, fetched from the provider on first use.
struct CostMatrix<'a, P> {
    portals: &'a [&'a Portal],
    provider: P,
    costs: Vec<Option<f64>>,
    degraded: usize,
    deadline: Deadline,
    timed_out: bool,
}

impl<'a, P: DistanceProvider> CostMatrix<'a, P> {
    fn new(portals: &'a [&'a Portal], provider: P, deadline: Deadline) -> Self {
        let n = portals.len();
        Self {
            portals,
            provider,
            costs: vec![None; n * n],
            degraded: 0,
            deadline,
            timed_out: false,
        }
    }

    /// Whether the budget is spent. Latches, so callers agree once it trips.
    fn out_of_time(&mut self) -> bool {
        if !self.timed_out && self.deadline.expired() {
            debug!("[Route] Time budget spent, remaining legs use the straight-line estimate");
            self.timed_out = true;
        }
        self.timed_out
    }

    fn cost(&mut self, i: usize, j: usize) -> f64 {
        if i == j {
            return 0.0;
        }
        let n = self.portals.len();
        if let Some(c) = self.costs[i * n + j] {
            return c;
        }

        let (a, b) = (self.portals[i], self.portals[j]);
        let cost = if self.out_of_time() {
            self.degraded += 1;
            StraightLineProvider.distance(a, b).unwrap_or(f64::MAX)
        } else {
            self.measure(a, b)
        };

        self.costs[i * n + j] = Some(cost);
        self.costs[j * n + i] = Some(cost);
        cost
    }

    fn measure(&mut self, a: &Portal, b: &Portal) -> f64 {
        match self.provider.distance(a, b) {
            Ok(c) if c.is_finite() && c >= 0.0 => c,
            result => {
                match result {
                    Err(e) if e.is_transient() => {
                        debug!("[Route] Leg {} -> {} using fallback: {}", a.id, b.id, e)
                    }
                    Err(e) => warn!("[Route] Leg {} -> {} using fallback: {}", a.id, b.id, e),
                    Ok(c) => warn!("[Route] Leg {} -> {} priced at {}, using fallback", a.id, b.id, c),
                }
                self.degraded += 1;
                StraightLineProvider.distance(a, b).unwrap_or(f64::MAX)
            }
        }
    }

    fn path_cost(&mut self, tour: &[usize]) -> f64 {
        tour.windows(2).map(|w| self.cost(w[0], w[1])).sum()
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Order `portals` into a near-optimal open path.
///
/// Duplicate ids are visited once, at their first position in the input.
/// Fewer than two portals yield the trivial route without consulting the
/// provider.
pub fn optimize_route<P: DistanceProvider>(
    portals: &[Portal],
    provider: P,
    config: &RouteConfig,
) -> Route {
    let mut seen = HashSet::new();
    let unique: Vec<&Portal> = portals.iter().filter(|p| seen.insert(p.id.as_str())).collect();

    if unique.len() < 2 {
        return Route::trivial(&unique);
    }

    let mut matrix = CostMatrix::new(&unique, provider, Deadline::after(config.time_budget_ms));
    let initial = nearest_neighbor_tour(&mut matrix);
    let initial_cost = matrix.path_cost(&initial);

    let (tour, passes, exhaustive) = if unique.len() <= config.exhaustive_limit {
        let best = exhaustive_tour(&mut matrix, &initial, initial_cost);
        (best, 0, true)
    } else {
        let mut tour = initial.clone();
        let passes = two_opt(&mut matrix, &mut tour, config);
        (tour, passes, false)
    };
    let total_cost = matrix.path_cost(&tour);

    info!(
        "[Route] {} portals: cost {:.0} (nearest-neighbour {:.0}), {} passes, {} degraded legs{}{}",
        unique.len(),
        total_cost,
        initial_cost,
        passes,
        matrix.degraded,
        if exhaustive { ", exhaustive" } else { "" },
        if matrix.timed_out { ", timed out" } else { "" }
    );

    Route {
        portal_ids: tour.iter().map(|&i| unique[i].id.clone()).collect(),
        total_cost,
        initial_cost,
        passes,
        degraded_legs: matrix.degraded,
        exhaustive,
        timed_out: matrix.timed_out,
    }
}

// ============================================================================
// Construction and improvement
// ============================================================================

/// Start at the first input portal and keep appending the nearest unvisited
/// one, ties broken by id.
fn nearest_neighbor_tour<P: DistanceProvider>(matrix: &mut CostMatrix<'_, P>) -> Vec<usize> {
    let n = matrix.portals.len();
    let mut visited = vec![false; n];
    let mut tour = Vec::with_capacity(n);
    let mut current = 0;
    visited[0] = true;
    tour.push(0);

    while tour.len() < n {
        let mut best: Option<(usize, f64)> = None;
        for next in 0..n {
            if visited[next] {
                continue;
            }
            let c = matrix.cost(current, next);
            let better = match best {
                None => true,
                Some((b, bc)) => {
                    c < bc || (c == bc && matrix.portals[next].id < matrix.portals[b].id)
                }
            };
            if better {
                best = Some((next, c));
            }
        }
        let Some((next, _)) = best else { break };
        visited[next] = true;
        tour.push(next);
        current = next;
    }
    tour
}

/// Open-path 2-opt, best improvement per pass. Returns passes applied.
fn two_opt<P: DistanceProvider>(
    matrix: &mut CostMatrix<'_, P>,
    tour: &mut [usize],
    config: &RouteConfig,
) -> usize {
    let n = tour.len();
    let mut passes = 0;

    while passes < config.max_passes && !matrix.out_of_time() {
        // Reversing tour[i..=j]; the whole path (i = 0, j = n - 1) never helps
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n - 1 {
            // A partial scan may still apply the best reversal found so far
            if matrix.out_of_time() {
                debug!("[Route] 2-opt stopped mid-pass after {} passes", passes);
                break;
            }
            for j in i + 1..n {
                if i == 0 && j == n - 1 {
                    continue;
                }
                let mut delta = 0.0;
                if i > 0 {
                    delta += matrix.cost(tour[i - 1], tour[j]) - matrix.cost(tour[i - 1], tour[i]);
                }
                if j < n - 1 {
                    delta += matrix.cost(tour[i], tour[j + 1]) - matrix.cost(tour[j], tour[j + 1]);
                }
                if delta < -IMPROVEMENT_EPSILON && best.map_or(true, |(_, _, d)| delta < d) {
                    best = Some((i, j, delta));
                }
            }
        }

        match best {
            Some((i, j, _)) => {
                tour[i..=j].reverse();
                passes += 1;
            }
            None => break,
        }
    }
    passes
}

/// Exact minimum-cost open path by depth-first search with cost pruning.
///
/// `bound` is a known achievable cost (the nearest-neighbour tour), so the
/// search only keeps strictly better paths.
fn exhaustive_tour<P: DistanceProvider>(
    matrix: &mut CostMatrix<'_, P>,
    initial: &[usize],
    bound: f64,
) -> Vec<usize> {
    struct Search {
        best: Vec<usize>,
        best_cost: f64,
        path: Vec<usize>,
        used: Vec<bool>,
    }

    fn visit<P: DistanceProvider>(s: &mut Search, matrix: &mut CostMatrix<'_, P>, cost: f64) {
        let n = s.used.len();
        if s.path.len() == n {
            if cost < s.best_cost - IMPROVEMENT_EPSILON {
                s.best_cost = cost;
                s.best = s.path.clone();
            }
            return;
        }
        for next in 0..n {
            if s.used[next] {
                continue;
            }
            if matrix.out_of_time() {
                return;
            }
            let step = match s.path.last() {
                Some(&last) => matrix.cost(last, next),
                None => 0.0,
            };
            if cost + step >= s.best_cost - IMPROVEMENT_EPSILON {
                continue;
            }
            s.used[next] = true;
            s.path.push(next);
            visit(s, matrix, cost + step);
            s.path.pop();
            s.used[next] = false;
        }
    }

    let n = matrix.portals.len();
    let mut search = Search {
        best: initial.to_vec(),
        best_cost: bound,
        path: Vec::with_capacity(n),
        used: vec![false; n],
    };
    visit(&mut search, matrix, 0.0);
    search.best
}
