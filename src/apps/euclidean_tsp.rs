//! Euclidean travelling-salesman search.
//!
//! Finds a minimum-cost tour over a set of points, branch-and-bound style:
//! the search tree branches on the next city to visit, and every copy of the
//! replicated [`MinCost`] bound prunes subtrees whose partial cost already
//! exceeds the best complete tour seen anywhere in the cluster.

use serde::{Deserialize, Serialize};

use crate::model::{Decomposition, TaskUnit};
use crate::shared::{SharedValue, TaskContext};

/// Remaining-city count below which a subtree is searched sequentially on one
/// worker instead of being decomposed further.
const ATOMIC_CUTOFF: usize = 10;

/// Replicated upper bound: the cost of the best complete tour seen so far.
/// Lower is newer; the bound only ever tightens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MinCost {
    pub cost: f64,
}

impl MinCost {
    pub fn unbounded() -> Self {
        Self { cost: f64::INFINITY }
    }
}

impl SharedValue for MinCost {
    fn is_older_than(&self, other: &Self) -> bool {
        self.cost > other.cost
    }
}

/// A complete tour and its cost, including the closing edge back to the start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tour {
    pub cities: Vec<usize>,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TspTask {
    /// Search all tours that extend a fixed prefix.
    Search {
        cities: Vec<(f64, f64)>,
        partial_tour: Vec<usize>,
        partial_cost: f64,
        unvisited: Vec<usize>,
    },
    /// Join node: the minimum-cost tour among the children's best.
    MinTour,
}

impl TspTask {
    /// Search starting at city 0 with everything else unvisited.
    pub fn root(cities: Vec<(f64, f64)>) -> Self {
        let unvisited = (1..cities.len()).collect();
        TspTask::Search {
            cities,
            partial_tour: vec![0],
            partial_cost: 0.0,
            unvisited,
        }
    }

    /// The child search obtained by visiting `city` next.
    fn extended(
        cities: &[(f64, f64)],
        partial_tour: &[usize],
        partial_cost: f64,
        unvisited: &[usize],
        city: usize,
    ) -> Self {
        let last = *partial_tour.last().unwrap_or(&0);
        let mut tour = partial_tour.to_vec();
        tour.push(city);
        TspTask::Search {
            cities: cities.to_vec(),
            partial_cost: partial_cost + distance(cities[last], cities[city]),
            partial_tour: tour,
            unvisited: unvisited.iter().copied().filter(|&c| c != city).collect(),
        }
    }
}

impl TaskUnit for TspTask {
    type Value = Option<Tour>;
    type Shared = MinCost;

    fn is_atomic(&self) -> bool {
        match self {
            TspTask::Search { unvisited, .. } => unvisited.len() <= ATOMIC_CUTOFF,
            TspTask::MinTour => true,
        }
    }

    fn solve(&self, ctx: &TaskContext<MinCost>) -> Option<Tour> {
        let TspTask::Search {
            cities,
            partial_tour,
            partial_cost,
            unvisited,
        } = self
        else {
            unreachable!("join nodes are composed, never solved");
        };

        let mut best: Option<Tour> = None;
        let mut stack = vec![(partial_tour.clone(), *partial_cost, unvisited.clone())];
        while let Some((tour, cost, remaining)) = stack.pop() {
            let bound = ctx.shared().map_or(f64::INFINITY, |b| b.cost);
            if cost >= bound {
                continue;
            }
            let last = cities[*tour.last().unwrap_or(&0)];
            if remaining.is_empty() {
                let total = cost + distance(last, cities[tour[0]]);
                let local_best = best.as_ref().map_or(f64::INFINITY, |b| b.cost);
                if total < bound && total < local_best {
                    ctx.push_shared(MinCost { cost: total });
                    best = Some(Tour {
                        cities: tour,
                        cost: total,
                    });
                }
                continue;
            }
            for &city in &remaining {
                let next_cost = cost + distance(last, cities[city]);
                if next_cost < bound {
                    let mut next_tour = tour.clone();
                    next_tour.push(city);
                    let next_remaining =
                        remaining.iter().copied().filter(|&c| c != city).collect();
                    stack.push((next_tour, next_cost, next_remaining));
                }
            }
        }
        best
    }

    fn decompose(&self) -> Decomposition<Self> {
        let TspTask::Search {
            cities,
            partial_tour,
            partial_cost,
            unvisited,
        } = self
        else {
            unreachable!("join nodes are composed, never decomposed");
        };

        let children = unvisited
            .iter()
            .map(|&city| Self::extended(cities, partial_tour, *partial_cost, unvisited, city))
            .collect();
        Decomposition::new(TspTask::MinTour, children)
    }

    fn compose(&self, args: Vec<Option<Tour>>) -> Option<Tour> {
        args.into_iter()
            .flatten()
            .min_by(|a, b| a.cost.total_cmp(&b.cost))
    }
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Cost of visiting `order` in sequence and returning to the start.
pub fn tour_cost(cities: &[(f64, f64)], order: &[usize]) -> f64 {
    if order.is_empty() {
        return 0.0;
    }
    let mut cost = 0.0;
    for pair in order.windows(2) {
        cost += distance(cities[pair[0]], cities[pair[1]]);
    }
    cost + distance(cities[order[order.len() - 1]], cities[order[0]])
}
