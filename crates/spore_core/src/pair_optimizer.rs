//! Per-pair step-size searches.
//!
//! For two grandchildren of different parents, find the signed steps that bring
//! their endpoints closest, each branch keeping its time direction. For a
//! grandchild and a foreign parent, the parent is a fixed target and the search is 1-D.
//!
//! Solver convergence flags are advisory. A candidate is kept only if it passes
//! the explicit checks: sign unchanged, inside the signed bounds, under the
//! distance ceiling, and strictly closer than the best candidate so far.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PairSearchSettings;
use crate::minimize::{bounded_scalar, nelder_mead, projected_bfgs, BoxBounds, MinimizeSettings};
use crate::spore::{Direction, Spore};
use crate::traits::{State, StateTransition};
use crate::tree::SporeTree;

const SCALAR_XATOL: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairMethod {
    /// Bounded quasi-Newton with finite-difference gradients.
    ProjectedBfgs,
    /// Unbounded simplex search; its result is checked against the bounds afterwards.
    NelderMead,
}

pub const DEFAULT_METHODS: [PairMethod; 2] = [PairMethod::ProjectedBfgs, PairMethod::NelderMead];

/// Why a candidate or a whole search was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    /// A step changed sign.
    DirectionViolation,
    /// A step left its signed magnitude bounds.
    BoundsViolation,
    /// Endpoint distance above the ceiling.
    ConstraintExceeded,
    /// Feasible but not strictly closer than an earlier candidate.
    NotImproved,
    /// The 1-D search hit its evaluation cap.
    NotConverged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodAttempt {
    pub method: PairMethod,
    pub dt: [f64; 2],
    pub distance: f64,
    pub converged: bool,
    pub message: String,
    pub rejection: Option<Rejection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairOptimization {
    pub gc_i: usize,
    pub gc_j: usize,
    pub success: bool,
    /// `f64::INFINITY` when nothing was accepted.
    pub min_distance: f64,
    pub optimal_dt_i: f64,
    pub optimal_dt_j: f64,
    pub final_position_i: Option<State>,
    pub final_position_j: Option<State>,
    pub bounds_i: (f64, f64),
    pub bounds_j: (f64, f64),
    pub distance_ceiling: Option<f64>,
    pub method: Option<PairMethod>,
    /// Reason of the closest rejected attempt when `success` is false.
    pub failure: Option<Rejection>,
    pub attempts: Vec<MethodAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentOptimization {
    pub gc: usize,
    pub parent: usize,
    pub success: bool,
    pub min_distance: f64,
    pub optimal_dt: f64,
    pub final_position: Option<State>,
    pub bounds: (f64, f64),
    pub evaluations: usize,
    pub failure: Option<Rejection>,
}

/// Signed interval for a magnitude range under a fixed direction.
pub fn signed_bounds(direction: Direction, (lo, hi): (f64, f64)) -> (f64, f64) {
    match direction {
        Direction::Forward => (lo, hi),
        Direction::Backward => (-hi, -lo),
    }
}

/// Checks one signed step against its branch policy.
pub fn check_step(direction: Direction, dt: f64, bounds: (f64, f64)) -> Option<Rejection> {
    let keeps_sign = match direction {
        Direction::Forward => dt > 0.0,
        Direction::Backward => dt < 0.0,
    };
    if !keeps_sign {
        return Some(Rejection::DirectionViolation);
    }
    if dt < bounds.0 || dt > bounds.1 {
        return Some(Rejection::BoundsViolation);
    }
    None
}

pub struct PairOptimizer<'a, S: StateTransition> {
    tree: &'a SporeTree<S>,
    magnitude_bounds: (f64, f64),
    distance_ceiling: Option<f64>,
    minimize: MinimizeSettings,
    methods: Vec<PairMethod>,
}

impl<'a, S: StateTransition> PairOptimizer<'a, S> {
    /// Derives magnitude bounds and the distance ceiling from the tree's current children.
    pub fn new(tree: &'a SporeTree<S>, settings: &PairSearchSettings) -> Result<Self> {
        settings.validate()?;
        if tree.children().is_empty() {
            bail!("Tree has no children to derive step bounds from.");
        }

        let magnitude_bounds = match settings.dt_bounds {
            Some(bounds) => bounds,
            None => {
                let max_child = tree
                    .children()
                    .iter()
                    .map(Spore::magnitude)
                    .fold(0.0, f64::max);
                (settings.min_dt, 2.0 * max_child)
            }
        };
        if magnitude_bounds.0 >= magnitude_bounds.1 {
            bail!(
                "Adaptive step bounds are empty: ({}, {}).",
                magnitude_bounds.0,
                magnitude_bounds.1
            );
        }

        let distance_ceiling = settings.use_distance_ceiling.then(|| {
            tree.children()
                .iter()
                .map(|c| (c.position - tree.root()).norm())
                .fold(f64::INFINITY, f64::min)
                / settings.ceiling_divisor
        });

        Ok(Self {
            tree,
            magnitude_bounds,
            distance_ceiling,
            minimize: MinimizeSettings {
                max_iterations: settings.max_iterations,
                ftol: settings.tolerance,
                xatol: settings.tolerance,
                fatol: settings.tolerance,
                ..MinimizeSettings::default()
            },
            methods: DEFAULT_METHODS.to_vec(),
        })
    }

    /// Restricts or reorders the methods tried per pair.
    pub fn with_methods(mut self, methods: &[PairMethod]) -> Self {
        self.methods = methods.to_vec();
        self
    }

    pub fn magnitude_bounds(&self) -> (f64, f64) {
        self.magnitude_bounds
    }

    pub fn distance_ceiling(&self) -> Option<f64> {
        self.distance_ceiling
    }

    fn endpoint(&self, gc: &Spore, dt: f64) -> State {
        let parent = &self.tree.children()[gc.parent_idx.unwrap_or_default()];
        self.tree.transition().step(&parent.position, gc.control, dt)
    }

    /// Minimizes the endpoint distance of grandchildren `i` and `j` over both signed steps.
    pub fn optimize(&self, i: usize, j: usize) -> Result<PairOptimization> {
        let grandchildren = self.tree.grandchildren();
        let (Some(gc_i), Some(gc_j)) = (grandchildren.get(i), grandchildren.get(j)) else {
            bail!("Grandchild index out of range: ({}, {}).", i, j);
        };

        let (dir_i, dir_j) = (gc_i.direction(), gc_j.direction());
        let bounds_i = signed_bounds(dir_i, self.magnitude_bounds);
        let bounds_j = signed_bounds(dir_j, self.magnitude_bounds);
        let box_bounds = BoxBounds::new(vec![bounds_i.0, bounds_j.0], vec![bounds_i.1, bounds_j.1])?;
        let x0 = [
            0.5 * (bounds_i.0 + bounds_i.1),
            0.5 * (bounds_j.0 + bounds_j.1),
        ];
        let distance = |x: &[f64]| (self.endpoint(gc_i, x[0]) - self.endpoint(gc_j, x[1])).norm();

        let mut attempts = Vec::with_capacity(self.methods.len());
        let mut best: Option<(usize, f64)> = None;

        for &method in &self.methods {
            let report = match method {
                PairMethod::ProjectedBfgs => projected_bfgs(distance, &x0, &box_bounds, &self.minimize)?,
                PairMethod::NelderMead => nelder_mead(distance, &x0, None, &self.minimize)?,
            };
            let dt = [report.x[0], report.x[1]];
            let achieved = distance(&dt[..]);

            let rejection = check_step(dir_i, dt[0], bounds_i)
                .or_else(|| check_step(dir_j, dt[1], bounds_j))
                .or_else(|| match self.distance_ceiling {
                    Some(ceiling) if achieved > ceiling => Some(Rejection::ConstraintExceeded),
                    _ => None,
                })
                .or_else(|| match best {
                    Some((_, best_distance)) if achieved >= best_distance => Some(Rejection::NotImproved),
                    _ => None,
                });

            debug!(
                gc_i = i,
                gc_j = j,
                ?method,
                dt_i = dt[0],
                dt_j = dt[1],
                distance = achieved,
                converged = report.converged,
                ?rejection,
                "pair attempt"
            );

            if rejection.is_none() {
                best = Some((attempts.len(), achieved));
            }
            attempts.push(MethodAttempt {
                method,
                dt,
                distance: achieved,
                converged: report.converged,
                message: report.message,
                rejection,
            });
        }

        let mut result = PairOptimization {
            gc_i: i,
            gc_j: j,
            success: false,
            min_distance: f64::INFINITY,
            optimal_dt_i: gc_i.dt,
            optimal_dt_j: gc_j.dt,
            final_position_i: None,
            final_position_j: None,
            bounds_i,
            bounds_j,
            distance_ceiling: self.distance_ceiling,
            method: None,
            failure: None,
            attempts,
        };

        match best {
            Some((k, best_distance)) => {
                let chosen = &result.attempts[k];
                let [dt_i, dt_j] = chosen.dt;
                result.method = Some(chosen.method);
                result.success = true;
                result.min_distance = best_distance;
                result.optimal_dt_i = dt_i;
                result.optimal_dt_j = dt_j;
                result.final_position_i = Some(self.endpoint(gc_i, dt_i));
                result.final_position_j = Some(self.endpoint(gc_j, dt_j));
            }
            None => {
                result.failure = result
                    .attempts
                    .iter()
                    .min_by(|a, b| a.distance.total_cmp(&b.distance))
                    .and_then(|a| a.rejection);
                warn!(gc_i = i, gc_j = j, failure = ?result.failure, "pair rejected");
            }
        }
        Ok(result)
    }

    /// Minimizes the distance of grandchild `g` to the fixed position of child `p`.
    pub fn optimize_parent(&self, g: usize, p: usize) -> Result<ParentOptimization> {
        let Some(gc) = self.tree.grandchildren().get(g) else {
            bail!("Grandchild index out of range: {}.", g);
        };
        let Some(target) = self.tree.children().get(p) else {
            bail!("Parent index out of range: {}.", p);
        };
        if gc.parent_idx == Some(p) {
            bail!("{} cannot be matched with its own parent {}.", gc.name, target.name);
        }

        let direction = gc.direction();
        let bounds = signed_bounds(direction, self.magnitude_bounds);
        let report = bounded_scalar(
            |dt| (self.endpoint(gc, dt) - target.position).norm(),
            bounds,
            SCALAR_XATOL,
            self.minimize.max_iterations,
        )?;

        let failure = if report.converged {
            check_step(direction, report.x, bounds)
        } else {
            Some(Rejection::NotConverged)
        };
        let success = failure.is_none();
        debug!(gc = g, parent = p, dt = report.x, distance = report.value, success, "parent attempt");

        Ok(ParentOptimization {
            gc: g,
            parent: p,
            success,
            min_distance: if success { report.value } else { f64::INFINITY },
            optimal_dt: report.x,
            final_position: success.then(|| self.endpoint(gc, report.x)),
            bounds,
            evaluations: report.evaluations,
            failure,
        })
    }
}
