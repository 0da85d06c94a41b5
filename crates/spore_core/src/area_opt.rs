//! Hard-constrained area maximization over the full dt-vector.
//!
//! Maximizes the evaluator's area subject to `distance_k <= constraint_distance`
//! for every constrained pair, solved as a sequence of bound-constrained
//! augmented-Lagrangian subproblems.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::area::TreeAreaEvaluator;
use crate::config::AreaSettings;
use crate::dt_vector::{DtVector, DT_LEN};
use crate::minimize::{projected_bfgs, BoxBounds, MinimizeSettings};
use crate::traits::StateTransition;

/// Areas below this are not used to rescale the objective.
const MIN_AREA_SCALE: f64 = 1e-12;
/// Constraints are enforced against `(1 - TIGHTENING) * constraint_distance`.
const TIGHTENING: f64 = 1e-3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaOptimizationResult {
    /// Converged with every constrained distance within `constraint_distance`.
    pub success: bool,
    /// The outer loop stopped on its feasibility and stationarity test, not a cap.
    pub converged: bool,
    pub original_area: f64,
    pub optimized_area: f64,
    pub improvement: f64,
    /// Relative to `original_area`; 0 when that is zero.
    pub improvement_pct: f64,
    pub optimal_dt: DtVector,
    pub constraint_pairs: Vec<(usize, usize)>,
    pub pair_distances: Vec<f64>,
    pub constraints_satisfied: Vec<bool>,
    pub outer_iterations: usize,
    pub evaluations: usize,
    pub message: String,
}

/// `phi(c) = ((c + l/r)_+^2 - (l/r)^2) * r/2`, summed over constraints.
fn penalty(values: &[f64], multipliers: &[f64], rho: f64) -> f64 {
    values
        .iter()
        .zip(multipliers)
        .map(|(&c, &lambda)| {
            let shifted = (c + lambda / rho).max(0.0);
            0.5 * rho * (shifted * shifted - (lambda / rho).powi(2))
        })
        .sum()
}

pub struct AreaOptimizer<'a, S: StateTransition> {
    evaluator: &'a mut TreeAreaEvaluator<S>,
    constraint_pairs: Vec<(usize, usize)>,
    settings: AreaSettings,
}

impl<'a, S: StateTransition> AreaOptimizer<'a, S> {
    /// `evaluator` must already be built; `constraint_pairs` are grandchild global indices.
    pub fn new(
        evaluator: &'a mut TreeAreaEvaluator<S>,
        constraint_pairs: Vec<(usize, usize)>,
        settings: AreaSettings,
    ) -> Result<Self> {
        settings.validate()?;
        if constraint_pairs.is_empty() {
            bail!("Area optimization needs at least one constrained pair.");
        }
        if evaluator.tree().is_none() {
            bail!("Area evaluator must be built before optimizing.");
        }
        Ok(Self {
            evaluator,
            constraint_pairs,
            settings,
        })
    }

    pub fn constraint_pairs(&self) -> &[(usize, usize)] {
        &self.constraint_pairs
    }

    /// Scaled constraint values `d_k / target - 1`.
    fn constraint_values(&mut self, dt: &DtVector, target: f64) -> Result<Vec<f64>> {
        Ok(self
            .evaluator
            .pair_distances(dt, &self.constraint_pairs)?
            .into_iter()
            .map(|d| d / target - 1.0)
            .collect())
    }

    pub fn optimize(&mut self, initial: &DtVector) -> Result<AreaOptimizationResult> {
        let settings = self.settings;
        let (lo, hi) = settings.dt_bounds;
        let bounds = BoxBounds::uniform(DT_LEN, lo, hi)?;
        let inner_settings = MinimizeSettings {
            max_iterations: settings.max_inner_iterations,
            ftol: settings.tolerance,
            ..MinimizeSettings::default()
        };
        let target = settings.constraint_distance * (1.0 - TIGHTENING);

        let start = initial.clamped(settings.dt_bounds);
        let original_area = self.evaluator.area(initial)?;
        let scale = if original_area > MIN_AREA_SCALE { original_area } else { 1.0 };

        let mut x = start.to_vec();
        let mut multipliers = vec![0.0; self.constraint_pairs.len()];
        let mut rho = settings.initial_penalty;
        let mut previous_violation = f64::INFINITY;
        let mut previous_area = f64::NAN;
        let mut evaluations = 0;
        let mut outer_iterations = 0;
        let mut converged = false;
        let mut last_message = String::new();

        for outer in 0..settings.max_outer_iterations {
            outer_iterations = outer + 1;
            let report = {
                let evaluator = &mut *self.evaluator;
                let pairs = &self.constraint_pairs;
                let lambdas = &multipliers;
                let lagrangian = |v: &[f64]| -> f64 {
                    let Ok(dt) = DtVector::from_slice(v) else {
                        return f64::NAN;
                    };
                    let Ok(area) = evaluator.area(&dt) else {
                        return f64::NAN;
                    };
                    let Ok(distances) = evaluator.pair_distances(&dt, pairs) else {
                        return f64::NAN;
                    };
                    let values: Vec<f64> = distances.iter().map(|d| d / target - 1.0).collect();
                    -area / scale + penalty(&values, lambdas, rho)
                };
                projected_bfgs(lagrangian, &x, &bounds, &inner_settings)?
            };
            evaluations += report.evaluations;
            let inner_converged = report.converged;
            last_message = report.message;
            x = report.x;

            let dt = DtVector::from_slice(&x)?;
            let values = self.constraint_values(&dt, target)?;
            let area = self.evaluator.area(&dt)?;
            let violation = values.iter().fold(0.0f64, |acc, &c| acc.max(c));
            debug!(outer, area, violation, rho, "augmented Lagrangian step");

            for (lambda, &c) in multipliers.iter_mut().zip(&values) {
                *lambda = (*lambda + rho * c).max(0.0);
            }

            let stalled = (area - previous_area).abs() <= settings.tolerance * area.abs().max(1.0);
            if violation <= settings.tolerance && (inner_converged || stalled) {
                converged = true;
                break;
            }
            if violation > 0.25 * previous_violation {
                if rho >= settings.max_penalty {
                    warn!(rho, violation, "penalty at its cap without progress");
                    break;
                }
                rho = (rho * settings.penalty_growth).min(settings.max_penalty);
            }
            previous_violation = violation;
            previous_area = area;
        }

        let optimal_dt = DtVector::from_slice(&x)?;
        let optimized_area = self.evaluator.area(&optimal_dt)?;
        let report = self.evaluator.constraint_report(
            &optimal_dt,
            &self.constraint_pairs,
            settings.constraint_distance,
        )?;
        let constraints_satisfied: Vec<bool> = report.iter().map(|s| s.satisfied).collect();
        let feasible = constraints_satisfied.iter().all(|&ok| ok);
        let success = converged && feasible;
        let improvement = optimized_area - original_area;
        let improvement_pct = if original_area > 0.0 {
            100.0 * improvement / original_area
        } else {
            0.0
        };
        let message = if success {
            format!("Optimization succeeded: {last_message}")
        } else if !feasible {
            let violated = constraints_satisfied.iter().filter(|ok| !**ok).count();
            format!(
                "{violated} of {} distance constraints violated: {last_message}",
                constraints_satisfied.len()
            )
        } else {
            format!("Optimization did not converge after {outer_iterations} outer iterations: {last_message}")
        };
        info!(
            success,
            converged,
            original_area,
            optimized_area,
            outer_iterations,
            evaluations,
            "area optimization finished"
        );

        Ok(AreaOptimizationResult {
            success,
            converged,
            original_area,
            optimized_area,
            improvement,
            improvement_pct,
            optimal_dt,
            constraint_pairs: self.constraint_pairs.clone(),
            pair_distances: report.iter().map(|s| s.distance).collect(),
            constraints_satisfied,
            outer_iterations,
            evaluations,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AreaObjective, TreeConfig};
    use crate::pendulum::Pendulum;

    #[test]
    fn penalty_vanishes_for_slack_constraints_without_multipliers() {
        assert_eq!(penalty(&[-0.5, -1.0], &[0.0, 0.0], 10.0), 0.0);
        assert!((penalty(&[0.2], &[0.0], 10.0) - 0.2).abs() < 1e-15);
        // an active multiplier on a slack constraint contributes -lambda^2 / (2 rho)
        assert!((penalty(&[-1.0], &[2.0], 10.0) + 0.2).abs() < 1e-15);
    }

    #[test]
    fn requires_a_built_evaluator_and_pairs() {
        let pendulum = Pendulum::default();
        let config = TreeConfig::default();
        let mut evaluator = TreeAreaEvaluator::new(&pendulum, config, AreaObjective::Quadrilateral);
        assert!(AreaOptimizer::new(&mut evaluator, vec![(1, 6)], AreaSettings::default()).is_err());

        evaluator.build(&config.default_dt_vector()).expect("build");
        let err = AreaOptimizer::new(&mut evaluator, vec![], AreaSettings::default())
            .err()
            .expect("empty pairs rejected");
        assert!(err.to_string().contains("at least one constrained pair"));
    }

    #[test]
    fn iteration_cap_is_not_success() {
        let pendulum = Pendulum::default();
        let config = TreeConfig::default();
        let dt = config.default_dt_vector();
        let mut evaluator = TreeAreaEvaluator::new(&pendulum, config, AreaObjective::Quadrilateral);
        evaluator.build(&dt).expect("build");
        let settings = AreaSettings {
            constraint_distance: 10.0,
            max_outer_iterations: 1,
            max_inner_iterations: 1,
            ..AreaSettings::default()
        };
        let mut optimizer = AreaOptimizer::new(&mut evaluator, vec![(1, 6)], settings).expect("optimizer");
        let result = optimizer.optimize(&dt).expect("optimize");
        assert_eq!(result.constraints_satisfied, vec![true]);
        assert!(!result.converged);
        assert!(!result.success);
        assert_eq!(result.outer_iterations, 1);
        assert!(!result.message.starts_with("Optimization succeeded"), "{}", result.message);
        assert!(result.message.contains("did not converge"));
    }

    #[test]
    fn loose_constraint_keeps_area_within_bounds() {
        let pendulum = Pendulum::default();
        let config = TreeConfig::default();
        let dt = config.default_dt_vector();
        let mut evaluator = TreeAreaEvaluator::new(&pendulum, config, AreaObjective::BranchTriangles);
        evaluator.build(&dt).expect("build");
        let settings = AreaSettings {
            constraint_distance: 10.0,
            objective: AreaObjective::BranchTriangles,
            max_outer_iterations: 3,
            max_inner_iterations: 30,
            ..AreaSettings::default()
        };
        let mut optimizer = AreaOptimizer::new(&mut evaluator, vec![(1, 6)], settings).expect("optimizer");
        let result = optimizer.optimize(&dt).expect("optimize");
        assert_eq!(result.constraints_satisfied, vec![true]);
        assert!(result.pair_distances[0] <= 10.0);
        assert!(result.optimized_area >= result.original_area - 1e-12);
        let (lo, hi) = settings.dt_bounds;
        assert!(result.optimal_dt.as_slice().iter().all(|&v| lo <= v && v <= hi));
        assert_eq!(result.success, result.converged);
        assert_eq!(result.success, result.message.starts_with("Optimization succeeded"));
    }
}
