//! Plain settings structs with validation.
//!
//! Every struct carries the defaults the tree and its optimizers were tuned with
//! and a `validate` method that rejects non-positive or misordered values before
//! any integration happens.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::dt_vector::DtVector;
use crate::traits::State;

/// Physical constants of the damped, torque-controlled pendulum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PendulumParams {
    pub g: f64,
    pub l: f64,
    pub m: f64,
    pub damping: f64,
    pub max_control: f64,
    /// RK4 substeps per `step` call, independent of the step length.
    pub substeps: usize,
}

impl Default for PendulumParams {
    fn default() -> Self {
        Self {
            g: 9.81,
            l: 2.0,
            m: 1.0,
            damping: 0.1,
            max_control: 2.0,
            substeps: 20,
        }
    }
}

impl PendulumParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.g.is_finite() && self.g >= 0.0) {
            bail!("g must be finite and non-negative.");
        }
        if !(self.l.is_finite() && self.l > 0.0) {
            bail!("l must be positive.");
        }
        if !(self.m.is_finite() && self.m > 0.0) {
            bail!("m must be positive.");
        }
        if !(self.damping.is_finite() && self.damping >= 0.0) {
            bail!("damping must be non-negative.");
        }
        if !(self.max_control.is_finite() && self.max_control > 0.0) {
            bail!("max_control must be positive.");
        }
        if self.substeps == 0 {
            bail!("substeps must be at least 1.");
        }
        Ok(())
    }
}

/// Shape of the initial spore tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Root state as `[theta, theta_dot]`.
    pub initial_position: [f64; 2],
    pub dt_base: f64,
    /// Grandchild magnitude = |parent dt| * factor.
    pub dt_grandchildren_factor: f64,
    /// Magnitude range for outer searches over this tree's dt-vector.
    pub dt_bounds: (f64, f64),
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            initial_position: [PI, 0.0],
            dt_base: 0.1,
            dt_grandchildren_factor: 0.1,
            dt_bounds: (0.001, 0.2),
        }
    }
}

impl TreeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_position.iter().any(|v| !v.is_finite()) {
            bail!("initial_position must be finite.");
        }
        if !(self.dt_base.is_finite() && self.dt_base > 0.0) {
            bail!("dt_base must be positive.");
        }
        if !(self.dt_grandchildren_factor.is_finite() && self.dt_grandchildren_factor > 0.0) {
            bail!("dt_grandchildren_factor must be positive.");
        }
        validate_bounds("dt_bounds", self.dt_bounds)?;
        Ok(())
    }

    pub fn root(&self) -> State {
        State::new(self.initial_position[0], self.initial_position[1])
    }

    /// 4 children at `dt_base`, 8 grandchildren at `dt_base * factor`.
    pub fn default_dt_vector(&self) -> DtVector {
        DtVector::uniform(self.dt_base, self.dt_base * self.dt_grandchildren_factor)
    }
}

/// Order in which a grandchild's candidate meetings are scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChronologyOrder {
    /// Ascending meeting time (the longer of the two travel times).
    ByTime,
    /// Descending quality `1 / (distance + 1e-8)`.
    ByQuality,
}

/// Thresholds for the convergence → optimize → chronology → match pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PairSearchSettings {
    /// Lower magnitude bound for every branch search.
    pub min_dt: f64,
    /// Explicit `(min, max)` magnitude bounds. `None` selects `[min_dt, 2 * max |child dt|]`.
    pub dt_bounds: Option<(f64, f64)>,
    /// Reject grandchild meetings farther apart than the distance ceiling.
    pub use_distance_ceiling: bool,
    /// Ceiling = min root-to-child distance / divisor.
    pub ceiling_divisor: f64,
    /// Closing rates below `-approach_threshold` count as approaching.
    pub approach_threshold: f64,
    /// Meetings closer than this are accepted (or stop the scan) immediately.
    pub ultra_close: f64,
    pub order: ChronologyOrder,
    /// Iteration cap of every per-pair minimizer.
    pub max_iterations: usize,
    /// Function and step tolerance of every per-pair minimizer.
    pub tolerance: f64,
}

impl Default for PairSearchSettings {
    fn default() -> Self {
        Self {
            min_dt: 0.001,
            dt_bounds: None,
            use_distance_ceiling: true,
            ceiling_divisor: 10.0,
            approach_threshold: 1e-6,
            ultra_close: 1e-6,
            order: ChronologyOrder::ByTime,
            max_iterations: 1000,
            tolerance: 1e-12,
        }
    }
}

impl PairSearchSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_dt.is_finite() && self.min_dt > 0.0) {
            bail!("min_dt must be positive.");
        }
        if let Some(bounds) = self.dt_bounds {
            validate_bounds("dt_bounds", bounds)?;
        }
        if !(self.ceiling_divisor.is_finite() && self.ceiling_divisor > 0.0) {
            bail!("ceiling_divisor must be positive.");
        }
        if !(self.approach_threshold.is_finite() && self.approach_threshold >= 0.0) {
            bail!("approach_threshold must be non-negative.");
        }
        if !(self.ultra_close.is_finite() && self.ultra_close >= 0.0) {
            bail!("ultra_close must be non-negative.");
        }
        if self.max_iterations == 0 {
            bail!("max_iterations must be greater than zero.");
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            bail!("tolerance must be positive.");
        }
        Ok(())
    }
}

/// Which geometric quantity the hard-constrained optimizer maximizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AreaObjective {
    /// Shoelace area of the 4 sorted-pair mean points.
    Quadrilateral,
    /// Sum of root-child-grandchild triangle areas.
    BranchTriangles,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AreaSettings {
    /// Upper bound on every constrained pair distance.
    pub constraint_distance: f64,
    pub dt_bounds: (f64, f64),
    pub objective: AreaObjective,
    /// Multiplier updates of the augmented Lagrangian.
    pub max_outer_iterations: usize,
    /// Quasi-Newton iterations per subproblem.
    pub max_inner_iterations: usize,
    pub tolerance: f64,
    pub initial_penalty: f64,
    pub penalty_growth: f64,
    pub max_penalty: f64,
}

impl Default for AreaSettings {
    fn default() -> Self {
        Self {
            constraint_distance: 1e-4,
            dt_bounds: (0.001, 0.2),
            objective: AreaObjective::Quadrilateral,
            max_outer_iterations: 30,
            max_inner_iterations: 200,
            tolerance: 1e-9,
            initial_penalty: 10.0,
            penalty_growth: 10.0,
            max_penalty: 1e12,
        }
    }
}

impl AreaSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.constraint_distance.is_finite() && self.constraint_distance > 0.0) {
            bail!("constraint_distance must be positive.");
        }
        validate_bounds("dt_bounds", self.dt_bounds)?;
        if self.max_outer_iterations == 0 || self.max_inner_iterations == 0 {
            bail!("iteration caps must be greater than zero.");
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            bail!("tolerance must be positive.");
        }
        if !(self.initial_penalty > 0.0 && self.penalty_growth > 1.0) {
            bail!("penalty must be positive and grow by a factor above 1.");
        }
        if self.max_penalty < self.initial_penalty {
            bail!("max_penalty must not be below initial_penalty.");
        }
        Ok(())
    }
}

pub(crate) fn validate_bounds(name: &str, (lo, hi): (f64, f64)) -> Result<()> {
    if !(lo.is_finite() && hi.is_finite()) {
        bail!("{} must be finite.", name);
    }
    if lo <= 0.0 {
        bail!("{} lower bound must be positive, got {}.", name, lo);
    }
    if lo >= hi {
        bail!("{} must be ordered (min < max), got ({}, {}).", name, lo, hi);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn defaults_validate() {
        PendulumParams::default().validate().expect("pendulum defaults");
        TreeConfig::default().validate().expect("tree defaults");
        PairSearchSettings::default().validate().expect("pair defaults");
        AreaSettings::default().validate().expect("area defaults");
    }

    #[test]
    fn tree_config_rejects_bad_values() {
        let mut config = TreeConfig::default();
        config.dt_base = 0.0;
        assert_err_contains(config.validate(), "dt_base must be positive");

        let mut config = TreeConfig::default();
        config.dt_grandchildren_factor = -1.0;
        assert_err_contains(config.validate(), "dt_grandchildren_factor");

        let mut config = TreeConfig::default();
        config.dt_bounds = (0.2, 0.1);
        assert_err_contains(config.validate(), "ordered");
    }

    #[test]
    fn default_dt_vector_uses_factor() {
        let config = TreeConfig::default();
        let dt = config.default_dt_vector();
        assert!(dt.children().iter().all(|&v| (v - 0.1).abs() < 1e-15));
        assert!(dt.grandchildren().iter().all(|&v| (v - 0.01).abs() < 1e-15));
    }

    #[test]
    fn pair_settings_reject_explicit_bad_bounds() {
        let settings = PairSearchSettings {
            dt_bounds: Some((0.0, 0.1)),
            ..PairSearchSettings::default()
        };
        assert_err_contains(settings.validate(), "lower bound must be positive");
    }

    #[test]
    fn area_settings_reject_zero_constraint() {
        let settings = AreaSettings {
            constraint_distance: 0.0,
            ..AreaSettings::default()
        };
        assert_err_contains(settings.validate(), "constraint_distance");
    }
}
