//! Soft pairing loss over grandchild endpoints.
//!
//! The discrete one-to-one matching is relaxed into a doubly-stochastic matrix
//! `P` from entropic optimal transport (Sinkhorn iterations, log domain). The
//! loss pulls softly-assigned partners together and pushes third parties out
//! of a margin around each pair, so it stays smooth in the dt-vector.
//!
//! `DynamicLossObjective` is the assignment-free variant: a softmin over each
//! grandchild's candidate partners, fed by distances and approach velocities.

use anyhow::{bail, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::area::TreeAreaEvaluator;
use crate::dt_vector::DtVector;
use crate::traits::{DtObjective, State, StateTransition};

/// Assignment weights at or below this are ignored by the push term.
const NEGLIGIBLE_WEIGHT: f64 = 1e-12;
/// Keeps `|dt|^p` smooth at zero.
const TIME_BONUS_OFFSET: f64 = 1e-8;
const REPULSION_OFFSET: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkhornConfig {
    /// Temperature of `SinkhornConfig::assignment`.
    pub eps: f64,
    pub n_iter: usize,
    /// Cost assigned to forbidden entries (diagonal, siblings).
    pub big_cost: f64,
    /// Temperatures visited by `SoftPairingObjective::anneal`, hottest first.
    pub anneal_schedule: Vec<f64>,
}

impl Default for SinkhornConfig {
    fn default() -> Self {
        Self {
            eps: 0.05,
            n_iter: 150,
            big_cost: 1e6,
            anneal_schedule: vec![0.1, 0.05, 0.02, 0.01, 0.005],
        }
    }
}

impl SinkhornConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.eps.is_finite() && self.eps > 0.0) {
            bail!("Sinkhorn eps must be positive.");
        }
        if self.n_iter == 0 {
            bail!("Sinkhorn n_iter must be greater than zero.");
        }
        if !(self.big_cost.is_finite() && self.big_cost > 0.0) {
            bail!("big_cost must be positive.");
        }
        if let Some(bad) = self.anneal_schedule.iter().find(|t| !(t.is_finite() && **t > 0.0)) {
            bail!("Anneal temperatures must be positive, got {}.", bad);
        }
        Ok(())
    }

    /// `sinkhorn` at this config's own temperature.
    pub fn assignment(&self, cost: &DMatrix<f64>) -> DMatrix<f64> {
        sinkhorn(cost, self.eps, self.n_iter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniversalLossConfig {
    /// Sinkhorn temperature used by the loss.
    pub eps: f64,
    /// Required gap between a partner and any third party.
    pub margin: f64,
    pub lam_push: f64,
    /// Bar self-assignment with `big_cost` on the diagonal.
    pub forbid_self: bool,
}

impl Default for UniversalLossConfig {
    fn default() -> Self {
        Self {
            eps: 0.05,
            margin: 0.02,
            lam_push: 0.3,
            forbid_self: true,
        }
    }
}

impl UniversalLossConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.eps.is_finite() && self.eps > 0.0) {
            bail!("Loss eps must be positive.");
        }
        if !(self.margin.is_finite() && self.margin >= 0.0) {
            bail!("margin must be non-negative.");
        }
        if !(self.lam_push.is_finite() && self.lam_push >= 0.0) {
            bail!("lam_push must be non-negative.");
        }
        Ok(())
    }
}

/// Weights of the meeting-dynamics loss over candidate partners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynamicLossConfig {
    /// Sharpness of the softmin over each grandchild's candidates.
    pub alpha: f64,
    pub w_distance: f64,
    pub w_velocity: f64,
    pub w_repulsion: f64,
    /// Subtracted from the loss.
    pub w_time: f64,
    pub p_norm: f64,
}

impl Default for DynamicLossConfig {
    fn default() -> Self {
        Self {
            alpha: 10.0,
            w_distance: 1.0,
            w_velocity: 0.0,
            w_repulsion: 0.0,
            w_time: 0.0,
            p_norm: 1.0,
        }
    }
}

impl DynamicLossConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            bail!("alpha must be positive.");
        }
        let weights = [self.w_distance, self.w_velocity, self.w_repulsion, self.w_time];
        if weights.iter().any(|w| !w.is_finite()) {
            bail!("Loss weights must be finite.");
        }
        if !(self.p_norm.is_finite() && self.p_norm > 0.0) {
            bail!("p_norm must be positive.");
        }
        Ok(())
    }
}

/// Unweighted terms of the meeting-dynamics loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynamicLossComponents {
    /// Σ over grandchildren of the softmin of squared distances to candidates.
    pub distance: f64,
    /// Same softmin over `r_ij · (v_i - v_j)`; negative while partners approach.
    pub velocity: f64,
    /// Σ `1 / (d + 1e-6)` over the six mean-point pairs.
    pub repulsion: f64,
    pub time_bonus: f64,
    pub sum_abs_dt: f64,
}

impl DynamicLossComponents {
    pub fn weighted(&self, config: &DynamicLossConfig) -> f64 {
        config.w_distance * self.distance
            + config.w_velocity * self.velocity
            + config.w_repulsion * self.repulsion
            - config.w_time * self.time_bonus
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LossBreakdown {
    pub total: f64,
    pub pull: f64,
    pub push: f64,
    /// Soft assignment matrix.
    pub assignment: DMatrix<f64>,
    /// Masked squared-distance cost.
    pub cost: DMatrix<f64>,
}

pub fn pairwise_sqdist(points: &[State]) -> DMatrix<f64> {
    let n = points.len();
    DMatrix::from_fn(n, n, |i, j| (points[i] - points[j]).norm_squared())
}

fn log_sum_exp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Smooth minimum `-ln(Σ exp(-alpha v)) / alpha`; never above `min(values)`.
pub fn softmin(values: &[f64], alpha: f64) -> f64 {
    -log_sum_exp(values.iter().map(|v| -alpha * v)) / alpha
}

/// Entropic assignment with unit row and column marginals.
///
/// Alternates row and column normalizations of `exp(-cost / eps)` in log space;
/// the last sweep normalizes columns, so column sums are exact.
pub fn sinkhorn(cost: &DMatrix<f64>, eps: f64, n_iter: usize) -> DMatrix<f64> {
    let (rows, cols) = cost.shape();
    let log_kernel = cost.map(|c| -c / eps);
    let mut log_u = vec![0.0; rows];
    let mut log_v = vec![0.0; cols];

    for _ in 0..n_iter {
        for (i, lu) in log_u.iter_mut().enumerate() {
            *lu = -log_sum_exp((0..cols).map(|j| log_kernel[(i, j)] + log_v[j]));
        }
        for (j, lv) in log_v.iter_mut().enumerate() {
            *lv = -log_sum_exp((0..rows).map(|i| log_kernel[(i, j)] + log_u[i]));
        }
    }

    DMatrix::from_fn(rows, cols, |i, j| (log_u[i] + log_kernel[(i, j)] + log_v[j]).exp())
}

/// Squared distances with forbidden entries raised to `big_cost`.
///
/// With `candidates`, row `i` keeps only `candidates[i]` (and `i` itself unless
/// `forbid_self`).
pub fn masked_cost(
    points: &[State],
    candidates: Option<&[Vec<usize>]>,
    big_cost: f64,
    forbid_self: bool,
) -> DMatrix<f64> {
    let mut cost = pairwise_sqdist(points);
    if let Some(map) = candidates {
        for i in 0..points.len() {
            let allowed = map.get(i).map(Vec::as_slice).unwrap_or(&[]);
            for j in 0..points.len() {
                if j != i && !allowed.contains(&j) {
                    cost[(i, j)] = big_cost;
                }
            }
        }
    }
    if forbid_self {
        cost.fill_diagonal(big_cost);
    }
    cost
}

/// Pull plus weighted hinge push for one set of endpoints.
///
/// `push = Σ_{i≠j} P_ij Σ_{k≠i,j} max(0, margin − (d_ik − d_ij))` with distances
/// read from the masked cost.
pub fn universal_loss(
    points: &[State],
    candidates: Option<&[Vec<usize>]>,
    loss: &UniversalLossConfig,
    sinkhorn_config: &SinkhornConfig,
) -> LossBreakdown {
    loss_at_temperature(points, candidates, loss, sinkhorn_config, loss.eps)
}

fn loss_at_temperature(
    points: &[State],
    candidates: Option<&[Vec<usize>]>,
    loss: &UniversalLossConfig,
    sinkhorn_config: &SinkhornConfig,
    eps: f64,
) -> LossBreakdown {
    let n = points.len();
    let cost = masked_cost(points, candidates, sinkhorn_config.big_cost, loss.forbid_self);
    let assignment = sinkhorn(&cost, eps, sinkhorn_config.n_iter);

    let pull = assignment.component_mul(&cost).sum();
    let distance = cost.map(f64::sqrt);
    let mut push = 0.0;
    for i in 0..n {
        for j in (0..n).filter(|&j| j != i) {
            let weight = assignment[(i, j)];
            if weight <= NEGLIGIBLE_WEIGHT {
                continue;
            }
            let d_ij = distance[(i, j)];
            push += weight
                * (0..n)
                    .filter(|&k| k != i && k != j)
                    .map(|k| (loss.margin - (distance[(i, k)] - d_ij)).max(0.0))
                    .sum::<f64>();
        }
    }

    LossBreakdown {
        total: pull + loss.lam_push * push,
        pull,
        push,
        assignment,
        cost,
    }
}

/// Soft pairing loss of the grandchild endpoints as a dt-vector objective.
pub struct SoftPairingObjective<S: StateTransition> {
    evaluator: TreeAreaEvaluator<S>,
    loss: UniversalLossConfig,
    sinkhorn: SinkhornConfig,
    /// Restrict partners to the tree's candidate map.
    use_candidates: bool,
}

impl<S: StateTransition> SoftPairingObjective<S> {
    /// `evaluator` must be built.
    pub fn new(
        evaluator: TreeAreaEvaluator<S>,
        loss: UniversalLossConfig,
        sinkhorn: SinkhornConfig,
        use_candidates: bool,
    ) -> Result<Self> {
        loss.validate()?;
        sinkhorn.validate()?;
        if evaluator.tree().is_none() {
            bail!("Soft pairing objective needs a built evaluator.");
        }
        Ok(Self {
            evaluator,
            loss,
            sinkhorn,
            use_candidates,
        })
    }

    fn breakdown_at(&mut self, dt: &DtVector, eps: f64) -> Result<LossBreakdown> {
        let tree = self.evaluator.refreshed(dt)?;
        let points: Vec<State> = tree.grandchildren().iter().map(|gc| gc.position).collect();
        let candidates = self.use_candidates.then(|| tree.candidate_map());
        Ok(loss_at_temperature(&points, candidates, &self.loss, &self.sinkhorn, eps))
    }

    pub fn breakdown(&mut self, dt: &DtVector) -> Result<LossBreakdown> {
        let eps = self.loss.eps;
        self.breakdown_at(dt, eps)
    }

    /// Loss at every temperature of the anneal schedule, hottest first.
    pub fn anneal(&mut self, dt: &DtVector) -> Result<Vec<(f64, LossBreakdown)>> {
        let schedule = self.sinkhorn.anneal_schedule.clone();
        let mut stages = Vec::with_capacity(schedule.len());
        for eps in schedule {
            let breakdown = self.breakdown_at(dt, eps)?;
            debug!(eps, total = breakdown.total, "anneal stage");
            stages.push((eps, breakdown));
        }
        Ok(stages)
    }

    pub fn dt_bounds(&self) -> (f64, f64) {
        self.evaluator.dt_bounds()
    }

    pub fn into_evaluator(self) -> TreeAreaEvaluator<S> {
        self.evaluator
    }
}

impl<S: StateTransition> DtObjective for SoftPairingObjective<S> {
    fn evaluate(&mut self, dt: &DtVector) -> f64 {
        self.breakdown(dt).map_or(f64::NAN, |b| b.total)
    }
}

/// Softmin meeting loss over each grandchild's candidate partners, with
/// mean-point repulsion and a reward for longer steps.
pub struct DynamicLossObjective<S: StateTransition> {
    evaluator: TreeAreaEvaluator<S>,
    config: DynamicLossConfig,
}

impl<S: StateTransition> DynamicLossObjective<S> {
    /// `evaluator` must be built.
    pub fn new(evaluator: TreeAreaEvaluator<S>, config: DynamicLossConfig) -> Result<Self> {
        config.validate()?;
        if evaluator.tree().is_none() {
            bail!("Dynamic loss needs a built evaluator.");
        }
        Ok(Self { evaluator, config })
    }

    pub fn config(&self) -> &DynamicLossConfig {
        &self.config
    }

    pub fn components(&mut self, dt: &DtVector) -> Result<DynamicLossComponents> {
        let DynamicLossConfig { alpha, p_norm, .. } = self.config;
        let tree = self.evaluator.refreshed(dt)?;
        let transition = tree.transition();
        let grandchildren = tree.grandchildren();
        let velocities: Vec<State> = grandchildren
            .iter()
            .map(|gc| transition.velocity(&gc.position, gc.control))
            .collect();

        let mut distance = 0.0;
        let mut velocity = 0.0;
        for (i, gc) in grandchildren.iter().enumerate() {
            let partners = tree.candidates(i);
            if partners.is_empty() {
                continue;
            }
            let (squared, approach): (Vec<f64>, Vec<f64>) = partners
                .iter()
                .map(|&j| {
                    let r = gc.position - grandchildren[j].position;
                    let w = velocities[i] - velocities[j];
                    (r.norm_squared(), r.dot(&w))
                })
                .unzip();
            distance += softmin(&squared, alpha);
            velocity += softmin(&approach, alpha);
        }

        let mean_points = tree.mean_points()?;
        let mut repulsion = 0.0;
        for a in 0..mean_points.len() {
            for b in a + 1..mean_points.len() {
                repulsion += 1.0 / ((mean_points[a] - mean_points[b]).norm() + REPULSION_OFFSET);
            }
        }

        let magnitudes = dt.as_slice();
        Ok(DynamicLossComponents {
            distance,
            velocity,
            repulsion,
            time_bonus: magnitudes
                .iter()
                .map(|v| (v.abs() + TIME_BONUS_OFFSET).powf(p_norm))
                .sum(),
            sum_abs_dt: magnitudes.iter().map(|v| v.abs()).sum(),
        })
    }

    pub fn dt_bounds(&self) -> (f64, f64) {
        self.evaluator.dt_bounds()
    }

    pub fn into_evaluator(self) -> TreeAreaEvaluator<S> {
        self.evaluator
    }
}

impl<S: StateTransition> DtObjective for DynamicLossObjective<S> {
    fn evaluate(&mut self, dt: &DtVector) -> f64 {
        let config = self.config;
        self.components(dt).map_or(f64::NAN, |c| c.weighted(&config))
    }
}
