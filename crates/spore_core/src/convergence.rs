//! Closing rates: the signed time derivative of the distance between two branch endpoints.
//!
//! Each endpoint moves with the raw forward-time vector field scaled by its own
//! time-direction sign. Foreign parents are treated as fixed points.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::spore::Spore;
use crate::traits::{State, StateTransition};

/// Distances below this make the rate undefined; it is reported as zero.
const COINCIDENT: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApproachingPair {
    pub gc_i: usize,
    pub gc_j: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApproachingParent {
    pub gc: usize,
    pub parent: usize,
    pub rate: f64,
}

/// d/dt |r1 − r2| for points moving with `w1` and `w2`.
pub fn closing_rate(r1: &State, w1: &State, r2: &State, w2: &State) -> f64 {
    let diff = r1 - r2;
    let distance = diff.norm();
    if distance < COINCIDENT {
        return 0.0;
    }
    diff.dot(&(w1 - w2)) / distance
}

fn signed_velocity<S: StateTransition>(transition: &S, spore: &Spore) -> State {
    transition.velocity(&spore.position, spore.control) * spore.direction().sign()
}

/// Symmetric `n × n` closing-rate matrix over all grandchildren, zero diagonal.
pub fn pairwise_closing_rate<S: StateTransition>(transition: &S, grandchildren: &[Spore]) -> DMatrix<f64> {
    let n = grandchildren.len();
    let velocities: Vec<State> = grandchildren
        .iter()
        .map(|gc| signed_velocity(transition, gc))
        .collect();

    let mut rates = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in (i + 1)..n {
            let rate = closing_rate(
                &grandchildren[i].position,
                &velocities[i],
                &grandchildren[j].position,
                &velocities[j],
            );
            rates[(i, j)] = rate;
            rates[(j, i)] = rate;
        }
    }
    rates
}

/// `n_gc × n_children` rates of grandchildren towards fixed children. NaN on the own parent.
pub fn grandchild_to_foreign_parent_rate<S: StateTransition>(
    transition: &S,
    grandchildren: &[Spore],
    children: &[Spore],
) -> DMatrix<f64> {
    let mut rates = DMatrix::from_element(grandchildren.len(), children.len(), f64::NAN);
    let still = State::zeros();
    for (g, gc) in grandchildren.iter().enumerate() {
        let velocity = signed_velocity(transition, gc);
        for (p, parent) in children.iter().enumerate() {
            if gc.parent_idx == Some(p) {
                continue;
            }
            rates[(g, p)] = closing_rate(&gc.position, &velocity, &parent.position, &still);
        }
    }
    rates
}

/// Upper-triangle entries with `rate < -threshold`, fastest approach first.
pub fn approaching_grandchild_pairs(rates: &DMatrix<f64>, threshold: f64) -> Vec<ApproachingPair> {
    let n = rates.nrows();
    let mut pairs = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let rate = rates[(i, j)];
            if rate < -threshold {
                pairs.push(ApproachingPair {
                    gc_i: i,
                    gc_j: j,
                    rate,
                });
            }
        }
    }
    pairs.sort_by(|a, b| a.rate.total_cmp(&b.rate));
    debug!(count = pairs.len(), "approaching grandchild pairs");
    pairs
}

/// Non-NaN entries with `rate < -threshold`, fastest approach first.
pub fn approaching_parent_pairs(rates: &DMatrix<f64>, threshold: f64) -> Vec<ApproachingParent> {
    let mut pairs = Vec::new();
    for g in 0..rates.nrows() {
        for p in 0..rates.ncols() {
            let rate = rates[(g, p)];
            if !rate.is_nan() && rate < -threshold {
                pairs.push(ApproachingParent { gc: g, parent: p, rate });
            }
        }
    }
    pairs.sort_by(|a, b| a.rate.total_cmp(&b.rate));
    debug!(count = pairs.len(), "approaching grandchild-parent pairs");
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::pendulum::Pendulum;
    use crate::tree::SporeTree;

    #[test]
    fn closing_rate_of_head_on_points() {
        let r1 = State::new(1.0, 0.0);
        let r2 = State::new(-1.0, 0.0);
        let w1 = State::new(-1.0, 0.0);
        let w2 = State::new(1.0, 0.0);
        assert!((closing_rate(&r1, &w1, &r2, &w2) + 2.0).abs() < 1e-15);
        assert!((closing_rate(&r1, &(-w1), &r2, &(-w2)) - 2.0).abs() < 1e-15);
    }

    #[test]
    fn closing_rate_is_zero_for_coincident_points() {
        let r = State::new(0.3, 0.3);
        let w = State::new(1.0, -1.0);
        assert_eq!(closing_rate(&r, &w, &r, &State::zeros()), 0.0);
    }

    #[test]
    fn tangential_motion_does_not_close() {
        let r1 = State::new(1.0, 0.0);
        let r2 = State::zeros();
        let w1 = State::new(0.0, 5.0);
        assert!(closing_rate(&r1, &w1, &r2, &State::zeros()).abs() < 1e-15);
    }

    #[test]
    fn pairwise_matrix_is_symmetric_with_zero_diagonal() {
        let pendulum = Pendulum::default();
        let tree = SporeTree::auto(&pendulum, TreeConfig::default()).expect("tree");
        let rates = pairwise_closing_rate(&pendulum, tree.grandchildren());
        assert_eq!(rates.shape(), (8, 8));
        for i in 0..8 {
            assert_eq!(rates[(i, i)], 0.0);
            for j in 0..8 {
                assert_eq!(rates[(i, j)], rates[(j, i)]);
            }
        }
    }

    #[test]
    fn parent_matrix_is_nan_exactly_on_own_parent() {
        let pendulum = Pendulum::default();
        let tree = SporeTree::auto(&pendulum, TreeConfig::default()).expect("tree");
        let rates = grandchild_to_foreign_parent_rate(&pendulum, tree.grandchildren(), tree.children());
        assert_eq!(rates.shape(), (8, 4));
        for (g, gc) in tree.grandchildren().iter().enumerate() {
            for p in 0..4 {
                assert_eq!(rates[(g, p)].is_nan(), gc.parent_idx == Some(p));
            }
        }
    }

    #[test]
    fn approaching_lists_filter_and_sort() {
        let mut rates = DMatrix::zeros(3, 3);
        rates[(0, 1)] = -0.5;
        rates[(1, 0)] = -0.5;
        rates[(0, 2)] = -2.0;
        rates[(2, 0)] = -2.0;
        rates[(1, 2)] = -1e-7;
        rates[(2, 1)] = -1e-7;
        let pairs = approaching_grandchild_pairs(&rates, 1e-6);
        assert_eq!(pairs.len(), 2);
        assert_eq!((pairs[0].gc_i, pairs[0].gc_j), (0, 2));
        assert_eq!((pairs[1].gc_i, pairs[1].gc_j), (0, 1));

        let mut parent_rates = DMatrix::from_element(2, 2, f64::NAN);
        parent_rates[(0, 1)] = -0.1;
        parent_rates[(1, 0)] = 0.3;
        let parents = approaching_parent_pairs(&parent_rates, 1e-6);
        assert_eq!(
            parents,
            vec![ApproachingParent {
                gc: 0,
                parent: 1,
                rate: -0.1
            }]
        );
    }
}
