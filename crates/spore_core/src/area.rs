//! Area objectives and the cached evaluator the dt-vector optimizers run on.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AreaObjective, TreeConfig};
use crate::dt_vector::DtVector;
use crate::error::TreeError;
use crate::spore::Spore;
use crate::traits::{DtObjective, State, StateTransition};
use crate::tree::SporeTree;

/// Shoelace area of a closed polygon, `0.5 * |Σ x_k y_{k-1} − y_k x_{k-1}|`.
pub fn shoelace_area(points: &[State]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: f64 = (0..n)
        .map(|k| {
            let prev = &points[(k + n - 1) % n];
            points[k].x * prev.y - points[k].y * prev.x
        })
        .sum();
    0.5 * twice.abs()
}

pub fn triangle_area(a: &State, b: &State, c: &State) -> f64 {
    let ab = b - a;
    let ac = c - a;
    0.5 * (ab.x * ac.y - ab.y * ac.x).abs()
}

/// Sum of the root → child → grandchild triangles.
pub fn tree_area(root: &State, children: &[Spore], grandchildren: &[Spore]) -> f64 {
    grandchildren
        .iter()
        .filter_map(|gc| {
            let parent = children.get(gc.parent_idx?)?;
            Some(triangle_area(root, &parent.position, &gc.position))
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluatorState {
    Unbuilt,
    /// Topology fixed by the first dt-vector.
    Built,
    /// Positions refreshed for a later dt-vector.
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstraintStatus {
    pub pair: (usize, usize),
    pub distance: f64,
    /// `distance - epsilon`; feasible when `<= 0`.
    pub value: f64,
    pub satisfied: bool,
}

/// Owns one tree for a whole optimization run.
///
/// The tree is built and sorted once; every later dt-vector only refreshes
/// positions through `SporeTree::update`, so slot indices and the sorted pair
/// layout stay valid across iterations.
pub struct TreeAreaEvaluator<S: StateTransition> {
    transition: Option<S>,
    config: TreeConfig,
    objective: AreaObjective,
    tree: Option<SporeTree<S>>,
    state: EvaluatorState,
}

impl<S: StateTransition> TreeAreaEvaluator<S> {
    pub fn new(transition: S, config: TreeConfig, objective: AreaObjective) -> Self {
        Self {
            transition: Some(transition),
            config,
            objective,
            tree: None,
            state: EvaluatorState::Unbuilt,
        }
    }

    /// Adopts an existing tree, sorting it first if needed.
    pub fn from_tree(mut tree: SporeTree<S>, objective: AreaObjective) -> Result<Self, TreeError> {
        if !tree.is_sorted() {
            tree.sort_and_pair()?;
        }
        Ok(Self {
            transition: None,
            config: *tree.config(),
            objective,
            tree: Some(tree),
            state: EvaluatorState::Built,
        })
    }

    /// Builds and sorts the tree. Only allowed once.
    pub fn build(&mut self, dt: &DtVector) -> Result<()> {
        if self.tree.is_some() {
            return Err(TreeError::TopologyFrozen.into());
        }
        self.config.validate()?;
        let transition = self.transition.take().ok_or(TreeError::TopologyFrozen)?;
        let mut tree = SporeTree::build(transition, self.config, dt)?;
        if let Err(err) = tree.sort_and_pair().map(|_| ()) {
            // stays Unbuilt, so a later build may retry
            self.transition = Some(tree.into_transition());
            return Err(err.into());
        }
        self.tree = Some(tree);
        self.state = EvaluatorState::Built;
        debug!(objective = ?self.objective, "area evaluator built");
        Ok(())
    }

    pub fn state(&self) -> EvaluatorState {
        self.state
    }

    pub fn objective(&self) -> AreaObjective {
        self.objective
    }

    pub fn dt_bounds(&self) -> (f64, f64) {
        self.config.dt_bounds
    }

    pub fn tree(&self) -> Option<&SporeTree<S>> {
        self.tree.as_ref()
    }

    /// Applies `dt` to the frozen tree and returns it.
    pub fn refreshed(&mut self, dt: &DtVector) -> Result<&SporeTree<S>, TreeError> {
        let tree = self.tree.as_mut().ok_or(TreeError::NotSorted {
            operation: "evaluating the area",
        })?;
        tree.update(dt);
        self.state = EvaluatorState::Updated;
        Ok(tree)
    }

    pub fn area(&mut self, dt: &DtVector) -> Result<f64, TreeError> {
        let objective = self.objective;
        let tree = self.refreshed(dt)?;
        match objective {
            AreaObjective::Quadrilateral => Ok(shoelace_area(&tree.mean_points()?)),
            AreaObjective::BranchTriangles => Ok(tree_area(tree.root(), tree.children(), tree.grandchildren())),
        }
    }

    pub fn pair_distances(&mut self, dt: &DtVector, pairs: &[(usize, usize)]) -> Result<Vec<f64>, TreeError> {
        let tree = self.refreshed(dt)?;
        let grandchildren = tree.grandchildren();
        pairs
            .iter()
            .map(|&(i, j)| match (grandchildren.get(i), grandchildren.get(j)) {
                (Some(a), Some(b)) => Ok((a.position - b.position).norm()),
                _ => Err(TreeError::InsufficientGrandchildren {
                    pair: i.max(j) / 2,
                    first_slot: i,
                    second_slot: j,
                    available: grandchildren.len(),
                }),
            })
            .collect()
    }

    pub fn constraint_report(
        &mut self,
        dt: &DtVector,
        pairs: &[(usize, usize)],
        epsilon: f64,
    ) -> Result<Vec<ConstraintStatus>, TreeError> {
        let distances = self.pair_distances(dt, pairs)?;
        Ok(pairs
            .iter()
            .zip(distances)
            .map(|(&pair, distance)| ConstraintStatus {
                pair,
                distance,
                value: distance - epsilon,
                satisfied: distance <= epsilon,
            })
            .collect())
    }
}

/// Negated area, NaN while unbuilt.
impl<S: StateTransition> DtObjective for TreeAreaEvaluator<S> {
    fn evaluate(&mut self, dt: &DtVector) -> f64 {
        self.area(dt).map_or(f64::NAN, |area| -area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pendulum::Pendulum;
    use proptest::prelude::*;

    fn square() -> Vec<State> {
        vec![
            State::new(0.0, 0.0),
            State::new(1.0, 0.0),
            State::new(1.0, 1.0),
            State::new(0.0, 1.0),
        ]
    }

    #[test]
    fn unit_square_and_triangle() {
        assert!((shoelace_area(&square()) - 1.0).abs() < 1e-15);
        let mut reversed = square();
        reversed.reverse();
        assert!((shoelace_area(&reversed) - 1.0).abs() < 1e-15);
        assert_eq!(
            triangle_area(&State::zeros(), &State::new(2.0, 0.0), &State::new(0.0, 3.0)),
            3.0
        );
        assert_eq!(shoelace_area(&square()[..2]), 0.0);
    }

    #[test]
    fn evaluator_walks_unbuilt_built_updated() {
        let pendulum = Pendulum::default();
        let config = TreeConfig::default();
        let dt = config.default_dt_vector();
        let mut evaluator = TreeAreaEvaluator::new(&pendulum, config, AreaObjective::Quadrilateral);
        assert_eq!(evaluator.state(), EvaluatorState::Unbuilt);
        assert!(matches!(evaluator.area(&dt), Err(TreeError::NotSorted { .. })));
        assert!(evaluator.evaluate(&dt).is_nan());

        evaluator.build(&dt).expect("build");
        assert_eq!(evaluator.state(), EvaluatorState::Built);
        let err = evaluator.build(&dt).unwrap_err();
        assert_eq!(err.downcast_ref::<TreeError>(), Some(&TreeError::TopologyFrozen));

        let area = evaluator.area(&dt).expect("area");
        assert_eq!(evaluator.state(), EvaluatorState::Updated);
        assert!(area.is_finite() && area > 0.0);
        assert_eq!(evaluator.evaluate(&dt), -area);
    }

    #[test]
    fn update_matches_a_fresh_build() {
        let pendulum = Pendulum::default();
        let config = TreeConfig::default();
        let mut evaluator = TreeAreaEvaluator::new(&pendulum, config, AreaObjective::BranchTriangles);
        evaluator.build(&config.default_dt_vector()).expect("build");
        let order = evaluator.tree().and_then(|t| t.sorted_order()).map(<[usize]>::to_vec);

        let moved = DtVector::new([0.12, 0.09, 0.11, 0.08], [0.011, 0.009, 0.008, 0.012, 0.01, 0.007, 0.013, 0.01])
            .expect("dt");
        let area = evaluator.area(&moved).expect("area");
        let fresh = SporeTree::build(&pendulum, config, &moved).expect("tree");
        let tree = evaluator.tree().expect("built");
        for (a, b) in tree.grandchildren().iter().zip(fresh.grandchildren()) {
            assert_eq!(a.position, b.position);
        }
        assert_eq!(tree.sorted_order().map(<[usize]>::to_vec), order);
        assert!((area - tree_area(fresh.root(), fresh.children(), fresh.grandchildren())).abs() < 1e-15);
    }

    #[test]
    fn constraint_report_flags_each_pair() {
        let pendulum = Pendulum::default();
        let tree = SporeTree::auto(&pendulum, TreeConfig::default()).expect("tree");
        let dt = tree.dt_vector();
        let mut evaluator = TreeAreaEvaluator::from_tree(tree, AreaObjective::Quadrilateral).expect("evaluator");
        let pairs = [(0, 2), (1, 6)];
        let distances = evaluator.pair_distances(&dt, &pairs).expect("distances");
        let epsilon = (distances[0] + distances[1]) / 2.0;
        let report = evaluator.constraint_report(&dt, &pairs, epsilon).expect("report");
        assert_eq!(report.len(), 2);
        for (status, distance) in report.iter().zip(&distances) {
            assert_eq!(status.distance, *distance);
            assert_eq!(status.satisfied, status.value <= 0.0);
        }
        assert!(matches!(
            evaluator.pair_distances(&dt, &[(0, 8)]),
            Err(TreeError::InsufficientGrandchildren { available: 8, .. })
        ));
    }

    /// Endpoints land at `(control, signed_dt)`, whatever the start state.
    struct Placement;

    impl StateTransition for Placement {
        fn step(&self, _state: &State, control: f64, signed_dt: f64) -> State {
            State::new(control, signed_dt)
        }

        fn control_bounds(&self) -> (f64, f64) {
            (-2.0, 2.0)
        }

        fn velocity(&self, _state: &State, _control: f64) -> State {
            State::zeros()
        }
    }

    #[test]
    fn failed_pairing_leaves_evaluator_unbuilt() {
        let config = TreeConfig {
            initial_position: [0.0, 0.0],
            ..TreeConfig::default()
        };
        // bearings put gc_3_0 and gc_3_1 in the same slot pair
        let dt = DtVector::new([0.1; 4], [0.02, 0.01, 0.01, 0.02, 0.02, 0.02, 0.01, 0.01]).expect("dt");
        let mut evaluator = TreeAreaEvaluator::new(Placement, config, AreaObjective::Quadrilateral);

        for _ in 0..2 {
            let err = evaluator.build(&dt).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<TreeError>(), Some(TreeError::SameParentPair { .. })),
                "{err}"
            );
            assert_eq!(evaluator.state(), EvaluatorState::Unbuilt);
            assert!(evaluator.tree().is_none());
        }

        evaluator.build(&config.default_dt_vector()).expect("uniform steps pair cleanly");
        assert_eq!(evaluator.state(), EvaluatorState::Built);
    }

    fn point() -> impl Strategy<Value = State> {
        (-10.0f64..10.0, -10.0f64..10.0).prop_map(|(x, y)| State::new(x, y))
    }

    proptest! {
        #[test]
        fn shoelace_ignores_cyclic_relabeling(points in prop::collection::vec(point(), 4), shift in 0usize..4) {
            let mut rotated = points.clone();
            rotated.rotate_left(shift);
            let a = shoelace_area(&points);
            prop_assert!((a - shoelace_area(&rotated)).abs() <= 1e-9 * (1.0 + a));
        }

        #[test]
        fn collinear_points_have_zero_area(
            origin in point(),
            angle in 0.0f64..std::f64::consts::TAU,
            ts in prop::collection::vec(-5.0f64..5.0, 4),
        ) {
            let direction = State::new(angle.cos(), angle.sin());
            let points: Vec<State> = ts.iter().map(|&t| origin + direction * t).collect();
            prop_assert!(shoelace_area(&points) < 1e-9);
        }
    }
}
