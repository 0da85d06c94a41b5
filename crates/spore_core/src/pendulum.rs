//! Reference state-transition collaborators: a damped, torque-controlled pendulum.
//!
//! `Pendulum` integrates the full nonlinear dynamics with fixed-substep RK4.
//! `LinearizedPendulum` linearizes at the current angle and applies the exact
//! discretization of the linear model, memoizing both matrices per instance.

use anyhow::Result;
use nalgebra::{Matrix2, Matrix3, Vector2};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::config::PendulumParams;
use crate::solvers::integrate_fixed;
use crate::traits::{DynamicalSystem, State, StateTransition};

/// θ̇ = ω, ω̇ = −(g/l)·sin θ − b·ω + u/(m l²), for one fixed control.
struct ControlledField<'a> {
    params: &'a PendulumParams,
    control: f64,
}

impl DynamicalSystem<f64> for ControlledField<'_> {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
        let p = self.params;
        out[0] = x[1];
        out[1] = -p.g / p.l * x[0].sin() - p.damping * x[1] + self.control / (p.m * p.l * p.l);
    }
}

#[derive(Debug, Clone)]
pub struct Pendulum {
    params: PendulumParams,
}

impl Pendulum {
    pub fn new(params: PendulumParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &PendulumParams {
        &self.params
    }
}

impl Default for Pendulum {
    fn default() -> Self {
        Self {
            params: PendulumParams::default(),
        }
    }
}

impl StateTransition for Pendulum {
    fn step(&self, state: &State, control: f64, signed_dt: f64) -> State {
        let field = ControlledField {
            params: &self.params,
            control,
        };
        let mut x = [state[0], state[1]];
        integrate_fixed(&field, &mut x, signed_dt, self.params.substeps);
        State::new(x[0], x[1])
    }

    fn control_bounds(&self) -> (f64, f64) {
        (-self.params.max_control, self.params.max_control)
    }

    fn velocity(&self, state: &State, control: f64) -> State {
        let field = ControlledField {
            params: &self.params,
            control,
        };
        let mut out = [0.0; 2];
        field.apply(0.0, state.as_slice(), &mut out);
        State::new(out[0], out[1])
    }
}

const THETA_KEY_SCALE: f64 = 1e6;
const DT_KEY_SCALE: f64 = 1e8;

fn rounded_key(value: f64, scale: f64) -> i64 {
    (value * scale).round() as i64
}

/// Linearize-and-discretize pendulum with an owned memoization layer.
///
/// Continuous matrices are cached per angle rounded to 6 decimals, discrete ones per
/// (angle, dt rounded to 8 decimals). The caches live and die with the instance.
#[derive(Debug)]
pub struct LinearizedPendulum {
    params: PendulumParams,
    linearization_cache: RefCell<HashMap<i64, Matrix2<f64>>>,
    discretization_cache: RefCell<HashMap<(i64, i64), (Matrix2<f64>, Vector2<f64>)>>,
}

impl LinearizedPendulum {
    pub fn new(params: PendulumParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            linearization_cache: RefCell::new(HashMap::new()),
            discretization_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Continuous A at `theta`; B is the constant `[0, 1]`.
    pub fn linearized_matrix(&self, theta: f64) -> Matrix2<f64> {
        let key = rounded_key(theta, THETA_KEY_SCALE);
        let mut cache = self.linearization_cache.borrow_mut();
        *cache.entry(key).or_insert_with(|| {
            Matrix2::new(
                0.0,
                1.0,
                -self.params.g / self.params.l * theta.cos(),
                -self.params.damping,
            )
        })
    }

    /// Zero-order-hold discretization `(A_d, B_d)` from `exp([[A, B], [0, 0]] * dt)`.
    pub fn discretize(&self, theta: f64, dt: f64) -> (Matrix2<f64>, Vector2<f64>) {
        let key = (
            rounded_key(theta, THETA_KEY_SCALE),
            rounded_key(dt, DT_KEY_SCALE),
        );
        if let Some(hit) = self.discretization_cache.borrow().get(&key) {
            return *hit;
        }

        let a = self.linearized_matrix(theta);
        let mut augmented = Matrix3::zeros();
        augmented.fixed_view_mut::<2, 2>(0, 0).copy_from(&a);
        augmented[(1, 2)] = 1.0;
        let phi = (augmented * dt).exp();

        let a_d: Matrix2<f64> = phi.fixed_view::<2, 2>(0, 0).into_owned();
        let b_d = Vector2::new(phi[(0, 2)], phi[(1, 2)]);
        self.discretization_cache
            .borrow_mut()
            .insert(key, (a_d, b_d));
        (a_d, b_d)
    }

    pub fn clear_cache(&self) {
        self.linearization_cache.borrow_mut().clear();
        self.discretization_cache.borrow_mut().clear();
    }

    /// Entry counts of the `(linearization, discretization)` caches.
    pub fn cache_len(&self) -> (usize, usize) {
        (
            self.linearization_cache.borrow().len(),
            self.discretization_cache.borrow().len(),
        )
    }
}

impl StateTransition for LinearizedPendulum {
    fn step(&self, state: &State, control: f64, signed_dt: f64) -> State {
        let (a_d, b_d) = self.discretize(state[0], signed_dt);
        a_d * state + b_d * control
    }

    fn control_bounds(&self) -> (f64, f64) {
        (-self.params.max_control, self.params.max_control)
    }

    fn velocity(&self, state: &State, control: f64) -> State {
        self.linearized_matrix(state[0]) * state + Vector2::new(0.0, control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn upright_equilibrium_without_control_stays_put() {
        let pendulum = Pendulum::default();
        let up = State::new(PI, 0.0);
        let next = pendulum.step(&up, 0.0, 0.1);
        assert!((next[0] - PI).abs() < 1e-12);
        assert!(next[1].abs() < 1e-12);
    }

    #[test]
    fn control_pushes_velocity_in_its_sign_for_either_direction() {
        let pendulum = Pendulum::default();
        let up = State::new(PI, 0.0);
        let forward = pendulum.step(&up, 2.0, 0.1);
        let backward = pendulum.step(&up, 2.0, -0.1);
        assert!(forward[1] > 0.0);
        assert!(backward[1] < 0.0);
    }

    #[test]
    fn forward_then_backward_returns_close_to_start() {
        let pendulum = Pendulum::default();
        let start = State::new(2.5, 0.4);
        let there = pendulum.step(&start, -2.0, 0.15);
        let back = pendulum.step(&there, -2.0, -0.15);
        assert!((back - start).norm() < 1e-8);
    }

    #[test]
    fn velocity_matches_vector_field() {
        let pendulum = Pendulum::default();
        let state = State::new(PI / 2.0, 1.0);
        let v = pendulum.velocity(&state, 2.0);
        assert!((v[0] - 1.0).abs() < 1e-15);
        let expected = -9.81 / 2.0 - 0.1 + 2.0 / 4.0;
        assert!((v[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn control_bounds_are_symmetric() {
        let pendulum = Pendulum::default();
        assert_eq!(pendulum.control_bounds(), (-2.0, 2.0));
    }

    #[test]
    fn rejects_invalid_params() {
        let params = PendulumParams {
            l: 0.0,
            ..PendulumParams::default()
        };
        assert!(Pendulum::new(params).is_err());
    }

    #[test]
    fn linearized_step_is_memoized_per_instance() {
        let pendulum = LinearizedPendulum::new(PendulumParams::default()).expect("pendulum");
        let state = State::new(PI, 0.0);
        let first = pendulum.step(&state, 2.0, 0.1);
        let second = pendulum.step(&state, 2.0, 0.1);
        assert_eq!(first, second);
        assert_eq!(pendulum.cache_len(), (1, 1));

        pendulum.step(&state, 2.0, -0.1);
        assert_eq!(pendulum.cache_len(), (1, 2));

        pendulum.clear_cache();
        assert_eq!(pendulum.cache_len(), (0, 0));
    }

    #[test]
    fn linearized_discretization_matches_identity_at_zero_dt() {
        let pendulum = LinearizedPendulum::new(PendulumParams::default()).expect("pendulum");
        let (a_d, b_d) = pendulum.discretize(0.3, 0.0);
        assert!((a_d - Matrix2::identity()).norm() < 1e-12);
        assert!(b_d.norm() < 1e-12);
    }

    #[test]
    fn linearized_discretization_is_first_order_accurate() {
        let pendulum = LinearizedPendulum::new(PendulumParams::default()).expect("pendulum");
        let dt = 1e-4;
        let a = pendulum.linearized_matrix(1.0);
        let (a_d, b_d) = pendulum.discretize(1.0, dt);
        let expected = Matrix2::identity() + a * dt;
        assert!((a_d - expected).norm() < 1e-6);
        assert!((b_d[1] - dt).abs() < 1e-7);
    }
}
