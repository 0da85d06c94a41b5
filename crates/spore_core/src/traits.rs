use nalgebra::Vector2;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::dt_vector::DtVector;

/// Phase-space point of a planar system: (angle, angular velocity).
pub type State = Vector2<f64>;

/// Numeric type the integrators are generic over.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Represents a continuous-time vector field.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: current state
    /// t: current time
    /// out: buffer to write dx/dt into
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A trait for solvers that can advance a system by one step.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt. A negative dt integrates backward in time.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}

/// The controlled dynamics every tree branch is propagated with.
///
/// Implementations must be deterministic and accept both signs of `signed_dt`.
/// Exact time reversibility is not required.
pub trait StateTransition {
    /// Propagates `state` under the constant `control` for `signed_dt` time units.
    fn step(&self, state: &State, control: f64, signed_dt: f64) -> State;

    /// Returns `(u_min, u_max)`.
    fn control_bounds(&self) -> (f64, f64);

    /// Raw forward-time vector field at `state`, independent of any branch direction.
    fn velocity(&self, state: &State, control: f64) -> State;
}

impl<S: StateTransition + ?Sized> StateTransition for &S {
    fn step(&self, state: &State, control: f64, signed_dt: f64) -> State {
        (**self).step(state, control, signed_dt)
    }

    fn control_bounds(&self) -> (f64, f64) {
        (**self).control_bounds()
    }

    fn velocity(&self, state: &State, control: f64) -> State {
        (**self).velocity(state, control)
    }
}

/// A scalar loss over the 12-entry dt-vector, lower is better.
///
/// Shared by the hard area objective and the soft pairing loss so either can
/// drive the same outer optimizer. Evaluation may refresh cached tree state.
pub trait DtObjective {
    fn evaluate(&mut self, dt: &DtVector) -> f64;
}
