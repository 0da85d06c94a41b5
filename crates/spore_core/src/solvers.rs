use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Classic Runge-Kutta 4th order stepper with preallocated stage buffers.
pub struct RK4<T: Scalar> {
    stages: [Vec<T>; 4],
    stage_input: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        let zero = T::zero();
        Self {
            stages: [
                vec![zero; dim],
                vec![zero; dim],
                vec![zero; dim],
                vec![zero; dim],
            ],
            stage_input: vec![zero; dim],
        }
    }

    fn offset_stage_input(&mut self, state: &[T], stage: usize, scale: T) {
        for ((input, &x), &k) in self.stage_input.iter_mut().zip(state).zip(&self.stages[stage]) {
            *input = x + scale * k;
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let two = T::one() + T::one();
        let half = T::one() / two;
        let sixth = T::one() / T::from_u8(6).unwrap_or_else(T::one);
        let t0 = *t;

        system.apply(t0, state, &mut self.stages[0]);

        self.offset_stage_input(state, 0, dt * half);
        system.apply(t0 + dt * half, &self.stage_input, &mut self.stages[1]);

        self.offset_stage_input(state, 1, dt * half);
        system.apply(t0 + dt * half, &self.stage_input, &mut self.stages[2]);

        self.offset_stage_input(state, 2, dt);
        system.apply(t0 + dt, &self.stage_input, &mut self.stages[3]);

        let [k1, k2, k3, k4] = &self.stages;
        for (i, x) in state.iter_mut().enumerate() {
            *x = *x + dt * sixth * (k1[i] + two * k2[i] + two * k3[i] + k4[i]);
        }

        *t = t0 + dt;
    }
}

/// Integrates `state` over `span` (either sign) with `substeps` equal RK4 steps.
///
/// The substep count is fixed rather than derived from `span`, so the endpoint is a
/// smooth function of `span`. Finite-difference gradients over step sizes rely on that.
pub fn integrate_fixed<T: Scalar>(
    system: &impl DynamicalSystem<T>,
    state: &mut [T],
    span: T,
    substeps: usize,
) {
    if substeps == 0 || span == T::zero() {
        return;
    }
    let n = T::from_usize(substeps).unwrap_or_else(T::one);
    let h = span / n;
    let mut stepper = RK4::new(state.len());
    let mut t = T::zero();
    for _ in 0..substeps {
        stepper.step(system, &mut t, state, h);
    }
}

#[cfg(test)]
mod tests {
    use super::{integrate_fixed, RK4};
    use crate::traits::{DynamicalSystem, Steppable};

    struct Decay {
        rate: f64,
    }

    impl DynamicalSystem<f64> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -self.rate * x[0];
        }
    }

    struct Rotation;

    impl DynamicalSystem<f64> for Rotation {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -x[1];
            out[1] = x[0];
        }
    }

    #[test]
    fn rk4_step_matches_exponential_decay() {
        let system = Decay { rate: 1.0 };
        let mut stepper = RK4::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        stepper.step(&system, &mut t, &mut state, 0.1);
        assert!((state[0] - (-0.1f64).exp()).abs() < 1e-7);
        assert!((t - 0.1).abs() < 1e-15);
    }

    #[test]
    fn integrate_fixed_runs_backward_for_negative_span() {
        let system = Decay { rate: 2.0 };
        let mut state = [1.0];
        integrate_fixed(&system, &mut state, -0.5, 50);
        assert!((state[0] - 1.0f64.exp()).abs() < 1e-8);
    }

    #[test]
    fn integrate_fixed_round_trip_is_close_to_identity() {
        let system = Rotation;
        let mut state = [1.0, 0.0];
        integrate_fixed(&system, &mut state, 0.7, 40);
        integrate_fixed(&system, &mut state, -0.7, 40);
        assert!((state[0] - 1.0).abs() < 1e-9);
        assert!(state[1].abs() < 1e-9);
    }

    #[test]
    fn integrate_fixed_zero_span_is_noop() {
        let system = Rotation;
        let mut state = [0.3, -0.2];
        integrate_fixed(&system, &mut state, 0.0, 10);
        assert_eq!(state, [0.3, -0.2]);
    }
}
