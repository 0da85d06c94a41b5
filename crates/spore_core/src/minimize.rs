//! Small dense minimizers for the step-size searches.
//!
//! - `projected_bfgs`: box-bounded quasi-Newton with central-difference gradients,
//!   projected backtracking line search and an inverse-Hessian BFGS update.
//! - `nelder_mead`: derivative-free simplex search, optionally clipped to a box.
//! - `bounded_scalar`: Brent's bounded 1-D minimizer (golden section + parabolic steps).
//!
//! All three return a report instead of failing when they run out of iterations;
//! only malformed inputs are errors.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MinimizeSettings {
    pub max_iterations: usize,
    /// Relative decrease of f below which quasi-Newton iteration stops.
    pub ftol: f64,
    /// Projected-gradient infinity norm below which quasi-Newton iteration stops.
    pub gtol: f64,
    /// Simplex size below which Nelder-Mead stops (together with `fatol`).
    pub xatol: f64,
    pub fatol: f64,
    /// Central-difference step, scaled by `max(1, |x_i|)`.
    pub fd_step: f64,
}

impl Default for MinimizeSettings {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            ftol: 1e-12,
            gtol: 1e-8,
            xatol: 1e-12,
            fatol: 1e-12,
            fd_step: 1e-8,
        }
    }
}

impl MinimizeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            bail!("max_iterations must be greater than zero.");
        }
        for (name, value) in [
            ("ftol", self.ftol),
            ("gtol", self.gtol),
            ("xatol", self.xatol),
            ("fatol", self.fatol),
            ("fd_step", self.fd_step),
        ] {
            if !(value.is_finite() && value > 0.0) {
                bail!("{} must be positive.", name);
            }
        }
        Ok(())
    }
}

/// Per-coordinate `[lower, upper]` box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxBounds {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl BoxBounds {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        if lower.len() != upper.len() {
            bail!(
                "Bounds dimension mismatch: {} lower vs {} upper.",
                lower.len(),
                upper.len()
            );
        }
        for (i, (lo, hi)) in lower.iter().zip(&upper).enumerate() {
            if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                bail!("Invalid bound at index {}: [{}, {}].", i, lo, hi);
            }
        }
        Ok(Self { lower, upper })
    }

    pub fn uniform(dim: usize, lo: f64, hi: f64) -> Result<Self> {
        Self::new(vec![lo; dim], vec![hi; dim])
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    pub fn project(&self, x: &mut [f64]) {
        for ((v, lo), hi) in x.iter_mut().zip(&self.lower).zip(&self.upper) {
            *v = v.clamp(*lo, *hi);
        }
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        x.len() == self.dim()
            && x
                .iter()
                .zip(&self.lower)
                .zip(&self.upper)
                .all(|((v, lo), hi)| *lo <= *v && *v <= *hi)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimizeReport {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub converged: bool,
    pub message: String,
}

/// Wraps an objective so NaN reads as +∞ and evaluations are counted.
struct Counted<F> {
    f: F,
    evaluations: usize,
}

impl<F: FnMut(&[f64]) -> f64> Counted<F> {
    fn eval(&mut self, x: &[f64]) -> f64 {
        self.evaluations += 1;
        let v = (self.f)(x);
        if v.is_nan() {
            f64::INFINITY
        } else {
            v
        }
    }
}

/// Central differences inside the box, one-sided at an active bound.
fn gradient<F: FnMut(&[f64]) -> f64>(
    objective: &mut Counted<F>,
    x: &[f64],
    bounds: &BoxBounds,
    step: f64,
) -> DVector<f64> {
    let mut grad = DVector::zeros(x.len());
    let mut probe = x.to_vec();
    for i in 0..x.len() {
        let h = step * x[i].abs().max(1.0);
        let hi = (x[i] + h).min(bounds.upper[i]);
        let lo = (x[i] - h).max(bounds.lower[i]);
        if hi <= lo {
            continue;
        }
        probe[i] = hi;
        let f_hi = objective.eval(&probe);
        probe[i] = lo;
        let f_lo = objective.eval(&probe);
        probe[i] = x[i];
        grad[i] = (f_hi - f_lo) / (hi - lo);
    }
    grad
}

fn projected_gradient_norm(x: &[f64], grad: &DVector<f64>, bounds: &BoxBounds) -> f64 {
    x.iter()
        .enumerate()
        .map(|(i, &v)| (v - (v - grad[i]).clamp(bounds.lower[i], bounds.upper[i])).abs())
        .fold(0.0, f64::max)
}

/// Box-constrained quasi-Newton minimization.
pub fn projected_bfgs<F: FnMut(&[f64]) -> f64>(
    f: F,
    x0: &[f64],
    bounds: &BoxBounds,
    settings: &MinimizeSettings,
) -> Result<MinimizeReport> {
    settings.validate()?;
    let n = x0.len();
    if n == 0 {
        bail!("Initial point has zero dimension.");
    }
    if bounds.dim() != n {
        bail!(
            "Initial point dimension mismatch. Expected {}, got {}.",
            bounds.dim(),
            n
        );
    }

    let mut objective = Counted { f, evaluations: 0 };
    let mut x = x0.to_vec();
    bounds.project(&mut x);
    let mut fx = objective.eval(&x);
    if !fx.is_finite() {
        bail!("Objective is not finite at the initial point.");
    }
    let mut grad = gradient(&mut objective, &x, bounds, settings.fd_step);
    let mut h_inv = DMatrix::<f64>::identity(n, n);

    let mut converged = false;
    let mut message = format!("Reached the iteration limit ({}).", settings.max_iterations);
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        if projected_gradient_norm(&x, &grad, bounds) <= settings.gtol {
            converged = true;
            message = "Projected gradient below tolerance.".to_string();
            break;
        }
        iterations += 1;

        let active: Vec<bool> = (0..n)
            .map(|i| {
                (x[i] <= bounds.lower[i] && grad[i] > 0.0)
                    || (x[i] >= bounds.upper[i] && grad[i] < 0.0)
            })
            .collect();

        let mut direction = -(&h_inv * &grad);
        for (d, &is_active) in direction.iter_mut().zip(&active) {
            if is_active {
                *d = 0.0;
            }
        }
        if direction.dot(&grad) >= 0.0 {
            h_inv.fill_with_identity();
            direction = -grad.clone();
            for (d, &is_active) in direction.iter_mut().zip(&active) {
                if is_active {
                    *d = 0.0;
                }
            }
        }

        // Projected backtracking (Armijo) along the search direction.
        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..60 {
            let mut trial: Vec<f64> = x.iter().zip(direction.iter()).map(|(v, d)| v + alpha * d).collect();
            bounds.project(&mut trial);
            let decrease: f64 = trial
                .iter()
                .zip(&x)
                .enumerate()
                .map(|(i, (t, v))| grad[i] * (t - v))
                .sum();
            let f_trial = objective.eval(&trial);
            if f_trial.is_finite() && f_trial <= fx + 1e-4 * decrease {
                accepted = Some((trial, f_trial));
                break;
            }
            alpha *= 0.5;
        }

        let Some((x_new, f_new)) = accepted else {
            converged = projected_gradient_norm(&x, &grad, bounds) <= settings.gtol.sqrt();
            message = "Line search could not decrease the objective.".to_string();
            break;
        };

        let grad_new = gradient(&mut objective, &x_new, bounds, settings.fd_step);
        let s = DVector::from_iterator(n, x_new.iter().zip(&x).map(|(a, b)| a - b));
        let y = &grad_new - &grad;
        let sy = s.dot(&y);
        if sy > 1e-16 {
            if iterations == 1 {
                h_inv *= sy / y.dot(&y);
            }
            let rho = 1.0 / sy;
            let identity = DMatrix::<f64>::identity(n, n);
            let left = &identity - rho * &s * y.transpose();
            let right = &identity - rho * &y * s.transpose();
            h_inv = &left * &h_inv * &right + rho * &s * s.transpose();
        }

        let f_change = (fx - f_new).abs();
        let scale = fx.abs().max(f_new.abs()).max(1.0);
        x = x_new;
        fx = f_new;
        grad = grad_new;

        if f_change <= settings.ftol * scale {
            converged = true;
            message = "Relative reduction of f below tolerance.".to_string();
            break;
        }
    }

    Ok(MinimizeReport {
        x,
        value: fx,
        iterations,
        evaluations: objective.evaluations,
        converged,
        message,
    })
}

/// Nelder-Mead simplex search. With `bounds`, every trial point is clipped into the box.
pub fn nelder_mead<F: FnMut(&[f64]) -> f64>(
    f: F,
    x0: &[f64],
    bounds: Option<&BoxBounds>,
    settings: &MinimizeSettings,
) -> Result<MinimizeReport> {
    settings.validate()?;
    let n = x0.len();
    if n == 0 {
        bail!("Initial point has zero dimension.");
    }
    if let Some(b) = bounds {
        if b.dim() != n {
            bail!("Initial point dimension mismatch. Expected {}, got {}.", b.dim(), n);
        }
    }

    const REFLECT: f64 = 1.0;
    const EXPAND: f64 = 2.0;
    const CONTRACT: f64 = 0.5;
    const SHRINK: f64 = 0.5;

    let clip = |p: &mut Vec<f64>| {
        if let Some(b) = bounds {
            b.project(p);
        }
    };

    let mut objective = Counted { f, evaluations: 0 };
    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    let mut start = x0.to_vec();
    clip(&mut start);
    simplex.push(start.clone());
    for i in 0..n {
        let mut vertex = start.clone();
        vertex[i] = if vertex[i] != 0.0 { vertex[i] * 1.05 } else { 0.00025 };
        clip(&mut vertex);
        if vertex[i] == start[i] {
            // pinned at a bound: step inwards instead
            vertex[i] = start[i] * 0.95;
            clip(&mut vertex);
        }
        simplex.push(vertex);
    }
    let mut values: Vec<f64> = simplex.iter().map(|p| objective.eval(p)).collect();

    let mut iterations = 0;
    let mut converged = false;
    while iterations < settings.max_iterations {
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        simplex = order.iter().map(|&k| simplex[k].clone()).collect();
        values = order.iter().map(|&k| values[k]).collect();

        let x_spread = simplex[1..]
            .iter()
            .flat_map(|p| p.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        let f_spread = values[1..]
            .iter()
            .map(|v| (v - values[0]).abs())
            .fold(0.0, f64::max);
        if x_spread <= settings.xatol && f_spread <= settings.fatol {
            converged = true;
            break;
        }
        iterations += 1;

        let centroid: Vec<f64> = (0..n)
            .map(|k| simplex[..n].iter().map(|p| p[k]).sum::<f64>() / n as f64)
            .collect();
        let along = |coef: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(&simplex[n])
                .map(|(c, w)| c + coef * (c - w))
                .collect()
        };

        let mut reflected = along(REFLECT);
        clip(&mut reflected);
        let f_reflected = objective.eval(&reflected);

        if f_reflected < values[0] {
            let mut expanded = along(REFLECT * EXPAND);
            clip(&mut expanded);
            let f_expanded = objective.eval(&expanded);
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                values[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                values[n] = f_reflected;
            }
            continue;
        }
        if f_reflected < values[n - 1] {
            simplex[n] = reflected;
            values[n] = f_reflected;
            continue;
        }

        let shrink_needed = if f_reflected < values[n] {
            let mut outside = along(CONTRACT * REFLECT);
            clip(&mut outside);
            let f_outside = objective.eval(&outside);
            if f_outside <= f_reflected {
                simplex[n] = outside;
                values[n] = f_outside;
                false
            } else {
                true
            }
        } else {
            let mut inside = along(-CONTRACT);
            clip(&mut inside);
            let f_inside = objective.eval(&inside);
            if f_inside < values[n] {
                simplex[n] = inside;
                values[n] = f_inside;
                false
            } else {
                true
            }
        };

        if shrink_needed {
            for j in 1..=n {
                let mut shrunk: Vec<f64> = simplex[0]
                    .iter()
                    .zip(&simplex[j])
                    .map(|(best, p)| best + SHRINK * (p - best))
                    .collect();
                clip(&mut shrunk);
                values[j] = objective.eval(&shrunk);
                simplex[j] = shrunk;
            }
        }
    }

    let best = (0..=n)
        .min_by(|&a, &b| values[a].total_cmp(&values[b]))
        .unwrap_or(0);
    let message = if converged {
        "Simplex converged.".to_string()
    } else {
        format!("Reached the iteration limit ({}).", settings.max_iterations)
    };
    Ok(MinimizeReport {
        x: simplex[best].clone(),
        value: values[best],
        iterations,
        evaluations: objective.evaluations,
        converged,
        message,
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalarReport {
    pub x: f64,
    pub value: f64,
    pub evaluations: usize,
    pub converged: bool,
}

/// Brent's method on `[a, b]`, stopping at absolute tolerance `xatol` or `max_evaluations`.
pub fn bounded_scalar<F: FnMut(f64) -> f64>(
    mut f: F,
    (lower, upper): (f64, f64),
    xatol: f64,
    max_evaluations: usize,
) -> Result<ScalarReport> {
    if !(lower.is_finite() && upper.is_finite()) || lower > upper {
        bail!("Invalid scalar bounds [{}, {}].", lower, upper);
    }
    if !(xatol.is_finite() && xatol > 0.0) {
        bail!("xatol must be positive.");
    }
    if max_evaluations == 0 {
        bail!("max_evaluations must be greater than zero.");
    }

    let mut eval = |x: f64| {
        let v = f(x);
        if v.is_nan() {
            f64::INFINITY
        } else {
            v
        }
    };

    let sqrt_eps = f64::EPSILON.sqrt();
    let golden_mean = 0.5 * (3.0 - 5.0f64.sqrt());
    let (mut a, mut b) = (lower, upper);
    let mut fulc = a + golden_mean * (b - a);
    let mut nfc = fulc;
    let mut xf = fulc;
    let mut rat: f64 = 0.0;
    let mut e: f64 = 0.0;
    let mut fx = eval(xf);
    let mut evaluations = 1;
    let mut ffulc = fx;
    let mut fnfc = fx;
    let mut xm = 0.5 * (a + b);
    let mut tol1 = sqrt_eps * xf.abs() + xatol / 3.0;
    let mut tol2 = 2.0 * tol1;
    let mut converged = true;

    while (xf - xm).abs() > tol2 - 0.5 * (b - a) {
        let mut golden = true;
        if e.abs() > tol1 {
            golden = false;
            let mut r = (xf - nfc) * (fx - ffulc);
            let mut q = (xf - fulc) * (fx - fnfc);
            let mut p = (xf - fulc) * q - (xf - nfc) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            r = e;
            e = rat;
            if p.abs() < (0.5 * q * r).abs() && p > q * (a - xf) && p < q * (b - xf) {
                rat = p / q;
                let x = xf + rat;
                if (x - a) < tol2 || (b - x) < tol2 {
                    let si = if xm - xf >= 0.0 { 1.0 } else { -1.0 };
                    rat = tol1 * si;
                }
            } else {
                golden = true;
            }
        }
        if golden {
            e = if xf >= xm { a - xf } else { b - xf };
            rat = golden_mean * e;
        }

        let si = if rat >= 0.0 { 1.0 } else { -1.0 };
        let x = xf + si * rat.abs().max(tol1);
        let fu = eval(x);
        evaluations += 1;

        if fu <= fx {
            if x >= xf {
                a = xf;
            } else {
                b = xf;
            }
            fulc = nfc;
            ffulc = fnfc;
            nfc = xf;
            fnfc = fx;
            xf = x;
            fx = fu;
        } else {
            if x < xf {
                a = x;
            } else {
                b = x;
            }
            if fu <= fnfc || nfc == xf {
                fulc = nfc;
                ffulc = fnfc;
                nfc = x;
                fnfc = fu;
            } else if fu <= ffulc || fulc == xf || fulc == nfc {
                fulc = x;
                ffulc = fu;
            }
        }

        xm = 0.5 * (a + b);
        tol1 = sqrt_eps * xf.abs() + xatol / 3.0;
        tol2 = 2.0 * tol1;

        if evaluations >= max_evaluations {
            converged = false;
            break;
        }
    }

    Ok(ScalarReport {
        x: xf,
        value: fx,
        evaluations,
        converged: converged && fx.is_finite(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rosenbrock(x: &[f64]) -> f64 {
        (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2)
    }

    #[test]
    fn bfgs_solves_unconstrained_quadratic() {
        let bounds = BoxBounds::uniform(2, -10.0, 10.0).expect("bounds");
        let report = projected_bfgs(
            |x| (x[0] - 1.0).powi(2) + 3.0 * (x[1] + 2.0).powi(2),
            &[0.0, 0.0],
            &bounds,
            &MinimizeSettings::default(),
        )
        .expect("bfgs");
        assert!(report.converged, "{}", report.message);
        assert!((report.x[0] - 1.0).abs() < 1e-5);
        assert!((report.x[1] + 2.0).abs() < 1e-5);
    }

    #[test]
    fn bfgs_stops_on_active_bound() {
        let bounds = BoxBounds::new(vec![2.0, -1.0], vec![5.0, 1.0]).expect("bounds");
        let report = projected_bfgs(
            |x| x[0] * x[0] + x[1] * x[1],
            &[4.0, 0.5],
            &bounds,
            &MinimizeSettings::default(),
        )
        .expect("bfgs");
        assert!((report.x[0] - 2.0).abs() < 1e-9);
        assert!(report.x[1].abs() < 1e-5);
        assert!(bounds.contains(&report.x));
    }

    #[test]
    fn bfgs_rejects_dimension_mismatch() {
        let bounds = BoxBounds::uniform(3, 0.0, 1.0).expect("bounds");
        let err = projected_bfgs(|x| x[0], &[0.5], &bounds, &MinimizeSettings::default())
            .expect_err("mismatch");
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn nelder_mead_finds_rosenbrock_minimum() {
        let settings = MinimizeSettings {
            max_iterations: 5000,
            xatol: 1e-10,
            fatol: 1e-14,
            ..MinimizeSettings::default()
        };
        let report = nelder_mead(rosenbrock, &[-1.2, 1.0], None, &settings).expect("nm");
        assert!(report.converged);
        assert!((report.x[0] - 1.0).abs() < 1e-4);
        assert!((report.x[1] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn nelder_mead_respects_bounds() {
        let bounds = BoxBounds::uniform(2, 0.5, 3.0).expect("bounds");
        let report = nelder_mead(
            |x| x[0] * x[0] + x[1] * x[1],
            &[2.0, 2.0],
            Some(&bounds),
            &MinimizeSettings::default(),
        )
        .expect("nm");
        assert!(bounds.contains(&report.x));
        assert!((report.x[0] - 0.5).abs() < 1e-4);
        assert!((report.x[1] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn bounded_scalar_matches_interior_minimum() {
        let report = bounded_scalar(|x| (x - 0.3).powi(2) + 1.0, (-1.0, 2.0), 1e-12, 500).expect("brent");
        assert!(report.converged);
        assert!((report.x - 0.3).abs() < 1e-7);
        assert!((report.value - 1.0).abs() < 1e-14);
    }

    #[test]
    fn bounded_scalar_approaches_the_boundary() {
        let report = bounded_scalar(|x| x, (-0.2, -0.001), 1e-12, 1000).expect("brent");
        assert!(report.x >= -0.2 && report.x <= -0.001);
        assert!((report.x + 0.2).abs() < 1e-6);
    }

    #[test]
    fn bounded_scalar_rejects_reversed_bounds() {
        assert!(bounded_scalar(|x| x, (1.0, 0.0), 1e-9, 10).is_err());
    }

    #[test]
    fn box_bounds_reject_inverted_entries() {
        let err = BoxBounds::new(vec![0.0, 2.0], vec![1.0, 1.0]).expect_err("inverted");
        assert!(err.to_string().contains("index 1"));
    }
}
