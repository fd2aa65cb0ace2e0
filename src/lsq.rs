use nalgebra::{DMatrix, DVector};
use std::fmt;

const INITIAL_LAMBDA: f64 = 1e-3;
const MIN_LAMBDA: f64 = 1e-12;
const MAX_LAMBDA: f64 = 1e16;
const MIN_DIAG: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LsqOptions {
    pub x_tol: f64,
    pub f_tol: f64,
    pub g_tol: f64,
    /// Relative finite-difference step.
    pub diff_step: f64,
    pub max_evals: usize,
}

/// Criterion that ended a successful minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    CostReduction,
    StepSize,
    Gradient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LsqSolution {
    pub x: Vec<f64>,
    pub cost: f64,
    pub n_evals: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LsqError {
    NoFiniteResiduals,
    EvaluationBudget { max_evals: usize },
    NonFiniteCost,
}

impl fmt::Display for LsqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFiniteResiduals => f.write_str("no finite residuals at the starting point"),
            Self::EvaluationBudget { max_evals } => {
                write!(f, "no convergence within {max_evals} evaluations")
            }
            Self::NonFiniteCost => f.write_str("final cost is not finite"),
        }
    }
}

impl std::error::Error for LsqError {}

/// Minimize `0.5 * sum(r_i^2)` within `[lower, upper]`.
///
/// The starting point is projected into the box first. Residuals that are not
/// finite are omitted, and a trial point that loses finite residuals is
/// rejected. Fields sitting on a bound that the gradient pushes outward are
/// held fixed for the step.
pub fn minimize<F>(
    mut residuals: F,
    x0: &[f64],
    lower: &[f64],
    upper: &[f64],
    opts: &LsqOptions,
) -> Result<LsqSolution, LsqError>
where
    F: FnMut(&[f64]) -> Vec<f64>,
{
    let n = x0.len();
    let mut x = project(x0.to_vec(), lower, upper);
    let mut r = residuals(&x);
    let mut n_evals = 1;
    let (mut cost, _) = cost_of(&r).ok_or(LsqError::NoFiniteResiduals)?;
    let mut lambda = INITIAL_LAMBDA;

    let finish = |x: Vec<f64>, cost: f64, n_evals: usize, termination: Termination| {
        if !cost.is_finite() {
            return Err(LsqError::NonFiniteCost);
        }
        Ok(LsqSolution {
            x,
            cost,
            n_evals,
            termination,
        })
    };

    loop {
        let rows: Vec<usize> = (0..r.len()).filter(|&i| r[i].is_finite()).collect();

        let mut jac = DMatrix::<f64>::zeros(rows.len(), n);
        for j in 0..n {
            if n_evals >= opts.max_evals {
                return Err(LsqError::EvaluationBudget {
                    max_evals: opts.max_evals,
                });
            }
            let mut h = opts.diff_step * (1.0 + x[j].abs());
            if x[j] + h > upper[j] {
                h = -h;
            }
            let mut x_h = x.clone();
            x_h[j] += h;
            let r_h = residuals(&x_h);
            n_evals += 1;
            for (row, &i) in rows.iter().enumerate() {
                let d = (r_h[i] - r[i]) / h;
                jac[(row, j)] = if d.is_finite() { d } else { 0.0 };
            }
        }

        let r_vec = DVector::from_iterator(rows.len(), rows.iter().map(|&i| r[i]));
        let jac_t = jac.transpose();
        let grad = &jac_t * &r_vec;
        let hess = &jac_t * &jac;

        let active: Vec<bool> = (0..n)
            .map(|j| {
                (x[j] <= lower[j] && grad[j] > 0.0) || (x[j] >= upper[j] && grad[j] < 0.0)
            })
            .collect();
        let free: Vec<usize> = (0..n).filter(|&j| !active[j]).collect();

        let projected_grad = free.iter().fold(0.0, |max: f64, &j| max.max(grad[j].abs()));
        if projected_grad <= opts.g_tol {
            return finish(x, cost, n_evals, Termination::Gradient);
        }

        let m = free.len();
        let hess_free = DMatrix::from_fn(m, m, |a, b| hess[(free[a], free[b])]);
        let grad_free = DVector::from_fn(m, |a, _| -grad[free[a]]);

        loop {
            if lambda > MAX_LAMBDA {
                return finish(x, cost, n_evals, Termination::StepSize);
            }
            if n_evals >= opts.max_evals {
                return Err(LsqError::EvaluationBudget {
                    max_evals: opts.max_evals,
                });
            }

            let mut damped = hess_free.clone();
            for a in 0..m {
                damped[(a, a)] += lambda * hess_free[(a, a)].max(MIN_DIAG);
            }
            let Some(cholesky) = damped.cholesky() else {
                lambda *= 10.0;
                continue;
            };
            let step = cholesky.solve(&grad_free);
            let mut delta = vec![0.0; n];
            for (a, &j) in free.iter().enumerate() {
                delta[j] = step[a];
            }

            let trial: Vec<f64> = x.iter().zip(delta.iter()).map(|(x, d)| x + d).collect();
            let trial = project(trial, lower, upper);
            let step_norm = norm(trial.iter().zip(&x).map(|(a, b)| a - b));
            let x_norm = norm(x.iter().copied());
            if step_norm <= opts.x_tol * (opts.x_tol + x_norm) {
                return finish(x, cost, n_evals, Termination::StepSize);
            }

            let r_trial = residuals(&trial);
            n_evals += 1;
            match cost_of(&r_trial) {
                Some((trial_cost, n_finite)) if n_finite >= rows.len() && trial_cost < cost => {
                    let reduction = cost - trial_cost;
                    let prev_cost = cost;
                    x = trial;
                    r = r_trial;
                    cost = trial_cost;
                    lambda = (lambda * 0.3).max(MIN_LAMBDA);
                    if cost == 0.0 || reduction <= opts.f_tol * prev_cost {
                        return finish(x, cost, n_evals, Termination::CostReduction);
                    }
                    break;
                }
                _ => lambda *= 10.0,
            }
        }
    }
}

/// Half the sum of squares of the finite residuals, and how many there are.
fn cost_of(r: &[f64]) -> Option<(f64, usize)> {
    let finite: Vec<f64> = r.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let cost = 0.5 * finite.iter().map(|v| v * v).sum::<f64>();
    Some((cost, finite.len()))
}

fn project(mut x: Vec<f64>, lower: &[f64], upper: &[f64]) -> Vec<f64> {
    for ((xi, &lo), &hi) in x.iter_mut().zip(lower).zip(upper) {
        *xi = xi.clamp(lo, hi);
    }
    x
}

fn norm<I: Iterator<Item = f64>>(values: I) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}
