use crate::config::SolverConfig;
use crate::error::SimulationFailure;
use std::ops::ControlFlow;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 5th-order weights (propagated solution).
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// 5th minus 4th order weights (error estimate).
const E1: f64 = B1 - 5179.0 / 57600.0;
const E3: f64 = B3 - 7571.0 / 16695.0;
const E4: f64 = B4 - 393.0 / 640.0;
const E5: f64 = B5 - -92097.0 / 339200.0;
const E6: f64 = B6 - 187.0 / 2100.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

/// Where an integration ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integration<const N: usize> {
    pub time: f64,
    pub state: [f64; N],
    /// The step callback requested an early stop.
    pub stopped: bool,
}

/// Dormand–Prince 5(4) with elementary error-per-step control.
#[derive(Debug, Clone)]
pub struct DormandPrince {
    abs_err: f64,
    rel_err: f64,
    max_step: f64,
    max_steps: usize,
    non_negative: bool,
}

impl DormandPrince {
    pub fn new(cfg: &SolverConfig) -> Self {
        Self {
            abs_err: cfg.abs_err,
            rel_err: cfg.rel_err,
            max_step: cfg.max_step,
            max_steps: cfg.max_steps,
            non_negative: false,
        }
    }

    /// Project negative components back to zero after every accepted step.
    pub fn non_negative(mut self) -> Self {
        self.non_negative = true;
        self
    }

    /// Integrate `dy/dt = rhs(t, y)` from `t0` to `t1`.
    ///
    /// `on_step` sees every accepted `(t, y)`, the final one included.
    pub fn integrate<const N: usize, F, C>(
        &self,
        rhs: F,
        t0: f64,
        t1: f64,
        y0: [f64; N],
        mut on_step: C,
    ) -> Result<Integration<N>, SimulationFailure>
    where
        F: Fn(f64, &[f64; N]) -> [f64; N],
        C: FnMut(f64, &[f64; N]) -> ControlFlow<()>,
    {
        let mut t = t0;
        let mut y = y0;
        if !(t1 > t0) {
            return Ok(Integration {
                time: t,
                state: y,
                stopped: false,
            });
        }

        let mut k1 = rhs(t, &y);
        if !all_finite(&y) || !all_finite(&k1) {
            return Err(SimulationFailure::NonFiniteState { time: t });
        }
        let mut h = self.initial_step(&y, &k1, t1 - t0);

        let mut n_steps = 0;
        while t < t1 {
            let h_min = 16.0 * f64::EPSILON * t.abs().max(1.0);
            let remaining = t1 - t;
            if remaining <= h_min {
                break;
            }
            if n_steps >= self.max_steps {
                return Err(SimulationFailure::MaxStepsExceeded {
                    time: t,
                    max_steps: self.max_steps,
                });
            }
            if h < h_min {
                return Err(SimulationFailure::StepSizeUnderflow { time: t, step: h });
            }
            n_steps += 1;

            let last = h >= remaining;
            if last {
                h = remaining;
            }

            let k2 = rhs(t + h / 5.0, &combine(&y, h, &[(A21, &k1)]));
            let k3 = rhs(
                t + 3.0 * h / 10.0,
                &combine(&y, h, &[(A31, &k1), (A32, &k2)]),
            );
            let k4 = rhs(
                t + 4.0 * h / 5.0,
                &combine(&y, h, &[(A41, &k1), (A42, &k2), (A43, &k3)]),
            );
            let k5 = rhs(
                t + 8.0 * h / 9.0,
                &combine(&y, h, &[(A51, &k1), (A52, &k2), (A53, &k3), (A54, &k4)]),
            );
            let k6 = rhs(
                t + h,
                &combine(
                    &y,
                    h,
                    &[(A61, &k1), (A62, &k2), (A63, &k3), (A64, &k4), (A65, &k5)],
                ),
            );
            let y_new = combine(
                &y,
                h,
                &[(B1, &k1), (B3, &k3), (B4, &k4), (B5, &k5), (B6, &k6)],
            );
            let k7 = rhs(t + h, &y_new);

            let mut err_sum = 0.0;
            for i in 0..N {
                let err = h
                    * (E1 * k1[i]
                        + E3 * k3[i]
                        + E4 * k4[i]
                        + E5 * k5[i]
                        + E6 * k6[i]
                        + E7 * k7[i]);
                let scale = self.abs_err + self.rel_err * y[i].abs().max(y_new[i].abs());
                err_sum += (err / scale).powi(2);
            }
            let err_norm = (err_sum / N as f64).sqrt();

            if !err_norm.is_finite() {
                h *= MIN_FACTOR;
                continue;
            }
            if err_norm > 1.0 {
                h *= (SAFETY * err_norm.powf(-0.2)).max(MIN_FACTOR);
                continue;
            }

            t = if last { t1 } else { t + h };
            y = y_new;
            k1 = k7;
            if self.non_negative && y.iter().any(|&yi| yi < 0.0) {
                y.iter_mut().for_each(|yi| *yi = yi.max(0.0));
                k1 = rhs(t, &y);
            }
            if !all_finite(&y) || !all_finite(&k1) {
                return Err(SimulationFailure::NonFiniteState { time: t });
            }

            if on_step(t, &y).is_break() {
                return Ok(Integration {
                    time: t,
                    state: y,
                    stopped: true,
                });
            }

            let factor = if err_norm == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err_norm.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
            };
            h = (h * factor).min(self.max_step);
        }

        Ok(Integration {
            time: t1,
            state: y,
            stopped: false,
        })
    }

    fn initial_step<const N: usize>(&self, y: &[f64; N], f: &[f64; N], span: f64) -> f64 {
        let mut d0 = 0.0;
        let mut d1 = 0.0;
        for i in 0..N {
            let scale = self.abs_err + self.rel_err * y[i].abs();
            d0 += (y[i] / scale).powi(2);
            d1 += (f[i] / scale).powi(2);
        }
        let d0 = (d0 / N as f64).sqrt();
        let d1 = (d1 / N as f64).sqrt();
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        h0.min(self.max_step).min(span)
    }
}

fn combine<const N: usize>(y: &[f64; N], h: f64, terms: &[(f64, &[f64; N])]) -> [f64; N] {
    let mut out = *y;
    for (coef, k) in terms {
        for i in 0..N {
            out[i] += h * coef * k[i];
        }
    }
    out
}

fn all_finite<const N: usize>(y: &[f64; N]) -> bool {
    y.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solver(max_step: f64) -> DormandPrince {
        DormandPrince::new(&SolverConfig {
            abs_err: 1e-10,
            rel_err: 1e-8,
            max_step,
            max_steps: 100_000,
        })
    }

    #[test]
    fn exponential_decay_is_accurate() {
        let out = solver(f64::INFINITY)
            .integrate(|_, y| [-0.5 * y[0]], 0.0, 10.0, [1.0], |_, _| {
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(out.time, 10.0);
        assert!(!out.stopped);
        assert!((out.state[0] - (-5.0f64).exp()).abs() < 1e-8);
    }

    #[test]
    fn rotation_preserves_norm() {
        let out = solver(0.5)
            .integrate(
                |_, y| [-y[1], y[0]],
                0.0,
                2.0 * std::f64::consts::PI,
                [1.0, 0.0],
                |_, _| ControlFlow::Continue(()),
            )
            .unwrap();
        assert!((out.state[0] - 1.0).abs() < 1e-6);
        assert!(out.state[1].abs() < 1e-6);
    }

    #[test]
    fn steps_respect_max_step_and_callback_can_stop() {
        let mut times = Vec::new();
        let out = solver(0.25)
            .integrate(|_, _| [1.0], 0.0, 10.0, [0.0], |t, y| {
                times.push(t);
                if y[0] >= 2.0 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert!(out.stopped);
        assert!(out.time < 3.0);
        let mut prev = 0.0;
        for &t in &times {
            assert!(t - prev <= 0.25 + 1e-12);
            prev = t;
        }
    }

    #[test]
    fn blow_up_is_reported_as_failure() {
        let result = solver(f64::INFINITY).integrate(
            |_, y| [y[0] * y[0]],
            0.0,
            2.0,
            [1.0],
            |_, _| ControlFlow::Continue(()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn step_budget_is_enforced() {
        let solver = DormandPrince::new(&SolverConfig {
            abs_err: 1e-10,
            rel_err: 1e-8,
            max_step: 0.1,
            max_steps: 5,
        });
        let result = solver.integrate(|_, _| [1.0], 0.0, 10.0, [0.0], |_, _| {
            ControlFlow::Continue(())
        });
        assert!(matches!(
            result,
            Err(SimulationFailure::MaxStepsExceeded { max_steps: 5, .. })
        ));
    }

    #[test]
    fn non_negative_projection_clamps_state() {
        let out = solver(1.0)
            .non_negative()
            .integrate(|_, _| [-1.0], 0.0, 2.0, [0.5], |_, y| {
                assert!(y[0] >= 0.0);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(out.state[0], 0.0);
    }
}
