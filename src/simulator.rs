use crate::config::SolverConfig;
use crate::error::SimulationFailure;
use crate::model::{TumorState, derivative};
use crate::params::ModelParameters;
use crate::policy::{
    Outcome, Terminal, Thresholds, TreatmentInterval, TreatmentPolicy, TreatmentSchedule,
};
use crate::solver::DormandPrince;
use std::ops::ControlFlow;

/// Tumour state at one accepted solver step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: f64,
    pub state: TumorState,
}

/// Result of one simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    /// Samples in increasing time order, from the start to the last simulated time.
    pub samples: Vec<Sample>,
    /// Realized treatment schedule.
    pub schedule: TreatmentSchedule,
    pub outcome: Outcome,
}

impl Trajectory {
    /// Burden at `time`, interpolated linearly between samples.
    ///
    /// Returns `None` outside the simulated time span.
    pub fn burden_at(&self, time: f64) -> Option<f64> {
        let idx = self.samples.partition_point(|sample| sample.time < time);
        let next = self.samples.get(idx)?;
        if next.time == time {
            return Some(next.state.burden());
        }
        let prev = self.samples.get(idx.checked_sub(1)?)?;
        let u = (time - prev.time) / (next.time - prev.time);
        Some(prev.state.lerp(&next.state, u).burden())
    }

    pub fn final_state(&self) -> TumorState {
        self.samples
            .last()
            .map(|sample| sample.state)
            .unwrap_or(TumorState::new(0.0, 0.0))
    }

    #[cfg(test)]
    pub fn end_time(&self) -> f64 {
        self.samples.last().map_or(f64::NAN, |sample| sample.time)
    }
}

/// Time span, control interval and optional terminal thresholds of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSpec {
    pub start: f64,
    pub end: f64,
    pub interval: f64,
    pub thresholds: Option<Thresholds>,
}

/// Integrates the tumour model for one parameter set.
pub struct Simulator<'a> {
    params: &'a ModelParameters,
    solver: DormandPrince,
}

impl<'a> Simulator<'a> {
    pub fn new(params: &'a ModelParameters, cfg: &SolverConfig) -> Self {
        Self {
            params,
            solver: DormandPrince::new(cfg).non_negative(),
        }
    }

    /// Simulate from `initial` at `spec.start` until `spec.end` or a terminal event.
    ///
    /// The policy is consulted at the start of every segment; the drug level
    /// stays constant until the policy's next decision time.
    pub fn run(
        &self,
        initial: TumorState,
        policy: &mut TreatmentPolicy,
        spec: &RunSpec,
    ) -> Result<Trajectory, SimulationFailure> {
        let baseline = initial.burden();
        let mut samples = vec![Sample {
            time: spec.start,
            state: initial,
        }];
        let mut schedule = TreatmentSchedule::new();

        if let Some(terminal) = spec
            .thresholds
            .and_then(|thresholds| thresholds.check(baseline, baseline))
        {
            return Ok(Trajectory {
                samples,
                schedule,
                outcome: outcome_of(terminal, 0.0),
            });
        }

        let mut time = spec.start;
        let mut state = initial;
        while time < spec.end {
            let decision = policy.decide(time, state.burden(), baseline, spec.interval);
            let segment_end = decision.until.min(spec.end);
            if !(segment_end > time) {
                break;
            }
            schedule.push(TreatmentInterval {
                start: time,
                end: segment_end,
                administered: decision.administered,
            });
            let drug = if decision.administered {
                self.params.drug_max
            } else {
                0.0
            };

            let mut prev = Sample { time, state };
            let mut hit = None;
            let integration = self.solver.integrate(
                |_, y| derivative(*y, self.params, drug),
                time,
                segment_end,
                state.to_array(),
                |t, y| {
                    let current = TumorState::from_array(*y);
                    let terminal = spec.thresholds.and_then(|thresholds| {
                        thresholds
                            .check(current.burden(), baseline)
                            .map(|terminal| (thresholds.level(terminal, baseline), terminal))
                    });
                    if let Some((level, terminal)) = terminal {
                        hit = Some((crossing(&prev, t, &current, level), terminal));
                        return ControlFlow::Break(());
                    }
                    samples.push(Sample {
                        time: t,
                        state: current,
                    });
                    prev = Sample {
                        time: t,
                        state: current,
                    };
                    ControlFlow::Continue(())
                },
            )?;

            if let Some((sample, terminal)) = hit {
                schedule.truncate_at(sample.time);
                samples.push(sample);
                return Ok(Trajectory {
                    samples,
                    schedule,
                    outcome: outcome_of(terminal, sample.time - spec.start),
                });
            }

            time = segment_end;
            state = TumorState::from_array(integration.state);
            if samples.last().is_some_and(|sample| sample.time < time) {
                samples.push(Sample { time, state });
            }
        }

        Ok(Trajectory {
            samples,
            schedule,
            outcome: Outcome::Censored,
        })
    }
}

/// Point where the burden crosses `level` between `prev` and `(t, current)`.
fn crossing(prev: &Sample, t: f64, current: &TumorState, level: f64) -> Sample {
    let b0 = prev.state.burden();
    let b1 = current.burden();
    let u = if b1 != b0 {
        ((level - b0) / (b1 - b0)).clamp(0.0, 1.0)
    } else {
        1.0
    };
    Sample {
        time: prev.time + u * (t - prev.time),
        state: prev.state.lerp(current, u),
    }
}

fn outcome_of(terminal: Terminal, elapsed: f64) -> Outcome {
    match terminal {
        Terminal::Progression => Outcome::Progressed { ttp: elapsed },
        Terminal::Cure => Outcome::Cured { time: elapsed },
    }
}

#[cfg(test)]
pub(crate) fn test_solver_config() -> SolverConfig {
    SolverConfig {
        abs_err: 1e-8,
        rel_err: 1e-6,
        max_step: 1.0,
        max_steps: 100_000,
    }
}
