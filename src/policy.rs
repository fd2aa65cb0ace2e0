use serde::{Deserialize, Serialize};

/// A stretch of time with constant drug administration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreatmentInterval {
    pub start: f64,
    pub end: f64,
    pub administered: bool,
}

/// Contiguous sequence of treatment intervals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreatmentSchedule {
    intervals: Vec<TreatmentInterval>,
}

impl TreatmentSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interval starting where the previous one ended.
    ///
    /// # Panics
    /// Panics if the interval is not contiguous with the last one or is empty.
    pub fn push(&mut self, interval: TreatmentInterval) {
        if let Some(last) = self.intervals.last() {
            assert_eq!(last.end, interval.start, "treatment intervals must be contiguous");
        }
        assert!(interval.end > interval.start, "treatment intervals must be non-empty");
        self.intervals.push(interval);
    }

    pub fn intervals(&self) -> &[TreatmentInterval] {
        &self.intervals
    }

    /// Interval containing `time` (half-open on the right).
    pub fn interval_at(&self, time: f64) -> Option<&TreatmentInterval> {
        let idx = self.intervals.partition_point(|interval| interval.end <= time);
        self.intervals
            .get(idx)
            .filter(|interval| interval.start <= time)
    }

    /// Shorten the last interval so that it ends at `time`.
    pub(crate) fn truncate_at(&mut self, time: f64) {
        if let Some(last) = self.intervals.last_mut() {
            if time > last.start && time < last.end {
                last.end = time;
            }
        }
    }

    /// Total time during which drug was administered.
    pub fn time_on_drug(&self) -> f64 {
        self.intervals
            .iter()
            .filter(|interval| interval.administered)
            .map(|interval| interval.end - interval.start)
            .sum()
    }

    /// Number of treatment cycles (maximal runs of administered intervals).
    pub fn n_cycles(&self) -> usize {
        let mut n_cycles = 0;
        let mut prev = false;
        for interval in &self.intervals {
            if interval.administered && !prev {
                n_cycles += 1;
            }
            prev = interval.administered;
        }
        n_cycles
    }
}

/// State of the adaptive therapy state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdaptiveState {
    On,
    Off,
}

/// What the policy decided for the next segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub administered: bool,
    /// Time at which the policy must be consulted again.
    pub until: f64,
}

/// Decision logic producing the drug level of every control interval.
#[derive(Debug, Clone, PartialEq)]
pub enum TreatmentPolicy {
    /// Drug always administered.
    Continuous,
    /// Treat until the burden falls to `at_threshold` of the baseline, pause
    /// until it regrows to the baseline.
    Adaptive {
        at_threshold: f64,
        state: AdaptiveState,
    },
    /// Reproduce a recorded schedule, holding the last level beyond its end.
    Replay(TreatmentSchedule),
}

impl TreatmentPolicy {
    pub fn adaptive(at_threshold: f64) -> Self {
        Self::Adaptive {
            at_threshold,
            state: AdaptiveState::On,
        }
    }

    /// Decide the drug level from `time` on, given the current and baseline burden.
    pub fn decide(&mut self, time: f64, burden: f64, baseline: f64, interval: f64) -> Decision {
        match self {
            Self::Continuous => Decision {
                administered: true,
                until: time + interval,
            },
            Self::Adaptive {
                at_threshold,
                state,
            } => {
                *state = match *state {
                    AdaptiveState::On if burden <= *at_threshold * baseline => AdaptiveState::Off,
                    AdaptiveState::Off if burden >= baseline => AdaptiveState::On,
                    current => current,
                };
                Decision {
                    administered: *state == AdaptiveState::On,
                    until: time + interval,
                }
            }
            Self::Replay(schedule) => match schedule.interval_at(time) {
                Some(recorded) => Decision {
                    administered: recorded.administered,
                    until: recorded.end,
                },
                None => {
                    let administered = schedule
                        .intervals()
                        .last()
                        .is_some_and(|last| last.administered);
                    Decision {
                        administered,
                        until: f64::INFINITY,
                    }
                }
            },
        }
    }
}

/// Burden thresholds that end a simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Multiple of the baseline burden defining progression.
    pub progression: f64,
    /// Absolute burden defining cure.
    pub cure: f64,
}

/// A terminal event reached by a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminal {
    Progression,
    Cure,
}

impl Thresholds {
    /// Terminal event reached at `burden`, if any. Cure takes precedence.
    pub fn check(&self, burden: f64, baseline: f64) -> Option<Terminal> {
        if burden <= self.cure {
            Some(Terminal::Cure)
        } else if burden >= self.progression * baseline {
            Some(Terminal::Progression)
        } else {
            None
        }
    }

    /// Burden level whose crossing triggers `terminal`.
    pub fn level(&self, terminal: Terminal, baseline: f64) -> f64 {
        match terminal {
            Terminal::Progression => self.progression * baseline,
            Terminal::Cure => self.cure,
        }
    }
}

/// How a simulation ended. At most one terminal event is ever recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Progressed { ttp: f64 },
    Cured { time: f64 },
    Censored,
}

#[cfg(test)]
impl Outcome {
    pub fn ttp(&self) -> Option<f64> {
        match self {
            Self::Progressed { ttp } => Some(*ttp),
            _ => None,
        }
    }

    pub fn is_cured(&self) -> bool {
        matches!(self, Self::Cured { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(start: f64, end: f64, administered: bool) -> TreatmentInterval {
        TreatmentInterval {
            start,
            end,
            administered,
        }
    }

    #[test]
    fn adaptive_policy_switches_on_thresholds() {
        let mut policy = TreatmentPolicy::adaptive(0.5);
        assert!(policy.decide(0.0, 1.0, 1.0, 1.0).administered);
        assert!(policy.decide(1.0, 0.6, 1.0, 1.0).administered);
        assert!(!policy.decide(2.0, 0.5, 1.0, 1.0).administered);
        assert!(!policy.decide(3.0, 0.9, 1.0, 1.0).administered);
        assert!(!policy.decide(4.0, 0.3, 1.0, 1.0).administered);
        let decision = policy.decide(5.0, 1.0, 1.0, 1.0);
        assert!(decision.administered);
        assert_eq!(decision.until, 6.0);
        assert!(policy.decide(6.0, 0.9, 1.0, 1.0).administered);
    }

    #[test]
    fn continuous_policy_always_treats() {
        let mut policy = TreatmentPolicy::Continuous;
        for burden in [0.0, 0.4, 1.0, 5.0] {
            assert!(policy.decide(0.0, burden, 1.0, 2.0).administered);
        }
    }

    #[test]
    fn replay_policy_follows_recorded_schedule() {
        let mut schedule = TreatmentSchedule::new();
        schedule.push(interval(0.0, 10.0, true));
        schedule.push(interval(10.0, 25.0, false));
        let mut policy = TreatmentPolicy::Replay(schedule);

        let decision = policy.decide(0.0, 1.0, 1.0, 1.0);
        assert_eq!((decision.administered, decision.until), (true, 10.0));
        let decision = policy.decide(10.0, 1.0, 1.0, 1.0);
        assert_eq!((decision.administered, decision.until), (false, 25.0));
        let decision = policy.decide(30.0, 1.0, 1.0, 1.0);
        assert!(!decision.administered);
        assert_eq!(decision.until, f64::INFINITY);
    }

    #[test]
    fn schedule_statistics() {
        let mut schedule = TreatmentSchedule::new();
        schedule.push(interval(0.0, 2.0, true));
        schedule.push(interval(2.0, 3.0, true));
        schedule.push(interval(3.0, 5.0, false));
        schedule.push(interval(5.0, 6.5, true));
        assert_eq!(schedule.time_on_drug(), 4.5);
        assert_eq!(schedule.n_cycles(), 2);
        assert_eq!(schedule.interval_at(2.0).unwrap().start, 2.0);
        assert!(schedule.interval_at(6.5).is_none());
        assert!(schedule.interval_at(-1.0).is_none());
    }

    #[test]
    #[should_panic(expected = "contiguous")]
    fn schedule_rejects_gaps() {
        let mut schedule = TreatmentSchedule::new();
        schedule.push(interval(0.0, 1.0, true));
        schedule.push(interval(2.0, 3.0, true));
    }

    #[test]
    fn terminal_conditions_are_exclusive() {
        let thresholds = Thresholds {
            progression: 1.2,
            cure: 1e-7,
        };
        assert_eq!(thresholds.check(1e-8, 1.0), Some(Terminal::Cure));
        assert_eq!(thresholds.check(1.2, 1.0), Some(Terminal::Progression));
        assert_eq!(thresholds.check(1.0, 1.0), None);
        // A degenerate baseline cannot flag both events.
        assert_eq!(thresholds.check(0.0, 0.0), Some(Terminal::Cure));
    }
}
