use crate::config::Config;
use crate::model::TumorState;
use crate::params::Field;
use crate::policy::{Outcome, Thresholds, TreatmentPolicy};
use crate::simulator::{RunSpec, Simulator, Trajectory};
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;

/// How a strategy's simulation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Progressed,
    Cured,
    Censored,
    Failed,
}

/// Summary of one strategy in one grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyOutcome {
    pub kind: OutcomeKind,
    pub ttp: Option<f64>,
    pub cure_time: Option<f64>,
    pub final_burden: f64,
    pub final_resistant_fraction: f64,
    pub time_on_drug: f64,
    pub n_cycles: usize,
}

impl StrategyOutcome {
    fn failed() -> Self {
        Self {
            kind: OutcomeKind::Failed,
            ttp: None,
            cure_time: None,
            final_burden: f64::NAN,
            final_resistant_fraction: f64::NAN,
            time_on_drug: f64::NAN,
            n_cycles: 0,
        }
    }

    fn from_trajectory(trajectory: &Trajectory) -> Self {
        let (kind, ttp, cure_time) = match trajectory.outcome {
            Outcome::Progressed { ttp } => (OutcomeKind::Progressed, Some(ttp), None),
            Outcome::Cured { time } => (OutcomeKind::Cured, None, Some(time)),
            Outcome::Censored => (OutcomeKind::Censored, None, None),
        };
        let state = trajectory.final_state();
        Self {
            kind,
            ttp,
            cure_time,
            final_burden: state.burden(),
            final_resistant_fraction: state.resistant_fraction(),
            time_on_drug: trajectory.schedule.time_on_drug(),
            n_cycles: trajectory.schedule.n_cycles(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    pub turnover: f64,
    pub cost: f64,
    pub ct: StrategyOutcome,
    pub at: StrategyOutcome,
}

impl SweepPoint {
    /// Ratio of adaptive to continuous time to progression, when both progressed.
    pub fn ttp_gain(&self) -> Option<f64> {
        Some(self.at.ttp? / self.ct.ttp?)
    }
}

/// Simulate both strategies for one `(turnover, cost)` cell.
pub fn evaluate_cell(cfg: &Config, turnover: f64, cost: f64) -> SweepPoint {
    let mut set = cfg.model.clone();
    set.fix(Field::Turnover, turnover);
    set.fix(Field::Cost, cost);

    let sweep = &cfg.sweep;
    let initial = TumorState::new(
        sweep.initial_size * (1.0 - sweep.resistant_fraction),
        sweep.initial_size * sweep.resistant_fraction,
    );
    let spec = RunSpec {
        start: 0.0,
        end: cfg.policy.horizon,
        interval: cfg.policy.interval,
        thresholds: Some(Thresholds {
            progression: cfg.policy.progression_threshold,
            cure: cfg.policy.cure_threshold,
        }),
    };

    let params = match set.resolve() {
        Ok(params) => params,
        Err(error) => {
            log::warn!("turnover = {turnover}, cost = {cost}: {error}");
            return SweepPoint {
                turnover,
                cost,
                ct: StrategyOutcome::failed(),
                at: StrategyOutcome::failed(),
            };
        }
    };
    let simulator = Simulator::new(&params, &cfg.solver);
    let simulate = |mut policy: TreatmentPolicy| match simulator.run(initial, &mut policy, &spec)
    {
        Ok(trajectory) => StrategyOutcome::from_trajectory(&trajectory),
        Err(error) => {
            log::warn!("turnover = {turnover}, cost = {cost}: {error}");
            StrategyOutcome::failed()
        }
    };

    SweepPoint {
        turnover,
        cost,
        ct: simulate(TreatmentPolicy::Continuous),
        at: simulate(TreatmentPolicy::adaptive(cfg.policy.at_threshold)),
    }
}

/// All `(turnover, cost)` cells of the configured grid, turnover-major.
pub fn grid(cfg: &Config) -> Vec<(f64, f64)> {
    let costs = cfg.sweep.cost.values();
    cfg.sweep
        .turnover
        .values()
        .into_iter()
        .flat_map(|turnover| costs.iter().map(move |&cost| (turnover, cost)))
        .collect()
}

/// Evaluate `cells` on a pool of `n_workers` threads.
pub fn run(cfg: &Config, cells: &[(f64, f64)]) -> Result<Vec<SweepPoint>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.sweep.n_workers)
        .build()
        .context("failed to build thread pool")?;
    log::info!(
        "sweeping {} cells on {} workers",
        cells.len(),
        cfg.sweep.n_workers
    );

    let points: Vec<SweepPoint> = pool.install(|| {
        cells
            .par_iter()
            .map(|&(turnover, cost)| evaluate_cell(cfg, turnover, cost))
            .collect()
    });

    let n_failed = points
        .iter()
        .filter(|point| {
            point.ct.kind == OutcomeKind::Failed || point.at.kind == OutcomeKind::Failed
        })
        .count();
    log::info!("swept {} cells, {n_failed} with failures", points.len());
    Ok(points)
}

#[derive(Serialize)]
struct SweepRow {
    turnover: f64,
    cost: f64,
    ct_outcome: OutcomeKind,
    ct_ttp: Option<f64>,
    ct_cure_time: Option<f64>,
    ct_final_burden: f64,
    ct_final_resistant_fraction: f64,
    ct_time_on_drug: f64,
    at_outcome: OutcomeKind,
    at_ttp: Option<f64>,
    at_cure_time: Option<f64>,
    at_final_burden: f64,
    at_final_resistant_fraction: f64,
    at_time_on_drug: f64,
    at_n_cycles: usize,
    ttp_gain: Option<f64>,
}

impl From<&SweepPoint> for SweepRow {
    fn from(point: &SweepPoint) -> Self {
        Self {
            turnover: point.turnover,
            cost: point.cost,
            ct_outcome: point.ct.kind,
            ct_ttp: point.ct.ttp,
            ct_cure_time: point.ct.cure_time,
            ct_final_burden: point.ct.final_burden,
            ct_final_resistant_fraction: point.ct.final_resistant_fraction,
            ct_time_on_drug: point.ct.time_on_drug,
            at_outcome: point.at.kind,
            at_ttp: point.at.ttp,
            at_cure_time: point.at.cure_time,
            at_final_burden: point.at.final_burden,
            at_final_resistant_fraction: point.at.final_resistant_fraction,
            at_time_on_drug: point.at.time_on_drug,
            at_n_cycles: point.at.n_cycles,
            ttp_gain: point.ttp_gain(),
        }
    }
}

pub fn save_points<P: AsRef<Path>>(points: &[SweepPoint], file: P) -> Result<()> {
    let file = file.as_ref();
    let mut writer =
        csv::Writer::from_path(file).with_context(|| format!("failed to create {file:?}"))?;
    for point in points {
        writer
            .serialize(SweepRow::from(point))
            .context("failed to serialize sweep point")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {file:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TEST_CONFIG;

    fn test_config() -> Config {
        Config::from_toml(TEST_CONFIG).unwrap()
    }

    fn sorted(mut points: Vec<SweepPoint>) -> Vec<SweepPoint> {
        points.sort_by(|a, b| {
            (a.turnover, a.cost)
                .partial_cmp(&(b.turnover, b.cost))
                .unwrap()
        });
        points
    }

    #[test]
    fn results_do_not_depend_on_evaluation_order() {
        let cfg = test_config();
        let cells = grid(&cfg);
        assert_eq!(cells.len(), 9);
        let forward = run(&cfg, &cells).unwrap();
        let reversed_cells: Vec<_> = cells.iter().rev().copied().collect();
        let reversed = run(&cfg, &reversed_cells).unwrap();
        assert_eq!(sorted(forward), sorted(reversed));
    }

    #[test]
    fn every_strategy_ends_in_exactly_one_way() {
        let cfg = test_config();
        for (turnover, cost) in grid(&cfg) {
            let point = evaluate_cell(&cfg, turnover, cost);
            for outcome in [point.ct, point.at] {
                match outcome.kind {
                    OutcomeKind::Progressed => {
                        assert!(outcome.ttp.is_some() && outcome.cure_time.is_none())
                    }
                    OutcomeKind::Cured => {
                        assert!(outcome.ttp.is_none() && outcome.cure_time.is_some())
                    }
                    OutcomeKind::Censored => {
                        assert!(outcome.ttp.is_none() && outcome.cure_time.is_none())
                    }
                    OutcomeKind::Failed => panic!("simulation failed at {turnover}, {cost}"),
                }
                assert!(outcome.final_burden >= 0.0);
                assert!(outcome.time_on_drug <= cfg.policy.horizon);
            }
            assert_eq!(point.ct.n_cycles, 1);
            assert!(point.at.n_cycles >= 1);
        }
    }

    #[test]
    fn adaptive_therapy_never_treats_longer_than_continuous() {
        let cfg = test_config();
        let point = evaluate_cell(&cfg, 0.25, 0.25);
        assert_eq!(point.ct.kind, OutcomeKind::Progressed);
        assert_eq!(point.at.kind, OutcomeKind::Progressed);
        assert!(point.ttp_gain().unwrap() > 1.0);
        assert!((point.ct.time_on_drug - point.ct.ttp.unwrap()).abs() < 1e-9);
        assert!(point.at.time_on_drug < point.at.ttp.unwrap());
    }

    #[test]
    fn sweep_is_written_as_csv() {
        let cfg = test_config();
        let points = run(&cfg, &grid(&cfg)[..2]).unwrap();
        let file = std::env::temp_dir().join(format!("atfit-sweep-{}.csv", std::process::id()));
        save_points(&points, &file).unwrap();
        let contents = std::fs::read_to_string(&file).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("turnover,cost,ct_outcome,ct_ttp"));
        assert_eq!(lines.count(), 2);
        std::fs::remove_file(&file).ok();
    }
}
