use crate::config::{Config, FitConfig};
use crate::data::{ObservationSource, PatientRecord};
use crate::error::{FailureKind, FitError};
use crate::lsq::{self, LsqOptions};
use crate::params::{Field, ModelParameters, ModelVariant, ParameterSet};
use crate::residual::ResidualFunction;
use crate::simulator::Trajectory;
use crate::store::{DiagnosticSink, ResultStore};
use anyhow::{Context, Result};
use rand::{SeedableRng, TryRngCore, rngs::OsRng};
use rand_chacha::ChaCha12Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One calibration attempt. Also the key under which its result is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FitJob {
    pub patient_id: u32,
    pub variant: ModelVariant,
    pub attempt: usize,
}

/// Persisted outcome of a successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub patient_id: u32,
    pub variant: ModelVariant,
    pub attempt: usize,
    pub params: ModelParameters,
    pub free_fields: Vec<Field>,
    /// Sum of squared weighted residuals.
    pub rss: f64,
    /// Undefined when every observation has the same value.
    pub r_squared: Option<f64>,
    pub aic: f64,
    pub bic: f64,
    pub n_evals: usize,
    pub seed: u64,
    pub eps_data: f64,
    /// Standard deviation of the initial-guess perturbation, if any.
    pub perturb_std_dev: Option<f64>,
}

impl FitResult {
    pub fn job(&self) -> FitJob {
        FitJob {
            patient_id: self.patient_id,
            variant: self.variant.clone(),
            attempt: self.attempt,
        }
    }
}

#[derive(Debug)]
pub enum AttemptOutcome {
    /// A result for this job already existed.
    Skipped,
    Fitted(Box<FitResult>),
}

/// Fitted parameters of one attempt together with goodness-of-fit measures.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub params: ModelParameters,
    pub trajectory: Trajectory,
    pub rss: f64,
    pub r_squared: Option<f64>,
    pub aic: f64,
    pub bic: f64,
    pub n_evals: usize,
}

impl From<&FitConfig> for LsqOptions {
    fn from(cfg: &FitConfig) -> Self {
        Self {
            x_tol: cfg.x_tol,
            f_tol: cfg.f_tol,
            g_tol: cfg.g_tol,
            diff_step: cfg.diff_step,
            max_evals: cfg.max_evals,
        }
    }
}

/// Fit the free fields of `template` to `record`, starting from their current values.
pub fn calibrate(
    template: &ParameterSet,
    record: &PatientRecord,
    cfg: &Config,
) -> Result<Calibration, FitError> {
    let residual = ResidualFunction::new(
        record,
        template,
        &cfg.solver,
        cfg.policy.interval,
        cfg.fit.eps_data,
    );
    let (lower, upper) = template.free_bounds();
    let solution = lsq::minimize(
        |free| residual.evaluate(free),
        &template.free_values(),
        &lower,
        &upper,
        &LsqOptions::from(&cfg.fit),
    )
    .map_err(|error| FitError::Optimization(error.to_string()))?;
    log::debug!(
        "patient {}: {:?} after {} evaluations",
        record.id,
        solution.termination,
        solution.n_evals
    );

    let params = template.with_free_values(&solution.x).resolve()?;
    let trajectory = residual.simulate(&params)?;
    let residuals = residual.residuals_of(&params, &trajectory);

    let values: Vec<f64> = record.observations.iter().map(|obs| obs.value).collect();
    let n = values.len() as f64;
    let rss: f64 = residuals.iter().map(|r| r * r).sum();
    let r_squared = r_squared(&values, rss * cfg.fit.eps_data.powi(2));

    let k = template.free_fields().len() as f64;
    let log_likelihood_term = n * (rss.max(f64::MIN_POSITIVE) / n).ln();
    let aic = log_likelihood_term + 2.0 * k;
    let bic = log_likelihood_term + n.ln() * k;

    Ok(Calibration {
        params,
        trajectory,
        rss,
        r_squared,
        aic,
        bic,
        n_evals: solution.n_evals,
    })
}

/// Coefficient of determination of `values` given the residual sum of squares.
fn r_squared(values: &[f64], ss_res: f64) -> Option<f64> {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let ss_tot: f64 = values.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return None;
    }
    Some(1.0 - ss_res / ss_tot)
}

/// Counts of a finished batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub fitted: usize,
    pub skipped: usize,
    pub failures: BTreeMap<FailureKind, usize>,
}

impl BatchSummary {
    pub fn n_failed(&self) -> usize {
        self.failures.values().sum()
    }
}

pub struct FitEngine<'a> {
    cfg: &'a Config,
    source: &'a dyn ObservationSource,
    store: &'a dyn ResultStore,
    diagnostics: Option<&'a dyn DiagnosticSink>,
}

impl<'a> FitEngine<'a> {
    pub fn new(
        cfg: &'a Config,
        source: &'a dyn ObservationSource,
        store: &'a dyn ResultStore,
    ) -> Self {
        Self {
            cfg,
            source,
            store,
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, sink: &'a dyn DiagnosticSink) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Every (patient, variant, attempt) combination of the configuration.
    pub fn jobs(&self) -> Result<Vec<FitJob>> {
        let patient_ids = self
            .source
            .patient_ids()
            .context("failed to list patients")?;
        let mut jobs = Vec::new();
        for &patient_id in &patient_ids {
            for variant in &self.cfg.fit.variants {
                for attempt in 0..self.cfg.fit.n_fits {
                    jobs.push(FitJob {
                        patient_id,
                        variant: variant.clone(),
                        attempt,
                    });
                }
            }
        }
        Ok(jobs)
    }

    /// Run one attempt, skipping it if its result is already stored.
    pub fn run_attempt(&self, job: &FitJob) -> Result<AttemptOutcome, FitError> {
        let record = self.source.load(job.patient_id).map_err(FitError::Load)?;

        if self.store.exists(job).map_err(FitError::Store)? {
            log::debug!("{job:?} already fitted");
            return Ok(AttemptOutcome::Skipped);
        }

        let seed = OsRng
            .try_next_u64()
            .map_err(|error| FitError::Initialization(format!("failed to draw seed: {error}")))?;
        let mut rng = ChaCha12Rng::seed_from_u64(seed);

        let fit_cfg = &self.cfg.fit;
        let mut template = self.cfg.model.clone();
        template.apply_variant(&job.variant);
        if fit_cfg.perturb {
            template
                .perturb(&mut rng, fit_cfg.perturb_std_dev)
                .map_err(|error| FitError::Initialization(format!("{error:#}")))?;
        }

        let calibration = calibrate(&template, &record, self.cfg)?;
        let result = FitResult {
            patient_id: job.patient_id,
            variant: job.variant.clone(),
            attempt: job.attempt,
            params: calibration.params,
            free_fields: template.free_fields(),
            rss: calibration.rss,
            r_squared: calibration.r_squared,
            aic: calibration.aic,
            bic: calibration.bic,
            n_evals: calibration.n_evals,
            seed,
            eps_data: fit_cfg.eps_data,
            perturb_std_dev: fit_cfg.perturb.then_some(fit_cfg.perturb_std_dev),
        };

        self.store.persist(&result).map_err(FitError::Store)?;

        if let Some(sink) = self.diagnostics {
            if let Err(error) = sink.render(&result, &record, &calibration.trajectory) {
                log::warn!("failed to render diagnostics of {job:?}: {error:#}");
            }
        }

        Ok(AttemptOutcome::Fitted(Box::new(result)))
    }

    /// Run `jobs` on a pool of `n_workers` threads and tally the outcomes.
    pub fn run_batch(&self, jobs: &[FitJob]) -> Result<BatchSummary> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.cfg.fit.n_workers)
            .build()
            .context("failed to build thread pool")?;
        log::info!(
            "running {} fit jobs on {} workers",
            jobs.len(),
            self.cfg.fit.n_workers
        );

        let outcomes: Vec<_> = pool.install(|| {
            jobs.par_iter()
                .map(|job| (job, self.run_attempt(job)))
                .collect()
        });

        let mut summary = BatchSummary::default();
        for (job, outcome) in outcomes {
            match outcome {
                Ok(AttemptOutcome::Fitted(result)) => {
                    log::debug!(
                        "{job:?} fitted (rss = {:.4e}, r_squared = {:?})",
                        result.rss,
                        result.r_squared
                    );
                    summary.fitted += 1;
                }
                Ok(AttemptOutcome::Skipped) => summary.skipped += 1,
                Err(error) => {
                    log::warn!("{job:?} abandoned: {error}");
                    *summary.failures.entry(error.kind()).or_default() += 1;
                }
            }
        }
        log::info!(
            "fitted {}, skipped {}, failed {} {:?}",
            summary.fitted,
            summary.skipped,
            summary.n_failed(),
            summary.failures
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SolverConfig, TEST_CONFIG};
    use crate::data::Observation;
    use crate::simulator::test_solver_config;
    use crate::store::tests::MemoryStore;
    use anyhow::bail;
    use std::collections::HashMap;

    struct MemorySource {
        records: HashMap<u32, PatientRecord>,
    }

    impl ObservationSource for MemorySource {
        fn patient_ids(&self) -> Result<Vec<u32>> {
            let mut ids: Vec<u32> = self.records.keys().copied().collect();
            ids.sort_unstable();
            Ok(ids)
        }

        fn load(&self, id: u32) -> Result<PatientRecord> {
            match self.records.get(&id) {
                Some(record) => Ok(record.clone()),
                None => bail!("no patient {id}"),
            }
        }
    }

    /// Noiseless observations of `truth` under continuous therapy.
    fn synthetic_record(id: u32, truth: &ModelParameters, cfg: &Config) -> PatientRecord {
        let times: Vec<f64> = (0..=30).map(|i| 20.0 * i as f64).collect();
        let placeholder = times
            .iter()
            .map(|&time| Observation { time, value: 1.0 })
            .collect();
        let mut record = PatientRecord::new(id, placeholder, None).unwrap();
        let trajectory = ResidualFunction::new(&record, &cfg.model, &cfg.solver, 1.0, 1.0)
            .simulate(truth)
            .unwrap();
        for obs in &mut record.observations {
            obs.value = truth.scale * trajectory.burden_at(obs.time).unwrap();
        }
        record
    }

    fn test_config() -> Config {
        let mut cfg = Config::from_toml(TEST_CONFIG).unwrap();
        cfg.solver = SolverConfig {
            abs_err: 1e-12,
            rel_err: 1e-10,
            ..test_solver_config()
        };
        cfg.fit.x_tol = 1e-12;
        cfg.fit.f_tol = 1e-14;
        cfg.fit.g_tol = 1e-16;
        cfg
    }

    fn truth(cfg: &Config) -> ModelParameters {
        let mut set = cfg.model.clone();
        set.cost.value = 0.3;
        set.turnover.value = 0.0;
        set.n0.value = 0.6;
        set.f_r.value = 0.05;
        set.resolve().unwrap()
    }

    #[test]
    fn recovers_parameters_from_noiseless_data() {
        let cfg = test_config();
        let truth = truth(&cfg);
        let record = synthetic_record(1, &truth, &cfg);

        let mut template = cfg.model.clone();
        template.apply_variant(&"3params_noTurnover".parse().unwrap());
        template.cost.value = 0.33;
        template.n0.value = 0.54;
        template.f_r.value = 0.055;

        let calibration = calibrate(&template, &record, &cfg).unwrap();
        for field in [Field::Cost, Field::InitialSize, Field::ResistantFraction] {
            let fitted = calibration.params.get(field);
            let expected = truth.get(field);
            assert!(
                (fitted - expected).abs() <= 0.01 * expected,
                "{} = {fitted}, expected {expected}",
                field.name()
            );
        }
        assert_eq!(calibration.params.turnover, 0.0);
        assert!(calibration.r_squared.unwrap() > 0.9999);
        assert!(calibration.n_evals > 1);
    }

    #[test]
    fn converges_with_fields_on_their_bounds() {
        let cfg = Config::from_toml(TEST_CONFIG).unwrap();
        let observations = (0..8)
            .map(|i| Observation {
                time: 60.0 * i as f64,
                value: 0.3 + 0.05 * i as f64,
            })
            .collect();
        let record = PatientRecord::new(1, observations, None).unwrap();

        let mut template = cfg.model.clone();
        template.apply_variant(&"4params".parse().unwrap());
        let calibration = calibrate(&template, &record, &cfg).unwrap();

        let params = calibration.params;
        assert!(params.turnover < 1e-6, "turnover = {}", params.turnover);
        assert!((params.f_r - 0.25).abs() < 1e-6, "f_r = {}", params.f_r);
        assert!(calibration.n_evals < cfg.fit.max_evals);
        assert!(calibration.r_squared.is_some());
    }

    #[test]
    fn r_squared_is_undefined_for_flat_observations() {
        assert_eq!(r_squared(&[0.5, 0.5, 0.5], 0.0), None);
        assert_eq!(r_squared(&[1.0, 2.0, 3.0], 0.0), Some(1.0));
        assert_eq!(r_squared(&[1.0, 2.0, 3.0], 1.0), Some(0.5));
    }

    #[test]
    fn derived_fields_match_fitted_sources() {
        let cfg = test_config();
        let record = synthetic_record(1, &truth(&cfg), &cfg);
        let mut template = cfg.model.clone();
        template.apply_variant(&"2params_noCost_noTurnover".parse().unwrap());
        let calibration = calibrate(&template, &record, &cfg).unwrap();
        let params = calibration.params;
        assert_eq!(params.r_r(), (1.0 - params.cost) * params.r_s);
        assert_eq!(params.d_s(), params.turnover * params.r_s);
        assert_eq!(params.r0(), params.n0 * params.f_r);
        assert_eq!(
            calibration.trajectory.samples[0].state,
            params.initial_state()
        );
    }

    #[test]
    fn batches_are_idempotent() {
        let mut cfg = test_config();
        cfg.fit.variants = vec!["2params_noCost_noTurnover".parse().unwrap()];
        cfg.fit.n_fits = 2;
        let truth = truth(&cfg);
        let source = MemorySource {
            records: HashMap::from([
                (1, synthetic_record(1, &truth, &cfg)),
                (2, synthetic_record(2, &truth, &cfg)),
            ]),
        };
        let store = MemoryStore::default();
        let engine = FitEngine::new(&cfg, &source, &store);

        let jobs = engine.jobs().unwrap();
        assert_eq!(jobs.len(), 4);

        let first = engine.run_batch(&jobs).unwrap();
        assert_eq!((first.fitted, first.skipped, first.n_failed()), (4, 0, 0));
        let stored = store.results.lock().unwrap().clone();

        let second = engine.run_batch(&jobs).unwrap();
        assert_eq!((second.fitted, second.skipped, second.n_failed()), (0, 4, 0));
        assert_eq!(*store.writes.lock().unwrap(), 4);
        assert_eq!(*store.results.lock().unwrap(), stored);

        for result in stored.values() {
            assert_eq!(result.free_fields.len(), 2);
            assert_eq!(result.params.cost, 0.0);
            assert_eq!(result.perturb_std_dev, Some(0.1));
        }
    }

    #[test]
    fn failures_are_isolated_and_classified() {
        let mut cfg = test_config();
        cfg.fit.variants = vec!["2params_noCost_noTurnover".parse().unwrap()];
        cfg.fit.n_fits = 1;
        let source = MemorySource {
            records: HashMap::from([(1, synthetic_record(1, &truth(&cfg), &cfg))]),
        };
        let store = MemoryStore::default();
        let engine = FitEngine::new(&cfg, &source, &store);

        let mut jobs = engine.jobs().unwrap();
        jobs.push(FitJob {
            patient_id: 9,
            ..jobs[0].clone()
        });
        let summary = engine.run_batch(&jobs).unwrap();
        assert_eq!(summary.fitted, 1);
        assert_eq!(summary.failures, BTreeMap::from([(FailureKind::Load, 1)]));

        let mut starved = cfg.clone();
        starved.fit.max_evals = 2;
        let engine = FitEngine::new(&starved, &source, &store);
        let error = engine
            .run_attempt(&FitJob {
                attempt: 5,
                ..jobs[0].clone()
            })
            .unwrap_err();
        assert_eq!(error.kind(), FailureKind::Optimization);

        let mut unseedable = cfg.clone();
        unseedable.fit.perturb_std_dev = -1.0;
        let engine = FitEngine::new(&unseedable, &source, &store);
        let error = engine
            .run_attempt(&FitJob {
                attempt: 6,
                ..jobs[0].clone()
            })
            .unwrap_err();
        assert_eq!(error.kind(), FailureKind::Initialization);
        assert_eq!(*store.writes.lock().unwrap(), 1);
    }
}
