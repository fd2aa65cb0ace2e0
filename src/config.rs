use crate::params::{ModelVariant, ParameterSet};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path, path::PathBuf};

/// Batch configuration.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default parameter values, bounds and free/fixed flags.
    pub model: ParameterSet,
    pub solver: SolverConfig,
    pub policy: PolicyConfig,
    pub data: DataConfig,
    pub fit: FitConfig,
    pub sweep: SweepConfig,
}

/// Numerical tolerances of the ODE solver.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Absolute error tolerance.
    pub abs_err: f64,
    /// Relative error tolerance.
    pub rel_err: f64,
    /// Maximum internal step size.
    pub max_step: f64,
    /// Maximum number of step attempts per control interval.
    pub max_steps: usize,
}

/// Treatment policy thresholds.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Length of one control interval.
    pub interval: f64,
    /// Adaptive therapy stops treating below this fraction of the baseline burden.
    pub at_threshold: f64,
    /// Progression when burden reaches this multiple of the baseline burden.
    pub progression_threshold: f64,
    /// Cure when burden falls to this absolute value.
    pub cure_threshold: f64,
    /// Simulated time after which a run is censored.
    pub horizon: f64,
}

/// Location and preprocessing of patient data.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory of `patient<ID>.csv` files, relative to the work directory.
    pub patient_dir: PathBuf,
    /// Divide biomarker values by the first value of each patient.
    #[serde(default)]
    pub normalize: bool,
}

/// Calibration settings.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    pub variants: Vec<ModelVariant>,
    /// Number of independent attempts per patient and variant.
    pub n_fits: usize,
    /// Perturb the initial guess of every attempt.
    pub perturb: bool,
    /// Standard deviation of the log-normal perturbation.
    pub perturb_std_dev: f64,
    /// Residual weighting (measurement error scale).
    pub eps_data: f64,
    pub x_tol: f64,
    pub f_tol: f64,
    pub g_tol: f64,
    /// Relative step of the finite-difference Jacobian.
    pub diff_step: f64,
    /// Maximum number of residual evaluations per attempt.
    pub max_evals: usize,
    pub n_workers: usize,
    /// Write the fitted trajectory next to every result.
    #[serde(default = "default_true")]
    pub write_trajectories: bool,
}

/// Cost × turnover sweep settings.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub turnover: GridRange,
    pub cost: GridRange,
    /// Initial tumour burden of every simulated tumour.
    pub initial_size: f64,
    /// Initial resistant fraction of every simulated tumour.
    pub resistant_fraction: f64,
    pub n_workers: usize,
}

/// `steps` evenly spaced values from `start` to `stop` (inclusive).
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct GridRange {
    pub start: f64,
    pub stop: f64,
    pub steps: usize,
}

impl GridRange {
    pub fn values(&self) -> Vec<f64> {
        if self.steps == 1 {
            return vec![self.start];
        }
        let step = (self.stop - self.start) / (self.steps - 1) as f64;
        (0..self.steps)
            .map(|i| self.start + step * i as f64)
            .collect()
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.model.validate().context("invalid model parameters")?;
        self.solver.validate().context("invalid solver settings")?;
        self.policy.validate().context("invalid policy settings")?;
        self.fit.validate().context("invalid fit settings")?;

        check_num(self.sweep.n_workers, 1..=1024).context("invalid number of sweep workers")?;
        check_num(self.sweep.initial_size, 0.0..=self.model.capacity.value)
            .context("invalid sweep initial size")?;
        check_num(self.sweep.resistant_fraction, 0.0..=1.0)
            .context("invalid sweep resistant fraction")?;
        check_range(&self.sweep.turnover, &self.model.turnover)
            .context("invalid sweep turnover range")?;
        check_range(&self.sweep.cost, &self.model.cost).context("invalid sweep cost range")?;

        Ok(())
    }
}

impl SolverConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.abs_err, 1e-15..=1.0).context("invalid absolute error")?;
        check_num(self.rel_err, 1e-15..=1.0).context("invalid relative error")?;
        if !(self.max_step > 0.0) {
            bail!("maximum step must be positive, but is {}", self.max_step);
        }
        check_num(self.max_steps, 1..100_000_000).context("invalid maximum number of steps")?;
        Ok(())
    }
}

impl PolicyConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.interval, 1e-6..1e6).context("invalid control interval")?;
        check_num(self.at_threshold, 0.0..1.0).context("invalid adaptive therapy threshold")?;
        check_num(self.progression_threshold, 1.0..1e6)
            .context("invalid progression threshold")?;
        check_num(self.cure_threshold, 0.0..1.0).context("invalid cure threshold")?;
        check_num(self.horizon, self.interval..1e9).context("invalid horizon")?;
        Ok(())
    }
}

impl FitConfig {
    fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            bail!("at least one model variant is required");
        }
        check_num(self.n_fits, 1..10_000).context("invalid number of fits")?;
        check_num(self.perturb_std_dev, 0.0..10.0).context("invalid perturbation std dev")?;
        if !(self.eps_data > 0.0 && self.eps_data.is_finite()) {
            bail!("eps_data must be positive, but is {}", self.eps_data);
        }
        check_num(self.x_tol, 0.0..1.0).context("invalid x tolerance")?;
        check_num(self.f_tol, 0.0..1.0).context("invalid f tolerance")?;
        check_num(self.g_tol, 0.0..1.0).context("invalid g tolerance")?;
        check_num(self.diff_step, 1e-12..1e-1).context("invalid difference step")?;
        check_num(self.max_evals, 1..10_000_000).context("invalid maximum evaluations")?;
        check_num(self.n_workers, 1..=1024).context("invalid number of fit workers")?;
        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_range(range: &GridRange, spec: &crate::params::ParamSpec) -> Result<()> {
    check_num(range.steps, 1..100_000).context("invalid number of steps")?;
    if range.start > range.stop {
        bail!("range start {} exceeds stop {}", range.start, range.stop);
    }
    check_num(range.start, spec.min..=spec.max).context("range start outside bounds")?;
    check_num(range.stop, spec.min..=spec.max).context("range stop outside bounds")?;
    Ok(())
}

#[cfg(test)]
pub(crate) const TEST_CONFIG: &str = r#"
[model]
r_s = { value = 0.027, min = 1e-4, max = 0.1 }
cost = { value = 0.3, min = 0.0, max = 1.0, vary = true }
turnover = { value = 0.3, min = 0.0, max = 1.0, vary = true }
drug_kill = { value = 1.5, min = 1.0, max = 2.0 }
capacity = { value = 1.0 }
scale = { value = 1.0 }
drug_max = { value = 1.0 }
n0 = { value = 0.5, min = 0.1, max = 1.0, vary = true }
f_r = { value = 0.01, min = 1e-5, max = 0.25, vary = true }

[solver]
abs_err = 1e-8
rel_err = 1e-6
max_step = 1.0
max_steps = 100000

[policy]
interval = 1.0
at_threshold = 0.5
progression_threshold = 1.2
cure_threshold = 1e-7
horizon = 3000.0

[data]
patient_dir = "patients"
normalize = true

[fit]
variants = ["4params", "3params_noCost", "3params_noTurnover", "2params_noCost_noTurnover"]
n_fits = 3
perturb = true
perturb_std_dev = 0.1
eps_data = 1.0
x_tol = 1e-8
f_tol = 1e-8
g_tol = 1e-10
diff_step = 1e-6
max_evals = 2000
n_workers = 2

[sweep]
turnover = { start = 0.0, stop = 0.5, steps = 3 }
cost = { start = 0.0, stop = 0.5, steps = 3 }
initial_size = 0.25
resistant_fraction = 0.001
n_workers = 2
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_valid() {
        let cfg = Config::from_toml(TEST_CONFIG).unwrap();
        assert_eq!(cfg.fit.variants.len(), 4);
        assert_eq!(cfg.fit.variants[1].name(), "3params_noCost");
        assert!(cfg.fit.write_trajectories);
        assert_eq!(cfg.model.capacity.min, f64::NEG_INFINITY);
        assert!(!cfg.model.r_s.vary);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_threshold = TEST_CONFIG.replace("at_threshold = 0.5", "at_threshold = 1.5");
        assert!(Config::from_toml(&bad_threshold).is_err());

        let bad_variant = TEST_CONFIG.replace("\"3params_noCost\"", "\"3params_noDrug\"");
        assert!(Config::from_toml(&bad_variant).is_err());

        let bad_range = TEST_CONFIG.replace(
            "cost = { start = 0.0, stop = 0.5, steps = 3 }",
            "cost = { start = 0.0, stop = 1.5, steps = 3 }",
        );
        assert!(Config::from_toml(&bad_range).is_err());
    }

    #[test]
    fn grid_range_includes_endpoints() {
        let values = GridRange {
            start: 0.0,
            stop: 0.5,
            steps: 251,
        }
        .values();
        assert_eq!(values.len(), 251);
        assert_eq!(values[0], 0.0);
        assert!((values[250] - 0.5).abs() < 1e-12);
        assert!((values[1] - 0.002).abs() < 1e-12);
    }
}
