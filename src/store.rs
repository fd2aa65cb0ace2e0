use crate::data::PatientRecord;
use crate::fit::{FitJob, FitResult};
use crate::params::ModelVariant;
use crate::simulator::Trajectory;
use anyhow::{Context, Result};
use glob::glob;
use rmp_serde::{decode, encode};
use serde::Serialize;
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

/// Persistent storage of fit results, keyed by [`FitJob`].
pub trait ResultStore: Sync {
    fn exists(&self, job: &FitJob) -> Result<bool>;
    fn persist(&self, result: &FitResult) -> Result<()>;
    fn load_all(&self, variant: &ModelVariant) -> Result<Vec<FitResult>>;
}

/// Receives every fitted trajectory for inspection.
pub trait DiagnosticSink: Sync {
    fn render(
        &self,
        result: &FitResult,
        record: &PatientRecord,
        trajectory: &Trajectory,
    ) -> Result<()>;
}

/// Directory layout `<variant>/patient-<id>/<name>-<attempt>.<ext>` under a root.
fn attempt_file(root: &Path, job: &FitJob, name: &str, ext: &str) -> PathBuf {
    root.join(job.variant.name())
        .join(format!("patient-{:04}", job.patient_id))
        .join(format!("{name}-{:04}.{ext}", job.attempt))
}

/// MessagePack files, one per fit attempt.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn fit_file(&self, job: &FitJob) -> PathBuf {
        attempt_file(&self.root, job, "fit", "msgpack")
    }
}

impl ResultStore for FileStore {
    fn exists(&self, job: &FitJob) -> Result<bool> {
        let file = self.fit_file(job);
        file.try_exists()
            .with_context(|| format!("failed to check {file:?}"))
    }

    /// Write to a temporary file first and rename it into place, so an
    /// interrupted write never leaves a file under the final name.
    fn persist(&self, result: &FitResult) -> Result<()> {
        let file = self.fit_file(&result.job());
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {dir:?}"))?;
        }

        let tmp_file = file.with_extension("msgpack.tmp");
        let mut writer = BufWriter::new(
            File::create(&tmp_file).with_context(|| format!("failed to create {tmp_file:?}"))?,
        );
        encode::write(&mut writer, result).context("failed to serialize fit result")?;
        writer
            .into_inner()
            .context("failed to flush fit result")?
            .sync_all()
            .with_context(|| format!("failed to sync {tmp_file:?}"))?;

        fs::rename(&tmp_file, &file)
            .with_context(|| format!("failed to rename {tmp_file:?} to {file:?}"))?;
        Ok(())
    }

    fn load_all(&self, variant: &ModelVariant) -> Result<Vec<FitResult>> {
        let pattern = self
            .root
            .join(variant.name())
            .join("patient-*")
            .join("fit-*.msgpack");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;

        let mut results = Vec::new();
        for path in glob(pattern).context("failed to glob fit files")? {
            let path = path.context("failed to read glob entry")?;
            let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
            let mut reader = BufReader::new(file);
            let result: FitResult = decode::from_read(&mut reader)
                .with_context(|| format!("failed to deserialize {path:?}"))?;
            results.push(result);
        }
        Ok(results)
    }
}

#[derive(Serialize)]
struct TrajectoryRow {
    kind: &'static str,
    time: f64,
    sensitive: Option<f64>,
    resistant: Option<f64>,
    biomarker: f64,
    administered: Option<bool>,
}

/// Writes each fitted trajectory and its observations as CSV.
pub struct TrajectoryWriter {
    root: PathBuf,
}

impl TrajectoryWriter {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn trajectory_file(&self, job: &FitJob) -> PathBuf {
        attempt_file(&self.root, job, "trajectory", "csv")
    }
}

impl DiagnosticSink for TrajectoryWriter {
    fn render(
        &self,
        result: &FitResult,
        record: &PatientRecord,
        trajectory: &Trajectory,
    ) -> Result<()> {
        let file = self.trajectory_file(&result.job());
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {dir:?}"))?;
        }
        let mut writer =
            csv::Writer::from_path(&file).with_context(|| format!("failed to create {file:?}"))?;

        let scale = result.params.scale;
        for sample in &trajectory.samples {
            let administered = trajectory
                .schedule
                .interval_at(sample.time)
                .map(|interval| interval.administered);
            writer.serialize(TrajectoryRow {
                kind: "model",
                time: sample.time,
                sensitive: Some(sample.state.sensitive),
                resistant: Some(sample.state.resistant),
                biomarker: scale * sample.state.burden(),
                administered,
            })?;
        }
        for obs in &record.observations {
            writer.serialize(TrajectoryRow {
                kind: "data",
                time: obs.time,
                sensitive: None,
                resistant: None,
                biomarker: obs.value,
                administered: None,
            })?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to write {file:?}"))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::params::test_parameter_set;
    use std::{collections::HashMap, env, sync::Mutex};

    /// In-memory store counting how often each key was written.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) results: Mutex<HashMap<FitJob, FitResult>>,
        pub(crate) writes: Mutex<usize>,
    }

    impl ResultStore for MemoryStore {
        fn exists(&self, job: &FitJob) -> Result<bool> {
            Ok(self.results.lock().unwrap().contains_key(job))
        }

        fn persist(&self, result: &FitResult) -> Result<()> {
            *self.writes.lock().unwrap() += 1;
            self.results
                .lock()
                .unwrap()
                .insert(result.job(), result.clone());
            Ok(())
        }

        fn load_all(&self, variant: &ModelVariant) -> Result<Vec<FitResult>> {
            Ok(self
                .results
                .lock()
                .unwrap()
                .values()
                .filter(|result| &result.variant == variant)
                .cloned()
                .collect())
        }
    }

    pub(crate) fn test_result(patient_id: u32, variant: &str, attempt: usize, rss: f64) -> FitResult {
        let template = test_parameter_set();
        FitResult {
            patient_id,
            variant: variant.parse().unwrap(),
            attempt,
            params: template.resolve().unwrap(),
            free_fields: template.free_fields(),
            rss,
            r_squared: Some(0.9),
            aic: -10.0,
            bic: -8.0,
            n_evals: 42,
            seed: 7,
            eps_data: 1.0,
            perturb_std_dev: Some(0.1),
        }
    }

    #[test]
    fn file_store_round_trip() {
        let root = env::temp_dir().join(format!("atfit-store-{}", std::process::id()));
        fs::remove_dir_all(&root).ok();
        let store = FileStore::new(&root);

        let result = test_result(3, "4params", 1, 0.5);
        let job = result.job();
        assert!(!store.exists(&job).unwrap());
        store.persist(&result).unwrap();
        assert!(store.exists(&job).unwrap());
        assert!(!store.fit_file(&job).with_extension("msgpack.tmp").exists());
        store.persist(&test_result(4, "4params", 0, 0.7)).unwrap();
        store.persist(&test_result(3, "3params_noCost", 0, 0.7)).unwrap();

        let loaded = store.load_all(&job.variant).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&result));

        fs::remove_dir_all(&root).ok();
    }
}
