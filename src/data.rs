use crate::config::DataConfig;
use crate::policy::{TreatmentInterval, TreatmentSchedule};
use anyhow::{Context, Result, bail};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
};

/// One biomarker measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time: f64,
    pub value: f64,
}

/// Observations of one patient and, when known, the recorded dosing history.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub id: u32,
    pub observations: Vec<Observation>,
    pub schedule: Option<TreatmentSchedule>,
}

impl PatientRecord {
    /// Build a record, checking the observations.
    ///
    /// `doses` holds the dose given from each observation until the next one.
    pub fn new(id: u32, observations: Vec<Observation>, doses: Option<Vec<f64>>) -> Result<Self> {
        if observations.len() < 2 {
            bail!("at least 2 observations are required, but there are {}", observations.len());
        }
        for (i, obs) in observations.iter().enumerate() {
            if !obs.time.is_finite() {
                bail!("observation {i} has a non-finite time");
            }
            if !(obs.value.is_finite() && obs.value >= 0.0) {
                bail!("observation {i} has an invalid value {}", obs.value);
            }
        }
        for (i, pair) in observations.windows(2).enumerate() {
            if pair[1].time <= pair[0].time {
                bail!(
                    "times must be strictly increasing, but t[{}] = {} follows {}",
                    i + 1,
                    pair[1].time,
                    pair[0].time
                );
            }
        }

        let schedule = doses
            .map(|doses| -> Result<TreatmentSchedule> {
                let mut schedule = TreatmentSchedule::new();
                for (pair, dose) in observations.windows(2).zip(doses) {
                    if !(dose.is_finite() && dose >= 0.0) {
                        bail!("invalid dose {dose} at t = {}", pair[0].time);
                    }
                    schedule.push(TreatmentInterval {
                        start: pair[0].time,
                        end: pair[1].time,
                        administered: dose > 0.0,
                    });
                }
                Ok(schedule)
            })
            .transpose()?;

        Ok(Self {
            id,
            observations,
            schedule,
        })
    }

    pub fn start_time(&self) -> f64 {
        self.observations[0].time
    }

    pub fn end_time(&self) -> f64 {
        self.observations[self.observations.len() - 1].time
    }

    /// Divide every value by the first one.
    pub fn normalize(&mut self) -> Result<()> {
        let first = self.observations[0].value;
        if !(first > 0.0) {
            bail!("cannot normalize by a first value of {first}");
        }
        for obs in &mut self.observations {
            obs.value /= first;
        }
        Ok(())
    }
}

/// Provider of patient records.
pub trait ObservationSource: Sync {
    fn patient_ids(&self) -> Result<Vec<u32>>;
    fn load(&self, id: u32) -> Result<PatientRecord>;
}

#[derive(Debug, Deserialize)]
struct PatientRow {
    time: f64,
    value: f64,
    #[serde(default)]
    dose: Option<f64>,
}

/// Reads `patient<ID>.csv` files with columns `time`, `value` and optionally `dose`.
pub struct CsvPatientSource {
    dir: PathBuf,
    normalize: bool,
}

impl CsvPatientSource {
    pub fn new<P: AsRef<Path>>(dir: P, normalize: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            normalize,
        }
    }

    pub fn from_config<P: AsRef<Path>>(work_dir: P, cfg: &DataConfig) -> Self {
        Self::new(work_dir.as_ref().join(&cfg.patient_dir), cfg.normalize)
    }

    fn patient_file(&self, id: u32) -> PathBuf {
        self.dir.join(format!("patient{id}.csv"))
    }
}

impl ObservationSource for CsvPatientSource {
    fn patient_ids(&self) -> Result<Vec<u32>> {
        let pattern = self.dir.join("patient*.csv");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let mut ids: Vec<u32> = glob(pattern)
            .context("failed to glob patient files")?
            .filter_map(Result::ok)
            .filter_map(|path| {
                path.file_stem()?
                    .to_str()?
                    .strip_prefix("patient")?
                    .parse()
                    .ok()
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn load(&self, id: u32) -> Result<PatientRecord> {
        let path = self.patient_file(id);
        let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(file);

        let mut observations = Vec::new();
        let mut doses = Vec::new();
        for (idx, row) in reader.deserialize::<PatientRow>().enumerate() {
            let row = row.with_context(|| format!("failed to parse row {} of {path:?}", idx + 1))?;
            observations.push(Observation {
                time: row.time,
                value: row.value,
            });
            doses.push(row.dose);
        }

        let doses = if doses.iter().all(Option::is_none) {
            None
        } else {
            let doses: Option<Vec<f64>> = doses.into_iter().collect();
            Some(doses.with_context(|| format!("{path:?} has missing doses"))?)
        };

        let mut record = PatientRecord::new(id, observations, doses)
            .with_context(|| format!("invalid observations in {path:?}"))?;
        if self.normalize {
            record
                .normalize()
                .with_context(|| format!("failed to normalize {path:?}"))?;
        }
        log::debug!(
            "loaded patient {id} ({} observations)",
            record.observations.len()
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn test_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("atfit-data-{name}-{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_patients_with_dosing_history() {
        let dir = test_dir("dosing");
        fs::write(
            dir.join("patient7.csv"),
            "time,value,dose\n0,20,1\n30,10,1\n60,8,0\n90,12,0\n",
        )
        .unwrap();
        fs::write(dir.join("patient12.csv"), "time,value\n0,5\n10,4\n").unwrap();
        fs::write(dir.join("notes.csv"), "time,value\n").unwrap();

        let source = CsvPatientSource::new(&dir, true);
        assert_eq!(source.patient_ids().unwrap(), vec![7, 12]);

        let record = source.load(7).unwrap();
        assert_eq!(record.observations.len(), 4);
        assert_eq!(record.observations[0].value, 1.0);
        assert_eq!(record.observations[2].value, 0.4);
        let schedule = record.schedule.unwrap();
        assert_eq!(schedule.intervals().len(), 3);
        assert_eq!(schedule.time_on_drug(), 60.0);

        let record = source.load(12).unwrap();
        assert!(record.schedule.is_none());
        assert_eq!(record.end_time(), 10.0);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_invalid_files() {
        let dir = test_dir("invalid");
        fs::write(dir.join("patient1.csv"), "time,value\n0,5\n0,4\n").unwrap();
        fs::write(dir.join("patient2.csv"), "time,value\n0,5\n1,-4\n").unwrap();
        fs::write(dir.join("patient3.csv"), "time,value\n0,abc\n1,4\n").unwrap();
        fs::write(dir.join("patient4.csv"), "time,value\n0,0\n1,4\n").unwrap();

        let source = CsvPatientSource::new(&dir, true);
        for id in 1..=4 {
            assert!(source.load(id).is_err(), "patient {id} should be rejected");
        }
        assert!(source.load(5).is_err());
        assert!(CsvPatientSource::new(&dir, false).load(4).is_ok());

        fs::remove_dir_all(&dir).ok();
    }
}
