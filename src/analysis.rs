use crate::fit::FitResult;
use crate::params::Field;
use crate::stats::{Accumulator, AccumulatorReport};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};

/// Best fit of one patient under one variant, plus the spread across attempts.
#[derive(Debug, Clone)]
pub struct PatientSummary {
    pub best: FitResult,
    pub n_fits: usize,
    pub spread: Vec<(Field, AccumulatorReport)>,
}

/// Group `results` by patient and pick the lowest-RSS attempt of each.
///
/// Results with a non-finite RSS are left out of both the best fit and the spread.
pub fn summarize(results: Vec<FitResult>) -> Vec<PatientSummary> {
    let mut by_patient: BTreeMap<u32, Vec<FitResult>> = BTreeMap::new();
    for result in results {
        by_patient.entry(result.patient_id).or_default().push(result);
    }

    by_patient
        .into_values()
        .filter_map(|fits| {
            let n_fits = fits.len();
            let best = fits
                .iter()
                .filter(|fit| fit.rss.is_finite())
                .min_by(|a, b| a.rss.total_cmp(&b.rss).then(a.attempt.cmp(&b.attempt)))?
                .clone();

            let spread = best
                .free_fields
                .iter()
                .map(|&field| {
                    let mut acc = Accumulator::new();
                    for fit in fits.iter().filter(|fit| fit.rss.is_finite()) {
                        acc.add(fit.params.get(field));
                    }
                    (field, acc.report())
                })
                .collect();

            Some(PatientSummary {
                best,
                n_fits,
                spread,
            })
        })
        .collect()
}

#[derive(Serialize)]
struct SummaryRow<'a> {
    variant: &'a str,
    patient_id: u32,
    n_fits: usize,
    best_attempt: usize,
    rss: f64,
    r_squared: Option<f64>,
    aic: f64,
    bic: f64,
    field: &'static str,
    best_value: f64,
    mean: f64,
    std_dev: f64,
    min: f64,
    max: f64,
}

/// Write one row per (patient, free field) to a CSV file.
pub fn save_summaries<P: AsRef<Path>>(summaries: &[PatientSummary], file: P) -> Result<()> {
    let file = file.as_ref();
    let mut writer =
        csv::Writer::from_path(file).with_context(|| format!("failed to create {file:?}"))?;
    for summary in summaries {
        let best = &summary.best;
        for (field, report) in &summary.spread {
            writer
                .serialize(SummaryRow {
                    variant: best.variant.name(),
                    patient_id: best.patient_id,
                    n_fits: summary.n_fits,
                    best_attempt: best.attempt,
                    rss: best.rss,
                    r_squared: best.r_squared,
                    aic: best.aic,
                    bic: best.bic,
                    field: field.name(),
                    best_value: best.params.get(*field),
                    mean: report.mean,
                    std_dev: report.std_dev,
                    min: report.min,
                    max: report.max,
                })
                .context("failed to serialize summary")?;
        }
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {file:?}"))?;
    Ok(())
}
