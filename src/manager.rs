use crate::analysis;
use crate::config::Config;
use crate::data::CsvPatientSource;
use crate::fit::FitEngine;
use crate::store::{FileStore, ResultStore, TrajectoryWriter};
use crate::sweep;
use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub struct Manager {
    work_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(work_dir: P) -> Result<Self> {
        let work_dir = work_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(work_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { work_dir, cfg })
    }

    pub fn run_fits(&self) -> Result<()> {
        let source = CsvPatientSource::from_config(&self.work_dir, &self.cfg.data);
        let store = FileStore::new(self.fits_dir());
        let writer = TrajectoryWriter::new(self.fits_dir());

        let mut engine = FitEngine::new(&self.cfg, &source, &store);
        if self.cfg.fit.write_trajectories {
            engine = engine.with_diagnostics(&writer);
        }

        let jobs = engine.jobs().context("failed to enumerate fit jobs")?;
        engine.run_batch(&jobs).context("failed to run fit batch")?;

        Ok(())
    }

    pub fn run_sweep(&self) -> Result<()> {
        let cells = sweep::grid(&self.cfg);
        let points = sweep::run(&self.cfg, &cells).context("failed to run sweep")?;

        let sweep_file = self.sweep_file();
        sweep::save_points(&points, &sweep_file)
            .with_context(|| format!("failed to save {sweep_file:?}"))?;
        log::info!("saved {sweep_file:?}");

        Ok(())
    }

    pub fn analyze_fits(&self) -> Result<()> {
        let store = FileStore::new(self.fits_dir());

        let mut summaries = Vec::new();
        for variant in &self.cfg.fit.variants {
            let results = store
                .load_all(variant)
                .with_context(|| format!("failed to load {variant} fits"))?;
            log::info!("loaded {} {variant} fits", results.len());
            summaries.extend(analysis::summarize(results));
        }

        let summary_file = self.summary_file();
        analysis::save_summaries(&summaries, &summary_file)
            .with_context(|| format!("failed to save {summary_file:?}"))?;
        log::info!("saved {summary_file:?}");

        Ok(())
    }

    /// Remove everything the other commands produced.
    pub fn clean(&self) -> Result<()> {
        let fits_dir = self.fits_dir();
        if fits_dir.exists() {
            fs::remove_dir_all(&fits_dir)
                .with_context(|| format!("failed to remove {fits_dir:?}"))?;
            log::info!("removed {fits_dir:?}");
        }

        for file in [self.sweep_file(), self.summary_file()] {
            if file.exists() {
                fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
                log::info!("removed {file:?}");
            }
        }

        Ok(())
    }

    fn fits_dir(&self) -> PathBuf {
        self.work_dir.join("fits")
    }

    fn sweep_file(&self) -> PathBuf {
        self.work_dir.join("sweep.csv")
    }

    fn summary_file(&self) -> PathBuf {
        self.work_dir.join("fit-summary.csv")
    }
}
