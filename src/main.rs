mod analysis;
mod config;
mod data;
mod error;
mod fit;
mod lsq;
mod manager;
mod model;
mod params;
mod policy;
mod residual;
mod simulator;
mod solver;
mod stats;
mod store;
mod sweep;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    #[arg(long)]
    work_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Calibrate every model variant to every patient.
    Fit,

    /// Compare continuous and adaptive therapy over the turnover × cost grid.
    Sweep,

    /// Summarize the stored fits.
    Analyze,

    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.work_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Fit => mgr.run_fits()?,
        Command::Sweep => mgr.run_sweep()?,
        Command::Analyze => mgr.analyze_fits()?,
        Command::Clean => mgr.clean()?,
    }

    Ok(())
}
