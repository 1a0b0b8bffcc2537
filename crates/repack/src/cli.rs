use std::path::PathBuf;

use clap::{Parser, ValueEnum};

pub fn default_parallel() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(512) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutorKind {
    /// Run targets as subprocesses on an in-process worker pool.
    Local,
    /// Submit targets to an LSF-style batch scheduler.
    Lsf,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "repack",
    version,
    about = "Dependency-aware batch runner for library characterization kits"
)]
pub struct Cli {
    /// Path to the run configuration (JSON).
    pub config: PathBuf,

    /// Number of local workers to run in parallel (local executor only).
    #[arg(
        short = 'p',
        long,
        env = "REPACK_PARALLEL",
        default_value_t = default_parallel(),
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub parallel: u16,

    /// Execution backend.
    #[arg(long, env = "REPACK_EXECUTOR", value_enum, default_value_t = ExecutorKind::Local)]
    pub executor: ExecutorKind,

    /// Override the status file path from the configuration.
    #[arg(long, env = "REPACK_STATUS_FILE")]
    pub status_file: Option<PathBuf>,
}
