mod cli;
mod config;
mod kits;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use repack_core::{Kit, StateManager};
use repack_engine::{
    BsubScheduler, Engine, EngineEvent, Executor, LocalExecutor, LsfExecutor, StaticSiteFlags,
};

use crate::cli::{Cli, ExecutorKind};
use crate::config::RunConfig;
use crate::kits::ShellKit;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RunConfig::load(&cli.config)?;
    let request = config.request()?;

    let kits: Vec<Box<dyn Kit>> = config
        .kits
        .iter()
        .cloned()
        .map(|spec| Box::new(ShellKit::new(spec)) as Box<dyn Kit>)
        .collect();

    let status_file = cli
        .status_file
        .clone()
        .or_else(|| config.status_file.clone())
        .unwrap_or_else(|| request.output_root.join("repack_status.csv"));

    // The engine initializes state without a cleanup hook; a missing status
    // file means this is a full run, so kit output directories are wiped
    // here before the engine starts.
    if !status_file.exists() {
        for kit in &kits {
            let out = kit.output_path(&request);
            if out.exists() {
                std::fs::remove_dir_all(&out)
                    .with_context(|| format!("clean output directory {}", out.display()))?;
            }
            std::fs::create_dir_all(&out)
                .with_context(|| format!("create output directory {}", out.display()))?;
        }
    }

    let executor: Arc<dyn Executor> = match cli.executor {
        ExecutorKind::Local => Arc::new(LocalExecutor::new(cli.parallel as usize)),
        ExecutorKind::Lsf => Arc::new(LsfExecutor::new(
            Box::new(BsubScheduler),
            Box::new(StaticSiteFlags(config.site_flags.clone())),
        )),
    };

    let state = Arc::new(StateManager::new(&status_file));
    let engine = Engine::new(kits, state, Arc::clone(&executor));

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let result = engine.run(&request).await;
    executor.shutdown().await?;
    drop(engine);
    let _ = printer.await;

    let summary = result?;
    println!(
        "{} target(s): {} passed, {} failed, {} skipped",
        summary.total_targets, summary.passed, summary.failed, summary.skipped
    );
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::RunStarted {
            incremental,
            total_targets,
        } => {
            let mode = if *incremental { "incremental" } else { "full" };
            println!("{mode} run, {total_targets} target(s)");
        }
        EngineEvent::TargetSkipped { id } => println!("skip {id} (already PASS)"),
        EngineEvent::TargetSubmitted { id, deps } => {
            if deps.is_empty() {
                println!("submit {id}");
            } else {
                println!("submit {id} (after {})", deps.join(", "));
            }
        }
        EngineEvent::TargetFinished { id, passed } => {
            println!("{} {id}", if *passed { "PASS" } else { "FAIL" });
        }
        EngineEvent::Warning { message } => eprintln!("warning: {message}"),
        EngineEvent::RunFinished { .. } => {}
    }
}
