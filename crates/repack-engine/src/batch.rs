use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::executor::{Executor, Job, OnComplete};

/// State of a job as reported by the batch scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchJobState {
    /// Finished successfully.
    Done,
    /// Finished unsuccessfully, or aborted because a dependency failed.
    Exit,
    /// Currently running.
    Run,
    /// Queued, waiting for resources or dependencies.
    Pend,
    /// State could not be determined; treated as still in flight.
    Unknown,
}

/// The scheduler commands the batch executor drives.
///
/// The default implementation shells out to `bsub`/`bjobs`; tests substitute
/// a scripted fake.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Runs the submission command with the given argv and returns its
    /// stdout. The output must contain a line of the shape `Job <NUMBER>`.
    async fn submit(&self, argv: &[String]) -> anyhow::Result<String>;

    /// Queries the state of a previously submitted job.
    async fn job_state(&self, backend_id: &str) -> BatchJobState;
}

/// Site-specific submission flags (queue, memory/CPU reservation, …).
pub trait SiteFlags: Send + Sync {
    /// Extra argv tokens appended to the submission command for `job`.
    fn flags(&self, job: &Job) -> Vec<String>;
}

/// A fixed flag list, the same for every job.
pub struct StaticSiteFlags(
    /// Flags appended verbatim to every submission.
    pub Vec<String>,
);

impl SiteFlags for StaticSiteFlags {
    fn flags(&self, _job: &Job) -> Vec<String> {
        self.0.clone()
    }
}

#[derive(Debug, thiserror::Error)]
enum BatchError {
    #[error("could not parse a job id from scheduler output: {output:?}")]
    UnparseableSubmission { output: String },
}

/// LSF-style batch scheduler.
pub struct BsubScheduler;

#[async_trait]
impl BatchScheduler for BsubScheduler {
    async fn submit(&self, argv: &[String]) -> anyhow::Result<String> {
        let output = tokio::process::Command::new("bsub")
            .args(argv)
            .output()
            .await
            .context("spawn bsub")?;
        if !output.status.success() {
            anyhow::bail!(
                "bsub failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn job_state(&self, backend_id: &str) -> BatchJobState {
        let output = tokio::process::Command::new("bjobs")
            .args(["-noheader", "-o", "stat"])
            .arg(backend_id)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                match String::from_utf8_lossy(&out.stdout).trim() {
                    "DONE" => BatchJobState::Done,
                    "EXIT" => BatchJobState::Exit,
                    "RUN" => BatchJobState::Run,
                    "PEND" => BatchJobState::Pend,
                    _ => BatchJobState::Unknown,
                }
            }
            _ => BatchJobState::Unknown,
        }
    }
}

#[derive(Default)]
struct BatchState {
    /// target id → scheduler-assigned id, used in dependency expressions
    /// and status queries.
    backend_ids: HashMap<String, String>,
    callbacks: HashMap<String, OnComplete>,
}

/// Executor submitting jobs to an LSF-style batch scheduler.
///
/// Dependencies are delegated to the backend as a `done(a) && done(b)` wait
/// expression over scheduler-assigned ids, so a failed dependency keeps the
/// downstream job from ever running; the backend then reports it as `EXIT`
/// and the callback fires with `success = false`. The job's environment
/// overlay is not forwarded: the submission inherits the driver environment,
/// and anything else belongs in the site flags.
pub struct LsfExecutor {
    scheduler: Box<dyn BatchScheduler>,
    site: Box<dyn SiteFlags>,
    poll_interval: Duration,
    state: Mutex<BatchState>,
}

impl LsfExecutor {
    /// Interval between status polls while waiting.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// Creates an executor over the given scheduler and site-flag hook.
    pub fn new(scheduler: Box<dyn BatchScheduler>, site: Box<dyn SiteFlags>) -> Self {
        Self {
            scheduler,
            site,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            state: Mutex::new(BatchState::default()),
        }
    }

    /// Overrides the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl Executor for LsfExecutor {
    async fn submit(
        &self,
        job: Job,
        deps: &[String],
        on_complete: OnComplete,
    ) -> anyhow::Result<()> {
        if let Some(dir) = job.log_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
        }

        let log = job.log_path.to_string_lossy().into_owned();
        let mut argv: Vec<String> = vec![
            "-o".into(),
            log.clone(),
            "-e".into(),
            log,
            "-J".into(),
            job.id.clone(),
        ];

        let wait_expr = {
            let state = self.state.lock().expect("batch lock poisoned");
            let predicates: Vec<String> = deps
                .iter()
                .filter_map(|dep| state.backend_ids.get(dep))
                .map(|backend_id| format!("done({backend_id})"))
                .collect();
            predicates.join(" && ")
        };
        if !wait_expr.is_empty() {
            argv.push("-w".into());
            argv.push(wait_expr);
        }

        argv.extend(self.site.flags(&job));
        argv.push(job.command.join(" "));

        let stdout = self
            .scheduler
            .submit(&argv)
            .await
            .with_context(|| format!("submit {} to batch scheduler", job.id))?;
        let backend_id = parse_backend_id(&stdout)
            .ok_or(BatchError::UnparseableSubmission { output: stdout })?;

        let mut state = self.state.lock().expect("batch lock poisoned");
        state.backend_ids.insert(job.id.clone(), backend_id);
        state.callbacks.insert(job.id, on_complete);
        Ok(())
    }

    async fn wait(&self, ids: &[String]) -> anyhow::Result<()> {
        let mut pending: Vec<String> = ids.to_vec();

        loop {
            let mut still_pending = Vec::new();
            for target_id in pending {
                let backend_id = {
                    let state = self.state.lock().expect("batch lock poisoned");
                    state.backend_ids.get(&target_id).cloned()
                };
                // No recorded backend id: nothing was submitted for this
                // target here, so there is nothing to poll.
                let Some(backend_id) = backend_id else {
                    continue;
                };

                let settled = match self.scheduler.job_state(&backend_id).await {
                    BatchJobState::Done => Some(true),
                    BatchJobState::Exit => Some(false),
                    BatchJobState::Run | BatchJobState::Pend | BatchJobState::Unknown => None,
                };
                match settled {
                    Some(success) => {
                        let callback = {
                            let mut state = self.state.lock().expect("batch lock poisoned");
                            state.callbacks.remove(&target_id)
                        };
                        if let Some(callback) = callback {
                            callback(&target_id, success);
                        }
                    }
                    None => still_pending.push(target_id),
                }
            }

            if still_pending.is_empty() {
                return Ok(());
            }
            pending = still_pending;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Extracts the scheduler-assigned id from submission stdout of the shape
/// `Job <12345> is submitted to queue <normal>.`
fn parse_backend_id(stdout: &str) -> Option<String> {
    let rest = stdout.split_once("Job <")?.1;
    let (digits, _) = rest.split_once('>')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits.to_string())
}
