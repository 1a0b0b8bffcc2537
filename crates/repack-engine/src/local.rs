use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};

use crate::executor::{Executor, Job, OnComplete};

/// In-process executor running jobs as subprocesses on a bounded pool.
///
/// Dependency wiring happens inside the executor: a submitted job stays
/// dormant until every declared dependency has succeeded, fails without
/// running if any of them fails, and otherwise runs on one of `max_workers`
/// pool slots with its output captured to the job's log file.
pub struct LocalExecutor {
    state: Arc<Mutex<PoolState>>,
    permits: Arc<Semaphore>,
}

/// Per-job bookkeeping. `latch_tx` resolves exactly once; it is taken out of
/// the entry at terminal time so the callback can fire before the latch.
struct JobEntry {
    /// Stored while the job is dormant; taken at dispatch (or dropped on
    /// failure) so a job can never be dispatched twice.
    job: Option<Job>,
    callback: Option<OnComplete>,
    pending_deps: HashSet<String>,
    /// Ids of later submissions waiting on this job.
    dependents: Vec<String>,
    terminal: Option<bool>,
    latch_tx: Option<watch::Sender<Option<bool>>>,
    latch_rx: watch::Receiver<Option<bool>>,
}

#[derive(Default)]
struct PoolState {
    jobs: HashMap<String, JobEntry>,
}

impl LocalExecutor {
    /// Creates a pool running at most `max_workers` subprocesses at a time.
    pub fn new(max_workers: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState::default())),
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn submit(
        &self,
        job: Job,
        deps: &[String],
        on_complete: OnComplete,
    ) -> anyhow::Result<()> {
        let id = job.id.clone();
        let (latch_tx, latch_rx) = watch::channel(None);

        let mut dispatch_now = None;
        let mut dep_failed = false;
        {
            let mut state = self.state.lock().expect("executor lock poisoned");
            if state.jobs.contains_key(&id) {
                anyhow::bail!("job {id:?} submitted twice");
            }

            let mut pending = HashSet::new();
            for dep in deps {
                // Unknown ids were filtered out by the caller (a dependency
                // that already PASSed in a prior run is not resubmitted), so
                // they carry no edge to wait on.
                let Some(entry) = state.jobs.get_mut(dep) else {
                    continue;
                };
                match entry.terminal {
                    Some(false) => {
                        dep_failed = true;
                        break;
                    }
                    Some(true) => {}
                    None => {
                        if pending.insert(dep.clone()) {
                            entry.dependents.push(id.clone());
                        }
                    }
                }
            }

            let mut entry = JobEntry {
                job: None,
                callback: Some(on_complete),
                pending_deps: pending,
                dependents: Vec::new(),
                terminal: None,
                latch_tx: Some(latch_tx),
                latch_rx,
            };

            if dep_failed {
                entry.pending_deps.clear();
            } else if entry.pending_deps.is_empty() {
                dispatch_now = Some(job);
            } else {
                entry.job = Some(job);
            }
            state.jobs.insert(id.clone(), entry);
        }

        if dep_failed {
            finish_job(&self.state, &self.permits, &id, false);
        } else if let Some(job) = dispatch_now {
            spawn_job(&self.state, &self.permits, job);
        }
        Ok(())
    }

    async fn wait(&self, ids: &[String]) -> anyhow::Result<()> {
        for id in ids {
            let rx = {
                let state = self.state.lock().expect("executor lock poisoned");
                match state.jobs.get(id) {
                    Some(entry) => entry.latch_rx.clone(),
                    None => continue,
                }
            };
            let mut rx = rx;
            rx.wait_for(|v| v.is_some())
                .await
                .map_err(|_| anyhow::anyhow!("job {id:?} was dropped before completing"))?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let ids: Vec<String> = {
            let state = self.state.lock().expect("executor lock poisoned");
            state.jobs.keys().cloned().collect()
        };
        self.wait(&ids).await
    }
}

/// Marks `id` terminal, fires its callback and latch, and walks the
/// consequences: failures propagate to every transitive dependent, successes
/// release dependents whose pending set drains to empty.
///
/// Callbacks and latches fire outside the lock, callback first, so a
/// returned `wait` implies the callback already ran.
fn finish_job(state: &Arc<Mutex<PoolState>>, permits: &Arc<Semaphore>, id: &str, success: bool) {
    let mut settled: Vec<(String, bool, Option<OnComplete>, Option<watch::Sender<Option<bool>>>)> =
        Vec::new();
    let mut runnable: Vec<Job> = Vec::new();

    {
        let mut state = state.lock().expect("executor lock poisoned");
        let mut worklist = vec![(id.to_string(), success)];
        while let Some((job_id, ok)) = worklist.pop() {
            let dependents = {
                let Some(entry) = state.jobs.get_mut(&job_id) else {
                    continue;
                };
                if entry.terminal.is_some() {
                    continue;
                }
                entry.terminal = Some(ok);
                if !ok {
                    entry.pending_deps.clear();
                    entry.job = None;
                }
                settled.push((job_id.clone(), ok, entry.callback.take(), entry.latch_tx.take()));
                std::mem::take(&mut entry.dependents)
            };

            for dependent in dependents {
                if !ok {
                    worklist.push((dependent, false));
                    continue;
                }
                let Some(entry) = state.jobs.get_mut(&dependent) else {
                    continue;
                };
                if entry.terminal.is_some() {
                    continue;
                }
                entry.pending_deps.remove(&job_id);
                if entry.pending_deps.is_empty() {
                    if let Some(job) = entry.job.take() {
                        runnable.push(job);
                    }
                }
            }
        }
    }

    for (job_id, ok, callback, latch_tx) in settled {
        if let Some(callback) = callback {
            callback(&job_id, ok);
        }
        if let Some(latch_tx) = latch_tx {
            let _ = latch_tx.send(Some(ok));
        }
    }

    for job in runnable {
        spawn_job(state, permits, job);
    }
}

fn spawn_job(state: &Arc<Mutex<PoolState>>, permits: &Arc<Semaphore>, job: Job) {
    let state = Arc::clone(state);
    let permits_for_task = Arc::clone(permits);
    tokio::spawn(async move {
        let _permit = permits_for_task
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore closed");
        let success = run_job(&job).await.unwrap_or(false);
        finish_job(&state, &permits_for_task, &job.id, success);
    });
}

/// Runs the subprocess for one job. Success means exit code 0; any spawn or
/// I/O failure counts as a job failure.
async fn run_job(job: &Job) -> anyhow::Result<bool> {
    let log_path = job.log_path.clone();
    let header = format!(
        "Executing: {}\nCWD: {}\n",
        job.command.join(" "),
        job.cwd.display()
    );
    let log_file = tokio::task::spawn_blocking(move || -> anyhow::Result<std::fs::File> {
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::File::create(&log_path)?;
        file.write_all(header.as_bytes())?;
        file.flush()?;
        Ok(file)
    })
    .await
    .map_err(|err| anyhow::anyhow!("open log file: {err:#}"))??;

    let Some((program, args)) = job.command.split_first() else {
        anyhow::bail!("job {:?} has an empty command", job.id);
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(&job.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file));
    for (key, value) in &job.env {
        cmd.env(key, value);
    }

    // status() reaps the child on every path; log handles close on drop.
    let status = cmd.status().await?;
    Ok(status.success())
}
