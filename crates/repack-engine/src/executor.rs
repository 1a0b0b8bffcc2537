use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

/// A fully resolved unit of work handed to an executor.
#[derive(Debug, Clone)]
pub struct Job {
    /// Target identity; also the key used for dependency declarations.
    pub id: String,
    /// Argv to execute. The first element is the program.
    pub command: Vec<String>,
    /// Working directory for the subprocess.
    pub cwd: PathBuf,
    /// File receiving the job's combined stdout/stderr.
    pub log_path: PathBuf,
    /// Environment overlay applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

/// Completion callback for a submitted job.
///
/// Fires exactly once, with the job id and whether it succeeded, when the
/// job reaches a terminal state, including when it never ran because a
/// dependency failed. Callbacks run on executor-owned tasks and must
/// synchronize any shared state they touch.
pub type OnComplete = Box<dyn FnOnce(&str, bool) + Send + 'static>;

/// A backend capable of running jobs while honoring dependencies between
/// them.
///
/// `deps` in [`Executor::submit`] names jobs previously submitted in the same
/// run. A job runs only after all of its declared dependencies succeed; if
/// any of them fails, the job is not executed and its callback fires with
/// `success = false`, transitively.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Registers a job. Non-blocking: the caller may submit an entire
    /// topological order before any job has started.
    async fn submit(&self, job: Job, deps: &[String], on_complete: OnComplete)
    -> anyhow::Result<()>;

    /// Blocks until every listed job is terminal and its callback has run.
    /// Ids never submitted to this executor are skipped.
    async fn wait(&self, ids: &[String]) -> anyhow::Result<()>;

    /// Releases executor resources. In-process executors drain outstanding
    /// work; the default implementation does nothing.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
