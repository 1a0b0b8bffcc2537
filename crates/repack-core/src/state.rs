use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;

use crate::kit::KitTarget;

const STATUS_HEADER: &str = "id,status";

/// Lifecycle status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    /// Not yet submitted in any run.
    Pending,
    /// Submitted to an executor; non-terminal. A `RUNNING` row left behind
    /// by an interrupted run is re-dispatched on the next invocation.
    Running,
    /// Completed successfully. The only status that skips re-execution.
    Pass,
    /// Completed unsuccessfully, or never ran because a dependency failed.
    Fail,
}

impl TargetStatus {
    /// The spelling used in the status file.
    pub fn as_str(self) -> &'static str {
        match self {
            TargetStatus::Pending => "PENDING",
            TargetStatus::Running => "RUNNING",
            TargetStatus::Pass => "PASS",
            TargetStatus::Fail => "FAIL",
        }
    }

    /// Parses a status-file spelling. Unknown spellings degrade to
    /// [`TargetStatus::Pending`] so a damaged row re-runs its target.
    pub fn parse(s: &str) -> Self {
        match s {
            "RUNNING" => TargetStatus::Running,
            "PASS" => TargetStatus::Pass,
            "FAIL" => TargetStatus::Fail,
            _ => TargetStatus::Pending,
        }
    }

    /// Whether this status is terminal for a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, TargetStatus::Pass | TargetStatus::Fail)
    }
}

/// Durable `target_id → status` store backing resumable runs.
///
/// State lives in a two-column CSV (`id,status`) so users can hand-edit it:
/// flipping a row from `PASS` back to `PENDING` forces that target to re-run
/// on the next invocation. Every transition rewrites the whole file through a
/// temp-file-then-rename sequence, so readers never observe a torn file and a
/// crash after any single completion is recoverable.
pub struct StateManager {
    path: PathBuf,
    state: Mutex<BTreeMap<String, TargetStatus>>,
}

impl StateManager {
    /// Creates a manager over the status file at `path`. Nothing is read or
    /// written until [`StateManager::initialize`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// Path of the status file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads prior state and reconciles it with the targets of this run.
    ///
    /// A missing or unparseable status file makes this a **full** run: the
    /// `clean_hook` (expected to wipe kit output directories) is invoked and
    /// every target is seeded `PENDING`. Otherwise the run is **incremental**:
    /// rows are loaded as-is, targets without a row are added as `PENDING`,
    /// and rows without a matching target are retained untouched, keeping
    /// the history of targets dropped from the current configuration.
    ///
    /// The reconciled state is flushed before returning. Returns `true` iff
    /// the run is incremental.
    pub fn initialize(
        &self,
        all_targets: &[KitTarget],
        clean_hook: Option<&dyn Fn()>,
    ) -> anyhow::Result<bool> {
        let loaded = load_status_file(&self.path);
        let is_incremental = loaded.is_some();

        let mut state = self.state.lock().expect("state lock poisoned");
        match loaded {
            Some(rows) => {
                *state = rows;
            }
            None => {
                if let Some(clean) = clean_hook {
                    clean();
                }
                state.clear();
            }
        }

        for target in all_targets {
            state.entry(target.id()).or_insert(TargetStatus::Pending);
        }

        self.flush(&state)?;
        Ok(is_incremental)
    }

    /// Current status of a target; `PENDING` when unknown.
    pub fn get(&self, target_id: &str) -> TargetStatus {
        let state = self.state.lock().expect("state lock poisoned");
        state.get(target_id).copied().unwrap_or(TargetStatus::Pending)
    }

    /// Records a status transition, persisting it before returning.
    ///
    /// Safe to call concurrently from executor-owned tasks; the file write
    /// happens under the state lock.
    pub fn set(&self, target_id: &str, status: TargetStatus) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.insert(target_id.to_string(), status);
        self.flush(&state)
    }

    /// A copy of the current state map.
    pub fn snapshot(&self) -> BTreeMap<String, TargetStatus> {
        self.state.lock().expect("state lock poisoned").clone()
    }

    fn flush(&self, state: &BTreeMap<String, TargetStatus>) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("invalid status file path: {}", self.path.display()))?;
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create status directory {}", dir.display()))?;
        }

        let mut out = String::with_capacity(64 + state.len() * 32);
        out.push_str(STATUS_HEADER);
        out.push('\n');
        for (id, status) in state {
            out.push_str(id);
            out.push(',');
            out.push_str(status.as_str());
            out.push('\n');
        }

        let tmp = self.path.with_extension("csv.tmp");
        std::fs::write(&tmp, out)
            .with_context(|| format!("write status file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace status file {}", self.path.display()))?;
        Ok(())
    }
}

/// Reads and parses the status file. `None` means "no usable prior state":
/// the file is missing, unreadable, or does not start with the expected
/// header.
fn load_status_file(path: &Path) -> Option<BTreeMap<String, TargetStatus>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut lines = raw.lines();
    if lines.next()? != STATUS_HEADER {
        return None;
    }

    let mut rows = BTreeMap::new();
    for line in lines {
        let Some((id, status)) = line.split_once(',') else {
            continue;
        };
        if id.is_empty() {
            continue;
        }
        rows.insert(id.to_string(), TargetStatus::parse(status));
    }
    Some(rows)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn targets(ids: &[(&str, &str)]) -> Vec<KitTarget> {
        ids.iter()
            .map(|(kit, pvt)| KitTarget::for_pvt(*kit, *pvt))
            .collect()
    }

    #[test]
    fn missing_file_triggers_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("repack_status.csv");
        let manager = StateManager::new(&path);

        let clean_calls = AtomicUsize::new(0);
        let clean = || {
            clean_calls.fetch_add(1, Ordering::SeqCst);
        };

        let all = targets(&[("KitA", "default"), ("KitB", "default")]);
        let incremental = manager.initialize(&all, Some(&clean)).unwrap();

        assert!(!incremental);
        assert_eq!(clean_calls.load(Ordering::SeqCst), 1);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            raw,
            "id,status\nKitA::default,PENDING\nKitB::default,PENDING\n"
        );
    }

    #[test]
    fn incremental_run_loads_and_reconciles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repack_status.csv");
        std::fs::write(
            &path,
            "id,status\nKitA::default,PASS\nKitB::default,BOGUS\nOldKit::default,FAIL\n",
        )
        .unwrap();

        let manager = StateManager::new(&path);
        let all = targets(&[("KitA", "default"), ("KitB", "default"), ("KitC", "default")]);
        let incremental = manager.initialize(&all, None).unwrap();

        assert!(incremental);
        assert_eq!(manager.get("KitA::default"), TargetStatus::Pass);
        // Unknown spellings degrade to PENDING.
        assert_eq!(manager.get("KitB::default"), TargetStatus::Pending);
        // New targets are seeded PENDING.
        assert_eq!(manager.get("KitC::default"), TargetStatus::Pending);
        // Rows with no matching target are retained.
        assert_eq!(manager.get("OldKit::default"), TargetStatus::Fail);
        assert!(
            std::fs::read_to_string(&path)
                .unwrap()
                .contains("OldKit::default,FAIL")
        );
    }

    #[test]
    fn corrupt_header_triggers_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repack_status.csv");
        std::fs::write(&path, "not,a,status,file\nKitA::default,PASS\n").unwrap();

        let manager = StateManager::new(&path);
        let all = targets(&[("KitA", "default")]);
        let incremental = manager.initialize(&all, None).unwrap();

        assert!(!incremental);
        assert_eq!(manager.get("KitA::default"), TargetStatus::Pending);
    }

    #[test]
    fn set_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repack_status.csv");

        let manager = StateManager::new(&path);
        let all = targets(&[("KitA", "ss"), ("KitA", "ff"), ("KitB", "ss")]);
        manager.initialize(&all, None).unwrap();
        manager.set("KitA::ss", TargetStatus::Pass).unwrap();
        manager.set("KitA::ff", TargetStatus::Fail).unwrap();
        manager.set("KitB::ss", TargetStatus::Running).unwrap();

        let reloaded = StateManager::new(&path);
        reloaded.initialize(&all, None).unwrap();
        assert_eq!(reloaded.snapshot(), manager.snapshot());
        assert_eq!(reloaded.get("KitA::ss"), TargetStatus::Pass);
        assert_eq!(reloaded.get("KitA::ff"), TargetStatus::Fail);
        // RUNNING survives a crash as-is and is re-dispatched by the engine.
        assert_eq!(reloaded.get("KitB::ss"), TargetStatus::Running);
    }

    #[test]
    fn user_override_forces_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repack_status.csv");

        let all = targets(&[("KitA", "default")]);
        let manager = StateManager::new(&path);
        manager.initialize(&all, None).unwrap();
        manager.set("KitA::default", TargetStatus::Pass).unwrap();
        drop(manager);

        // A user flips the row back to PENDING in an editor.
        let edited = std::fs::read_to_string(&path)
            .unwrap()
            .replace("PASS", "PENDING");
        std::fs::write(&path, edited).unwrap();

        let manager = StateManager::new(&path);
        assert!(manager.initialize(&all, None).unwrap());
        assert_eq!(manager.get("KitA::default"), TargetStatus::Pending);
    }
}
