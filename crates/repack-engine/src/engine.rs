use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use repack_core::{ALL_PVT, Kit, KitTarget, Request, StateManager, TargetStatus};

use crate::executor::{Executor, Job, OnComplete};

/// Configuration errors detected before anything is submitted.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Two registered kits share a name.
    #[error("duplicate kit name {name:?}")]
    DuplicateKit {
        /// The offending kit name.
        name: String,
    },
    /// Two kits (or one kit, twice) produced the same target identity.
    #[error("kits {first:?} and {second:?} both produce target {id:?}")]
    DuplicateTarget {
        /// The duplicated target identity.
        id: String,
        /// Kit that produced the identity first.
        first: String,
        /// Kit that produced it again.
        second: String,
    },
    /// The kit dependency declarations contain a cycle.
    #[error("cycle detected in kit dependencies involving {}", kits.join(", "))]
    DependencyCycle {
        /// Kits whose targets could not be ordered.
        kits: Vec<String>,
    },
}

/// Progress events emitted while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Targets were expanded and state reconciled; dispatch is starting.
    RunStarted {
        /// Whether prior state was loaded (incremental run).
        incremental: bool,
        /// Number of targets in this run's configuration.
        total_targets: usize,
    },
    /// A target already marked `PASS` was not resubmitted.
    TargetSkipped {
        /// Target identity.
        id: String,
    },
    /// A target was handed to the executor.
    TargetSubmitted {
        /// Target identity.
        id: String,
        /// Dependencies that are in flight in this run.
        deps: Vec<String>,
    },
    /// A target reached a terminal state.
    TargetFinished {
        /// Target identity.
        id: String,
        /// Whether the target passed.
        passed: bool,
    },
    /// Something non-fatal deserves attention.
    Warning {
        /// Human-readable message.
        message: String,
    },
    /// The run completed and all callbacks have settled.
    RunFinished {
        /// Final tallies.
        summary: RunSummary,
    },
}

/// Final tallies for one engine run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    /// Whether prior state was loaded (incremental run).
    pub incremental: bool,
    /// Number of targets in this run's configuration.
    pub total_targets: usize,
    /// Targets handed to the executor.
    pub submitted: usize,
    /// Targets skipped because they already passed.
    pub skipped: usize,
    /// Targets in `PASS` after the run (including skipped ones).
    pub passed: usize,
    /// Targets in `FAIL` after the run.
    pub failed: usize,
}

impl RunSummary {
    /// Whether every target of the run is now `PASS`.
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.passed == self.total_targets
    }
}

/// Composes kits, state, and an executor into a resumable run.
///
/// `run` expands kits into targets, derives the target-level dependency
/// graph, orders it topologically, skips targets that already passed, and
/// submits the rest (each with the list of its dependencies that are in
/// flight in this run), then waits for all of them to settle.
pub struct Engine {
    kits: Vec<Box<dyn Kit>>,
    state: Arc<StateManager>,
    executor: Arc<dyn Executor>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl Engine {
    /// Creates an engine over the given kits, state store, and executor.
    pub fn new(
        kits: Vec<Box<dyn Kit>>,
        state: Arc<StateManager>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            kits,
            state,
            executor,
            event_tx,
        }
    }

    /// Subscribes to the run's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Executes one run for `request`.
    ///
    /// Job failures do not fail the run; they land in the summary and the
    /// persisted state. Configuration errors, state-write errors, and
    /// executor submission errors do.
    pub async fn run(&self, request: &Request) -> anyhow::Result<RunSummary> {
        // 1. Expand kits into targets.
        let mut kit_index: HashMap<String, usize> = HashMap::new();
        for (idx, kit) in self.kits.iter().enumerate() {
            if kit_index.insert(kit.name().to_string(), idx).is_some() {
                return Err(EngineError::DuplicateKit {
                    name: kit.name().to_string(),
                }
                .into());
            }
        }

        let mut all_targets: Vec<KitTarget> = Vec::new();
        let mut kit_targets: HashMap<String, Vec<KitTarget>> = HashMap::new();
        let mut target_owner: HashMap<String, String> = HashMap::new();
        for kit in &self.kits {
            let targets = kit.targets(request);
            for target in &targets {
                let id = target.id();
                if let Some(first) = target_owner.get(&id) {
                    return Err(EngineError::DuplicateTarget {
                        id,
                        first: first.clone(),
                        second: kit.name().to_string(),
                    }
                    .into());
                }
                target_owner.insert(id, kit.name().to_string());
            }
            all_targets.extend(targets.iter().cloned());
            kit_targets.insert(kit.name().to_string(), targets);
        }

        // 2. Reconcile persisted state.
        let incremental = self.state.initialize(&all_targets, None)?;
        self.emit(EngineEvent::RunStarted {
            incremental,
            total_targets: all_targets.len(),
        });

        // 3. Derive target-level edges from kit-level declarations.
        let mut edges_out: HashMap<String, Vec<String>> = HashMap::new();
        let mut edges_in: HashMap<String, Vec<String>> = HashMap::new();
        let mut seen_edges: HashSet<(String, String)> = HashSet::new();
        let mut missing_dep_kits: HashSet<String> = HashSet::new();
        for target in &all_targets {
            let kit = &self.kits[kit_index[target.kit_name()]];
            for dep_kit in kit.dependencies() {
                let Some(dep_targets) = kit_targets.get(&dep_kit) else {
                    if missing_dep_kits.insert(dep_kit.clone()) {
                        self.emit(EngineEvent::Warning {
                            message: format!(
                                "kit {:?} depends on unregistered kit {dep_kit:?}; ignoring",
                                kit.name()
                            ),
                        });
                    }
                    continue;
                };
                for dep in dep_targets {
                    if !pvt_match(dep, target) {
                        continue;
                    }
                    let edge = (dep.id(), target.id());
                    if !seen_edges.insert(edge.clone()) {
                        continue;
                    }
                    edges_out.entry(edge.0.clone()).or_default().push(edge.1.clone());
                    edges_in.entry(edge.1).or_default().push(edge.0);
                }
            }
        }

        // 4. Topological order (Kahn), insertion order among ready nodes.
        let ids: Vec<String> = all_targets.iter().map(|t| t.id()).collect();
        let mut indegree: HashMap<String, usize> = ids.iter().map(|id| (id.clone(), 0)).collect();
        for (to, froms) in &edges_in {
            indegree.insert(to.clone(), froms.len());
        }

        let mut ready: VecDeque<String> =
            ids.iter().filter(|id| indegree[*id] == 0).cloned().collect();
        let mut order: Vec<String> = Vec::with_capacity(ids.len());
        while let Some(id) = ready.pop_front() {
            if let Some(downstream) = edges_out.get(&id) {
                for next in downstream {
                    if let Some(degree) = indegree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push_back(next.clone());
                        }
                    }
                }
            }
            order.push(id);
        }

        if order.len() != ids.len() {
            let ordered: HashSet<&String> = order.iter().collect();
            let mut kits: Vec<String> = Vec::new();
            for target in &all_targets {
                let id = target.id();
                if !ordered.contains(&id) && !kits.contains(&target.kit_name().to_string()) {
                    kits.push(target.kit_name().to_string());
                }
            }
            return Err(EngineError::DependencyCycle { kits }.into());
        }

        // 5. Submit everything that has not already passed, in order.
        let target_by_id: HashMap<String, &KitTarget> =
            all_targets.iter().map(|t| (t.id(), t)).collect();
        let persist_failed = Arc::new(AtomicBool::new(false));
        let mut submitted: Vec<String> = Vec::new();
        let mut submitted_set: HashSet<String> = HashSet::new();
        let mut skipped = 0usize;
        let mut submit_err: Option<anyhow::Error> = None;

        for id in &order {
            if self.state.get(id) == TargetStatus::Pass {
                skipped += 1;
                self.emit(EngineEvent::TargetSkipped { id: id.clone() });
                continue;
            }

            let target = target_by_id[id];
            let kit = &self.kits[kit_index[target.kit_name()]];

            // Only dependencies submitted in this run are declared to the
            // executor; a dependency skipped as PASS is not in flight, so
            // there is no edge to wait on.
            let live_deps: Vec<String> = edges_in
                .get(id)
                .map(|deps| {
                    deps.iter()
                        .filter(|dep| submitted_set.contains(*dep))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let cwd = kit.output_path(request);
            let job = Job {
                id: id.clone(),
                command: kit.command(target, request),
                log_path: cwd.join(format!("{id}.log")),
                cwd,
                env: BTreeMap::new(),
            };

            // The RUNNING write lands before submission so a crash in
            // between is recoverable: the row is non-terminal and the target
            // is re-dispatched on the next invocation.
            self.state.set(id, TargetStatus::Running)?;
            let callback = self.completion_callback(&persist_failed);
            if let Err(err) = self.executor.submit(job, &live_deps, callback).await {
                // Already-submitted jobs still drain below before the error
                // surfaces.
                submit_err = Some(err);
                break;
            }
            self.emit(EngineEvent::TargetSubmitted {
                id: id.clone(),
                deps: live_deps,
            });
            submitted.push(id.clone());
            submitted_set.insert(id.clone());
        }

        // 6. Barrier: every callback has run once this returns.
        self.executor.wait(&submitted).await?;

        if let Some(err) = submit_err {
            return Err(err);
        }

        if persist_failed.load(Ordering::SeqCst) {
            anyhow::bail!(
                "failed to persist one or more status transitions to {}",
                self.state.path().display()
            );
        }

        let snapshot = self.state.snapshot();
        let mut passed = 0usize;
        let mut failed = 0usize;
        for id in &ids {
            match snapshot.get(id) {
                Some(TargetStatus::Pass) => passed += 1,
                Some(TargetStatus::Fail) => failed += 1,
                _ => {}
            }
        }

        let summary = RunSummary {
            incremental,
            total_targets: ids.len(),
            submitted: submitted.len(),
            skipped,
            passed,
            failed,
        };
        self.emit(EngineEvent::RunFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Builds the write-back callback for one submission. Runs on an
    /// executor-owned task; the StateManager synchronizes internally.
    fn completion_callback(&self, persist_failed: &Arc<AtomicBool>) -> OnComplete {
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let persist_failed = Arc::clone(persist_failed);
        Box::new(move |id: &str, success: bool| {
            let status = if success {
                TargetStatus::Pass
            } else {
                TargetStatus::Fail
            };
            if let Err(err) = state.set(id, status) {
                persist_failed.store(true, Ordering::SeqCst);
                let _ = event_tx.send(EngineEvent::Warning {
                    message: format!("failed to persist status for {id}: {err:#}"),
                });
            }
            let _ = event_tx.send(EngineEvent::TargetFinished {
                id: id.to_string(),
                passed: success,
            });
        })
    }
}

/// Targets of dependent kits are linked when they share a PVT, or when
/// either side is unscoped: an `ALL` target is a barrier to and from every
/// PVT of the related kit.
fn pvt_match(dep: &KitTarget, target: &KitTarget) -> bool {
    dep.pvt() == target.pvt() || dep.pvt() == ALL_PVT || target.pvt() == ALL_PVT
}
