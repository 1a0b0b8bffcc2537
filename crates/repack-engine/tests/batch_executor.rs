//! Batch executor tests over a scripted scheduler: submission argv shape,
//! dependency expressions over backend ids, and polled completion.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use repack_engine::{
    BatchJobState, BatchScheduler, Executor, Job, LsfExecutor, OnComplete, StaticSiteFlags,
};

#[derive(Default)]
struct FakeInner {
    submissions: Mutex<Vec<Vec<String>>>,
    states: Mutex<HashMap<String, BatchJobState>>,
    counter: AtomicU64,
    reply: Mutex<Option<String>>,
}

#[derive(Clone, Default)]
struct FakeScheduler(Arc<FakeInner>);

impl FakeScheduler {
    fn set_state(&self, backend_id: &str, state: BatchJobState) {
        self.0
            .states
            .lock()
            .unwrap()
            .insert(backend_id.to_string(), state);
    }

    fn reply_with(&self, raw: &str) {
        *self.0.reply.lock().unwrap() = Some(raw.to_string());
    }

    fn submissions(&self) -> Vec<Vec<String>> {
        self.0.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchScheduler for FakeScheduler {
    async fn submit(&self, argv: &[String]) -> anyhow::Result<String> {
        self.0.submissions.lock().unwrap().push(argv.to_vec());
        if let Some(raw) = self.0.reply.lock().unwrap().clone() {
            return Ok(raw);
        }
        let id = 100 + self.0.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Job <{id}> is submitted to queue <normal>.\n"))
    }

    async fn job_state(&self, backend_id: &str) -> BatchJobState {
        self.0
            .states
            .lock()
            .unwrap()
            .get(backend_id)
            .copied()
            .unwrap_or(BatchJobState::Pend)
    }
}

type Results = Arc<Mutex<Vec<(String, bool)>>>;

fn recorder(results: &Results) -> OnComplete {
    let results = Arc::clone(results);
    Box::new(move |id, success| {
        results.lock().unwrap().push((id.to_string(), success));
    })
}

fn job(dir: &Path, id: &str) -> Job {
    Job {
        id: id.to_string(),
        command: vec!["run_kit".to_string(), "--target".to_string(), id.to_string()],
        cwd: dir.to_path_buf(),
        log_path: dir.join(format!("{id}.log")),
        env: BTreeMap::new(),
    }
}

fn executor(scheduler: &FakeScheduler, flags: &[&str]) -> LsfExecutor {
    LsfExecutor::new(
        Box::new(scheduler.clone()),
        Box::new(StaticSiteFlags(flags.iter().map(|f| f.to_string()).collect())),
    )
    .with_poll_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn submission_argv_carries_log_name_and_dependency_expression() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = FakeScheduler::default();
    let executor = executor(&scheduler, &["-q", "normal"]);
    let results: Results = Arc::default();

    executor
        .submit(job(dir.path(), "KitC::tt"), &[], recorder(&results))
        .await
        .unwrap();
    executor
        .submit(
            job(dir.path(), "KitB::tt"),
            &["KitC::tt".to_string()],
            recorder(&results),
        )
        .await
        .unwrap();
    executor
        .submit(
            job(dir.path(), "KitA::tt"),
            &["KitC::tt".to_string(), "KitB::tt".to_string()],
            recorder(&results),
        )
        .await
        .unwrap();

    let submissions = scheduler.submissions();
    let log = dir.path().join("KitC::tt.log").to_string_lossy().into_owned();
    assert_eq!(
        submissions[0],
        vec![
            "-o".to_string(),
            log.clone(),
            "-e".to_string(),
            log,
            "-J".to_string(),
            "KitC::tt".to_string(),
            "-q".to_string(),
            "normal".to_string(),
            "run_kit --target KitC::tt".to_string(),
        ]
    );

    // Dependencies resolve to the scheduler-assigned ids.
    let expr_of = |argv: &Vec<String>| -> Option<String> {
        argv.iter()
            .position(|t| t == "-w")
            .map(|idx| argv[idx + 1].clone())
    };
    assert_eq!(expr_of(&submissions[1]), Some("done(100)".to_string()));
    assert_eq!(
        expr_of(&submissions[2]),
        Some("done(100) && done(101)".to_string())
    );
}

#[tokio::test]
async fn unparseable_submission_output_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = FakeScheduler::default();
    scheduler.reply_with("Request queued\n");
    let executor = executor(&scheduler, &[]);
    let results: Results = Arc::default();

    let err = executor
        .submit(job(dir.path(), "KitA::tt"), &[], recorder(&results))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("could not parse a job id"));
    assert!(results.lock().unwrap().is_empty());
}

#[tokio::test]
async fn wait_polls_states_and_fires_callbacks_once() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = FakeScheduler::default();
    let executor = executor(&scheduler, &[]);
    let results: Results = Arc::default();

    executor
        .submit(job(dir.path(), "good"), &[], recorder(&results))
        .await
        .unwrap();
    executor
        .submit(job(dir.path(), "bad"), &[], recorder(&results))
        .await
        .unwrap();
    scheduler.set_state("100", BatchJobState::Done);
    scheduler.set_state("101", BatchJobState::Exit);

    let ids = vec!["good".to_string(), "bad".to_string()];
    executor.wait(&ids).await.unwrap();

    {
        let results = results.lock().unwrap();
        assert!(results.contains(&("good".to_string(), true)));
        assert!(results.contains(&("bad".to_string(), false)));
        assert_eq!(results.len(), 2);
    }

    // A second wait settles immediately and does not re-fire callbacks.
    executor.wait(&ids).await.unwrap();
    assert_eq!(results.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn wait_keeps_polling_while_jobs_are_queued_or_running() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = FakeScheduler::default();
    let executor = executor(&scheduler, &[]);
    let results: Results = Arc::default();

    executor
        .submit(job(dir.path(), "slow"), &[], recorder(&results))
        .await
        .unwrap();
    scheduler.set_state("100", BatchJobState::Run);

    let flipper = scheduler.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        flipper.set_state("100", BatchJobState::Done);
    });

    executor.wait(&["slow".to_string()]).await.unwrap();
    assert_eq!(
        results.lock().unwrap().as_slice(),
        &[("slow".to_string(), true)]
    );
}

#[tokio::test]
async fn wait_skips_targets_never_submitted_here() {
    let scheduler = FakeScheduler::default();
    let executor = executor(&scheduler, &[]);

    executor
        .wait(&["KitA::tt".to_string()])
        .await
        .unwrap();
}
