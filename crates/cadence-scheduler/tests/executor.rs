// Executor behaviour against real worker processes (the `cadence` binary).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{ExecutorConfig, JobDefaults};
use cadence_scheduler::events::EventBus;
use cadence_scheduler::executor::Executor;
use cadence_scheduler::{
    EventMask, Job, JobExecutionEvent, JobFailure, JobOutcome, MemoryJobStore, NewJob,
    SchedulerError, SchedulerEvent,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn worker_config() -> ExecutorConfig {
    ExecutorConfig {
        worker_program: Some(env!("CARGO_BIN_EXE_cadence").to_string()),
        worker_args: vec!["worker".to_string()],
        join_timeout_ms: 5_000,
        teardown_poll_ms: 50,
    }
}

fn build(new_job: NewJob) -> Job {
    new_job
        .into_job(Utc::now(), chrono_tz::UTC, &JobDefaults::default())
        .unwrap()
}

struct Harness {
    executor: Arc<Executor>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

fn harness() -> Harness {
    harness_with(worker_config())
}

fn harness_with(config: ExecutorConfig) -> Harness {
    let bus = Arc::new(EventBus::new());
    let (tx, rx) = mpsc::unbounded_channel();
    bus.add_listener(EventMask::ALL, move |event| {
        let _ = tx.send(event.clone());
    });
    let executor = Arc::new(Executor::new(
        config,
        Arc::new(MemoryJobStore::new()),
        bus,
    ));
    Harness {
        executor,
        events: rx,
    }
}

async fn next_execution(rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>) -> JobExecutionEvent {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Some(SchedulerEvent::JobExecution(ev)) => return ev,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("no execution event within 20s")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_run_reports_return_value_and_callback() {
    let mut h = harness();
    h.executor.start().unwrap();

    let called = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&called);
    let job = build(
        NewJob::new("echo")
            .id("greeter")
            .arg("a")
            .kwarg("k", 1)
            .on_success(move |job_id, _, value| {
                assert_eq!(job_id, "greeter");
                assert_eq!(value["kwargs"]["k"], 1);
                c.fetch_add(1, Ordering::SeqCst);
            }),
    );

    let run_time = Utc::now();
    let instance_id = h.executor.submit_job(&job, run_time).unwrap();
    assert_eq!(instance_id, 10_000);

    let ev = next_execution(&mut h.events).await;
    assert_eq!(ev.kind, EventMask::JOB_EXECUTED);
    assert_eq!(ev.job_id, "greeter");
    assert_eq!(ev.instance_id, instance_id);
    assert_eq!(ev.run_time, run_time);
    match &ev.outcome {
        JobOutcome::Success(value) => {
            assert_eq!(value["instance_id"], instance_id);
            assert_eq!(value["args"], json!(["a"]));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(called.load(Ordering::SeqCst), 1);
    assert!(h.executor.instance_ids("greeter").is_empty());
    assert!(h.executor.running_instances().is_empty());

    h.executor.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dynamic_args_are_resolved_at_submission() {
    let mut h = harness();
    h.executor.start().unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&counter);
    let job = build(
        NewJob::new("echo")
            .unlimited_instances()
            .dynamic_arg("seq", move || Value::from(c.fetch_add(1, Ordering::SeqCst))),
    );

    h.executor.submit_job(&job, Utc::now()).unwrap();
    h.executor.submit_job(&job, Utc::now()).unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let ev = next_execution(&mut h.events).await;
        match ev.outcome {
            JobOutcome::Success(value) => seen.push(value["kwargs"]["seq"].as_u64().unwrap()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1]);

    h.executor.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_instances_rejects_without_starting_a_process() {
    let h = harness();
    h.executor.start().unwrap();

    let job = build(
        NewJob::new("sleep")
            .id("slow")
            .kwarg("secs", 30)
            .max_instances(1),
    );
    let first = h.executor.submit_job(&job, Utc::now()).unwrap();

    let err = h.executor.submit_job(&job, Utc::now()).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::MaxInstancesReached { ref job_id, max: 1 } if job_id == "slow"
    ));
    assert_eq!(h.executor.instance_ids("slow"), vec![first]);
    assert_eq!(h.executor.running_instances().len(), 1);

    h.executor.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_kills_worker_and_drops_its_completion() {
    let mut h = harness();
    h.executor.start().unwrap();

    let job = build(NewJob::new("sleep").id("victim").kwarg("secs", 30));
    let instance_id = h.executor.submit_job(&job, Utc::now()).unwrap();
    assert_eq!(h.executor.instance_job(instance_id).unwrap().id, "victim");

    let job_id = h.executor.terminate_job(instance_id).await.unwrap();
    assert_eq!(job_id, "victim");
    assert!(h.executor.instance_ids("victim").is_empty());
    assert!(h.executor.instance_job(instance_id).is_none());

    // The killed worker's completion must not surface as an execution event.
    let late = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            if let Some(SchedulerEvent::JobExecution(ev)) = h.events.recv().await {
                return ev;
            }
        }
    })
    .await;
    assert!(late.is_err());

    let err = h.executor.terminate_job(instance_id).await.unwrap_err();
    assert_eq!(err.code(), "INSTANCE_NOT_FOUND");

    h.executor.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashing_worker_is_reported_as_failure() {
    let mut h = harness();
    h.executor.start().unwrap();

    let failures = Arc::new(std::sync::Mutex::new(Vec::new()));
    let f = Arc::clone(&failures);
    let job = build(
        NewJob::new("exit")
            .id("crasher")
            .kwarg("code", 7)
            .on_error(move |_, _, failure| f.lock().unwrap().push(failure.clone())),
    );
    h.executor.submit_job(&job, Utc::now()).unwrap();

    let ev = next_execution(&mut h.events).await;
    assert_eq!(ev.kind, EventMask::JOB_ERROR);
    match &ev.outcome {
        JobOutcome::Failure(JobFailure::Crashed { status }) => assert!(status.contains('7')),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(failures.lock().unwrap().len(), 1);

    // The executor keeps working after a crash.
    let ok = build(NewJob::new("echo"));
    h.executor.submit_job(&ok, Utc::now()).unwrap();
    assert!(next_execution(&mut h.events).await.outcome.is_success());

    h.executor.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn task_error_is_reported_as_raised() {
    let mut h = harness();
    h.executor.start().unwrap();

    let job = build(NewJob::new("fail").kwarg("message", "boom"));
    h.executor.submit_job(&job, Utc::now()).unwrap();

    let ev = next_execution(&mut h.events).await;
    assert_eq!(
        ev.outcome,
        JobOutcome::Failure(JobFailure::Raised {
            message: "boom".to_string()
        })
    );

    let unknown = build(NewJob::new("no-such-task"));
    h.executor.submit_job(&unknown, Utc::now()).unwrap();
    match next_execution(&mut h.events).await.outcome {
        JobOutcome::Failure(JobFailure::Raised { message }) => {
            assert!(message.contains("unknown task"))
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    h.executor.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_callback_does_not_break_completion_loop() {
    let mut h = harness();
    h.executor.start().unwrap();

    let job = build(
        NewJob::new("echo")
            .unlimited_instances()
            .on_success(|_, _, _| panic!("callback bug")),
    );
    h.executor.submit_job(&job, Utc::now()).unwrap();
    assert!(next_execution(&mut h.events).await.outcome.is_success());

    h.executor.submit_job(&job, Utc::now()).unwrap();
    assert!(next_execution(&mut h.events).await.outcome.is_success());

    h.executor.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_requires_started_executor() {
    let h = harness();
    let job = build(NewJob::new("echo"));
    assert_eq!(
        h.executor.submit_job(&job, Utc::now()).unwrap_err().code(),
        "EXECUTOR_NOT_SETUP"
    );

    h.executor.start().unwrap();
    h.executor.shutdown(true).await;
    assert_eq!(
        h.executor.submit_job(&job, Utc::now()).unwrap_err().code(),
        "EXECUTOR_NOT_SETUP"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_is_idempotent() {
    let h = harness();
    h.executor.start().unwrap();
    h.executor.shutdown(true).await;
    h.executor.shutdown(true).await;
    h.executor.shutdown(false).await;
    assert!(!h.executor.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_without_wait_kills_workers() {
    let mut h = harness();
    h.executor.start().unwrap();

    let job = build(NewJob::new("sleep").kwarg("secs", 60).unlimited_instances());
    h.executor.submit_job(&job, Utc::now()).unwrap();
    h.executor.submit_job(&job, Utc::now()).unwrap();

    tokio::time::timeout(Duration::from_secs(15), h.executor.shutdown(false))
        .await
        .expect("teardown did not finish");
    assert!(h.executor.running_instances().is_empty());

    for _ in 0..2 {
        let ev = next_execution(&mut h.events).await;
        assert_eq!(ev.outcome, JobOutcome::Failure(JobFailure::Terminated));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_with_wait_lets_workers_finish() {
    let mut h = harness();
    h.executor.start().unwrap();

    let job = build(NewJob::new("sleep").kwarg("secs", 0.5));
    h.executor.submit_job(&job, Utc::now()).unwrap();
    h.executor.shutdown(true).await;

    let ev = next_execution(&mut h.events).await;
    assert_eq!(ev.outcome, JobOutcome::Success(json!(0.5)));
}

/// A `sh` worker that answers and exits but leaves a background child
/// holding its stdout.
fn leaky_worker(script: &str) -> ExecutorConfig {
    ExecutorConfig {
        worker_program: Some("sh".to_string()),
        worker_args: vec!["-c".to_string(), format!("cat >/dev/null; {script}")],
        join_timeout_ms: 1_000,
        teardown_poll_ms: 50,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_exit_completes_instance_despite_inherited_stdout() {
    let mut h = harness_with(leaky_worker(
        r#"sleep 20 & echo '{"status":"ok","value":1}'"#,
    ));
    h.executor.start().unwrap();

    let job = build(NewJob::new("any").id("leaky").max_instances(1));
    let started = std::time::Instant::now();
    h.executor.submit_job(&job, Utc::now()).unwrap();

    let ev = next_execution(&mut h.events).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(ev.outcome, JobOutcome::Success(json!(1)));
    assert!(h.executor.instance_ids("leaky").is_empty());

    // The slot is free again.
    h.executor.submit_job(&job, Utc::now()).unwrap();
    assert!(next_execution(&mut h.events).await.outcome.is_success());

    h.executor.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_without_wait_finishes_despite_inherited_stdout() {
    let mut h = harness_with(leaky_worker("sleep 20 & sleep 30"));
    h.executor.start().unwrap();

    let job = build(NewJob::new("any").id("stuck"));
    h.executor.submit_job(&job, Utc::now()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(10), h.executor.shutdown(false))
        .await
        .expect("teardown did not finish");
    assert!(h.executor.running_instances().is_empty());

    let ev = next_execution(&mut h.events).await;
    assert_eq!(ev.outcome, JobOutcome::Failure(JobFailure::Terminated));
}
