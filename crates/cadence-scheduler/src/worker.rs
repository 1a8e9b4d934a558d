//! The worker side of process-per-run execution.
//!
//! The executor launches the `cadence` binary with the `worker` subcommand,
//! writes one JSON [`WorkerRequest`] to its stdin and closes it. The worker
//! looks the task up in its [`TaskRegistry`], runs it, and prints exactly one
//! JSON [`WorkerResponse`] line on stdout. Anything else (a crash, a signal,
//! garbage on stdout) is classified by [`read_outcome`] on the executor side.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::events::panic_message;
use crate::types::{InstanceId, JobFailure, JobOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job_id: String,
    pub instance_id: InstanceId,
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok { value: Value },
    Error { message: String },
}

/// What a task handler sees of the run it belongs to.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: String,
    pub instance_id: InstanceId,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

impl TaskContext {
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

impl From<WorkerRequest> for TaskContext {
    fn from(req: WorkerRequest) -> Self {
        Self {
            job_id: req.job_id,
            instance_id: req.instance_id,
            args: req.args,
            kwargs: req.kwargs,
        }
    }
}

/// A unit of work runnable inside a worker process.
pub trait TaskHandler: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> anyhow::Result<Value>;
}

impl<F> TaskHandler for F
where
    F: Fn(&TaskContext) -> anyhow::Result<Value> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext) -> anyhow::Result<Value> {
        self(ctx)
    }
}

/// Task key → handler. Jobs refer to tasks by key, so the registry must be
/// identical in the scheduler's binary and the worker binary.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.tasks.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.tasks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Decode one request and run it. Never panics.
pub fn handle_request(registry: &TaskRegistry, input: &[u8]) -> WorkerResponse {
    let request: WorkerRequest = match serde_json::from_slice(input) {
        Ok(r) => r,
        Err(e) => {
            return WorkerResponse::Error {
                message: format!("malformed worker request: {e}"),
            }
        }
    };

    let Some(handler) = registry.get(&request.task) else {
        return WorkerResponse::Error {
            message: format!("unknown task '{}'", request.task),
        };
    };

    debug!(job_id = %request.job_id, instance_id = request.instance_id, task = %request.task, "running task");
    let ctx = TaskContext::from(request);
    match catch_unwind(AssertUnwindSafe(|| handler.run(&ctx))) {
        Ok(Ok(value)) => WorkerResponse::Ok { value },
        Ok(Err(e)) => WorkerResponse::Error {
            message: format!("{e:#}"),
        },
        Err(panic) => WorkerResponse::Error {
            message: format!("task panicked: {}", panic_message(panic.as_ref())),
        },
    }
}

/// Entry point of the `worker` subcommand. Returns the process exit code.
pub fn run_worker(registry: &TaskRegistry) -> i32 {
    let mut input = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut input) {
        error!(error = %e, "failed to read worker request");
        return 2;
    }

    let response = handle_request(registry, &input);
    let line = match serde_json::to_string(&response) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "failed to encode worker response");
            return 2;
        }
    };

    let mut stdout = std::io::stdout().lock();
    if writeln!(stdout, "{line}").and_then(|_| stdout.flush()).is_err() {
        return 2;
    }
    0
}

/// Classify a finished worker from its captured stdout.
///
/// The last non-empty stdout line is the response; task output printed before
/// it is ignored. `exit` describes the exit status for crash reports.
pub fn read_outcome(stdout: &[u8], exit: &str, killed: bool) -> JobOutcome {
    if killed {
        return JobOutcome::Failure(JobFailure::Terminated);
    }

    let text = String::from_utf8_lossy(stdout);
    let last = text.lines().rev().find(|l| !l.trim().is_empty());
    match last.and_then(|l| serde_json::from_str::<WorkerResponse>(l).ok()) {
        Some(WorkerResponse::Ok { value }) => JobOutcome::Success(value),
        Some(WorkerResponse::Error { message }) => {
            JobOutcome::Failure(JobFailure::Raised { message })
        }
        None => JobOutcome::Failure(JobFailure::Crashed {
            status: exit.to_string(),
        }),
    }
}
