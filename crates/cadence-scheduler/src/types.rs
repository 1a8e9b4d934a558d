use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cadence_core::config::{max_instances_limit, JobDefaults, JobSpec};
use cadence_core::Trigger;
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::events::panic_message;

/// Identifier of one in-flight run of a job.
pub type InstanceId = u32;

/// Lowest instance ID handed out by the allocator.
pub const MIN_INSTANCE_ID: InstanceId = 10_000;
/// Highest instance ID; the allocator wraps back to [`MIN_INSTANCE_ID`] after it.
pub const MAX_INSTANCE_ID: InstanceId = 99_999;

/// Produces a keyword-argument value fresh at every submission.
pub trait ArgProvider: Send + Sync {
    fn produce(&self) -> Value;
}

impl<F> ArgProvider for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn produce(&self) -> Value {
        self()
    }
}

/// Injects the submission wall-clock time as an RFC 3339 string.
pub struct CurrentTime;

impl ArgProvider for CurrentTime {
    fn produce(&self) -> Value {
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

/// Invoked in the scheduler process with `(job_id, instance_id, return_value)`.
pub type SuccessCallback = Arc<dyn Fn(&str, InstanceId, &Value) + Send + Sync>;
/// Invoked in the scheduler process with `(job_id, instance_id, failure)`.
pub type ErrorCallback = Arc<dyn Fn(&str, InstanceId, &JobFailure) + Send + Sync>;

/// Process-local parts of a job. Never persisted; a restarted process must
/// re-attach them.
#[derive(Clone, Default)]
pub struct JobHooks {
    pub dynamic_args: Vec<(String, Arc<dyn ArgProvider>)>,
    pub callback: Option<SuccessCallback>,
    pub error_callback: Option<ErrorCallback>,
}

impl JobHooks {
    pub fn is_empty(&self) -> bool {
        self.dynamic_args.is_empty() && self.callback.is_none() && self.error_callback.is_none()
    }
}

impl fmt::Debug for JobHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.dynamic_args.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("JobHooks")
            .field("dynamic_args", &names)
            .field("callback", &self.callback.is_some())
            .field("error_callback", &self.error_callback.is_some())
            .finish()
    }
}

/// A schedulable unit of work.
///
/// Invariant: `next_run_time.is_some()` implies `active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// Task key the worker process resolves through its registry.
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
    pub trigger: Trigger,
    pub next_run_time: Option<DateTime<Utc>>,
    pub active: bool,
    /// Collapse several overdue fire times into one run.
    pub coalesce: bool,
    /// `None` means unlimited concurrent instances.
    pub max_instances: Option<u32>,
    #[serde(skip)]
    pub hooks: JobHooks,
}

impl Job {
    pub fn ensure_consistent(&self) -> Result<()> {
        check_invariant(&self.id, self.next_run_time, self.active)
    }

    /// Overdue fire times as of `now`, oldest first. A coalescing job yields
    /// at most the latest one.
    pub fn run_times(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut times = Vec::new();
        let mut next = self.next_run_time;
        while let Some(run_time) = next {
            if run_time > now {
                break;
            }
            if self.coalesce {
                times.clear();
            }
            times.push(run_time);
            next = self.trigger.get_next_fire_time(Some(run_time), now);
        }
        times
    }

    /// Static kwargs followed by freshly produced dynamic ones. A dynamic
    /// argument replaces a static one of the same name.
    pub fn resolved_kwargs(&self) -> Result<Vec<(String, Value)>> {
        let mut kwargs = self.kwargs.clone();
        for (name, provider) in &self.hooks.dynamic_args {
            let value = catch_unwind(AssertUnwindSafe(|| provider.produce())).map_err(|panic| {
                SchedulerError::DynamicArgument {
                    name: name.clone(),
                    message: panic_message(panic.as_ref()),
                }
            })?;
            match kwargs.iter_mut().find(|(k, _)| k == name) {
                Some(slot) => slot.1 = value,
                None => kwargs.push((name.clone(), value)),
            }
        }
        Ok(kwargs)
    }
}

fn check_invariant(job_id: &str, next_run_time: Option<DateTime<Utc>>, active: bool) -> Result<()> {
    if next_run_time.is_some() && !active {
        return Err(SchedulerError::InvalidJobState {
            job_id: job_id.to_string(),
            reason: "next_run_time cannot be set on an inactive job".to_string(),
        });
    }
    Ok(())
}

/// Everything `Scheduler::add_job` accepts.
#[derive(Debug, Clone)]
pub struct NewJob {
    id: Option<String>,
    name: Option<String>,
    task: String,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    trigger: Option<Trigger>,
    next_run_time: Option<DateTime<Utc>>,
    active: bool,
    coalesce: Option<bool>,
    max_instances: Option<Option<u32>>,
    hooks: JobHooks,
}

impl NewJob {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            task: task.into(),
            args: Vec::new(),
            kwargs: Vec::new(),
            trigger: None,
            next_run_time: None,
            active: true,
            coalesce: None,
            max_instances: None,
            hooks: JobHooks::default(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.push((name.into(), value.into()));
        self
    }

    pub fn dynamic_arg(mut self, name: impl Into<String>, provider: impl ArgProvider + 'static) -> Self {
        self.hooks
            .dynamic_args
            .push((name.into(), Arc::new(provider)));
        self
    }

    /// Omitted means "fire once, now".
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Override the first fire time instead of asking the trigger.
    pub fn next_run_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_time = Some(at);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn max_instances(mut self, max: u32) -> Self {
        self.max_instances = Some(Some(max));
        self
    }

    pub fn unlimited_instances(mut self) -> Self {
        self.max_instances = Some(None);
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, InstanceId, &Value) + Send + Sync + 'static,
    {
        self.hooks.callback = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, InstanceId, &JobFailure) + Send + Sync + 'static,
    {
        self.hooks.error_callback = Some(Arc::new(callback));
        self
    }

    /// Resolve defaults and produce the job to persist.
    pub fn into_job(self, now: DateTime<Utc>, timezone: Tz, defaults: &JobDefaults) -> Result<Job> {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        check_invariant(&id, self.next_run_time, self.active)?;

        let mut trigger = self.trigger.unwrap_or_else(|| Trigger::once(now));
        trigger.validate()?;
        trigger.bind_timezone(timezone);

        let next_run_time = match (self.active, self.next_run_time) {
            (false, _) => None,
            (true, Some(at)) => Some(at),
            (true, None) => trigger.get_next_fire_time(None, now),
        };

        Ok(Job {
            name: self.name.unwrap_or_else(|| self.task.clone()),
            id,
            task: self.task,
            args: self.args,
            kwargs: self.kwargs,
            trigger,
            next_run_time,
            active: self.active,
            coalesce: self.coalesce.unwrap_or(defaults.coalesce),
            max_instances: self
                .max_instances
                .unwrap_or_else(|| max_instances_limit(defaults.max_instances)),
            hooks: self.hooks,
        })
    }
}

impl From<&JobSpec> for NewJob {
    fn from(spec: &JobSpec) -> Self {
        let mut job = NewJob::new(spec.task.clone());
        job.id = spec.id.clone();
        job.name = spec.name.clone();
        job.args = spec.args.clone();
        job.kwargs = spec
            .kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        job.trigger = spec.trigger.clone();
        job.coalesce = spec.coalesce;
        job.max_instances = spec.max_instances.map(max_instances_limit);
        job
    }
}

/// Field changes accepted by `Scheduler::modify_job`. Unset fields keep
/// their current value.
#[derive(Debug, Clone, Default)]
pub struct JobChanges {
    name: Option<String>,
    task: Option<String>,
    args: Option<Vec<Value>>,
    kwargs: Option<Vec<(String, Value)>>,
    trigger: Option<Option<Trigger>>,
    next_run_time: Option<Option<DateTime<Utc>>>,
    active: Option<bool>,
    coalesce: Option<bool>,
    max_instances: Option<Option<u32>>,
}

impl JobChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn kwargs(mut self, kwargs: Vec<(String, Value)>) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(Some(trigger));
        self
    }

    /// Reset the trigger to "fire once, now".
    pub fn clear_trigger(mut self) -> Self {
        self.trigger = Some(None);
        self
    }

    pub fn next_run_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_time = Some(Some(at));
        self
    }

    pub fn clear_next_run_time(mut self) -> Self {
        self.next_run_time = Some(None);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn max_instances(mut self, max: Option<u32>) -> Self {
        self.max_instances = Some(max);
        self
    }

    /// Validate the merged state, then apply it to `job`.
    ///
    /// Nothing is changed when validation fails. When the trigger changes, or
    /// the job is switched back on without an explicit `next_run_time`, the
    /// next run is recomputed from the trigger.
    pub(crate) fn apply(self, job: &mut Job, now: DateTime<Utc>, timezone: Tz) -> Result<()> {
        let active = self.active.unwrap_or(job.active);
        let next_run_time = self.next_run_time.unwrap_or(job.next_run_time);
        check_invariant(&job.id, next_run_time, active)?;

        let trigger = match self.trigger {
            Some(Some(trigger)) => {
                trigger.validate()?;
                Some(trigger)
            }
            Some(None) => Some(Trigger::once(now)),
            None => None,
        };

        let reactivated = active && !job.active;
        let trigger_changed = trigger.is_some();

        if let Some(name) = self.name {
            job.name = name;
        }
        if let Some(task) = self.task {
            job.task = task;
        }
        if let Some(args) = self.args {
            job.args = args;
        }
        if let Some(kwargs) = self.kwargs {
            job.kwargs = kwargs;
        }
        if let Some(trigger) = trigger {
            job.trigger = trigger;
        }
        if let Some(coalesce) = self.coalesce {
            job.coalesce = coalesce;
        }
        if let Some(max) = self.max_instances {
            job.max_instances = max;
        }
        job.trigger.bind_timezone(timezone);
        job.active = active;
        job.next_run_time = next_run_time;

        let explicit_next = self.next_run_time.is_some();
        if active && !explicit_next && (trigger_changed || (reactivated && next_run_time.is_none())) {
            job.next_run_time = job.trigger.get_next_fire_time(None, now);
        }

        job.ensure_consistent()
    }
}

/// Why a job run did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    /// The task returned an error (or panicked) inside the worker.
    #[error("job raised an error: {message}")]
    Raised { message: String },

    /// The worker exited without reporting a result.
    #[error("worker exited without a result ({status})")]
    Crashed { status: String },

    /// The worker was killed on request.
    #[error("worker was terminated")]
    Terminated,
}

/// Result of one job run as seen by the scheduler process.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(Value),
    Failure(JobFailure),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }
}
