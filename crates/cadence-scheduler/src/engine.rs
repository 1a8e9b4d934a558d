use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::{ExecutorConfig, SchedulerConfig};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::events::{EventBus, EventMask, ListenerId, SchedulerEvent};
use crate::executor::{Executor, RunningInstance};
use crate::store::JobStore;
use crate::types::{InstanceId, Job, JobChanges, NewJob};

const MAX_RETRY_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

struct Shared {
    config: SchedulerConfig,
    executor_config: ExecutorConfig,
    store: Arc<dyn JobStore>,
    events: Arc<EventBus>,
    state: Mutex<SchedulerState>,
    /// Collapses any number of wakeup requests into one pending permit.
    wakeup: Notify,
    /// Serializes job-store read-modify-write between the loop and callers.
    jobstore_lock: Mutex<()>,
    executor: Mutex<Option<Arc<Executor>>>,
    run_loop: Mutex<Option<JoinHandle<()>>>,
    wakeup_logger: Mutex<Option<ListenerId>>,
}

/// Drives jobs from a [`JobStore`] into worker processes.
///
/// Cheap to clone; all clones share one scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: SchedulerConfig,
        executor_config: ExecutorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                executor_config,
                store,
                events: Arc::new(EventBus::new()),
                state: Mutex::new(SchedulerState::Stopped),
                wakeup: Notify::new(),
                jobstore_lock: Mutex::new(()),
                executor: Mutex::new(None),
                run_loop: Mutex::new(None),
                wakeup_logger: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.shared.store)
    }

    /// Start the executor and the decision loop. Must be called from within
    /// a Tokio runtime.
    pub fn start(&self, paused: bool) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock().expect("scheduler state poisoned");
            if *state != SchedulerState::Stopped {
                return Err(SchedulerError::AlreadyRunning);
            }

            shared.store.setup()?;
            let executor = Arc::new(Executor::new(
                shared.executor_config.clone(),
                Arc::clone(&shared.store),
                Arc::clone(&shared.events),
            ));
            if let Err(e) = executor.start() {
                if let Err(te) = shared.store.teardown() {
                    warn!(error = %te, "job store teardown failed");
                }
                return Err(e);
            }
            *shared.executor.lock().expect("scheduler executor poisoned") = Some(executor);
            *state = if paused {
                SchedulerState::Paused
            } else {
                SchedulerState::Running
            };
        }

        let store = Arc::clone(&shared.store);
        let logger = shared.events.add_listener(
            EventMask::JOB_EXECUTED | EventMask::JOB_ERROR,
            move |_| match store.get_next_run_time() {
                Ok(Some(at)) => info!(next_wakeup = %at, "next wakeup scheduled"),
                Ok(None) => info!("no jobs scheduled; waiting until a job is added"),
                Err(e) => warn!(error = %e, "could not read next run time"),
            },
        );
        *shared.wakeup_logger.lock().expect("scheduler listener poisoned") = Some(logger);

        info!(paused, timezone = %shared.config.timezone, "scheduler started");
        shared
            .events
            .dispatch(&SchedulerEvent::scheduler(EventMask::SCHEDULER_STARTED));
        if !paused {
            shared.wakeup.notify_one();
        }

        let handle = tokio::spawn(run_loop(Arc::clone(shared)));
        *shared.run_loop.lock().expect("scheduler loop poisoned") = Some(handle);
        Ok(())
    }

    /// Stop the loop, then the executor (waiting for running instances when
    /// `wait`), then the store.
    pub async fn shutdown(&self, wait: bool) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock().expect("scheduler state poisoned");
            if *state == SchedulerState::Stopped {
                return Err(SchedulerError::NotRunning);
            }
            *state = SchedulerState::Stopped;
        }
        shared.wakeup.notify_one();

        let handle = shared.run_loop.lock().expect("scheduler loop poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "decision loop ended abnormally");
            }
        }

        let executor = shared.executor.lock().expect("scheduler executor poisoned").take();
        if let Some(executor) = executor {
            executor.shutdown(wait).await;
        }
        if let Err(e) = shared.store.teardown() {
            warn!(error = %e, "job store teardown failed");
        }

        info!(wait, "scheduler stopped");
        shared
            .events
            .dispatch(&SchedulerEvent::scheduler(EventMask::SCHEDULER_STOPPED));
        let logger = shared.wakeup_logger.lock().expect("scheduler listener poisoned").take();
        if let Some(id) = logger {
            shared.events.remove_listener(id);
        }
        Ok(())
    }

    /// Stop processing due jobs. Running instances are not affected.
    pub fn pause(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("scheduler state poisoned");
            match *state {
                SchedulerState::Stopped => return Err(SchedulerError::NotRunning),
                SchedulerState::Paused => return Ok(()),
                SchedulerState::Running => *state = SchedulerState::Paused,
            }
        }
        info!("scheduler paused");
        self.shared
            .events
            .dispatch(&SchedulerEvent::scheduler(EventMask::SCHEDULER_PAUSED));
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("scheduler state poisoned");
            match *state {
                SchedulerState::Stopped => return Err(SchedulerError::NotRunning),
                SchedulerState::Running => return Ok(()),
                SchedulerState::Paused => *state = SchedulerState::Running,
            }
        }
        info!("scheduler resumed");
        self.shared
            .events
            .dispatch(&SchedulerEvent::scheduler(EventMask::SCHEDULER_RESUMED));
        self.shared.wakeup.notify_one();
        Ok(())
    }

    pub fn add_job(&self, new_job: NewJob) -> Result<Job> {
        let shared = &self.shared;
        let job = new_job.into_job(
            Utc::now(),
            shared.config.timezone,
            &shared.config.job_defaults,
        )?;
        {
            let _guard = shared.jobstore_lock.lock().expect("job store lock poisoned");
            shared.store.add_job(&job)?;
        }

        info!(job_id = %job.id, name = %job.name, next_run_time = ?job.next_run_time, "job added");
        shared
            .events
            .dispatch(&SchedulerEvent::job(EventMask::JOB_ADDED, &job.id));
        if job.active {
            shared.wake_if_running();
        }
        Ok(job)
    }

    /// Apply `changes` to a stored job. Nothing is persisted when the merged
    /// state is invalid.
    pub fn modify_job(&self, job_id: &str, changes: JobChanges) -> Result<Job> {
        let shared = &self.shared;
        let job = {
            let _guard = shared.jobstore_lock.lock().expect("job store lock poisoned");
            let mut job = shared.store.get_job(job_id)?;
            changes.apply(&mut job, Utc::now(), shared.config.timezone)?;
            shared.store.update_job(&job)?;
            job
        };

        info!(job_id = %job.id, next_run_time = ?job.next_run_time, active = job.active, "job modified");
        shared
            .events
            .dispatch(&SchedulerEvent::job(EventMask::JOB_MODIFIED, &job.id));
        shared.wake_if_running();
        Ok(job)
    }

    pub fn pause_job(&self, job_id: &str) -> Result<Job> {
        self.modify_job(job_id, JobChanges::new().active(false).clear_next_run_time())
    }

    /// Reactivate a paused job; its next run is recomputed from the trigger.
    pub fn resume_job(&self, job_id: &str) -> Result<Job> {
        self.modify_job(job_id, JobChanges::new().active(true))
    }

    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        {
            let _guard = self.shared.jobstore_lock.lock().expect("job store lock poisoned");
            self.shared.store.remove_job(job_id)?;
        }
        info!(job_id, "job removed");
        self.shared
            .events
            .dispatch(&SchedulerEvent::job(EventMask::JOB_REMOVED, job_id));
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job> {
        self.shared.store.get_job(job_id)
    }

    pub fn get_jobs(&self, pattern: Option<&str>) -> Result<Vec<Job>> {
        self.shared.store.get_jobs(pattern)
    }

    /// Run a job once, now, outside its schedule.
    pub fn trigger_job(&self, job_id: &str) -> Result<InstanceId> {
        let shared = &self.shared;
        let executor = shared.executor().ok_or(SchedulerError::ExecutorNotSetup)?;
        let job = shared.store.get_job(job_id)?;

        match executor.submit_job(&job, Utc::now()) {
            Ok(instance_id) => {
                shared
                    .events
                    .dispatch(&SchedulerEvent::job(EventMask::JOB_SUBMITTED, job_id));
                Ok(instance_id)
            }
            Err(e @ SchedulerError::MaxInstancesReached { .. }) => {
                warn!(job_id, error = %e, "manual run skipped");
                shared
                    .events
                    .dispatch(&SchedulerEvent::job(EventMask::JOB_MAX_INSTANCES, job_id));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Kill a running instance. Returns the owning job's ID.
    pub async fn terminate_job(&self, instance_id: InstanceId) -> Result<String> {
        let executor = self
            .shared
            .executor()
            .ok_or(SchedulerError::InstanceNotFound { instance_id })?;
        let job_id = executor.terminate_job(instance_id).await?;
        self.shared
            .events
            .dispatch(&SchedulerEvent::job(EventMask::JOB_TERMINATED, &job_id));
        Ok(job_id)
    }

    pub fn get_job_instance_ids(&self, job_id: &str) -> Vec<InstanceId> {
        self.shared
            .executor()
            .map(|e| e.instance_ids(job_id))
            .unwrap_or_default()
    }

    /// The job owning a live instance. Falls back to the submitted snapshot
    /// when the job has since left the store.
    pub fn get_job_with_instance_id(&self, instance_id: InstanceId) -> Result<Job> {
        let snapshot = self
            .shared
            .executor()
            .and_then(|e| e.instance_job(instance_id))
            .ok_or(SchedulerError::InstanceNotFound { instance_id })?;
        match self.shared.store.get_job(&snapshot.id) {
            Ok(job) => Ok(job),
            Err(SchedulerError::JobNotFound { .. }) => Ok(snapshot),
            Err(e) => Err(e),
        }
    }

    pub fn get_running_jobs(&self) -> Vec<RunningInstance> {
        self.shared
            .executor()
            .map(|e| e.running_instances())
            .unwrap_or_default()
    }

    pub fn add_listener<F>(&self, mask: EventMask, callback: F) -> ListenerId
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.shared.events.add_listener(mask, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.events.remove_listener(id)
    }
}

impl Shared {
    fn state(&self) -> SchedulerState {
        *self.state.lock().expect("scheduler state poisoned")
    }

    fn executor(&self) -> Option<Arc<Executor>> {
        self.executor
            .lock()
            .expect("scheduler executor poisoned")
            .clone()
    }

    fn wake_if_running(&self) {
        if self.state() == SchedulerState::Running {
            self.wakeup.notify_one();
        }
    }

    /// One pass over due jobs. Returns how long to sleep before the next
    /// pass, or `None` to wait until woken.
    fn process_jobs(&self) -> Option<Duration> {
        if self.state() == SchedulerState::Paused {
            return None;
        }
        let executor = self.executor()?;

        let now = Utc::now();
        let retry_delay = chrono::Duration::seconds(self.config.store_retry_secs.min(MAX_RETRY_SECS) as i64);
        let mut retry_at: Option<DateTime<Utc>> = None;
        let mut events = Vec::new();

        {
            let _guard = self.jobstore_lock.lock().expect("job store lock poisoned");
            match self.store.get_due_jobs(now) {
                Ok(due) => {
                    for job in due {
                        self.run_due_job(&executor, job, now, &mut events);
                    }
                }
                Err(e) => {
                    warn!(error = %e, retry_secs = self.config.store_retry_secs, "could not fetch due jobs; retrying");
                    retry_at = Some(now + retry_delay);
                }
            }
        }

        self.events.dispatch_all(events);

        // Overdue jobs are not retried before the store recovers.
        let next_run = if retry_at.is_some() {
            None
        } else {
            match self.store.get_next_run_time() {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "could not read next run time; retrying");
                    retry_at = Some(now + retry_delay);
                    None
                }
            }
        };

        let wake_at = next_run.into_iter().chain(retry_at).min()?;
        let wait = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(wait_secs = wait.as_secs_f64(), "next decision pass");
        Some(wait)
    }

    /// Submit the overdue runs of one job and advance or retire it.
    fn run_due_job(
        &self,
        executor: &Executor,
        mut job: Job,
        now: DateTime<Utc>,
        events: &mut Vec<SchedulerEvent>,
    ) {
        let run_times = job.run_times(now);
        let Some(&last) = run_times.last() else {
            return;
        };

        for &run_time in &run_times {
            match executor.submit_job(&job, run_time) {
                Ok(instance_id) => {
                    debug!(job_id = %job.id, instance_id, run_time = %run_time, "job submitted");
                    events.push(SchedulerEvent::job(EventMask::JOB_SUBMITTED, &job.id));
                }
                Err(e @ SchedulerError::MaxInstancesReached { .. }) => {
                    warn!(job_id = %job.id, run_time = %run_time, error = %e, "run skipped");
                    events.push(SchedulerEvent::job(EventMask::JOB_MAX_INSTANCES, &job.id));
                }
                Err(e) => {
                    error!(job_id = %job.id, run_time = %run_time, error = %e, "failed to submit job");
                }
            }
        }

        match job.trigger.get_next_fire_time(Some(last), now) {
            Some(next) => {
                job.next_run_time = Some(next);
                if let Err(e) = self.store.update_job(&job) {
                    error!(job_id = %job.id, error = %e, "failed to reschedule job");
                }
            }
            None => {
                match self.store.remove_job(&job.id) {
                    Ok(()) => {
                        info!(job_id = %job.id, "job has no further runs; removed");
                        events.push(SchedulerEvent::job(EventMask::JOB_REMOVED, &job.id));
                    }
                    Err(e) => error!(job_id = %job.id, error = %e, "failed to remove finished job"),
                }
            }
        }
    }
}

/// The decision loop. Sleeps until woken or the computed deadline passes,
/// then runs one pass unless stopped or paused.
async fn run_loop(shared: Arc<Shared>) {
    let max_wait = Duration::from_secs(shared.config.max_wait_secs.max(1));
    let mut wait: Option<Duration> = None;

    loop {
        let timeout = wait.map_or(max_wait, |w| w.min(max_wait));
        let _ = tokio::time::timeout(timeout, shared.wakeup.notified()).await;

        match shared.state() {
            SchedulerState::Stopped => break,
            SchedulerState::Paused => wait = None,
            SchedulerState::Running => wait = shared.process_jobs(),
        }
    }
    debug!("decision loop exited");
}
