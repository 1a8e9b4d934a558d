//! Runs job instances in isolated worker processes.
//!
//! Every submitted run gets its own child process and a supervising task that
//! feeds the request, collects stdout, and waits for exit (or a kill request).
//! Outcomes flow back through an unbounded channel to a single completion
//! loop, which invokes job callbacks, cleans up bookkeeping and dispatches
//! execution events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::ExecutorConfig;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::events::{guarded, EventBus, EventMask, JobExecutionEvent, SchedulerEvent};
use crate::store::JobStore;
use crate::types::{InstanceId, Job, JobOutcome};
use crate::worker::{read_outcome, WorkerRequest};

/// Snapshot of one live instance.
#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub job_id: String,
    pub instance_id: InstanceId,
    pub run_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub pid: Option<u32>,
}

struct InstanceRecord {
    job: Job,
    run_time: DateTime<Utc>,
    start_time: DateTime<Utc>,
    pid: Option<u32>,
    /// Taken when a kill is requested.
    kill_tx: Option<oneshot::Sender<()>>,
    /// Flips to `true` once the worker has exited and its completion is queued.
    exited: watch::Receiver<bool>,
    /// Set by `terminate_job`; a late completion for it is dropped.
    terminated: bool,
}

impl InstanceRecord {
    fn is_alive(&self) -> bool {
        !*self.exited.borrow()
    }
}

/// The two indices over live instances, kept in step.
#[derive(Default)]
struct Instances {
    by_id: HashMap<InstanceId, InstanceRecord>,
    by_job: HashMap<String, Vec<InstanceId>>,
}

impl Instances {
    fn live_count(&self, job_id: &str) -> usize {
        self.by_job.get(job_id).map_or(0, Vec::len)
    }

    fn insert(&mut self, instance_id: InstanceId, record: InstanceRecord) {
        self.by_job
            .entry(record.job.id.clone())
            .or_default()
            .push(instance_id);
        self.by_id.insert(instance_id, record);
    }

    /// Safe to call for an instance that is already gone.
    fn remove(&mut self, job_id: &str, instance_id: InstanceId) -> Option<InstanceRecord> {
        if let Some(ids) = self.by_job.get_mut(job_id) {
            ids.retain(|id| *id != instance_id);
            if ids.is_empty() {
                self.by_job.remove(job_id);
            }
        }
        self.by_id.remove(&instance_id)
    }

    fn clear(&mut self) {
        self.by_id.clear();
        self.by_job.clear();
    }
}

/// Message from a supervising task to the completion loop.
#[derive(Debug)]
struct Completion {
    job_id: String,
    instance_id: InstanceId,
    run_time: DateTime<Utc>,
    outcome: JobOutcome,
}

struct CompletionChannel {
    tx: mpsc::UnboundedSender<Completion>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    runtime: Handle,
}

pub struct Executor {
    config: ExecutorConfig,
    store: Arc<dyn JobStore>,
    events: Arc<EventBus>,
    instances: Mutex<Instances>,
    channel: Mutex<Option<CompletionChannel>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, store: Arc<dyn JobStore>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            store,
            events,
            instances: Mutex::new(Instances::default()),
            channel: Mutex::new(None),
        }
    }

    /// Start the completion loop on the current Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|e| SchedulerError::WorkerSpawn(format!("no async runtime: {e}")))?;
        let mut channel = self.channel.lock().expect("executor channel poisoned");
        if channel.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(Arc::clone(self).completion_loop(rx, shutdown_rx));
        *channel = Some(CompletionChannel {
            tx,
            shutdown: shutdown_tx,
            handle,
            runtime,
        });
        debug!("executor started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.channel
            .lock()
            .expect("executor channel poisoned")
            .is_some()
    }

    /// Launch one run of `job` for `run_time` in a new worker process.
    ///
    /// Fails with `MaxInstancesReached` without starting anything when the
    /// job is at its concurrency limit.
    pub fn submit_job(&self, job: &Job, run_time: DateTime<Utc>) -> Result<InstanceId> {
        let (completions, runtime) = {
            let channel = self.channel.lock().expect("executor channel poisoned");
            match channel.as_ref() {
                Some(c) => (c.tx.clone(), c.runtime.clone()),
                None => return Err(SchedulerError::ExecutorNotSetup),
            }
        };

        let mut instances = self.instances.lock().expect("executor instances poisoned");
        if let Some(max) = job.max_instances {
            if instances.live_count(&job.id) >= max as usize {
                return Err(SchedulerError::MaxInstancesReached {
                    job_id: job.id.clone(),
                    max,
                });
            }
        }

        let kwargs = job.resolved_kwargs()?;
        let instance_id = self.store.next_instance_id()?;
        let payload = serde_json::to_vec(&WorkerRequest {
            job_id: job.id.clone(),
            instance_id,
            task: job.task.clone(),
            args: job.args.clone(),
            kwargs,
        })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        instances.insert(
            instance_id,
            InstanceRecord {
                job: job.clone(),
                run_time,
                start_time: Utc::now(),
                pid: None,
                kill_tx: Some(kill_tx),
                exited: exited_rx,
                terminated: false,
            },
        );

        let _runtime = runtime.enter();
        let child = match self.worker_command().and_then(|mut cmd| {
            cmd.spawn()
                .map_err(|e| SchedulerError::WorkerSpawn(e.to_string()))
        }) {
            Ok(child) => child,
            Err(e) => {
                instances.remove(&job.id, instance_id);
                warn!(job_id = %job.id, instance_id, error = %e, "worker failed to start");
                return Err(e);
            }
        };

        let pid = child.id();
        if let Some(record) = instances.by_id.get_mut(&instance_id) {
            record.pid = pid;
        }
        drop(instances);

        info!(job_id = %job.id, instance_id, ?pid, run_time = %run_time, "job instance started");
        runtime.spawn(supervise(
            child,
            payload,
            kill_rx,
            exited_tx,
            completions,
            Duration::from_millis(self.config.join_timeout_ms / 2),
            job.id.clone(),
            instance_id,
            run_time,
        ));
        Ok(instance_id)
    }

    fn worker_command(&self) -> Result<Command> {
        let program = match &self.config.worker_program {
            Some(p) => PathBuf::from(p),
            None => std::env::current_exe()
                .map_err(|e| SchedulerError::WorkerSpawn(format!("cannot locate executable: {e}")))?,
        };
        let mut cmd = Command::new(program);
        cmd.args(&self.config.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Kill a live instance and forget it. Returns the owning job ID.
    pub async fn terminate_job(&self, instance_id: InstanceId) -> Result<String> {
        let job_id = {
            let instances = self.instances.lock().expect("executor instances poisoned");
            instances
                .by_id
                .get(&instance_id)
                .map(|r| r.job.id.clone())
                .ok_or(SchedulerError::InstanceNotFound { instance_id })?
        };
        self.cleanup(&job_id, instance_id, true).await;
        info!(job_id = %job_id, instance_id, "job instance terminated");
        Ok(job_id)
    }

    /// Drop bookkeeping for an instance, killing it first when `terminate`.
    async fn cleanup(&self, job_id: &str, instance_id: InstanceId, terminate: bool) {
        let mut exited = {
            let mut instances = self.instances.lock().expect("executor instances poisoned");
            let Some(record) = instances.by_id.get_mut(&instance_id) else {
                debug!(job_id, instance_id, "instance already cleaned up");
                return;
            };
            if terminate {
                record.terminated = true;
                if record.is_alive() {
                    if let Some(kill) = record.kill_tx.take() {
                        let _ = kill.send(());
                    }
                }
            }
            record.exited.clone()
        };

        let join_timeout = Duration::from_millis(self.config.join_timeout_ms);
        if tokio::time::timeout(join_timeout, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(job_id, instance_id, "worker did not exit within the join timeout");
        }

        self.instances
            .lock()
            .expect("executor instances poisoned")
            .remove(job_id, instance_id);
    }

    /// Stop the executor. With `wait`, live workers are allowed to finish;
    /// otherwise they are killed. Safe to call more than once.
    pub async fn shutdown(&self, wait: bool) {
        let poll = Duration::from_millis(self.config.teardown_poll_ms.max(1));
        loop {
            let alive: Vec<(InstanceId, watch::Receiver<bool>)> = {
                let mut instances = self.instances.lock().expect("executor instances poisoned");
                instances
                    .by_id
                    .iter_mut()
                    .filter(|(_, r)| r.is_alive())
                    .map(|(id, r)| {
                        if !wait {
                            if let Some(kill) = r.kill_tx.take() {
                                let _ = kill.send(());
                            }
                        }
                        (*id, r.exited.clone())
                    })
                    .collect()
            };
            if alive.is_empty() {
                break;
            }
            debug!(count = alive.len(), wait, "waiting for workers to exit");
            for (_, mut exited) in alive {
                let _ = tokio::time::timeout(poll, exited.wait_for(|done| *done)).await;
            }
        }

        let channel = self
            .channel
            .lock()
            .expect("executor channel poisoned")
            .take();
        if let Some(channel) = channel {
            channel.shutdown.send_replace(true);
            drop(channel.tx);
            if let Err(e) = channel.handle.await {
                warn!(error = %e, "completion loop ended abnormally");
            }
        }

        self.instances
            .lock()
            .expect("executor instances poisoned")
            .clear();
        debug!("executor shut down");
    }

    async fn completion_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Completion>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(completion) => self.handle_completion(completion).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        while let Ok(completion) = rx.try_recv() {
            self.handle_completion(completion).await;
        }
    }

    async fn handle_completion(&self, completion: Completion) {
        let Completion {
            job_id,
            instance_id,
            run_time,
            outcome,
        } = completion;

        let job = {
            let instances = self.instances.lock().expect("executor instances poisoned");
            match instances.by_id.get(&instance_id) {
                Some(record) if !record.terminated => record.job.clone(),
                _ => {
                    debug!(job_id = %job_id, instance_id, "dropping completion of terminated instance");
                    return;
                }
            }
        };

        let kind = match &outcome {
            JobOutcome::Success(value) => {
                info!(job_id = %job_id, instance_id, "job instance succeeded");
                if let Some(callback) = &job.hooks.callback {
                    guarded("job callback", || callback(&job_id, instance_id, value));
                }
                EventMask::JOB_EXECUTED
            }
            JobOutcome::Failure(failure) => {
                warn!(job_id = %job_id, instance_id, error = %failure, "job instance failed");
                if let Some(callback) = &job.hooks.error_callback {
                    guarded("job error callback", || callback(&job_id, instance_id, failure));
                }
                EventMask::JOB_ERROR
            }
        };

        self.cleanup(&job_id, instance_id, false).await;

        self.events
            .dispatch(&SchedulerEvent::JobExecution(JobExecutionEvent {
                kind,
                job_id,
                instance_id,
                run_time,
                outcome,
            }));
    }

    pub fn instance_ids(&self, job_id: &str) -> Vec<InstanceId> {
        let instances = self.instances.lock().expect("executor instances poisoned");
        instances.by_job.get(job_id).cloned().unwrap_or_default()
    }

    /// The job a live instance belongs to, as it was when submitted.
    pub fn instance_job(&self, instance_id: InstanceId) -> Option<Job> {
        let instances = self.instances.lock().expect("executor instances poisoned");
        instances.by_id.get(&instance_id).map(|r| r.job.clone())
    }

    pub fn running_instances(&self) -> Vec<RunningInstance> {
        let instances = self.instances.lock().expect("executor instances poisoned");
        let mut running: Vec<RunningInstance> = instances
            .by_id
            .iter()
            .map(|(id, r)| RunningInstance {
                job_id: r.job.id.clone(),
                instance_id: *id,
                run_time: r.run_time,
                start_time: r.start_time,
                pid: r.pid,
            })
            .collect();
        running.sort_by_key(|r| r.instance_id);
        running
    }
}

/// Owns one worker process from spawn to exit.
///
/// The instance ends when the worker exits; stdout is drained for at most
/// `output_grace` after that, as a process the worker left behind may still
/// hold the pipe.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    payload: Vec<u8>,
    mut kill_rx: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
    completions: mpsc::UnboundedSender<Completion>,
    output_grace: Duration,
    job_id: String,
    instance_id: InstanceId,
    run_time: DateTime<Utc>,
) {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let mut output = Vec::new();

    let (status, killed) = {
        let feed = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(instance_id, error = %e, "could not write worker request");
                }
            }
        };

        let collect = async {
            if let Some(mut stdout) = stdout {
                if let Err(e) = stdout.read_to_end(&mut output).await {
                    debug!(instance_id, error = %e, "could not read worker output");
                }
            }
        };
        tokio::pin!(collect);

        let wait = async {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = &mut kill_rx => None,
            };
            match finished {
                Some(status) => (status, false),
                None => {
                    if let Err(e) = child.start_kill() {
                        warn!(instance_id, error = %e, "failed to kill worker");
                    }
                    (child.wait().await, true)
                }
            }
        };
        let run = async { tokio::join!(feed, wait).1 };
        tokio::pin!(run);

        let mut drained = false;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                () = &mut collect, if !drained => drained = true,
            }
        };
        if !drained && tokio::time::timeout(output_grace, &mut collect).await.is_err() {
            debug!(instance_id, "worker output still open after exit");
        }
        result
    };

    let exit = match &status {
        Ok(s) => s.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };

    let outcome = read_outcome(&output, &exit, killed);
    let _ = completions.send(Completion {
        job_id,
        instance_id,
        run_time,
        outcome,
    });
    exited.send_replace(true);
}
