//! `cadence-scheduler` — job scheduler that runs every job instance in its
//! own worker process.
//!
//! # Overview
//!
//! Jobs live in a [`store::JobStore`] (in memory or SQLite). The
//! [`engine::Scheduler`] decision loop sleeps until the earliest due job,
//! hands each due run to the [`executor::Executor`], and advances the job via
//! its trigger. The executor re-launches the `cadence` binary as a worker for
//! every run, enforces per-job instance limits, and reports outcomes through
//! the [`events::EventBus`].
//!
//! # Event kinds
//!
//! | Kind                 | Emitted when                                   |
//! |----------------------|------------------------------------------------|
//! | `SCHEDULER_*`        | start, stop, pause, resume                     |
//! | `JOB_ADDED/MODIFIED` | a job is stored or changed                     |
//! | `JOB_REMOVED`        | removed explicitly or after its last fire time |
//! | `JOB_SUBMITTED`      | a run was handed to a worker                   |
//! | `JOB_MAX_INSTANCES`  | a run was skipped at the instance limit        |
//! | `JOB_EXECUTED/ERROR` | a worker finished                              |
//! | `JOB_TERMINATED`     | an instance was killed on request              |

pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod store;
pub mod tasks;
pub mod types;
pub mod worker;

pub use engine::{Scheduler, SchedulerState};
pub use error::{Result, SchedulerError};
pub use events::{EventMask, JobExecutionEvent, ListenerId, SchedulerEvent};
pub use executor::RunningInstance;
pub use store::{JobStore, MemoryJobStore, SqliteJobStore};
pub use types::{
    CurrentTime, InstanceId, Job, JobChanges, JobFailure, JobOutcome, NewJob, MAX_INSTANCE_ID,
    MIN_INSTANCE_ID,
};
pub use worker::{TaskContext, TaskRegistry};
