//! Job persistence and the instance-ID allocator.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{InstanceId, Job, MAX_INSTANCE_ID, MIN_INSTANCE_ID};

/// Storage backend consumed by the scheduler and the executor.
///
/// Implementations must be safe to share across threads; every method takes
/// `&self` and synchronizes internally.
pub trait JobStore: Send + Sync {
    /// Called by `Scheduler::start`.
    fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Called by `Scheduler::shutdown` after the executor is torn down.
    fn teardown(&self) -> Result<()> {
        Ok(())
    }

    /// Fails with `ConflictingJobId` if the ID is taken.
    fn add_job(&self, job: &Job) -> Result<()>;

    /// Fails with `JobNotFound` if the job does not exist.
    fn update_job(&self, job: &Job) -> Result<()>;

    /// Fails with `JobNotFound` if the job does not exist.
    fn remove_job(&self, job_id: &str) -> Result<()>;

    fn get_job(&self, job_id: &str) -> Result<Job>;

    /// All jobs, or those whose ID matches `pattern` (a regular expression),
    /// ordered by next run time with paused jobs last.
    fn get_jobs(&self, pattern: Option<&str>) -> Result<Vec<Job>>;

    fn contains_job(&self, job_id: &str) -> Result<bool>;

    /// Active jobs with `next_run_time <= now`, ordered by `(next_run_time, id)`.
    fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Earliest `next_run_time` among active jobs.
    fn get_next_run_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Allocate the next instance ID and persist it before returning.
    fn next_instance_id(&self) -> Result<InstanceId>;
}

/// One allocator step: the ID that follows `last`.
///
/// A missing or out-of-range `last` restarts the sequence at
/// [`MIN_INSTANCE_ID`]; after [`MAX_INSTANCE_ID`] it wraps around.
pub fn next_instance_id_after(last: Option<i64>) -> InstanceId {
    let floor = i64::from(MIN_INSTANCE_ID) - 1;
    let mut current = last.unwrap_or(floor);
    if current < floor || current > i64::from(MAX_INSTANCE_ID) {
        current = floor;
    }
    let next = current + 1;
    if next > i64::from(MAX_INSTANCE_ID) {
        MIN_INSTANCE_ID
    } else {
        // In range by the checks above.
        next as InstanceId
    }
}

/// Sort order shared by the backends for `get_jobs`.
pub(crate) fn listing_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    match (a.next_run_time, b.next_run_time) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    }
}
