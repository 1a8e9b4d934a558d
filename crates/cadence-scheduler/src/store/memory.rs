use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{Result, SchedulerError};
use crate::store::{listing_order, next_instance_id_after, JobStore};
use crate::types::{InstanceId, Job};

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<String, Job>,
    last_instance_id: Option<i64>,
}

/// Volatile store. Jobs and the allocator position are lost with the process.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the allocator after `last` instead of from the bottom of the range.
    pub fn with_last_instance_id(last: i64) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                jobs: HashMap::new(),
                last_instance_id: Some(last),
            }),
        }
    }
}

impl JobStore for MemoryJobStore {
    fn add_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        if inner.jobs.contains_key(&job.id) {
            return Err(SchedulerError::ConflictingJobId { id: job.id.clone() });
        }
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        match inner.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(SchedulerError::JobNotFound { id: job.id.clone() }),
        }
    }

    fn remove_job(&self, job_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        inner
            .jobs
            .remove(job_id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    fn get_job(&self, job_id: &str) -> Result<Job> {
        let inner = self.inner.lock().expect("job store poisoned");
        inner
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    fn get_jobs(&self, pattern: Option<&str>) -> Result<Vec<Job>> {
        let re = pattern.map(Regex::new).transpose()?;
        let inner = self.inner.lock().expect("job store poisoned");
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| re.as_ref().map_or(true, |re| re.is_match(&j.id)))
            .cloned()
            .collect();
        jobs.sort_by(listing_order);
        Ok(jobs)
    }

    fn contains_job(&self, job_id: &str) -> Result<bool> {
        let inner = self.inner.lock().expect("job store poisoned");
        Ok(inner.jobs.contains_key(job_id))
    }

    fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().expect("job store poisoned");
        let mut due: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.active && j.next_run_time.is_some_and(|t| t <= now))
            .cloned()
            .collect();
        due.sort_by(listing_order);
        Ok(due)
    }

    fn get_next_run_time(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().expect("job store poisoned");
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.active)
            .filter_map(|j| j.next_run_time)
            .min())
    }

    fn next_instance_id(&self) -> Result<InstanceId> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        let id = next_instance_id_after(inner.last_instance_id);
        inner.last_instance_id = Some(i64::from(id));
        Ok(id)
    }
}
