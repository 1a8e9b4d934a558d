use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::error::{Result, SchedulerError};
use crate::store::schema::{init_db, LAST_INSTANCE_ID_KEY};
use crate::store::{next_instance_id_after, JobStore};
use crate::types::{InstanceId, Job, JobHooks};

const JOB_COLUMNS: &str = "id, name, task, args, kwargs, trigger_spec, next_run_time, active,
     coalesce_runs, max_instances";

struct SqliteInner {
    conn: Connection,
    /// Allocator position; loaded from `scheduler_meta` on first use.
    last_instance_id: Option<i64>,
    /// Callbacks and dynamic args cannot be persisted; they live here for
    /// the lifetime of the process.
    hooks: HashMap<String, JobHooks>,
}

impl SqliteInner {
    fn attach_hooks(&self, mut job: Job) -> Job {
        if let Some(hooks) = self.hooks.get(&job.id) {
            job.hooks = hooks.clone();
        }
        job
    }

    fn remember_hooks(&mut self, job: &Job) {
        if job.hooks.is_empty() {
            self.hooks.remove(&job.id);
        } else {
            self.hooks.insert(job.id.clone(), job.hooks.clone());
        }
    }

    fn query_jobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(sql)?;
        let jobs = stmt
            .query_map(params, row_to_job)?
            .collect::<rusqlite::Result<Vec<Job>>>()?;
        Ok(jobs.into_iter().map(|j| self.attach_hooks(j)).collect())
    }
}

/// Durable store backed by a single SQLite connection.
///
/// Jobs survive restarts, and so does the allocator position, so instance
/// IDs keep advancing across process lifetimes.
pub struct SqliteJobStore {
    inner: Mutex<SqliteInner>,
}

impl SqliteJobStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")?;
        Self::new(conn)
    }

    /// Wrap an already-open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            inner: Mutex::new(SqliteInner {
                conn,
                last_instance_id: None,
                hooks: HashMap::new(),
            }),
        })
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    fn add_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        let now = format_ts(Utc::now());
        let inserted = inner.conn.execute(
            "INSERT INTO jobs
             (id, name, task, args, kwargs, trigger_spec, next_run_time, active,
              coalesce_runs, max_instances, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?11)
             ON CONFLICT(id) DO NOTHING",
            rusqlite::params![
                job.id,
                job.name,
                job.task,
                serde_json::to_string(&job.args)?,
                serde_json::to_string(&job.kwargs)?,
                serde_json::to_string(&job.trigger)?,
                job.next_run_time.map(format_ts),
                job.active,
                job.coalesce,
                job.max_instances.map(i64::from),
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(SchedulerError::ConflictingJobId { id: job.id.clone() });
        }
        inner.remember_hooks(job);
        debug!("job stored");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        let updated = inner.conn.execute(
            "UPDATE jobs SET name = ?2, task = ?3, args = ?4, kwargs = ?5, trigger_spec = ?6,
                    next_run_time = ?7, active = ?8, coalesce_runs = ?9,
                    max_instances = ?10, updated_at = ?11
             WHERE id = ?1",
            rusqlite::params![
                job.id,
                job.name,
                job.task,
                serde_json::to_string(&job.args)?,
                serde_json::to_string(&job.kwargs)?,
                serde_json::to_string(&job.trigger)?,
                job.next_run_time.map(format_ts),
                job.active,
                job.coalesce,
                job.max_instances.map(i64::from),
                format_ts(Utc::now()),
            ],
        )?;
        if updated == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id.clone() });
        }
        inner.remember_hooks(job);
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove_job(&self, job_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        let removed = inner.conn.execute("DELETE FROM jobs WHERE id = ?1", [job_id])?;
        if removed == 0 {
            return Err(SchedulerError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        inner.hooks.remove(job_id);
        debug!("job deleted");
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Job> {
        let inner = self.inner.lock().expect("job store poisoned");
        let job = inner
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [job_id],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: job_id.to_string(),
            })?;
        Ok(inner.attach_hooks(job))
    }

    fn get_jobs(&self, pattern: Option<&str>) -> Result<Vec<Job>> {
        let re = pattern.map(Regex::new).transpose()?;
        let inner = self.inner.lock().expect("job store poisoned");
        let jobs = inner.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 ORDER BY next_run_time IS NULL, next_run_time, id"
            ),
            [],
        )?;
        Ok(match re {
            Some(re) => jobs.into_iter().filter(|j| re.is_match(&j.id)).collect(),
            None => jobs,
        })
    }

    fn contains_job(&self, job_id: &str) -> Result<bool> {
        let inner = self.inner.lock().expect("job store poisoned");
        let found = inner
            .conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [job_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    #[instrument(skip(self))]
    fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().expect("job store poisoned");
        inner.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE active = 1 AND next_run_time IS NOT NULL AND next_run_time <= ?1
                 ORDER BY next_run_time, id"
            ),
            [format_ts(now)],
        )
    }

    fn get_next_run_time(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().expect("job store poisoned");
        let next: Option<String> = inner.conn.query_row(
            "SELECT MIN(next_run_time) FROM jobs WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        next.map(|s| parse_ts(0, &s).map_err(SchedulerError::from))
            .transpose()
    }

    #[instrument(skip(self))]
    fn next_instance_id(&self) -> Result<InstanceId> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        let last = match inner.last_instance_id {
            Some(last) => Some(last),
            None => inner
                .conn
                .query_row(
                    "SELECT value FROM scheduler_meta WHERE key = ?1",
                    [LAST_INSTANCE_ID_KEY],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
        };

        let id = next_instance_id_after(last);
        inner.conn.execute(
            "INSERT INTO scheduler_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![LAST_INSTANCE_ID_KEY, i64::from(id)],
        )?;
        inner.last_instance_id = Some(i64::from(id));
        Ok(id)
    }
}

/// Fixed-width UTC timestamp (`2026-01-02T03:04:05.000000Z`).
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let next_run_time = row
        .get::<_, Option<String>>(6)?
        .map(|s| parse_ts(6, &s))
        .transpose()?;
    let max_instances = row
        .get::<_, Option<i64>>(9)?
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX));

    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        task: row.get(2)?,
        args: parse_json(3, &row.get::<_, String>(3)?)?,
        kwargs: parse_json(4, &row.get::<_, String>(4)?)?,
        trigger: parse_json(5, &row.get::<_, String>(5)?)?,
        next_run_time,
        active: row.get(7)?,
        coalesce: row.get(8)?,
        max_instances,
        hooks: JobHooks::default(),
    })
}
