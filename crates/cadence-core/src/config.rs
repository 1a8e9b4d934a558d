use std::collections::BTreeMap;

use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::trigger::Trigger;

pub const DEFAULT_MAX_WAIT_SECS: u64 = 3_600; // cap on a single decision-loop sleep
pub const DEFAULT_STORE_RETRY_SECS: u64 = 10; // back-off when the job store errors
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TEARDOWN_POLL_MS: u64 = 200;
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Jobs registered by `cadence run` on startup.
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Timezone bound onto every trigger added through the scheduler.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    /// Upper bound for one wait of the decision loop, even when no job is due.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// How long the loop waits before retrying after the job store failed.
    #[serde(default = "default_store_retry_secs")]
    pub store_retry_secs: u64,
    #[serde(default)]
    pub job_defaults: JobDefaults,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            max_wait_secs: DEFAULT_MAX_WAIT_SECS,
            store_retry_secs: DEFAULT_STORE_RETRY_SECS,
            job_defaults: JobDefaults::default(),
        }
    }
}

/// Values applied to new jobs that do not set them explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "bool_true")]
    pub coalesce: bool,
    /// `-1` means unlimited.
    #[serde(default = "default_max_instances")]
    pub max_instances: i64,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            coalesce: true,
            max_instances: default_max_instances(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Binary launched for every job run. Defaults to the running executable.
    #[serde(default)]
    pub worker_program: Option<String>,
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
    /// Bounded wait for a worker process to exit during cleanup.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    /// Poll interval while teardown waits for live workers.
    #[serde(default = "default_teardown_poll_ms")]
    pub teardown_poll_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            worker_args: default_worker_args(),
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            teardown_poll_ms: DEFAULT_TEARDOWN_POLL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// A job declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Task key resolved by the worker's task registry.
    pub task: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, serde_json::Value>,
    /// Omitted means "fire once, now".
    pub trigger: Option<Trigger>,
    pub coalesce: Option<bool>,
    /// `-1` means unlimited.
    pub max_instances: Option<i64>,
}

/// Convert the config-file convention (`-1` = unlimited) into an optional cap.
pub fn max_instances_limit(value: i64) -> Option<u32> {
    if value < 0 {
        None
    } else {
        Some(u32::try_from(value).unwrap_or(u32::MAX))
    }
}

fn bool_true() -> bool {
    true
}
fn default_timezone() -> Tz {
    chrono_tz::UTC
}
fn default_max_wait_secs() -> u64 {
    DEFAULT_MAX_WAIT_SECS
}
fn default_store_retry_secs() -> u64 {
    DEFAULT_STORE_RETRY_SECS
}
fn default_max_instances() -> i64 {
    1
}
fn default_worker_args() -> Vec<String> {
    vec![WORKER_SUBCOMMAND.to_string()]
}
fn default_join_timeout_ms() -> u64 {
    DEFAULT_JOIN_TIMEOUT_MS
}
fn default_teardown_poll_ms() -> u64 {
    DEFAULT_TEARDOWN_POLL_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// The file is the explicit path if given, else `~/.cadence/cadence.toml`.
    /// A missing file is not an error; every section has defaults. Nested
    /// keys use a double underscore: `CADENCE_SCHEDULER__MAX_WAIT_SECS=60`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading configuration");

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        for job in &config.jobs {
            if let Some(trigger) = &job.trigger {
                trigger.validate()?;
            }
        }

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::trigger::Schedule;

    #[test]
    fn defaults_are_sane() {
        let config = CadenceConfig::default();
        assert_eq!(config.scheduler.timezone, chrono_tz::UTC);
        assert_eq!(config.scheduler.max_wait_secs, DEFAULT_MAX_WAIT_SECS);
        assert!(config.scheduler.job_defaults.coalesce);
        assert_eq!(config.scheduler.job_defaults.max_instances, 1);
        assert_eq!(config.executor.worker_args, vec!["worker".to_string()]);
        assert!(config.executor.worker_program.is_none());
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn negative_max_instances_means_unlimited() {
        assert_eq!(max_instances_limit(-1), None);
        assert_eq!(max_instances_limit(0), Some(0));
        assert_eq!(max_instances_limit(3), Some(3));
    }

    #[test]
    fn loads_toml_file_with_jobs() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[scheduler]
timezone = "Europe/Paris"
store_retry_secs = 3

[scheduler.job_defaults]
max_instances = -1

[executor]
worker_program = "/usr/local/bin/cadence"
join_timeout_ms = 250

[[jobs]]
id = "nightly-report"
task = "shell"
kwargs = {{ command = "echo done" }}
trigger = {{ kind = "daily", hour = 2, minute = 15 }}
max_instances = 2
"#
        )
        .unwrap();

        let config = CadenceConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.scheduler.timezone, chrono_tz::Europe::Paris);
        assert_eq!(config.scheduler.store_retry_secs, 3);
        assert_eq!(config.scheduler.max_wait_secs, DEFAULT_MAX_WAIT_SECS);
        assert_eq!(config.scheduler.job_defaults.max_instances, -1);
        assert_eq!(
            config.executor.worker_program.as_deref(),
            Some("/usr/local/bin/cadence")
        );
        assert_eq!(config.executor.join_timeout_ms, 250);

        let job = &config.jobs[0];
        assert_eq!(job.id.as_deref(), Some("nightly-report"));
        assert_eq!(job.kwargs["command"], "echo done");
        assert_eq!(job.max_instances, Some(2));
        let trigger = job.trigger.as_ref().unwrap();
        assert_eq!(trigger.schedule, Schedule::Daily { hour: 2, minute: 15 });
    }

    #[test]
    fn invalid_job_trigger_fails_load() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[jobs]]
task = "echo"
trigger = {{ kind = "daily", hour = 25, minute = 0 }}
"#
        )
        .unwrap();

        let err = CadenceConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = CadenceConfig::load(path.to_str()).unwrap();
        assert!(config.jobs.is_empty());
        assert_eq!(config.executor.join_timeout_ms, DEFAULT_JOIN_TIMEOUT_MS);
    }
}
