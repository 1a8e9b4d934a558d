use rusqlite::Connection;

use crate::error::Result;

/// Key in `scheduler_meta` holding the allocator position.
pub(crate) const LAST_INSTANCE_ID_KEY: &str = "last_instance_id";

/// Initialise the job store schema in `conn`.
///
/// Timestamps are fixed-width RFC 3339 UTC strings, so text comparison in the
/// due-jobs query matches chronological order.
pub(crate) fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id             TEXT    NOT NULL PRIMARY KEY,
            name           TEXT    NOT NULL,
            task           TEXT    NOT NULL,
            args           TEXT    NOT NULL,   -- JSON array
            kwargs         TEXT    NOT NULL,   -- JSON array of [name, value]
            trigger_spec   TEXT    NOT NULL,   -- JSON-encoded Trigger
            next_run_time  TEXT,               -- NULL when paused or exhausted
            active         INTEGER NOT NULL,
            coalesce_runs  INTEGER NOT NULL,
            max_instances  INTEGER,            -- NULL means unlimited
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs (next_run_time);

        CREATE TABLE IF NOT EXISTS scheduler_meta (
            key    TEXT    NOT NULL PRIMARY KEY,
            value  INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
