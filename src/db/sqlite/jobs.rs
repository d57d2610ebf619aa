//! Job rows
//!
//! Every status change is a single conditional UPDATE on the current status,
//! so two callers racing for the same row resolve to one winner and one
//! no-op.

use crate::db::sqlite::models::{Job, JobError, JobKind, JobProgress, JobStatus};
use crate::error::{AppError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

const JOB_COLUMNS: &str =
    "id, kind, status, params, progress, result, error, created_at, started_at, completed_at";

/// Raw row before JSON and timestamp decoding
struct JobRow {
    id: String,
    kind: String,
    status: String,
    params: String,
    progress: String,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            status: row.get(2)?,
            params: row.get(3)?,
            progress: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            params: serde_json::from_str(&self.params)?,
            progress: serde_json::from_str(&self.progress)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error.as_deref().map(serde_json::from_str).transpose()?,
            created_at: from_millis(self.created_at)?,
            started_at: self.started_at.map(from_millis).transpose()?,
            completed_at: self.completed_at.map(from_millis).transpose()?,
            id: self.id,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AppError::Internal(format!("Invalid stored timestamp {}", ms)))
}

fn single_job(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Option<Job>> {
    conn.query_row(sql, params, JobRow::from_row)
        .optional()?
        .map(JobRow::into_job)
        .transpose()
}

/// Insert a pending job
pub fn create_job(
    conn: &Connection,
    kind: JobKind,
    params: &Value,
    progress: &JobProgress,
    now: DateTime<Utc>,
) -> Result<Job> {
    let id = uuid::Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO jobs (id, kind, status, params, progress, completed_steps, created_at)
         VALUES (?, ?, 'pending', ?, ?, ?, ?)",
        params![
            id,
            kind.as_str(),
            serde_json::to_string(params)?,
            serde_json::to_string(progress)?,
            progress.completed_steps,
            now.timestamp_millis(),
        ],
    )?;

    get_job(conn, &id)?.ok_or_else(|| AppError::Internal(format!("Job {} vanished after insert", id)))
}

/// Get job by ID
pub fn get_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    single_job(
        conn,
        &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
        [id],
    )
}

/// Claim the oldest pending job
pub fn claim_next_pending(conn: &Connection, now: DateTime<Utc>) -> Result<Option<Job>> {
    single_job(
        conn,
        &format!(
            "UPDATE jobs SET status = 'running', started_at = ?1
             WHERE id = (
                 SELECT id FROM jobs WHERE status = 'pending'
                 ORDER BY created_at ASC, rowid ASC LIMIT 1
             )
             AND status = 'pending'
             RETURNING {}",
            JOB_COLUMNS
        ),
        params![now.timestamp_millis()],
    )
}

/// Claim one specific job if it is still pending
pub fn claim_by_id(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
    single_job(
        conn,
        &format!(
            "UPDATE jobs SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'pending'
             RETURNING {}",
            JOB_COLUMNS
        ),
        params![now.timestamp_millis(), id],
    )
}

/// Record progress on a running job; stale (lower step count) writes are ignored
pub fn update_progress(conn: &Connection, id: &str, progress: &JobProgress) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET progress = ?1, completed_steps = ?2
         WHERE id = ?3 AND status = 'running' AND completed_steps <= ?2",
        params![
            serde_json::to_string(progress)?,
            progress.completed_steps,
            id
        ],
    )?;
    Ok(changed == 1)
}

/// running -> completed
pub fn complete(conn: &Connection, id: &str, result: &Value, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'completed', result = ?1, completed_at = ?2
         WHERE id = ?3 AND status = 'running'",
        params![serde_json::to_string(result)?, now.timestamp_millis(), id],
    )?;
    Ok(changed == 1)
}

/// running -> failed
pub fn fail(conn: &Connection, id: &str, error: &JobError, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'failed', error = ?1, completed_at = ?2
         WHERE id = ?3 AND status = 'running'",
        params![serde_json::to_string(error)?, now.timestamp_millis(), id],
    )?;
    Ok(changed == 1)
}

/// pending | running -> cancelled
pub fn cancel(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let now = now.timestamp_millis();
    let changed = conn.execute(
        "UPDATE jobs SET status = 'cancelled',
             started_at = COALESCE(started_at, ?1),
             completed_at = ?1
         WHERE id = ?2 AND status IN ('pending', 'running')",
        params![now, id],
    )?;
    Ok(changed == 1)
}

/// Pending jobs created before `cutoff`, oldest first
pub fn find_pending_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM jobs
         WHERE status = 'pending' AND created_at < ?
         ORDER BY created_at ASC, rowid ASC",
        JOB_COLUMNS
    ))?;

    let rows = stmt
        .query_map([cutoff.timestamp_millis()], JobRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(JobRow::into_job).collect()
}

/// Current status only
pub fn get_status(conn: &Connection, id: &str) -> Result<Option<JobStatus>> {
    conn.query_row("SELECT status FROM jobs WHERE id = ?", [id], |row| {
        row.get::<_, String>(0)
    })
    .optional()?
    .map(|s| s.parse())
    .transpose()
}
