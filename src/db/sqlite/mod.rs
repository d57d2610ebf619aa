//! SQLite job store

pub mod models;
mod candidates;
mod jobs;
mod migrations;

use crate::clock::Clock;
use crate::db::JobStore;
use crate::error::Result;
use chrono::Duration;
use models::*;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// SQLite-backed [`JobStore`]
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteJobStore {
    /// Open (or create) the database file and run migrations
    pub fn new(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while a claim is being written
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Self::with_connection(conn, clock)
    }

    /// Private in-memory database
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, clock)
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, kind: JobKind, params: &Value, progress: &JobProgress) -> Result<Job> {
        let conn = self.conn.lock();
        jobs::create_job(&conn, kind, params, progress, self.clock.now())
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        jobs::get_job(&conn, id)
    }

    fn get_status(&self, id: &str) -> Result<Option<JobStatus>> {
        let conn = self.conn.lock();
        jobs::get_status(&conn, id)
    }

    fn claim_next_pending(&self) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        jobs::claim_next_pending(&conn, self.clock.now())
    }

    fn claim_by_id(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        jobs::claim_by_id(&conn, id, self.clock.now())
    }

    fn update_progress(&self, id: &str, progress: &JobProgress) -> Result<bool> {
        let conn = self.conn.lock();
        jobs::update_progress(&conn, id, progress)
    }

    fn complete(&self, id: &str, result: &Value) -> Result<bool> {
        let conn = self.conn.lock();
        jobs::complete(&conn, id, result, self.clock.now())
    }

    fn fail(&self, id: &str, error: &JobError) -> Result<bool> {
        let conn = self.conn.lock();
        jobs::fail(&conn, id, error, self.clock.now())
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        jobs::cancel(&conn, id, self.clock.now())
    }

    fn find_stuck_pending(&self, older_than: Duration) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        jobs::find_pending_before(&conn, self.clock.now() - older_than)
    }

    fn save_candidates(&self, job_id: &str, candidates: &[Candidate]) -> Result<()> {
        let mut conn = self.conn.lock();
        candidates::save_candidates(&mut conn, job_id, candidates)
    }

    fn list_candidates(&self, job_id: &str) -> Result<Vec<Candidate>> {
        let conn = self.conn.lock();
        candidates::list_candidates(&conn, job_id)
    }
}
