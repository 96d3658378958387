//! Durable job repository.
//!
//! Structured fields live in SQLite, payload and result bytes live in
//! [`BlobStore`] files. Every operation, reads included, runs under one
//! mutex that covers both, so no caller can observe a row without its blob
//! or a blob without its row.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction};

use crate::error::{Result, SchedulerError};
use crate::scheduler::blobs::BlobStore;
use crate::scheduler::job::{is_valid_job_id, job_id_for, now_ms, JobRecord, JobStatus};

const DB_FILE: &str = "jobs.sqlite3";

const SELECT_JOB: &str = "SELECT id, version, created_at_ms, claimed_at_ms, finished_at_ms, status, error_message \
                          FROM jobs WHERE id = ?1";

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Row fields without the blobs.
struct JobRow {
    id: String,
    version: Option<String>,
    created: i64,
    claimed_at: Option<i64>,
    finished_at: Option<i64>,
    status: JobStatus,
    error_message: Option<String>,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        version: row.get(1)?,
        created: row.get(2)?,
        claimed_at: row.get(3)?,
        finished_at: row.get(4)?,
        status: row.get(5)?,
        error_message: row.get(6)?,
    })
}

#[derive(Debug)]
struct StoreInner {
    conn: Connection,
    blobs: BlobStore,
}

#[derive(Debug)]
pub struct JobStore {
    inner: Mutex<StoreInner>,
    data_dir: PathBuf,
}

impl JobStore {
    /// Open (or create) the store under `data_dir`.
    ///
    /// Any job found in COMPUTING is put back to QUEUED: its worker's claim
    /// did not survive the restart.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let conn = Connection::open(data_dir.join(DB_FILE))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        install_schema(&conn)?;

        let recovered = conn.execute(
            "UPDATE jobs SET status = ?1, claimed_at_ms = NULL WHERE status = ?2",
            params![JobStatus::Queued, JobStatus::Computing],
        )?;
        if recovered > 0 {
            tracing::warn!(recovered, "Requeued jobs left in COMPUTING by a previous run");
        }

        let blobs = BlobStore::open(&data_dir)?;
        tracing::info!(data_dir = %data_dir.display(), "Job store opened");

        Ok(Self {
            inner: Mutex::new(StoreInner { conn, blobs }),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| SchedulerError::Internal("job store lock poisoned".to_string()))
    }

    /// Insert a QUEUED job for `payload` unless one already exists. Returns
    /// the content-addressed id either way.
    pub fn insert_if_absent(&self, payload: &[u8], version: Option<&str>) -> Result<String> {
        let id = job_id_for(payload);
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let tx = inner.conn.transaction()?;

        if job_exists_tx(&tx, &id)? {
            return Ok(id);
        }

        inner.blobs.write_payload(&id, payload)?;
        let inserted = tx.execute(
            "INSERT INTO jobs (id, version, created_at_ms, status) VALUES (?1, ?2, ?3, ?4)",
            params![id, version, now_ms(), JobStatus::Queued],
        );
        if let Err(e) = inserted.and_then(|_| tx.commit()) {
            // The row never landed, so the payload must not linger either
            if let Err(cleanup) = inner.blobs.remove(&id) {
                tracing::warn!(job_id = %id, error = %cleanup, "Failed to remove orphan payload");
            }
            return Err(e.into());
        }

        tracing::info!(job_id = %id, version = ?version, "Job queued");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        if !is_valid_job_id(id) {
            return Ok(None);
        }
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let tx = inner.conn.transaction()?;
        let job = load_job_tx(&tx, &inner.blobs, id)?;
        tx.commit()?;
        Ok(job)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        if !is_valid_job_id(id) {
            return Ok(false);
        }
        let guard = self.lock()?;
        let found = guard
            .conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Upsert a record.
    ///
    /// Existing rows keep their id, version, payload and creation time; only
    /// status, timestamps, result and error message change. A missing row is
    /// inserted as given, provided its id matches its payload.
    pub fn save(&self, record: &JobRecord) -> Result<()> {
        record.validate()?;

        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let tx = inner.conn.transaction()?;

        let current: Option<JobStatus> = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![record.id],
                |row| row.get(0),
            )
            .optional()?;

        match current {
            Some(current) => {
                if !current.can_transition_to(record.status) {
                    return Err(SchedulerError::InvalidTransition {
                        id: record.id.clone(),
                        from: current,
                        to: record.status,
                    });
                }
                match &record.result {
                    Some(result) => inner.blobs.write_result(&record.id, result)?,
                    None => inner.blobs.remove_result(&record.id)?,
                }
                tx.execute(
                    "UPDATE jobs SET status = ?2, claimed_at_ms = ?3, finished_at_ms = ?4, error_message = ?5 \
                     WHERE id = ?1",
                    params![
                        record.id,
                        record.status,
                        record.claimed_at,
                        record.finished_at,
                        record.error_message
                    ],
                )?;
            }
            None => {
                if job_id_for(&record.payload) != record.id {
                    return Err(SchedulerError::InvalidRecord(format!(
                        "job id {} does not match its payload",
                        record.id
                    )));
                }
                inner.blobs.write_payload(&record.id, &record.payload)?;
                if let Some(result) = &record.result {
                    inner.blobs.write_result(&record.id, result)?;
                }
                tx.execute(
                    "INSERT INTO jobs (id, version, created_at_ms, claimed_at_ms, finished_at_ms, status, error_message) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.id,
                        record.version,
                        record.created,
                        record.claimed_at,
                        record.finished_at,
                        record.status,
                        record.error_message
                    ],
                )?;
            }
        }

        tx.commit()?;
        tracing::debug!(job_id = %record.id, status = %record.status, "Job saved");
        Ok(())
    }

    /// Atomically take the oldest QUEUED job compatible with `version` and
    /// move it to COMPUTING. Ties on creation time are broken by id.
    ///
    /// A job without a version runs anywhere; a caller without a version
    /// accepts any job.
    pub fn claim_next(&self, version: Option<&str>) -> Result<Option<JobRecord>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let tx = inner.conn.transaction()?;

        let next: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs \
                 WHERE status = ?1 AND (?2 IS NULL OR version IS NULL OR version = ?2) \
                 ORDER BY created_at_ms ASC, id ASC LIMIT 1",
                params![JobStatus::Queued, version],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = ?2, claimed_at_ms = ?3 WHERE id = ?1 AND status = ?4",
            params![id, JobStatus::Computing, now_ms(), JobStatus::Queued],
        )?;
        let job = load_job_tx(&tx, &inner.blobs, &id)?;
        tx.commit()?;

        if let Some(job) = &job {
            tracing::info!(job_id = %job.id, version = ?version, "Job claimed");
        }
        Ok(job)
    }

    /// Number of QUEUED jobs created strictly before `record`.
    pub fn count_queued_before(&self, record: &JobRecord) -> Result<u64> {
        let guard = self.lock()?;
        let count: i64 = guard.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1 AND created_at_ms < ?2",
            params![JobStatus::Queued, record.created],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Delete every terminal job that finished at or before `now - max_age`,
    /// one record at a time. Returns how many were removed.
    pub fn delete_expired(&self, max_age: Duration) -> Result<usize> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(max_age_ms);

        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let expired: Vec<String> = {
            let mut stmt = inner.conn.prepare(
                "SELECT id FROM jobs WHERE status IN (?1, ?2) AND finished_at_ms <= ?3",
            )?;
            let rows = stmt.query_map(
                params![JobStatus::Terminated, JobStatus::Error, cutoff],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for id in &expired {
            let tx = inner.conn.transaction()?;
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            tx.commit()?;
            inner.blobs.remove(id)?;
            tracing::debug!(job_id = %id, "Expired job deleted");
        }

        Ok(expired.len())
    }
}

fn install_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         CREATE TABLE IF NOT EXISTS jobs (
             id             TEXT PRIMARY KEY,
             version        TEXT,
             created_at_ms  INTEGER NOT NULL,
             claimed_at_ms  INTEGER,
             finished_at_ms INTEGER,
             status         TEXT NOT NULL,
             error_message  TEXT
         );
         CREATE INDEX IF NOT EXISTS jobs_status_created ON jobs (status, created_at_ms, id);",
    )
}

fn job_exists_tx(tx: &Transaction<'_>, id: &str) -> rusqlite::Result<bool> {
    tx.query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
}

fn load_job_tx(tx: &Transaction<'_>, blobs: &BlobStore, id: &str) -> Result<Option<JobRecord>> {
    let Some(row) = tx.query_row(SELECT_JOB, params![id], read_job_row).optional()? else {
        return Ok(None);
    };

    let payload = blobs.read_payload(&row.id)?;
    let result = if row.status == JobStatus::Terminated {
        blobs.read_result(&row.id)?
    } else {
        None
    };

    Ok(Some(JobRecord {
        id: row.id,
        version: row.version,
        created: row.created,
        claimed_at: row.claimed_at,
        finished_at: row.finished_at,
        status: row.status,
        payload,
        result,
        error_message: row.error_message,
    }))
}
