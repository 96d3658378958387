use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{b64, now_ms, JobRecord, JobStatus};
use crate::scheduler::store::JobStore;
use crate::worker::SchedulerApi;

/// Answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job: String,
    pub status: JobStatus,
    pub progress: u64,
}

/// What a client sees when polling a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobResult {
    Queued {
        progress: u64,
    },
    Computing {
        progress: u64,
    },
    Terminated {
        #[serde(with = "b64")]
        result: Vec<u8>,
    },
    Error {
        message: String,
    },
}

impl JobResult {
    pub fn status(&self) -> JobStatus {
        match self {
            JobResult::Queued { .. } => JobStatus::Queued,
            JobResult::Computing { .. } => JobStatus::Computing,
            JobResult::Terminated { .. } => JobStatus::Terminated,
            JobResult::Error { .. } => JobStatus::Error,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Request handling over a [`JobStore`]. Holds no state of its own besides
/// the store handle and the retention window used by submit-time sweeps.
#[derive(Debug, Clone)]
pub struct SchedulerService {
    store: Arc<JobStore>,
    retention: Duration,
}

impl SchedulerService {
    pub fn new(store: Arc<JobStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Run a blocking store operation off the async runtime.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&JobStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| SchedulerError::Internal(format!("store task failed: {}", e)))?
    }

    /// Queue `payload`, or find the job it already maps to.
    ///
    /// Expired jobs are swept first so that a resubmitted payload whose old
    /// result has aged out gets computed again.
    pub async fn submit(&self, payload: Vec<u8>, version: Option<String>) -> Result<SubmitReceipt> {
        let retention = self.retention;
        self.with_store(move |store| {
            let expired = store.delete_expired(retention)?;
            if expired > 0 {
                tracing::info!(expired, "Removed expired jobs before submit");
            }

            let id = store.insert_if_absent(&payload, version.as_deref())?;
            let job = store
                .get(&id)?
                .ok_or_else(|| SchedulerError::JobNotFound(id.clone()))?;
            let ahead = store.count_queued_before(&job)?;

            Ok(SubmitReceipt {
                job: id,
                status: JobStatus::Queued,
                progress: ahead.max(1),
            })
        })
        .await
    }

    pub async fn get_result(&self, id: &str) -> Result<JobResult> {
        let id = id.to_string();
        self.with_store(move |store| {
            let job = store
                .get(&id)?
                .ok_or_else(|| SchedulerError::JobNotFound(id.clone()))?;

            match job.status {
                JobStatus::Queued => Ok(JobResult::Queued {
                    progress: store.count_queued_before(&job)?,
                }),
                JobStatus::Computing => Ok(JobResult::Computing { progress: 0 }),
                JobStatus::Terminated => {
                    let result = job.result.ok_or_else(|| {
                        SchedulerError::Internal(format!("job {} has no stored result", job.id))
                    })?;
                    Ok(JobResult::Terminated { result })
                }
                JobStatus::Error => Ok(JobResult::Error {
                    message: job.error_message.unwrap_or_default(),
                }),
            }
        })
        .await
    }

    pub async fn claim(&self, version: Option<String>) -> Result<Option<JobRecord>> {
        self.with_store(move |store| store.claim_next(version.as_deref()))
            .await
    }

    /// Record a worker's outcome. The record must carry a terminal status;
    /// `finished_at` is stamped here.
    pub async fn report(&self, mut record: JobRecord) -> Result<String> {
        if !record.is_terminal() {
            return Err(SchedulerError::InvalidRecord(format!(
                "job {} reported with non-terminal status {}",
                record.id, record.status
            )));
        }
        record.finished_at = Some(now_ms());
        record.validate()?;

        self.with_store(move |store| {
            store.save(&record)?;
            tracing::info!(job_id = %record.id, status = %record.status, "Job reported");
            Ok(record.id)
        })
        .await
    }
}

#[async_trait]
impl SchedulerApi for SchedulerService {
    async fn claim(&self, version: Option<&str>) -> Result<Option<JobRecord>> {
        SchedulerService::claim(self, version.map(str::to_string)).await
    }

    async fn report(&self, record: &JobRecord) -> Result<()> {
        SchedulerService::report(self, record.clone()).await.map(|_| ())
    }
}
