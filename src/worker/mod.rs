//! Worker side of the queue.
//!
//! A worker repeatedly claims one job from the scheduler, runs it through a
//! [`Solver`] and reports the outcome:
//!
//! 1. [`SchedulerApi::claim`] asks for the oldest compatible QUEUED job
//! 2. Nothing to do: sleep for the poll interval and ask again
//! 3. A job: run the solver on its payload. Success becomes TERMINATED with
//!    the result, any failure (including a panic) becomes ERROR with its
//!    description
//! 4. [`SchedulerApi::report`] is called exactly once per claimed job
//!
//! A report refused with a conflict means another worker already finished
//! the job; the worker drops its copy and moves on. Scheduler unreachability
//! is logged and polling resumes. There is no local
//! retry queue: a job whose report is lost stays COMPUTING until the
//! scheduler restarts and requeues it.
//!
//! # Components
//!
//! - [`WorkerClient`]: the polling loop
//! - [`HttpSchedulerClient`]: talks to a remote scheduler over HTTP
//! - [`CommandSolver`]: runs an external program as the compute routine

pub mod client;
pub mod solver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{JobRecord, JobStatus};

pub use client::HttpSchedulerClient;
pub use solver::{CommandSolver, SolveError, Solver};

/// The two scheduler operations a worker needs.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Claim the next job, `None` when the queue has nothing eligible.
    async fn claim(&self, version: Option<&str>) -> Result<Option<JobRecord>>;

    /// Hand back a job carrying a terminal status.
    async fn report(&self, record: &JobRecord) -> Result<()>;
}

/// Result of one claim/solve/report cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The queue had nothing for this worker.
    Idle,
    /// A job was computed and its outcome reported.
    Finished { job_id: String, status: JobStatus },
    /// The scheduler refused the report, typically because the job was
    /// already finished by another worker after a requeue.
    Rejected { job_id: String, reason: String },
    /// The scheduler could not be reached for a claim or a report.
    Unavailable { reason: String },
}

pub struct WorkerClient<A, S> {
    api: A,
    solver: Arc<S>,
    version: Option<String>,
    poll_interval: Duration,
}

impl<A: SchedulerApi, S: Solver> WorkerClient<A, S> {
    pub fn new(api: A, solver: Arc<S>, config: &WorkerConfig) -> Self {
        Self {
            api,
            solver,
            version: config.version.clone(),
            poll_interval: config.poll_interval,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Claim, compute and report at most one job.
    pub async fn poll_once(&self) -> PollOutcome {
        let job = match self.api.claim(self.version.as_deref()).await {
            Ok(Some(job)) => job,
            Ok(None) => return PollOutcome::Idle,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to claim a job");
                return PollOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        let record = self.compute(job).await;
        let job_id = record.id.clone();
        let status = record.status;

        match self.api.report(&record).await {
            Ok(()) => {}
            Err(e) if is_conflict(&e) => {
                tracing::info!(job_id = %job_id, error = %e, "Report rejected, job already finished elsewhere");
                return PollOutcome::Rejected {
                    job_id,
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to report job outcome");
                return PollOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        }

        PollOutcome::Finished { job_id, status }
    }

    async fn compute(&self, job: JobRecord) -> JobRecord {
        tracing::info!(job_id = %job.id, bytes = job.payload.len(), "Starting job");

        let solver = Arc::clone(&self.solver);
        let payload = job.payload.clone();
        let outcome = tokio::spawn(async move { solver.solve(&payload).await }).await;

        match outcome {
            Ok(Ok(result)) => {
                tracing::info!(job_id = %job.id, bytes = result.len(), "Job finished");
                job.complete(result)
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job failed");
                job.fail(e.to_string())
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Solver task aborted");
                job.fail(format!("solver aborted: {}", e))
            }
        }
    }

    /// Poll until `shutdown` is cancelled. A job already claimed is finished
    /// and reported before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(version = ?self.version, "Worker started");

        while !shutdown.is_cancelled() {
            match self.poll_once().await {
                PollOutcome::Finished { .. } | PollOutcome::Rejected { .. } => continue,
                PollOutcome::Idle | PollOutcome::Unavailable { .. } => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!("Worker stopped");
    }
}

/// A report the scheduler refused because of the job's current state, as
/// opposed to a transport or server failure.
fn is_conflict(error: &SchedulerError) -> bool {
    matches!(
        error,
        SchedulerError::InvalidTransition { .. } | SchedulerError::Http { status: 409, .. }
    )
}
