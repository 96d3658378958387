//! WorkerClient tests with scripted schedulers and solvers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use compute_scheduler::config::WorkerConfig;
use compute_scheduler::scheduler::job::{job_id_for, now_ms};
use compute_scheduler::scheduler::{JobRecord, JobResult, JobStatus, JobStore, SchedulerService};
use compute_scheduler::worker::{PollOutcome, SchedulerApi, SolveError, Solver, WorkerClient};
use compute_scheduler::{Result, SchedulerError};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test doubles
// =============================================================================

/// Hands out queued records and keeps every report.
#[derive(Default)]
struct ScriptedScheduler {
    queue: Mutex<VecDeque<JobRecord>>,
    reports: Mutex<Vec<JobRecord>>,
    claim_versions: Mutex<Vec<Option<String>>>,
    unreachable: bool,
    reject_reports: bool,
    conflict_reports: bool,
}

impl ScriptedScheduler {
    fn with_jobs(payloads: &[&str]) -> Self {
        let queue = payloads
            .iter()
            .map(|p| {
                let mut job = JobRecord::new(p.as_bytes().to_vec(), None, now_ms());
                job.status = JobStatus::Computing;
                job.claimed_at = Some(now_ms());
                job
            })
            .collect();
        Self {
            queue: Mutex::new(queue),
            ..Default::default()
        }
    }

    fn reports(&self) -> Vec<JobRecord> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulerApi for ScriptedScheduler {
    async fn claim(&self, version: Option<&str>) -> Result<Option<JobRecord>> {
        if self.unreachable {
            return Err(SchedulerError::Http {
                status: 503,
                body: "down".to_string(),
            });
        }
        self.claim_versions
            .lock()
            .unwrap()
            .push(version.map(str::to_string));
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn report(&self, record: &JobRecord) -> Result<()> {
        if self.conflict_reports {
            return Err(SchedulerError::Http {
                status: 409,
                body: "already finished".to_string(),
            });
        }
        if self.reject_reports {
            return Err(SchedulerError::Http {
                status: 500,
                body: "report lost".to_string(),
            });
        }
        self.reports.lock().unwrap().push(record.clone());
        Ok(())
    }
}

struct UppercaseSolver;

#[async_trait]
impl Solver for UppercaseSolver {
    async fn solve(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, SolveError> {
        Ok(payload.to_ascii_uppercase())
    }
}

struct FailingSolver;

#[async_trait]
impl Solver for FailingSolver {
    async fn solve(&self, _payload: &[u8]) -> std::result::Result<Vec<u8>, SolveError> {
        Err(SolveError::Failed("model is infeasible".to_string()))
    }
}

struct PanickingSolver;

#[async_trait]
impl Solver for PanickingSolver {
    async fn solve(&self, _payload: &[u8]) -> std::result::Result<Vec<u8>, SolveError> {
        panic!("solver blew up");
    }
}

/// Counts calls, useful to prove a solver never ran.
#[derive(Default)]
struct CountingSolver {
    calls: AtomicUsize,
}

#[async_trait]
impl Solver for CountingSolver {
    async fn solve(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, SolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(payload.to_vec())
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig::default().with_poll_interval(Duration::from_millis(10))
}

// =============================================================================
// poll_once
// =============================================================================

#[tokio::test]
async fn test_poll_once_idle_on_empty_queue() {
    let solver = Arc::new(CountingSolver::default());
    let worker = WorkerClient::new(
        ScriptedScheduler::default(),
        Arc::clone(&solver),
        &fast_config(),
    );

    assert_eq!(worker.poll_once().await, PollOutcome::Idle);
    assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
    assert!(worker.api().reports().is_empty());
}

#[tokio::test]
async fn test_poll_once_reports_success() {
    let api = ScriptedScheduler::with_jobs(&["hello"]);
    let worker = WorkerClient::new(api, Arc::new(UppercaseSolver), &fast_config());

    let outcome = worker.poll_once().await;
    let reports = worker.api().reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        outcome,
        PollOutcome::Finished {
            job_id: reports[0].id.clone(),
            status: JobStatus::Terminated,
        }
    );
    assert_eq!(reports[0].result.as_deref(), Some(&b"HELLO"[..]));
    assert!(reports[0].error_message.is_none());
}

#[tokio::test]
async fn test_poll_once_reports_solver_failure() {
    let api = ScriptedScheduler::with_jobs(&["bad"]);
    let worker = WorkerClient::new(api, Arc::new(FailingSolver), &fast_config());

    let outcome = worker.poll_once().await;
    assert!(matches!(
        outcome,
        PollOutcome::Finished {
            status: JobStatus::Error,
            ..
        }
    ));

    let reports = worker.api().reports();
    assert_eq!(reports[0].status, JobStatus::Error);
    assert_eq!(
        reports[0].error_message.as_deref(),
        Some("model is infeasible")
    );
    assert!(reports[0].result.is_none());
}

#[tokio::test]
async fn test_poll_once_turns_panic_into_error() {
    let api = ScriptedScheduler::with_jobs(&["boom"]);
    let worker = WorkerClient::new(api, Arc::new(PanickingSolver), &fast_config());

    let outcome = worker.poll_once().await;
    assert!(matches!(
        outcome,
        PollOutcome::Finished {
            status: JobStatus::Error,
            ..
        }
    ));

    let reports = worker.api().reports();
    assert_eq!(reports.len(), 1);
    let message = reports[0].error_message.as_deref().unwrap();
    assert!(!message.is_empty());
}

#[tokio::test]
async fn test_poll_once_unavailable_scheduler() {
    let api = ScriptedScheduler {
        unreachable: true,
        ..Default::default()
    };
    let solver = Arc::new(CountingSolver::default());
    let worker = WorkerClient::new(api, Arc::clone(&solver), &fast_config());

    assert!(matches!(
        worker.poll_once().await,
        PollOutcome::Unavailable { .. }
    ));
    assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_poll_once_lost_report_is_unavailable() {
    let mut api = ScriptedScheduler::with_jobs(&["lost"]);
    api.reject_reports = true;
    let worker = WorkerClient::new(api, Arc::new(UppercaseSolver), &fast_config());

    match worker.poll_once().await {
        PollOutcome::Unavailable { reason } => assert!(reason.contains("report lost")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_poll_once_conflicting_report_is_rejected() {
    let mut api = ScriptedScheduler::with_jobs(&["raced"]);
    api.conflict_reports = true;
    let worker = WorkerClient::new(api, Arc::new(UppercaseSolver), &fast_config());

    match worker.poll_once().await {
        PollOutcome::Rejected { job_id, reason } => {
            assert_eq!(job_id, job_id_for(b"raced"));
            assert!(reason.contains("409"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

/// Hands out one stale copy of a job, then reports to a real service.
struct StaleClaim {
    stale: Mutex<Option<JobRecord>>,
    service: SchedulerService,
}

#[async_trait]
impl SchedulerApi for StaleClaim {
    async fn claim(&self, _version: Option<&str>) -> Result<Option<JobRecord>> {
        Ok(self.stale.lock().unwrap().take())
    }

    async fn report(&self, record: &JobRecord) -> Result<()> {
        SchedulerApi::report(&self.service, record).await
    }
}

#[tokio::test]
async fn test_poll_once_conflict_against_local_service() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JobStore::open(dir.path()).unwrap());
    let service = SchedulerService::new(Arc::clone(&store), Duration::from_secs(3600));
    let receipt = service.submit(b"twice".to_vec(), None).await.unwrap();

    let claimed = store.claim_next(None).unwrap().unwrap();
    let stale = claimed.clone();

    // Another worker already gave up on the job
    let mut failed = claimed.fail("gave up");
    failed.finished_at = Some(now_ms());
    store.save(&failed).unwrap();

    let api = StaleClaim {
        stale: Mutex::new(Some(stale)),
        service: service.clone(),
    };
    let worker = WorkerClient::new(api, Arc::new(UppercaseSolver), &fast_config());
    assert!(matches!(
        worker.poll_once().await,
        PollOutcome::Rejected { ref job_id, .. } if *job_id == receipt.job
    ));

    assert_eq!(
        service.get_result(&receipt.job).await.unwrap(),
        JobResult::Error {
            message: "gave up".to_string()
        }
    );
}

#[tokio::test]
async fn test_poll_once_sends_configured_version() {
    let config = fast_config().with_version("3.1");
    let worker = WorkerClient::new(
        ScriptedScheduler::default(),
        Arc::new(UppercaseSolver),
        &config,
    );

    worker.poll_once().await;
    worker.poll_once().await;
    let versions = worker.api().claim_versions.lock().unwrap().clone();
    assert_eq!(versions, vec![Some("3.1".to_string()); 2]);
}

// =============================================================================
// run
// =============================================================================

#[tokio::test]
async fn test_run_drains_queue_and_stops_on_cancel() {
    let api = ScriptedScheduler::with_jobs(&["a", "b", "c"]);
    let worker = Arc::new(WorkerClient::new(
        api,
        Arc::new(UppercaseSolver),
        &fast_config(),
    ));
    let shutdown = CancellationToken::new();

    let handle = {
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    for _ in 0..200 {
        if worker.api().reports().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();

    let results: Vec<Vec<u8>> = worker
        .api()
        .reports()
        .into_iter()
        .map(|r| r.result.unwrap())
        .collect();
    assert_eq!(results, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
}

#[tokio::test]
async fn test_run_returns_immediately_when_already_cancelled() {
    let worker = WorkerClient::new(
        ScriptedScheduler::with_jobs(&["never"]),
        Arc::new(UppercaseSolver),
        &fast_config(),
    );
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    worker.run(shutdown).await;
    assert!(worker.api().reports().is_empty());
}

// =============================================================================
// In-process against the real service
// =============================================================================

#[tokio::test]
async fn test_worker_against_local_service() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JobStore::open(dir.path()).unwrap());
    let service = SchedulerService::new(store, Duration::from_secs(3600));

    let ok = service.submit(b"ok".to_vec(), None).await.unwrap();
    let worker = WorkerClient::new(service.clone(), Arc::new(UppercaseSolver), &fast_config());

    assert!(matches!(
        worker.poll_once().await,
        PollOutcome::Finished {
            status: JobStatus::Terminated,
            ..
        }
    ));
    assert_eq!(worker.poll_once().await, PollOutcome::Idle);

    assert_eq!(
        service.get_result(&ok.job).await.unwrap(),
        JobResult::Terminated {
            result: b"OK".to_vec()
        }
    );
}
