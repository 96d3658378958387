//! End-to-end tests: a real scheduler bound to a local port, remote workers
//! talking to it over HTTP, and restarts against the same data directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use compute_scheduler::config::{SchedulerConfig, WorkerConfig};
use compute_scheduler::scheduler::job::job_id_for;
use compute_scheduler::scheduler::{JobResult, JobStatus};
use compute_scheduler::server::SchedulerServer;
use compute_scheduler::worker::{CommandSolver, HttpSchedulerClient, SchedulerApi, WorkerClient};
use compute_scheduler::SchedulerError;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RunningServer {
    url: String,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningServer {
    async fn start(config: SchedulerConfig) -> Self {
        let server = SchedulerServer::open(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            server.serve(listener, token).await.unwrap();
        });

        Self {
            url,
            shutdown,
            handle,
        }
    }

    fn client(&self, token: Option<&str>) -> HttpSchedulerClient {
        HttpSchedulerClient::new(
            self.url.clone(),
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

fn config_for(dir: &Path) -> SchedulerConfig {
    SchedulerConfig::new("127.0.0.1:0".parse().unwrap(), dir)
}

async fn wait_for_final(client: &HttpSchedulerClient, id: &str) -> JobResult {
    for _ in 0..200 {
        let result = client.get_result(id).await.unwrap();
        if result.is_final() {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} never finished", id);
}

#[tokio::test]
async fn test_remote_worker_computes_submitted_job() {
    let dir = tempfile::tempdir().unwrap();
    let server = RunningServer::start(config_for(dir.path())).await;
    let client = server.client(None);

    let receipt = client.submit(b"hello".to_vec(), None).await.unwrap();
    assert_eq!(receipt.job, job_id_for(b"hello"));
    assert_eq!(receipt.status, JobStatus::Queued);
    assert_eq!(receipt.progress, 1);

    let worker_config =
        WorkerConfig::new(server.url.clone()).with_poll_interval(Duration::from_millis(20));
    let worker = WorkerClient::new(
        HttpSchedulerClient::from_config(&worker_config).unwrap(),
        Arc::new(CommandSolver::new("tr a-z A-Z")),
        &worker_config,
    );
    let worker_shutdown = CancellationToken::new();
    let worker_handle = {
        let shutdown = worker_shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    assert_eq!(
        wait_for_final(&client, &receipt.job).await,
        JobResult::Terminated {
            result: b"HELLO".to_vec()
        }
    );

    worker_shutdown.cancel();
    worker_handle.await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_failing_solver_reports_error_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let server = RunningServer::start(config_for(dir.path())).await;
    let client = server.client(None);

    let receipt = client.submit(b"doomed".to_vec(), None).await.unwrap();

    let worker_config = WorkerConfig::new(server.url.clone());
    let worker = WorkerClient::new(
        server.client(None),
        Arc::new(CommandSolver::new("echo 'cannot solve' >&2; exit 2")),
        &worker_config,
    );
    worker.poll_once().await;

    assert_eq!(
        client.get_result(&receipt.job).await.unwrap(),
        JobResult::Error {
            message: "cannot solve".to_string()
        }
    );

    server.stop().await;
}

#[tokio::test]
async fn test_http_claim_on_empty_queue() {
    let dir = tempfile::tempdir().unwrap();
    let server = RunningServer::start(config_for(dir.path())).await;

    let client = server.client(None);
    assert!(client.claim(None).await.unwrap().is_none());
    assert!(client.claim(Some("1")).await.unwrap().is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_job_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let server = RunningServer::start(config_for(dir.path())).await;

    let client = server.client(None);
    assert!(matches!(
        client.get_result(&job_id_for(b"nothing")).await,
        Err(SchedulerError::JobNotFound(_))
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_access_token_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let server =
        RunningServer::start(config_for(dir.path()).with_access_token("letmein")).await;

    let anonymous = server.client(None);
    match anonymous.submit(b"x".to_vec(), None).await {
        Err(SchedulerError::Http { status, .. }) => assert_eq!(status, 403),
        other => panic!("unexpected response: {:?}", other.map(|r| r.job)),
    }

    let wrong = server.client(Some("letmeout"));
    assert!(matches!(
        wrong.claim(None).await,
        Err(SchedulerError::Http { status: 403, .. })
    ));

    let authorized = server.client(Some("letmein"));
    let receipt = authorized.submit(b"x".to_vec(), None).await.unwrap();
    let job = authorized.claim(None).await.unwrap().unwrap();
    assert_eq!(job.id, receipt.job);

    server.stop().await;
}

#[tokio::test]
async fn test_restart_requeues_claimed_job() {
    let dir = tempfile::tempdir().unwrap();

    let first = RunningServer::start(config_for(dir.path())).await;
    let client = first.client(None);
    let receipt = client.submit(b"interrupted".to_vec(), None).await.unwrap();
    let claimed = client.claim(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, receipt.job);
    assert!(matches!(
        client.get_result(&receipt.job).await.unwrap(),
        JobResult::Computing { .. }
    ));
    first.stop().await;

    // The worker holding the claim is gone; a fresh process hands it out again
    let second = RunningServer::start(config_for(dir.path())).await;
    let client = second.client(None);
    assert!(matches!(
        client.get_result(&receipt.job).await.unwrap(),
        JobResult::Queued { .. }
    ));
    let again = client.claim(None).await.unwrap().unwrap();
    assert_eq!(again.id, receipt.job);
    second.stop().await;
}

#[tokio::test]
async fn test_local_workers_inside_server() {
    let dir = tempfile::tempdir().unwrap();
    let server = SchedulerServer::open(config_for(dir.path()).with_local_workers(2)).unwrap();
    assert_eq!(server.service().store().data_dir(), dir.path());
    let shutdown = CancellationToken::new();

    let worker_config = WorkerConfig::default().with_poll_interval(Duration::from_millis(10));
    let workers = server.spawn_local_workers(
        server.config().local_workers,
        Arc::new(CommandSolver::new("cat")),
        &worker_config,
        shutdown.clone(),
    );
    assert_eq!(workers.len(), 2);

    let service = server.service().clone();
    let mut ids = Vec::new();
    for i in 0..4 {
        let receipt = service
            .submit(format!("payload {}", i).into_bytes(), None)
            .await
            .unwrap();
        ids.push(receipt.job);
    }

    for (i, id) in ids.iter().enumerate() {
        let mut finished = None;
        for _ in 0..200 {
            let result = service.get_result(id).await.unwrap();
            if result.is_final() {
                finished = Some(result);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            finished,
            Some(JobResult::Terminated {
                result: format!("payload {}", i).into_bytes()
            })
        );
    }

    shutdown.cancel();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("local worker did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn test_bind_failure_stops_local_workers() {
    let dir = tempfile::tempdir().unwrap();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = SchedulerConfig::new(taken.local_addr().unwrap(), dir.path()).with_local_workers(1);
    let server = SchedulerServer::open(config).unwrap();
    let shutdown = CancellationToken::new();

    let worker_config = WorkerConfig::default().with_poll_interval(Duration::from_millis(10));
    let workers = server.spawn_local_workers(
        1,
        Arc::new(CommandSolver::new("cat")),
        &worker_config,
        shutdown.clone(),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), server.run(shutdown.clone()))
        .await
        .expect("run did not return");
    assert!(matches!(result, Err(SchedulerError::Io(_))));
    assert!(shutdown.is_cancelled());

    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("local worker did not stop")
            .unwrap();
    }
    drop(taken);
}

#[tokio::test]
async fn test_open_rejects_zero_gc_interval() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path()).with_gc_interval(Duration::ZERO);
    assert!(matches!(
        SchedulerServer::open(config),
        Err(SchedulerError::Config(_))
    ));
}
