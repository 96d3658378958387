use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AccessGuard, ApiState};
use crate::config::{SchedulerConfig, WorkerConfig};
use crate::error::Result;
use crate::scheduler::{GarbageCollector, JobStore, SchedulerService};
use crate::worker::{Solver, WorkerClient};

/// The scheduler process: store, HTTP API, garbage collector and any
/// in-process workers.
pub struct SchedulerServer {
    config: SchedulerConfig,
    service: SchedulerService,
}

impl SchedulerServer {
    /// Open the store under `config.data_dir`. Jobs left COMPUTING by a
    /// previous run are requeued here.
    pub fn open(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(JobStore::open(&config.data_dir)?);
        let service = SchedulerService::new(store, config.retention);
        Ok(Self { config, service })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn service(&self) -> &SchedulerService {
        &self.service
    }

    pub fn router(&self) -> Router {
        let guard = AccessGuard::new(self.config.access_token.as_deref());
        api::router(ApiState::new(self.service.clone(), guard))
    }

    /// Start the garbage collector loop.
    pub fn spawn_gc(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let gc = GarbageCollector::new(
            Arc::clone(self.service.store()),
            self.config.retention,
            self.config.gc_interval,
        );
        tokio::spawn(gc.run(shutdown))
    }

    /// Start `count` workers that claim straight from the local store.
    pub fn spawn_local_workers<S: Solver>(
        &self,
        count: usize,
        solver: Arc<S>,
        worker_config: &WorkerConfig,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|index| {
                let worker =
                    WorkerClient::new(self.service.clone(), Arc::clone(&solver), worker_config);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::info!(worker = index, "Starting local worker");
                    worker.run(shutdown).await;
                })
            })
            .collect()
    }

    /// Serve the API on an already bound listener until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Scheduler listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Bind the configured address, start the garbage collector and serve.
    /// Local workers are started separately because they need a solver.
    ///
    /// `shutdown` is cancelled whenever this returns, including on a bind
    /// failure, so every task sharing the token stops with it.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(addr = %self.config.listen_addr, error = %e, "Failed to bind");
                shutdown.cancel();
                return Err(e.into());
            }
        };
        let gc = self.spawn_gc(shutdown.clone());

        let served = self.serve(listener, shutdown.clone()).await;
        shutdown.cancel();
        if let Err(e) = gc.await {
            tracing::warn!(error = %e, "Garbage collector task ended abnormally");
        }
        served
    }
}
