use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Settings for the scheduler process.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    /// Directory holding the job database and blob files.
    pub data_dir: PathBuf,
    /// How long TERMINATED and ERROR jobs are kept after finishing.
    pub retention: Duration,
    pub gc_interval: Duration,
    /// Shared secret callers must present as `?token=`. `None` disables
    /// authorization.
    pub access_token: Option<String>,
    /// Workers to run inside the scheduler process.
    pub local_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            data_dir: PathBuf::from("data"),
            retention: DEFAULT_RETENTION,
            gc_interval: DEFAULT_GC_INTERVAL,
            access_token: None,
            local_workers: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_local_workers(mut self, count: usize) -> Self {
        self.local_workers = count;
        self
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.gc_interval.is_zero() {
            return Err(SchedulerError::Config(
                "garbage collection interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub scheduler_url: String,
    pub poll_interval: Duration,
    /// Compatibility tag sent with each claim.
    pub version: Option<String>,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scheduler_url: format!("http://localhost:{}", DEFAULT_PORT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            version: None,
            access_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new(scheduler_url: impl Into<String>) -> Self {
        Self {
            scheduler_url: scheduler_url.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}
