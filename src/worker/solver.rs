use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Why a computation produced no result.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("failed to start solver: {0}")]
    Launch(#[source] std::io::Error),

    #[error("{}", describe_exit(.code, .stderr))]
    Exit { code: Option<i32>, stderr: String },

    #[error("{0}")]
    Failed(String),
}

fn describe_exit(code: &Option<i32>, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("Exit code: {:?}", code)
    } else {
        stderr.to_string()
    }
}

/// The compute routine a worker runs on each claimed payload. Payload and
/// result formats are its business alone.
#[async_trait]
pub trait Solver: Send + Sync + 'static {
    async fn solve(&self, payload: &[u8]) -> Result<Vec<u8>, SolveError>;
}

/// Runs an external program through `sh -c`. The payload is written to the
/// program's stdin and its stdout becomes the result.
#[derive(Debug, Clone)]
pub struct CommandSolver {
    command: String,
}

impl CommandSolver {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Solver for CommandSolver {
    async fn solve(&self, payload: &[u8]) -> Result<Vec<u8>, SolveError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SolveError::Launch)?;

        // Feed stdin from its own task so a chatty program cannot deadlock
        // against a full stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = payload.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(error = %e, "Solver closed stdin early");
                }
            })
        });

        let output = child.wait_with_output().await.map_err(SolveError::Launch)?;
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::debug!(error = %e, "Solver stdin task ended abnormally");
            }
        }

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(SolveError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}
