use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

use compute_scheduler::config::{SchedulerConfig, WorkerConfig, DEFAULT_PORT};
use compute_scheduler::scheduler::{JobResult, SubmitReceipt};
use compute_scheduler::server::SchedulerServer;
use compute_scheduler::shutdown::install_shutdown_handler;
use compute_scheduler::worker::{CommandSolver, HttpSchedulerClient, WorkerClient};

#[derive(Parser, Debug)]
#[command(name = "compute-scheduler")]
#[command(version)]
#[command(about = "A durable, content-addressed compute job queue")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler (HTTP API, garbage collector, optional local workers)
    Server(ServerArgs),

    /// Start a worker that polls a remote scheduler
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory for the job database and blob files
    #[arg(long, env = "DATA_PATH", default_value = "data")]
    data_dir: PathBuf,

    /// How long finished jobs are kept, in milliseconds
    #[arg(long, env = "DATA_EXPIRATION_MS", default_value = "86400000")]
    retention_ms: u64,

    /// Seconds between garbage collection sweeps
    #[arg(long, env = "GARBAGE_LOOP_SEC", default_value = "60")]
    gc_interval_secs: u64,

    /// Shared secret callers must pass as ?token=
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Number of workers to run inside the scheduler process
    #[arg(long, default_value = "0")]
    local_workers: usize,

    /// Program the local workers run on each payload (required with --local-workers)
    #[arg(long, env = "SOLVER_COMMAND")]
    solver_command: Option<String>,

    /// Version tag local workers claim with
    #[arg(long, env = "WORKER_VERSION")]
    worker_version: Option<String>,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Scheduler base URL
    #[arg(long, env = "SCHEDULER_URL", default_value = "http://localhost:8765")]
    scheduler_url: String,

    /// Program run on each payload; reads stdin, writes the result to stdout
    #[arg(long, env = "SOLVER_COMMAND")]
    solver_command: String,

    /// Version tag sent with each claim
    #[arg(long, env = "WORKER_VERSION")]
    worker_version: Option<String>,

    /// Access token for the scheduler
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Milliseconds to wait after an empty claim
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Scheduler base URL
    #[arg(
        long,
        short = 'u',
        env = "SCHEDULER_URL",
        default_value = "http://localhost:8765"
    )]
    url: String,

    /// Access token for the scheduler
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a payload
    Submit {
        /// Payload file, or "-" for stdin
        file: PathBuf,

        /// Compatibility tag for the job
        #[arg(long)]
        version: Option<String>,

        /// Poll until the job finishes and print its result
        #[arg(long)]
        wait: bool,

        /// Write the result here instead of stdout (with --wait)
        #[arg(long, requires = "wait")]
        out: Option<PathBuf>,

        /// Milliseconds between polls (with --wait)
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },
    /// Show the state of a job
    Status {
        /// The job ID (SHA-256 of the payload)
        job_id: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobStatusOutput<'a> {
    job_id: &'a str,
    #[serde(flatten)]
    result: &'a JobResult,
}

// =============================================================================
// Server and Worker
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = SchedulerConfig::new(SocketAddr::new(args.host, args.port), args.data_dir)
        .with_retention(Duration::from_millis(args.retention_ms))
        .with_gc_interval(Duration::from_secs(args.gc_interval_secs))
        .with_local_workers(args.local_workers);
    if let Some(token) = args.access_token {
        config = config.with_access_token(token);
    }

    let solver = match (&args.solver_command, config.local_workers) {
        (_, 0) => None,
        (Some(command), _) => Some(Arc::new(CommandSolver::new(command.clone()))),
        (None, _) => return Err("--local-workers requires --solver-command".into()),
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        retention_ms = args.retention_ms,
        local_workers = config.local_workers,
        token_required = config.access_token.is_some(),
        "Starting compute scheduler"
    );

    let server = SchedulerServer::open(config)?;
    let shutdown = install_shutdown_handler();

    let workers = match solver {
        Some(solver) => {
            let worker_config = WorkerConfig {
                version: args.worker_version,
                ..WorkerConfig::default()
            };
            server.spawn_local_workers(
                server.config().local_workers,
                solver,
                &worker_config,
                shutdown.clone(),
            )
        }
        None => Vec::new(),
    };

    let served = server.run(shutdown.clone()).await;
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Local worker ended abnormally");
        }
    }
    served?;

    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = WorkerConfig::new(args.scheduler_url)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms));
    if let Some(version) = args.worker_version {
        config = config.with_version(version);
    }
    if let Some(token) = args.access_token {
        config = config.with_access_token(token);
    }

    let api = HttpSchedulerClient::from_config(&config)?;
    let solver = Arc::new(CommandSolver::new(args.solver_command));

    tracing::info!(
        scheduler_url = %api.base_url(),
        solver = %solver.command(),
        "Starting worker"
    );

    let worker = WorkerClient::new(api, solver, &config);
    worker.run(install_shutdown_handler()).await;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn client_for(args: &ClientArgs) -> Result<HttpSchedulerClient, Box<dyn std::error::Error>> {
    Ok(HttpSchedulerClient::new(
        args.url.clone(),
        args.access_token.clone(),
        Duration::from_secs(30),
    )?)
}

async fn read_payload(file: &Path) -> std::io::Result<Vec<u8>> {
    if file.as_os_str() == "-" {
        let mut payload = Vec::new();
        tokio::io::stdin().read_to_end(&mut payload).await?;
        Ok(payload)
    } else {
        tokio::fs::read(file).await
    }
}

fn print_receipt(receipt: &SubmitReceipt, output_format: &OutputFormat) -> serde_json::Result<()> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(receipt)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID:   {}", receipt.job);
            println!("Status:   {}", receipt.status);
            println!("Progress: {}", receipt.progress);
        }
    }
    Ok(())
}

fn print_status(
    job_id: &str,
    result: &JobResult,
    output_format: &OutputFormat,
) -> serde_json::Result<()> {
    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput { job_id, result };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:   {}", job_id);
            println!("Status:   {}", result.status());
            match result {
                JobResult::Queued { progress } | JobResult::Computing { progress } => {
                    println!("Progress: {}", progress);
                }
                JobResult::Terminated { result } => {
                    println!("Result:   {} bytes", result.len());
                }
                JobResult::Error { message } => {
                    println!("Error:");
                    for line in message.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_submit(
    client: &HttpSchedulerClient,
    file: PathBuf,
    version: Option<String>,
    wait: bool,
    out: Option<PathBuf>,
    poll_interval: Duration,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = read_payload(&file).await?;
    let receipt = client.submit(payload, version.as_deref()).await?;

    if !wait {
        print_receipt(&receipt, output_format)?;
        return Ok(());
    }

    eprintln!("Job {} queued at position {}", receipt.job, receipt.progress);
    let result = loop {
        let result = client.get_result(&receipt.job).await?;
        if result.is_final() {
            break result;
        }
        tokio::time::sleep(poll_interval).await;
    };

    match result {
        JobResult::Terminated { result } => match out {
            Some(path) => {
                tokio::fs::write(&path, &result).await?;
                eprintln!("Result written to {}", path.display());
            }
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&result).await?;
                stdout.flush().await?;
            }
        },
        JobResult::Error { message } => {
            eprintln!("Error: Job {} failed: {}", receipt.job, message);
            std::process::exit(1);
        }
        other => print_status(&receipt.job, &other, output_format)?,
    }
    Ok(())
}

async fn handle_job_status(
    client: &HttpSchedulerClient,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = client.get_result(&job_id).await?;
    print_status(&job_id, &result, output_format)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            let http = client_for(&client)?;

            match command {
                JobCommands::Submit {
                    file,
                    version,
                    wait,
                    out,
                    poll_ms,
                } => {
                    handle_job_submit(
                        &http,
                        file,
                        version,
                        wait,
                        out,
                        Duration::from_millis(poll_ms),
                        &client.output,
                    )
                    .await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, job_id, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
