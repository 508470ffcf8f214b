//! CLI entrypoint for the `haul` upload agent.

mod supervisor;

use clap::{error::ErrorKind, Parser, Subcommand};
use haul_kernel::{default_data_dir, AgentError, Config, ExitCode, HttpClient, HttpClientConfig, Overrides};
use std::error::Error as _;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "haul")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Crash-resumable, flow-controlled multipart upload agent for S3-compatible object storage")]
struct Cli {
    /// Show verbose output (debug-level logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show full trace-level logging, secrets redacted
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent process: binds the Control WebSocket, restores any
    /// resumable job, then blocks until terminated.
    Serve {
        /// Directory for the embedded state-store database
        /// (default: an OS-conventional local data directory for haul).
        #[arg(long, value_name = "PATH")]
        data_dir: Option<PathBuf>,

        /// Target part size in MiB, overriding `HAUL_PART_SIZE_BYTES`/default.
        #[arg(long, value_name = "MIB")]
        part_size_mib: Option<u64>,

        /// Maximum worker count, overriding auto-sizing.
        #[arg(long, value_name = "N")]
        workers: Option<usize>,

        /// Control WebSocket port.
        #[arg(long, value_name = "PORT")]
        ws_port: Option<u16>,

        /// Coordinator base URL.
        #[arg(long, value_name = "URL")]
        backend_url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let exit_code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 2,
            };
            e.print().unwrap_or(());
            std::process::exit(exit_code);
        }
    };

    haul_kernel::logging::init(cli.verbose, cli.debug);

    if let Err(err) = run(cli).await {
        let exit_code = ExitCode::from_error(&err);

        eprintln!("Error: {err}");
        let mut source = err.source();
        while let Some(cause) = source {
            eprintln!("  Caused by: {cause}");
            source = cause.source();
        }

        exit_code.exit();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { data_dir, part_size_mib, workers, ws_port, backend_url } => {
            serve(data_dir, part_size_mib, workers, ws_port, backend_url).await
        }
    }
}

async fn serve(
    data_dir: Option<PathBuf>,
    part_size_mib: Option<u64>,
    workers: Option<usize>,
    ws_port: Option<u16>,
    backend_url: Option<String>,
) -> anyhow::Result<()> {
    let overrides = Overrides {
        part_size_bytes: part_size_mib.map(|mib| mib * 1024 * 1024),
        workers_max: workers,
        ws_port,
        backend_url,
    };
    let config = Config::load(overrides)?;

    let data_dir = data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir).map_err(|e| AgentError::Internal {
        message: format!("failed to create data directory {}: {e}", data_dir.display()),
    })?;
    let store = haul_store::StateStore::open(data_dir.join("haul.db")).await?;

    let http = HttpClient::new(HttpClientConfig { timeout: config.http_timeout, ..HttpClientConfig::default() })?;
    let coordinator = Arc::new(haul_transfer::CoordinatorClient::new(http, config.backend_url.clone()));

    let (surface, commands_rx) = haul_control::ControlSurface::new(&config);
    let supervisor = Supervisor::new(config, store, coordinator, surface.clone());

    let cancel = tokio_util::sync::CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_cancel.cancel();
    });

    tokio::select! {
        _ = supervisor.run(commands_rx) => {}
        result = surface.serve(cancel) => { result?; }
    }

    Ok(())
}
