//! CLI binary for cin-gateway.
//!
//! A thin shim over the library crate: layers CLI flags and environment over
//! an optional TOML file into a `GatewayConfig`, then either serves the HTTP
//! gateway or runs a single local image through the pipeline.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cin_gateway::{
    build_router, ApiError, AppState, Document, GatewayConfig, PipelineCoordinator, StageKind,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve the gateway with every stage on one host
  cin-gateway serve \
    --detection-url http://models:9001/detect \
    --extraction-url http://models:9002/extract \
    --preprocessing-url http://models:9003/preprocess \
    --recognition-url http://models:9004/ocr \
    --aggregation-url http://models:9005/aggregate

  # Same, from a config file
  cin-gateway --config gateway.toml serve

  # Read one card locally and pretty-print the result
  cin-gateway --config gateway.toml run card.jpg --pretty

CONFIG FILE (TOML):
  bind = "0.0.0.0:8000"
  run_deadline_ms = 120000
  concurrency = 8

  [stages.detection]
  url = "http://models:9001/detect"
  timeout_ms = 50000
  max_retries = 2

ENVIRONMENT VARIABLES:
  CIN_GATEWAY_CONFIG        Path to the TOML config file
  CIN_GATEWAY_BIND          Listen address for `serve`
  CIN_DETECTION_URL         Detection stage endpoint
  CIN_EXTRACTION_URL        Extraction stage endpoint
  CIN_PREPROCESSING_URL     Preprocessing stage endpoint
  CIN_RECOGNITION_URL       Recognition stage endpoint
  CIN_AGGREGATION_URL       Aggregation stage endpoint
  CIN_GATEWAY_DEADLINE_MS   Whole-run deadline in milliseconds
  CIN_GATEWAY_CONCURRENCY   Concurrent per-field calls per stage
  RUST_LOG                  Overrides -v / -q log filtering
"#;

/// Read identity cards through a chain of remote model services.
#[derive(Parser, Debug)]
#[command(
    name = "cin-gateway",
    version,
    about = "HTTP gateway that reads identity cards through five remote stages",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: ConfigArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "CIN_GATEWAY_VERBOSE")]
    verbose: bool,

    /// Suppress all logs except errors.
    #[arg(short, long, global = true, env = "CIN_GATEWAY_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve POST /process-cin/ and GET /health.
    Serve,
    /// Run one local image through the pipeline and print the JSON result.
    Run {
        /// Image file to read.
        file: PathBuf,
        /// Pretty-print the JSON output.
        #[arg(long)]
        pretty: bool,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// TOML configuration file; flags below override its values.
    #[arg(long, global = true, env = "CIN_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(long, global = true, env = "CIN_GATEWAY_BIND")]
    bind: Option<String>,

    #[arg(long, global = true, env = "CIN_DETECTION_URL")]
    detection_url: Option<String>,

    #[arg(long, global = true, env = "CIN_EXTRACTION_URL")]
    extraction_url: Option<String>,

    #[arg(long, global = true, env = "CIN_PREPROCESSING_URL")]
    preprocessing_url: Option<String>,

    #[arg(long, global = true, env = "CIN_RECOGNITION_URL")]
    recognition_url: Option<String>,

    #[arg(long, global = true, env = "CIN_AGGREGATION_URL")]
    aggregation_url: Option<String>,

    /// Whole-run deadline in milliseconds.
    #[arg(long, global = true, env = "CIN_GATEWAY_DEADLINE_MS")]
    deadline_ms: Option<u64>,

    /// Concurrent per-field calls within a fan-out stage.
    #[arg(long, global = true, env = "CIN_GATEWAY_CONCURRENCY")]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli.config)?;

    match cli.command {
        Command::Serve => serve(config).await.map(|_| ExitCode::SUCCESS),
        Command::Run { file, pretty } => run_once(&config, file, pretty).await,
    }
}

/// TOML file (if any) first, then flags and environment on top.
fn build_config(args: &ConfigArgs) -> Result<GatewayConfig> {
    let mut config = match args.config {
        Some(ref path) => GatewayConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    if let Some(ref bind) = args.bind {
        config.bind = bind.clone();
    }
    let urls = [
        (StageKind::Detection, &args.detection_url),
        (StageKind::Extraction, &args.extraction_url),
        (StageKind::Preprocessing, &args.preprocessing_url),
        (StageKind::Recognition, &args.recognition_url),
        (StageKind::Aggregation, &args.aggregation_url),
    ];
    for (stage, url) in urls {
        if let Some(url) = url {
            config.set_endpoint_url(stage, url.clone());
        }
    }
    if let Some(ms) = args.deadline_ms {
        config.run_deadline_ms = ms;
    }
    if let Some(n) = args.concurrency {
        config.concurrency = n;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let state = AppState::from_config(&config).context("Failed to build gateway")?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(
        "Listening on {} (deadline {}ms, concurrency {})",
        listener.local_addr().context("Listener has no local address")?,
        config.run_deadline_ms,
        config.concurrency
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, draining in-flight requests"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C ({e}); serving until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Process one file. Prints the success body, or the error body the gateway
/// would have returned, and exits non-zero on failure.
async fn run_once(config: &GatewayConfig, file: PathBuf, pretty: bool) -> Result<ExitCode> {
    let bytes = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file.file_name().map(|n| n.to_string_lossy().into_owned());

    let coordinator = PipelineCoordinator::from_config(config).context("Failed to build pipeline")?;

    let outcome = match Document::from_upload(bytes, None, filename) {
        Ok(document) => {
            let cancel = CancellationToken::new();
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, cancelling run");
                        cancel.cancel();
                    }
                })
            };
            let result = coordinator.process_with_cancel(document, cancel).await;
            watcher.abort();
            result.map_err(ApiError::from)
        }
        Err(e) => Err(ApiError::from(e)),
    };

    let (body, code) = match outcome {
        Ok(output) => (output.into_body(), ExitCode::SUCCESS),
        Err(err) => (err.body(), ExitCode::FAILURE),
    };
    let json = if pretty {
        serde_json::to_string_pretty(&body)
    } else {
        serde_json::to_string(&body)
    }
    .context("Failed to serialise output")?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{json}").context("Failed to write to stdout")?;
    Ok(code)
}
