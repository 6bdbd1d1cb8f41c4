//! clubhouse-daemon - ledger-gated admission daemon
//!
//! Loads `clubhouse.toml`, rehydrates the admission session from the counter
//! store, starts watching the authorization contract, and serves the operator
//! API until SIGTERM or SIGINT.
//!
//! The Tokio runtime is built explicitly from a synchronous `fn main()` so
//! that argument parsing errors are reported before any worker thread starts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clubhouse_core::config::{ClubhouseConfig, PROVIDER_ENV_VAR, validate_endpoint};
use clubhouse_core::engine::AccessEngine;
use clubhouse_core::store::SqliteCounterStore;
use clubhouse_daemon::api::{self, ApiState};
use clubhouse_daemon::ledger::LedgerClient;
use clubhouse_daemon::ledger::rpc::JsonRpcLedgerClient;
use clubhouse_daemon::metrics::new_shared_registry;
use clubhouse_daemon::pipeline::{Pipeline, PipelineConfig};
use clubhouse_daemon::state::DaemonStateHandle;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// clubhouse daemon - admit ticket holders approved on the ledger
#[derive(Parser, Debug)]
#[command(name = "clubhouse-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "clubhouse.toml")]
    config: PathBuf,

    /// Ledger provider endpoint (overrides CLUBHOUSE_WEB3_PROVIDER and the
    /// config file)
    #[arg(long)]
    provider: Option<String>,

    /// Authorization contract address
    #[arg(long)]
    contract_address: Option<String>,

    /// Block the contract was deployed in
    #[arg(long)]
    deploy_block: Option<u64>,

    /// Path to the counter store database (`SQLite`)
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Address for the operator API
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Disable the operator API
    #[arg(long)]
    no_api: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Reads the config file, or starts from defaults when it does not exist,
/// then applies command-line overrides.
fn load_config(args: &Args) -> Result<ClubhouseConfig> {
    let mut config = if args.config.exists() {
        ClubhouseConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        ClubhouseConfig::default()
    };

    if let Some(address) = &args.contract_address {
        config.ledger.contract_address.clone_from(address);
    }
    if let Some(block) = args.deploy_block {
        config.ledger.deploy_block = block;
    }
    if let Some(path) = &args.store_path {
        config.store.path.clone_from(path);
    }
    if let Some(addr) = args.listen_addr {
        config.api.listen_addr = addr;
    }
    if args.no_api {
        config.api.enabled = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;
    let config = load_config(&args)?;

    let env_endpoint = std::env::var(PROVIDER_ENV_VAR).ok();
    let endpoint = config
        .ledger
        .resolve_provider_endpoint(args.provider.as_deref(), env_endpoint.as_deref());
    validate_endpoint(&endpoint).context("invalid provider endpoint")?;

    info!(
        contract = %config.ledger.contract_address,
        deploy_block = config.ledger.deploy_block,
        provider = %endpoint,
        "starting clubhouse-daemon"
    );

    // Rehydrate before anything can observe or allocate.
    let store = SqliteCounterStore::open(&config.store.path)
        .with_context(|| format!("failed to open counter store {}", config.store.path.display()))?;
    let engine = Arc::new(AccessEngine::open(Arc::new(store)).context("failed to load session")?);
    {
        let snapshot = engine.snapshot();
        info!(
            session_id = %snapshot.session_id,
            allocation_count = snapshot.allocation_count,
            "session loaded"
        );
    }

    let state = DaemonStateHandle::shared();
    let metrics = new_shared_registry().context("failed to create metrics registry")?;

    let ledger: Arc<dyn LedgerClient> = Arc::new(
        JsonRpcLedgerClient::new(
            &endpoint,
            config.ledger.request_timeout(),
            config.ledger.poll_interval(),
        )
        .context("failed to create ledger client")?,
    );

    let pipeline = Pipeline::spawn(
        ledger,
        Arc::clone(&engine),
        Arc::clone(&state),
        Arc::clone(&metrics),
        PipelineConfig::from_ledger_config(&config.ledger),
    );

    let api_task = if config.api.enabled {
        let listener = tokio::net::TcpListener::bind(config.api.listen_addr)
            .await
            .with_context(|| format!("failed to bind API on {}", config.api.listen_addr))?;
        let router = api::router(ApiState {
            engine: Arc::clone(&engine),
            daemon: Arc::clone(&state),
            metrics: Arc::clone(&metrics),
            contract_address: Arc::from(config.ledger.contract_address.as_str()),
        });
        Some(tokio::spawn(api::serve(listener, router, Arc::clone(&state))))
    } else {
        info!("API server disabled");
        None
    };

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
    state.request_shutdown();

    if let Some(task) = api_task {
        match task.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => error!(error = %e, "API server failed"),
            Err(e) => error!(error = %e, "API server task failed"),
        }
    }
    pipeline.join().await;

    info!(uptime_secs = state.uptime_secs(), "clubhouse-daemon stopped");
    Ok(())
}
