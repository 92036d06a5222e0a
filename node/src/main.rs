// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Timelock Vault Node
//!
//! Entry point for the `timelock-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the vault, and serves the HTTP/WS
//! API.
//!
//! The binary supports four subcommands:
//!
//! - `run`     — start the vault node
//! - `init`    — initialize a data directory with its first owner
//! - `status`  — print a stopped vault's state as JSON
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;

use timelock_contracts::Vault;
use timelock_protocol::config::{VaultConfig, EVENT_CHANNEL_CAPACITY, PROTOCOL_VERSION};
use timelock_protocol::payment::PayoutBook;
use timelock_protocol::storage::VaultDB;
use timelock_protocol::{Address, SystemClock};

use cli::{Commands, TimelockNodeCli};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::VaultMetrics;

/// Name of the sled tree the payout book keeps its settled orders in.
const PAYOUTS_TREE: &str = "payouts";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TimelockNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => print_status(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("db")
}

fn open_db(data_dir: &Path) -> Result<VaultDB> {
    let path = db_path(data_dir);
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create database directory: {}", path.display()))?;
    VaultDB::open(&path).with_context(|| format!("failed to open database at {}", path.display()))
}

/// Opens the vault over `db`, initializing it with `owner` when the
/// directory has never been initialized.
fn open_vault(db: VaultDB, owner: Option<Address>, config: VaultConfig) -> Result<Vault> {
    let payouts = PayoutBook::new(
        db.open_tree(PAYOUTS_TREE)
            .context("failed to open payout book")?,
    );
    let clock = Arc::new(SystemClock);
    let gateway = Arc::new(payouts);

    let initialized = db.owner().context("failed to read owner")?.is_some();
    let vault = match (initialized, owner) {
        (true, _) => Vault::open(db, clock, gateway, config)?,
        (false, Some(owner)) => Vault::initialize(db, owner, clock, gateway, config)?,
        (false, None) => {
            bail!("data directory is not initialized; run `timelock-node init` or pass --owner")
        }
    };
    Ok(vault)
}

/// Starts the node: API server and metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, args.log_format);

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        max_lock_duration = ?args.max_lock_duration,
        "starting timelock-node"
    );

    // --- Persistent storage ---
    let db = open_db(&args.data_dir)?;
    tracing::info!(path = %db_path(&args.data_dir).display(), "database opened");

    // --- Vault ---
    let config = VaultConfig {
        max_lock_duration: args.max_lock_duration,
    };
    let vault = Arc::new(open_vault(db.clone(), args.owner, config)?);
    if let Some(owner) = args.owner {
        if owner != vault.owner() {
            tracing::warn!(
                %owner,
                current = %vault.owner(),
                "--owner ignored, vault already has an owner"
            );
        }
    }

    // --- Metrics ---
    let vault_metrics = Arc::new(VaultMetrics::new().context("failed to register metrics")?);
    vault_metrics.observe_vault(&vault);

    // --- Event broadcast ---
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    vault.add_listener(Arc::new(api::EventBridge {
        event_tx: event_tx.clone(),
        metrics: Arc::clone(&vault_metrics),
    }));

    // --- Application state ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            PROTOCOL_VERSION,
        ),
        vault: Arc::clone(&vault),
        event_tx,
        metrics: Arc::clone(&vault_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&vault_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    db.flush().context("failed to flush database")?;
    tracing::info!("timelock-node stopped");
    Ok(())
}

/// Initializes a new data directory with its first owner.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::Pretty);

    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), owner = %args.owner, "initializing vault");

    let db = open_db(data_dir)?;
    if let Some(existing) = db.owner().context("failed to read owner")? {
        bail!("{} is already initialized (owner {})", data_dir.display(), existing);
    }
    let vault = open_vault(db.clone(), Some(args.owner), VaultConfig::default())?;
    db.flush().context("failed to flush database")?;

    println!("Vault initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Owner          : {}", vault.owner());

    Ok(())
}

/// Reads a stopped vault's data directory and prints its state.
///
/// Opens the database directly rather than the vault so that pending
/// withdrawals are reported as they are, not re-driven.
fn print_status(args: cli::StatusArgs) -> Result<()> {
    let path = db_path(&args.data_dir);
    if !path.exists() {
        bail!("no database at {}", path.display());
    }
    let db = VaultDB::open(&path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    let totals = db.totals()?;
    let chain = match db.verify_event_chain() {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };
    let status = serde_json::json!({
        "data_dir": args.data_dir.display().to_string(),
        "owner": db.owner()?.map(|o| o.to_hex()),
        "total_locked": totals.total_locked.to_string(),
        "total_withdrawn": totals.total_withdrawn.to_string(),
        "total_deposited": totals.total_deposited.to_string(),
        "vault_balance": db.custody()?.to_string(),
        "deposits": db.deposit_record_count(),
        "pending_withdrawals": db.pending_withdrawals()?.len(),
        "event_count": db.event_count(),
        "event_chain": chain,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("timelock-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol      {}", PROTOCOL_VERSION);
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_directory_needs_owner() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path()).unwrap();
        let err = open_vault(db, None, VaultConfig::default()).err().unwrap();
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn owner_flag_initializes_once() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Address::repeat_byte(0x0E);
        {
            let db = open_db(dir.path()).unwrap();
            let vault = open_vault(db, Some(owner), VaultConfig::default()).unwrap();
            assert_eq!(vault.owner(), owner);
        }

        let db = open_db(dir.path()).unwrap();
        let vault =
            open_vault(db, Some(Address::repeat_byte(0x0F)), VaultConfig::default()).unwrap();
        assert_eq!(vault.owner(), owner);
        assert_eq!(vault.event_count(), 1);
    }
}
