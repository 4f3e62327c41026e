//! tally-node — the host-side ledger daemon.
//!
//! Startup sequence:
//!   1. Open (or initialise) the ledger database
//!   2. Load or create the host identity
//!   3. Start the JSON-RPC 2.0 server
//!   4. Wait for ctrl-c

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tally_market::Market;
use tally_rpc::{RpcServer, RpcServerState};
use tally_state::{LedgerDb, LedgerEngine};

#[derive(Parser, Debug)]
#[command(
    name = "tally-node",
    version,
    about = "Tally host node — a two-party signed ledger"
)]
struct Args {
    /// Directory for the persistent ledger database.
    #[arg(long, default_value = "~/.tally/data")]
    data_dir: PathBuf,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8545")]
    rpc_addr: SocketAddr,

    /// Name for the host identity (created on first run).
    #[arg(long, default_value = "host")]
    host_name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tally=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("Tally node starting");

    // ── Ledger database ───────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let db = Arc::new(LedgerDb::open(&data_dir).context("opening ledger database")?);

    // ── Host engine and market ────────────────────────────────────────────────
    let now_us = chrono::Utc::now().timestamp_micros() as u64;
    let engine = Arc::new(
        LedgerEngine::open(Arc::clone(&db), &args.host_name, now_us)
            .context("opening ledger engine")?,
    );
    info!(host = %engine.host_identity().id(), "host identity ready");

    let market = Arc::new(Market::new(Arc::clone(&engine)));

    // ── RPC server ────────────────────────────────────────────────────────────
    let rpc_state = Arc::new(RpcServerState { engine, market });
    let _rpc_handle = RpcServer::new(rpc_state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    info!("node ready");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    db.flush().context("flushing database")?;
    Ok(())
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
