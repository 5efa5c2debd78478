mod cli;

use std::sync::Arc;

use clap::Parser;
use eyre::{eyre, WrapErr};
use tokio::sync::watch;

use osprey_core::rpc::{BitcoinRpcClient, RpcConnection, ZcashRpcClient};
use osprey_core::storage::memory::InMemoryStore;
use osprey_core::{BitcoinMonitor, Repositories, ZcashMonitor};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let config = args.monitor_config();
    let mut connection = RpcConnection::new(&args.rpc_url).with_retry_policy(&config);
    if let (Some(user), Some(pass)) = (&args.rpc_user, &args.rpc_pass) {
        connection = connection.with_auth(user, pass);
    }

    // Repository wiring belongs to the deployment; this daemon ships with
    // the in-memory store for bring-up against a regtest node.
    let store = Arc::new(InMemoryStore::new());
    let repos = Repositories::from_single(store.clone());
    tracing::warn!("using in-memory repositories; state does not survive restart");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    match args.chain {
        cli::ChainArg::Btc => {
            let rpc = Arc::new(
                BitcoinRpcClient::new(&connection).wrap_err("construct bitcoin rpc client")?,
            );
            let monitor = BitcoinMonitor::new(rpc, repos, config, &args.event_stream_endpoint);
            monitor
                .run(shutdown_rx)
                .await
                .map_err(|e| format_startup_error(&args.rpc_url, e))?;
        }
        cli::ChainArg::Zec => {
            let rpc = Arc::new(
                ZcashRpcClient::new(&connection).wrap_err("construct zcash rpc client")?,
            );
            // The in-memory store doubles as the wallet seam until the
            // real wallet service is wired in.
            let monitor = ZcashMonitor::new(rpc, repos, store, config);
            monitor
                .run(shutdown_rx)
                .await
                .map_err(|e| format_startup_error(&args.rpc_url, e))?;
        }
    }

    Ok(())
}

/// Expand monitor startup failures into an actionable operator message.
fn format_startup_error(rpc_url: &str, err: osprey_core::CoreError) -> eyre::Report {
    let source = err.to_string();
    let mut lines = vec![format!("monitor failed: {source}")];

    if source.contains("connect") || source.contains("transport") {
        lines.push(format!(
            "hint: verify the node at `{rpc_url}` is running and reachable"
        ));
    }
    if source.contains("401") || source.contains("403") || source.contains("status 401") {
        lines.push("hint: authentication failed; check --rpc-user/--rpc-pass".into());
    }
    eyre!(lines.join("\n"))
}
