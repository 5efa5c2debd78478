use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChainArg {
    /// Bitcoin-family chain (event stream + reconciliation).
    Btc,
    /// Zcash-family chain (polling, transparent + shielded).
    Zec,
}

fn parse_nonzero_u32(s: &str) -> Result<u32, String> {
    let n: u32 = s.parse().map_err(|e| format!("{e}"))?;
    if n == 0 {
        return Err("value must be at least 1".to_string());
    }
    Ok(n)
}

/// Osprey — blockchain payment monitor for the Bitcoin and Zcash families.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Which chain family this monitor instance watches.
    #[arg(long, value_enum, env = "OSPREY_CHAIN")]
    pub chain: ChainArg,

    /// Chain node JSON-RPC endpoint (HTTP URL).
    #[arg(
        long,
        default_value = "http://127.0.0.1:8332",
        env = "OSPREY_RPC_URL",
        help_heading = "RPC"
    )]
    pub rpc_url: String,

    /// RPC username.
    #[arg(long, env = "OSPREY_RPC_USER", help_heading = "RPC")]
    pub rpc_user: Option<String>,

    /// RPC password.
    #[arg(long, env = "OSPREY_RPC_PASS", help_heading = "RPC")]
    pub rpc_pass: Option<String>,

    /// RPC attempts per call before giving up (must be >= 1).
    #[arg(
        long,
        default_value = "3",
        env = "OSPREY_RPC_MAX_RETRIES",
        value_parser = parse_nonzero_u32,
        help_heading = "RPC"
    )]
    pub rpc_max_retries: u32,

    /// Initial RPC retry backoff in milliseconds; doubles per attempt.
    #[arg(long, default_value = "1000", env = "OSPREY_RPC_RETRY_INITIAL_MS", help_heading = "RPC")]
    pub rpc_retry_initial_ms: u64,

    /// Per-call RPC timeout in milliseconds.
    #[arg(long, default_value = "30000", env = "OSPREY_RPC_TIMEOUT_MS", help_heading = "RPC")]
    pub rpc_timeout_ms: u64,

    /// Event-stream endpoint (btc-family only), host:port.
    #[arg(
        long,
        default_value = "127.0.0.1:28332",
        env = "OSPREY_EVENT_STREAM",
        help_heading = "Event Stream"
    )]
    pub event_stream_endpoint: String,

    /// Consecutive reconnect failures before the stream reports degraded.
    #[arg(
        long,
        default_value = "10",
        env = "OSPREY_STREAM_MAX_RECONNECTS",
        help_heading = "Event Stream"
    )]
    pub subscriber_max_reconnect_attempts: u32,

    /// Confirmations required before a payment is confirmed.
    #[arg(
        long,
        default_value = "6",
        env = "OSPREY_CONFIRMATION_THRESHOLD",
        value_parser = parse_nonzero_u32,
        help_heading = "Monitoring"
    )]
    pub confirmation_threshold: u32,

    /// Poll cadence in milliseconds (zec-family).
    #[arg(long, default_value = "15000", env = "OSPREY_POLL_INTERVAL_MS", help_heading = "Monitoring")]
    pub poll_interval_ms: u64,

    /// Reconciliation sweep cadence in milliseconds (btc-family).
    #[arg(
        long,
        default_value = "10000",
        env = "OSPREY_RECONCILE_INTERVAL_MS",
        help_heading = "Monitoring"
    )]
    pub reconcile_interval_ms: u64,

    /// Address-cache refresh cadence in milliseconds.
    #[arg(
        long,
        default_value = "60000",
        env = "OSPREY_CACHE_REFRESH_MS",
        help_heading = "Monitoring"
    )]
    pub address_cache_refresh_ms: u64,

    /// Maximum blocks scanned by any single sweep.
    #[arg(
        long,
        default_value = "500",
        env = "OSPREY_CATCHUP_MAX_BLOCKS",
        help_heading = "Monitoring"
    )]
    pub catch_up_max_blocks_per_tick: u64,

    /// Rescan lookback (blocks) for viewing keys with no recorded birthday.
    #[arg(
        long,
        default_value = "40000",
        env = "OSPREY_SHIELDED_LOOKBACK",
        help_heading = "Monitoring"
    )]
    pub shielded_import_lookback: u64,
}

impl Cli {
    pub fn monitor_config(&self) -> osprey_core::MonitorConfig {
        osprey_core::MonitorConfig {
            confirmation_threshold: self.confirmation_threshold,
            poll_interval_ms: self.poll_interval_ms,
            reconcile_interval_ms: self.reconcile_interval_ms,
            address_cache_refresh_ms: self.address_cache_refresh_ms,
            rpc_max_retries: self.rpc_max_retries,
            rpc_retry_initial_ms: self.rpc_retry_initial_ms,
            rpc_timeout_ms: self.rpc_timeout_ms,
            subscriber_max_reconnect_attempts: self.subscriber_max_reconnect_attempts,
            catch_up_max_blocks_per_tick: self.catch_up_max_blocks_per_tick,
            shielded_import_lookback: self.shielded_import_lookback,
            ..Default::default()
        }
    }
}
