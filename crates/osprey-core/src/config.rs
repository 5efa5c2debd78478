//! Monitor configuration.

use std::time::Duration;

use serde::Deserialize;

/// Behavioral knobs shared by both monitors. Endpoint addresses and
/// credentials are wiring concerns and live with the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Confirmations required before a payment transitions to `confirmed`.
    pub confirmation_threshold: u32,
    /// Zcash-family poll cadence.
    pub poll_interval_ms: u64,
    /// Bitcoin-family reconciliation sweep cadence. The sweep backs up the
    /// event stream, which is best-effort only.
    pub reconcile_interval_ms: u64,
    /// How often the address cache is rebuilt from the payment repository.
    pub address_cache_refresh_ms: u64,
    pub rpc_max_retries: u32,
    pub rpc_retry_initial_ms: u64,
    pub rpc_timeout_ms: u64,
    pub subscriber_max_reconnect_attempts: u32,
    /// Upper bound on blocks scanned by any single sweep, so one tick can
    /// never monopolize the monitor after long downtime.
    pub catch_up_max_blocks_per_tick: u64,
    /// Rescan window used when importing a viewing key with no recorded
    /// birthday; must cover the payment expiry window with slack.
    pub shielded_import_lookback: u64,
    /// How long shutdown waits for in-flight work before returning.
    pub shutdown_grace_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            confirmation_threshold: 6,
            poll_interval_ms: 15_000,
            reconcile_interval_ms: 10_000,
            address_cache_refresh_ms: 60_000,
            rpc_max_retries: 3,
            rpc_retry_initial_ms: 1_000,
            rpc_timeout_ms: 30_000,
            subscriber_max_reconnect_attempts: 10,
            catch_up_max_blocks_per_tick: 500,
            shielded_import_lookback: 40_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn address_cache_refresh(&self) -> Duration {
        Duration::from_millis(self.address_cache_refresh_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn rpc_retry_initial(&self) -> Duration {
        Duration::from_millis(self.rpc_retry_initial_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.confirmation_threshold, 6);
        assert_eq!(cfg.poll_interval_ms, 15_000);
        assert_eq!(cfg.reconcile_interval_ms, 10_000);
        assert_eq!(cfg.address_cache_refresh_ms, 60_000);
        assert_eq!(cfg.rpc_max_retries, 3);
        assert_eq!(cfg.catch_up_max_blocks_per_tick, 500);
    }

    #[test]
    fn partial_config_files_fill_from_defaults() {
        let cfg: MonitorConfig =
            serde_json::from_str(r#"{"confirmation_threshold": 2}"#).expect("must deserialize");
        assert_eq!(cfg.confirmation_threshold, 2);
        assert_eq!(cfg.poll_interval_ms, 15_000);
    }
}
