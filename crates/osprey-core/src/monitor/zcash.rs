//! Zcash-family monitor: poll-driven scanning of transparent and shielded
//! addresses, with viewing-key import anchored at each key's birthday.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{AddressCache, ShieldedEntry};
use crate::config::MonitorConfig;
use crate::error::CoreError;
use crate::rpc::memo::decode_memo;
use crate::rpc::types::RescanPolicy;
use crate::rpc::ZcashRpc;
use crate::storage::WalletService;
use crate::types::{BlockHeight, Chain, PaymentStatus};

use super::engine::{Engine, ObservedPayment, ReorgTracker};
use super::{advance_to_tip, Repositories};

/// `maxconf` argument meaning "no upper bound" on `listunspent`.
const LIST_UNSPENT_MAX_CONF: u32 = 9_999_999;

/// Transparent Zcash addresses are base58 with a `t` prefix on every
/// network; everything else in the payment tables is a shielded address.
fn is_shielded_address(address: &str) -> bool {
    !address.starts_with('t')
}

/// Monitor for a chain without push notifications. Every poll tick scans
/// new blocks against the transparent set, sweeps `listunspent` and
/// `z_listreceivedbyaddress` for the cached addresses, and refreshes
/// confirmations.
pub struct ZcashMonitor<R> {
    rpc: Arc<R>,
    repos: Repositories,
    wallet: Arc<dyn WalletService>,
    cache: Arc<AddressCache>,
    config: MonitorConfig,
    engine: Engine,
    reorg: ReorgTracker,
    /// Addresses whose viewing key was imported this process lifetime.
    /// Import is idempotent node-side; this just avoids re-submitting on
    /// every cache refresh.
    imported: HashSet<String>,
}

impl<R: ZcashRpc + 'static> ZcashMonitor<R> {
    pub fn new(
        rpc: Arc<R>,
        repos: Repositories,
        wallet: Arc<dyn WalletService>,
        config: MonitorConfig,
    ) -> Self {
        let engine = Engine::new(Chain::Zec, config.confirmation_threshold, repos.clone());
        Self {
            rpc,
            repos,
            wallet,
            cache: Arc::new(AddressCache::new()),
            config,
            engine,
            reorg: ReorgTracker::new(),
            imported: HashSet::new(),
        }
    }

    /// Run until the shutdown signal fires. Startup failures are fatal;
    /// per-tick failures are logged and retried on the next poll.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        let info = self
            .rpc
            .get_blockchain_info()
            .await
            .map_err(|e| CoreError::Startup(format!("connect to zcash-family node: {e}")))?;
        info!(chain = %info.chain, blocks = info.blocks, "connected to zcash-family node");

        self.refresh_cache()
            .await
            .map_err(|e| CoreError::Startup(format!("load monitored payments: {e}")))?;
        if let Err(err) = self.import_viewing_keys().await {
            // Individual imports retry on refresh; only the tip read can
            // fail here and the next refresh repeats it.
            warn!(error = %err, "shielded import step incomplete");
        }

        let transparent = self.cache.transparent();
        let tip = self
            .rpc
            .get_block_count()
            .await
            .map_err(|e| CoreError::Startup(format!("read chain tip: {e}")))?;
        let cursor = advance_to_tip(
            &self.engine,
            self.rpc.as_ref(),
            &self.repos,
            Chain::Zec,
            &transparent,
            tip,
            self.config.catch_up_max_blocks_per_tick,
        )
        .await
        .map_err(|e| CoreError::Startup(format!("catch-up scan: {e}")))?;
        info!(cursor = %cursor, "startup catch-up complete");

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.config.address_cache_refresh());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The cache is fresh from startup; let the poll's immediate first
        // tick run the first full scan.
        refresh.tick().await;

        let mut shutdown_rx = shutdown;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = poll.tick() => {
                    if let Err(err) = self.poll_tick().await {
                        warn!(error = %err, "poll tick failed; retrying next interval");
                    }
                }
                _ = refresh.tick() => {
                    if let Err(err) = self.refresh_cache().await {
                        warn!(error = %err, "address cache refresh failed; retrying next tick");
                    }
                    if let Err(err) = self.import_viewing_keys().await {
                        warn!(error = %err, "shielded import step incomplete");
                    }
                }
            }
        }

        info!("zcash monitor stopped");
        Ok(())
    }

    /// One poll cycle: new blocks, transparent UTXOs, shielded receipts,
    /// confirmations.
    async fn poll_tick(&mut self) -> Result<(), CoreError> {
        let transparent = self.cache.transparent();
        let tip = self.rpc.get_block_count().await?;
        advance_to_tip(
            &self.engine,
            self.rpc.as_ref(),
            &self.repos,
            Chain::Zec,
            &transparent,
            tip,
            self.config.catch_up_max_blocks_per_tick,
        )
        .await?;

        self.scan_transparent(&transparent).await;
        self.scan_shielded().await;

        self.engine
            .update_confirmations(self.rpc.as_ref(), &mut self.reorg)
            .await?;
        Ok(())
    }

    /// Zero-conf and near-tip detection for transparent addresses; the
    /// block scan alone would wait for the next mined block.
    async fn scan_transparent(&self, transparent: &HashSet<String>) {
        for address in transparent.iter() {
            let utxos = match self
                .rpc
                .list_unspent(0, LIST_UNSPENT_MAX_CONF, std::slice::from_ref(address))
                .await
            {
                Ok(utxos) => utxos,
                Err(err) => {
                    warn!(address = %address, error = %err, "listunspent failed");
                    continue;
                }
            };
            for utxo in utxos {
                let result = self
                    .engine
                    .process_observation(ObservedPayment {
                        txid: utxo.txid.clone(),
                        address: utxo.address.clone(),
                        amount: utxo.amount,
                        confirmations: utxo.confirmations,
                        block_hash: None,
                        block_height: None,
                        shielded: false,
                        memo: None,
                    })
                    .await;
                if let Err(err) = result {
                    warn!(txid = %utxo.txid, error = %err, "transparent observation failed");
                }
            }
        }
    }

    /// Shielded detection. Amounts come from the node's note decryption;
    /// the raw transaction only contributes block linkage and the memo is
    /// decoded from the receipt itself.
    async fn scan_shielded(&self) {
        let shielded = self.cache.shielded();
        for address in shielded.keys() {
            let receipts = match self.rpc.z_list_received_by_address(address, 0).await {
                Ok(receipts) => receipts,
                Err(err) => {
                    warn!(address = %address, error = %err, "z_listreceivedbyaddress failed");
                    continue;
                }
            };

            for receipt in receipts {
                if receipt.change {
                    continue;
                }
                match self
                    .repos
                    .transactions
                    .find_by_txid_and_address(Chain::Zec, &receipt.txid, address)
                    .await
                {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(txid = %receipt.txid, error = %err, "dedupe lookup failed");
                        continue;
                    }
                }

                let (block_hash, block_height, confirmations) =
                    match self.rpc.get_raw_transaction(&receipt.txid).await {
                        Ok(tx) => (
                            tx.block_hash,
                            tx.block_height,
                            tx.confirmations.unwrap_or(0) as u32,
                        ),
                        Err(err) => {
                            debug!(txid = %receipt.txid, error = %err, "shielded tx metadata unavailable");
                            (None, None, receipt.confirmations)
                        }
                    };

                let memo = match receipt.memo_hex.as_deref() {
                    None => None,
                    Some(hex_memo) => match decode_memo(hex_memo) {
                        Ok(memo) => memo,
                        Err(err) => {
                            warn!(txid = %receipt.txid, error = %err, "undecodable memo; recording without it");
                            None
                        }
                    },
                };

                let result = self
                    .engine
                    .process_observation(ObservedPayment {
                        txid: receipt.txid.clone(),
                        address: address.clone(),
                        amount: receipt.amount,
                        confirmations,
                        block_hash,
                        block_height,
                        shielded: true,
                        memo,
                    })
                    .await;
                if let Err(err) = result {
                    warn!(txid = %receipt.txid, error = %err, "shielded observation failed");
                }
            }
        }
    }

    /// Submit viewing keys for shielded addresses not yet imported this
    /// lifetime. The start height is the key's birthday; with no birthday
    /// on file, a bounded lookback from the tip with a forced rescan.
    /// Importing at the tip would silently lose anything that arrived
    /// between issuance and import.
    async fn import_viewing_keys(&mut self) -> Result<(), CoreError> {
        let shielded = self.cache.shielded();
        for (address, entry) in shielded.iter() {
            if self.imported.contains(address) {
                continue;
            }
            let Some(key) = entry.viewing_key.clone() else {
                warn!(
                    address = %address,
                    payment_id = %entry.payment_id,
                    "no viewing key on file; shielded scanning cannot see this address"
                );
                continue;
            };

            let (start_height, rescan) = match key.birthday {
                Some(birthday) => (birthday, RescanPolicy::WhenKeyIsNew),
                None => {
                    let tip = self.rpc.get_block_count().await?;
                    (
                        BlockHeight(tip.0.saturating_sub(self.config.shielded_import_lookback)),
                        RescanPolicy::Yes,
                    )
                }
            };

            match self
                .rpc
                .z_import_viewing_key(&key.key, rescan, start_height)
                .await
            {
                Ok(()) => {
                    info!(address = %address, start_height = %start_height, "viewing key imported");
                    self.imported.insert(address.clone());
                }
                // Left out of the imported set; the next refresh retries.
                Err(err) => {
                    warn!(address = %address, error = %err, "viewing key import failed");
                }
            }
        }
        Ok(())
    }

    /// Rebuild both address views from the repository, attach viewing
    /// keys from the wallet collaborator, and expire overdue payments.
    async fn refresh_cache(&self) -> Result<(), CoreError> {
        let payments = self
            .repos
            .payments
            .find_non_terminal_by_chain(Chain::Zec)
            .await?;
        let now = Utc::now();
        self.engine.expire_due(&payments, now).await?;

        let mut transparent = HashSet::new();
        let mut shielded = HashMap::new();
        for payment in &payments {
            if payment.status == PaymentStatus::Pending && payment.expires_at < now {
                continue;
            }
            if is_shielded_address(&payment.address) {
                let viewing_key = match self.wallet.viewing_key_for_address(&payment.address).await
                {
                    Ok(viewing_key) => viewing_key,
                    Err(err) => {
                        warn!(address = %payment.address, error = %err, "wallet lookup failed");
                        None
                    }
                };
                shielded.insert(
                    payment.address.clone(),
                    ShieldedEntry {
                        payment_id: payment.id.clone(),
                        viewing_key,
                    },
                );
            } else {
                transparent.insert(payment.address.clone());
            }
        }

        debug!(
            transparent = transparent.len(),
            shielded = shielded.len(),
            "address cache refreshed"
        );
        self.cache.replace_transparent(transparent);
        self.cache.replace_shielded(shielded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_kind_classification() {
        assert!(!is_shielded_address("t1Kr3rzkYBv4eJp5LRN8pJ3ZcLP9y9Uc9qL"));
        assert!(!is_shielded_address("tmXvQrR4fmPuRhf4GqcPSF8L6V4mHNbbjTV"));
        assert!(is_shielded_address("zs1w6nkameazc2c326ep3snu8ezqcv2g9c"));
        assert!(is_shielded_address("zregtestsapling1qqqqqqqqqq"));
    }
}
