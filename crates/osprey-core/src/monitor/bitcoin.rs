//! Bitcoin-family monitor: event-driven intake backed by a periodic
//! reconciliation sweep.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::AddressCache;
use crate::config::MonitorConfig;
use crate::error::CoreError;
use crate::rpc::BitcoinRpc;
use crate::stream::{EventStreamSubscriber, StreamHandler, TOPIC_HASH_BLOCK, TOPIC_RAW_TX};
use crate::types::Chain;

use super::engine::{Engine, ObservedPayment, ReorgTracker};
use super::{advance_to_tip, scan_mempool, Repositories};

/// Work items the stream handlers enqueue for the monitor loop. Handlers
/// never do chain or repository work themselves.
enum Intake {
    RawTx(Vec<u8>),
    NewBlock,
}

struct RawTxHandler {
    sender: mpsc::Sender<Intake>,
}

#[async_trait]
impl StreamHandler for RawTxHandler {
    async fn handle(&self, payload: Vec<u8>) -> Result<(), CoreError> {
        self.sender
            .try_send(Intake::RawTx(payload))
            .map_err(|e| CoreError::Stream(format!("intake queue rejected raw tx: {e}")))
    }
}

struct NewBlockHandler {
    sender: mpsc::Sender<Intake>,
}

#[async_trait]
impl StreamHandler for NewBlockHandler {
    async fn handle(&self, _payload: Vec<u8>) -> Result<(), CoreError> {
        // The payload is just the block hash; the sweep re-reads the chain
        // from the cursor rather than trusting the notification.
        self.sender
            .try_send(Intake::NewBlock)
            .map_err(|e| CoreError::Stream(format!("intake queue rejected block notice: {e}")))
    }
}

/// Monitor for a chain with push notifications available.
///
/// Detection runs from three sources: raw-transaction notifications
/// (mempool-fast), new-block notifications, and the reconciliation sweep
/// that makes the first two optional for correctness.
pub struct BitcoinMonitor<R> {
    rpc: Arc<R>,
    repos: Repositories,
    cache: Arc<AddressCache>,
    config: MonitorConfig,
    stream_endpoint: String,
    engine: Engine,
    reorg: ReorgTracker,
}

impl<R: BitcoinRpc + 'static> BitcoinMonitor<R> {
    pub fn new(
        rpc: Arc<R>,
        repos: Repositories,
        config: MonitorConfig,
        stream_endpoint: impl Into<String>,
    ) -> Self {
        let engine = Engine::new(Chain::Btc, config.confirmation_threshold, repos.clone());
        Self {
            rpc,
            repos,
            cache: Arc::new(AddressCache::new()),
            config,
            stream_endpoint: stream_endpoint.into(),
            engine,
            reorg: ReorgTracker::new(),
        }
    }

    /// Run until the shutdown signal fires. Startup failures (unreachable
    /// node, unreadable repositories) are fatal; everything after startup
    /// is absorbed and retried on the next tick.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        let info = self
            .rpc
            .get_blockchain_info()
            .await
            .map_err(|e| CoreError::Startup(format!("connect to bitcoin-family node: {e}")))?;
        info!(chain = %info.chain, blocks = info.blocks, "connected to bitcoin-family node");

        self.refresh_cache()
            .await
            .map_err(|e| CoreError::Startup(format!("load monitored payments: {e}")))?;
        self.catch_up()
            .await
            .map_err(|e| CoreError::Startup(format!("catch-up scan: {e}")))?;

        let (sender, mut intake) = mpsc::channel(1024);
        let subscriber = EventStreamSubscriber::new(
            &self.stream_endpoint,
            self.config.subscriber_max_reconnect_attempts,
        )
        .on_topic(
            TOPIC_RAW_TX,
            Arc::new(RawTxHandler {
                sender: sender.clone(),
            }),
        )
        .on_topic(TOPIC_HASH_BLOCK, Arc::new(NewBlockHandler { sender }));
        let subscriber_task = tokio::spawn(subscriber.run(shutdown.clone()));

        let mut reconcile = tokio::time::interval(self.config.reconcile_interval());
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.config.address_cache_refresh());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Startup just did both jobs; skip the intervals' immediate ticks.
        reconcile.tick().await;
        refresh.tick().await;

        let mut shutdown_rx = shutdown;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                Some(message) = intake.recv() => {
                    let result = match message {
                        Intake::RawTx(payload) => self.handle_raw_tx(&payload).await,
                        Intake::NewBlock => self.reconcile().await,
                    };
                    if let Err(err) = result {
                        warn!(error = %err, "stream intake processing failed");
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "reconciliation sweep failed; retrying next tick");
                    }
                }
                _ = refresh.tick() => {
                    if let Err(err) = self.refresh_cache().await {
                        warn!(error = %err, "address cache refresh failed; retrying next tick");
                    }
                }
            }
        }

        info!("bitcoin monitor stopping");
        if tokio::time::timeout(self.config.shutdown_grace(), subscriber_task)
            .await
            .is_err()
        {
            warn!("event stream did not stop within the grace period");
        }
        Ok(())
    }

    /// Startup catch-up: mempool first, then every block between the
    /// stored cursor and the tip, then a confirmation pass.
    async fn catch_up(&mut self) -> Result<(), CoreError> {
        let transparent = self.cache.transparent();
        let matched = scan_mempool(&self.engine, self.rpc.as_ref(), &transparent).await?;
        let tip = self.rpc.get_block_count().await?;
        let cursor = advance_to_tip(
            &self.engine,
            self.rpc.as_ref(),
            &self.repos,
            Chain::Btc,
            &transparent,
            tip,
            self.config.catch_up_max_blocks_per_tick,
        )
        .await?;
        self.engine
            .update_confirmations(self.rpc.as_ref(), &mut self.reorg)
            .await?;
        info!(cursor = %cursor, mempool_matches = matched, "startup catch-up complete");
        Ok(())
    }

    /// A raw-transaction notification: decode it, and only if an output
    /// pays a cached address fetch the authoritative copy and run
    /// match-and-detect.
    async fn handle_raw_tx(&mut self, payload: &[u8]) -> Result<(), CoreError> {
        let decoded = self
            .rpc
            .decode_raw_transaction(&hex::encode(payload))
            .await?;
        let transparent = self.cache.transparent();
        let hit = decoded
            .outputs
            .iter()
            .any(|out| out.addresses.iter().any(|a| transparent.contains(a)));
        if !hit {
            return Ok(());
        }

        let tx = match self.rpc.get_raw_transaction(&decoded.txid).await {
            Ok(tx) => tx,
            Err(CoreError::TxNotFound(_)) => {
                debug!(txid = %decoded.txid, "notified transaction vanished; sweep will rediscover it");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for out in &tx.outputs {
            for address in &out.addresses {
                if !transparent.contains(address) {
                    continue;
                }
                self.engine
                    .process_observation(ObservedPayment {
                        txid: tx.txid.clone(),
                        address: address.clone(),
                        amount: out.value,
                        confirmations: tx.confirmations.unwrap_or(0) as u32,
                        block_hash: tx.block_hash.clone(),
                        block_height: tx.block_height,
                        shielded: false,
                        memo: None,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// The reconciliation sweep: rescan the mempool, advance the cursor
    /// over any new blocks, then refresh confirmations. Runs on block
    /// notifications and on the timer, and is the correctness backstop
    /// for the stream.
    async fn reconcile(&mut self) -> Result<(), CoreError> {
        let transparent = self.cache.transparent();
        scan_mempool(&self.engine, self.rpc.as_ref(), &transparent).await?;
        let tip = self.rpc.get_block_count().await?;
        advance_to_tip(
            &self.engine,
            self.rpc.as_ref(),
            &self.repos,
            Chain::Btc,
            &transparent,
            tip,
            self.config.catch_up_max_blocks_per_tick,
        )
        .await?;
        self.engine
            .update_confirmations(self.rpc.as_ref(), &mut self.reorg)
            .await?;
        Ok(())
    }

    /// Rebuild the address cache from the repository and expire overdue
    /// pending payments while the fresh rows are in hand.
    async fn refresh_cache(&self) -> Result<(), CoreError> {
        let payments = self
            .repos
            .payments
            .find_non_terminal_by_chain(Chain::Btc)
            .await?;
        let now = Utc::now();
        self.engine.expire_due(&payments, now).await?;

        let addresses: std::collections::HashSet<String> = payments
            .iter()
            .filter(|p| !(p.status == crate::types::PaymentStatus::Pending && p.expires_at < now))
            .map(|p| p.address.clone())
            .collect();
        debug!(addresses = addresses.len(), "address cache refreshed");
        self.cache.replace_transparent(addresses);
        Ok(())
    }
}
