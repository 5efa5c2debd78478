//! The two chain monitors and their shared machinery.
//!
//! `engine` holds the state-machine logic both monitors share
//! (match-and-detect, confirmation updates, reorg handling, expiry); this
//! module holds the scan helpers that walk chain data looking for matches
//! and the cursor-advance discipline.

mod bitcoin;
pub(crate) mod engine;
mod zcash;

pub use bitcoin::BitcoinMonitor;
pub use zcash::ZcashMonitor;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::rpc::BitcoinRpc;
use crate::storage::{CursorStore, EventRepository, PaymentRepository, TransactionRepository};
use crate::types::{BlockHeight, Chain};

use engine::{Engine, ObservedPayment};

/// The persistence seams a monitor is constructed over.
#[derive(Clone)]
pub struct Repositories {
    pub payments: Arc<dyn PaymentRepository>,
    pub transactions: Arc<dyn TransactionRepository>,
    pub events: Arc<dyn EventRepository>,
    pub cursors: Arc<dyn CursorStore>,
}

impl Repositories {
    /// Wire every seam to one backend implementing all the traits.
    pub fn from_single<S>(store: Arc<S>) -> Self
    where
        S: PaymentRepository + TransactionRepository + EventRepository + CursorStore + 'static,
    {
        Self {
            payments: store.clone(),
            transactions: store.clone(),
            events: store.clone(),
            cursors: store,
        }
    }
}

/// Run every output of every transaction in `block` against the
/// transparent address set. Returns how many outputs matched.
pub(crate) async fn scan_block(
    engine: &Engine,
    block: &crate::rpc::types::Block,
    tip: BlockHeight,
    transparent: &HashSet<String>,
) -> Result<usize, CoreError> {
    let confirmations =
        u32::try_from(tip.0.saturating_sub(block.height.0).saturating_add(1)).unwrap_or(u32::MAX);
    let mut matched = 0;

    for tx in &block.transactions {
        for out in &tx.outputs {
            for address in &out.addresses {
                if !transparent.contains(address) {
                    continue;
                }
                matched += 1;
                engine
                    .process_observation(ObservedPayment {
                        txid: tx.txid.clone(),
                        address: address.clone(),
                        amount: out.value,
                        confirmations,
                        block_hash: Some(block.hash.clone()),
                        block_height: Some(block.height),
                        shielded: false,
                        memo: None,
                    })
                    .await?;
            }
        }
    }
    Ok(matched)
}

/// Scan blocks from the stored cursor up to `tip`, advancing the cursor
/// after each fully processed block so a crash resumes exactly where this
/// run stopped. Work per call is bounded by `max_blocks`; the next tick
/// continues from the new cursor.
///
/// On the very first run (no stored cursor) the cursor is seeded at the
/// tip without scanning: no monitored payment can predate the store.
pub(crate) async fn advance_to_tip<R: BitcoinRpc>(
    engine: &Engine,
    rpc: &R,
    repos: &Repositories,
    chain: Chain,
    transparent: &HashSet<String>,
    tip: BlockHeight,
    max_blocks: u64,
) -> Result<BlockHeight, CoreError> {
    let Some(mut cursor) = repos.cursors.get(chain).await? else {
        repos.cursors.set(chain, tip).await?;
        info!(%chain, cursor = %tip, "cursor initialized at chain tip");
        return Ok(tip);
    };
    if cursor >= tip {
        return Ok(cursor);
    }

    let end = tip.0.min(cursor.0.saturating_add(max_blocks));
    if end < tip.0 {
        info!(
            %chain,
            from = cursor.0 + 1,
            to = end,
            tip = tip.0,
            "sweep capped; remaining blocks continue next tick"
        );
    }

    while cursor.0 < end {
        let height = BlockHeight(cursor.0 + 1);
        let hash = rpc.get_block_hash(height).await?;
        let block = rpc.get_block(&hash).await?;
        let matched = scan_block(engine, &block, tip, transparent).await?;
        if matched > 0 {
            info!(%chain, height = %height, matched, "matched monitored addresses in block");
        } else {
            debug!(%chain, height = %height, txs = block.transactions.len(), "block scanned");
        }
        repos.cursors.set(chain, height).await?;
        cursor = height;
    }
    Ok(cursor)
}

/// Check every mempool transaction against the transparent address set.
/// Zero-confirmation matches are detections like any other.
pub(crate) async fn scan_mempool<R: BitcoinRpc>(
    engine: &Engine,
    rpc: &R,
    transparent: &HashSet<String>,
) -> Result<usize, CoreError> {
    let txids = rpc.get_raw_mempool().await?;
    debug!(txs = txids.len(), "scanning mempool");
    let mut matched = 0;

    for txid in txids {
        let tx = match rpc.get_raw_transaction(&txid).await {
            Ok(tx) => tx,
            // Raced out of the mempool between listing and fetch.
            Err(CoreError::TxNotFound(_)) => continue,
            Err(err) => {
                warn!(%txid, error = %err, "mempool transaction fetch failed");
                continue;
            }
        };
        for out in &tx.outputs {
            for address in &out.addresses {
                if !transparent.contains(address) {
                    continue;
                }
                matched += 1;
                engine
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
    }
    Ok(matched)
}
