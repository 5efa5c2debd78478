//! Chain RPC abstraction layer.
//!
//! Defines the [`BitcoinRpc`] and [`ZcashRpc`] trait surfaces, provides the
//! HTTP JSON-RPC implementations ([`BitcoinRpcClient`], [`ZcashRpcClient`])
//! and a scriptable fake node ([`mock::MockRpc`]) for tests.
//!
//! Implementations are expected to handle authentication, retry with
//! backoff, and response validation internally; callers see typed DTOs or
//! a classified [`CoreError`].

mod http_adapter;
pub mod memo;
pub mod mock;
pub mod types;

pub use http_adapter::{BitcoinRpcClient, RpcConnection, ZcashRpcClient};

use async_trait::async_trait;

use crate::error::CoreError;
use crate::types::BlockHeight;
use types::{
    AddressValidation, Block, ChainInfo, MempoolEntry, RawTransaction, RescanPolicy,
    ShieldedReceipt, UnspentOutput,
};

/// The RPC surface common to both chain families.
#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    async fn get_block_count(&self) -> Result<BlockHeight, CoreError>;

    async fn get_block_hash(&self, height: BlockHeight) -> Result<String, CoreError>;

    /// Fetch a block with its transactions decoded (verbosity 2), so a
    /// block scan costs one RPC round-trip.
    async fn get_block(&self, hash: &str) -> Result<Block, CoreError>;

    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError>;

    async fn validate_address(&self, address: &str) -> Result<AddressValidation, CoreError>;

    /// Fetch a decoded transaction by txid. Fails with
    /// [`CoreError::TxNotFound`] when the node does not know it.
    async fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, CoreError>;

    /// Decode a raw transaction hex without looking it up on chain.
    async fn decode_raw_transaction(&self, hex: &str) -> Result<RawTransaction, CoreError>;

    /// All mempool txids.
    async fn get_raw_mempool(&self) -> Result<Vec<String>, CoreError>;

    /// `None` when the transaction is not in the mempool.
    async fn get_mempool_entry(&self, txid: &str) -> Result<Option<MempoolEntry>, CoreError>;

    async fn is_in_mempool(&self, txid: &str) -> Result<bool, CoreError> {
        Ok(self.get_mempool_entry(txid).await?.is_some())
    }

    /// Current confirmation count for a transaction: `0` while in the
    /// mempool, `-1` when the node no longer knows the transaction at all
    /// (never mined, evicted, or reorged away).
    async fn get_confirmations(&self, txid: &str) -> Result<i64, CoreError> {
        match self.get_raw_transaction(txid).await {
            Ok(tx) => Ok(tx.confirmations.unwrap_or(0) as i64),
            Err(CoreError::TxNotFound(_)) => Ok(-1),
            Err(e) => Err(e),
        }
    }
}

/// The Zcash-family surface: everything Bitcoin-family offers plus
/// transparent UTXO listing and shielded scanning via viewing keys.
#[async_trait]
pub trait ZcashRpc: BitcoinRpc {
    async fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> Result<Vec<UnspentOutput>, CoreError>;

    /// Received notes for one shielded address, visible through an
    /// imported viewing key.
    async fn z_list_received_by_address(
        &self,
        address: &str,
        min_conf: u32,
    ) -> Result<Vec<ShieldedReceipt>, CoreError>;

    async fn z_validate_address(&self, address: &str) -> Result<AddressValidation, CoreError>;

    /// Import a viewing key, rescanning from `start_height` per `rescan`.
    /// Re-importing a known key is a no-op on the node side.
    async fn z_import_viewing_key(
        &self,
        key: &str,
        rescan: RescanPolicy,
        start_height: BlockHeight,
    ) -> Result<(), CoreError>;
}
