//! Repository contracts the monitoring core requires from persistence.
//!
//! The core does not prescribe a storage engine; it is written against
//! these narrow traits. Write operations that implement state transitions
//! are status-guarded and idempotent: they report through their return
//! value whether this call performed the transition, which is what keeps
//! event emission at exactly one row per transition even when detection
//! and confirmation race.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    BlockHeight, Chain, ChainTransaction, EventType, NewTransaction, OutboundEvent, Payment,
    ViewingKey,
};

/// Errors surfaced by repository implementations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Uniqueness violation; the caller lost a benign race.
    #[error("record already exists")]
    AlreadyExists,

    #[error("not found: {0}")]
    NotFound(String),

    /// Backend unreachable or failing; retried by the next tick.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Access to payment rows. All writes are idempotent under repeated calls
/// with the same input.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Payment>, StorageError>;

    async fn find_by_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> Result<Option<Payment>, StorageError>;

    /// Payments the monitor may still act on: `pending` and `detected`.
    async fn find_non_terminal_by_chain(&self, chain: Chain)
        -> Result<Vec<Payment>, StorageError>;

    /// Guarded on `status = pending`. Links the transaction, stamps
    /// `detected_at`, and returns whether this call made the transition.
    async fn mark_detected(
        &self,
        id: &str,
        txid: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Guarded on `status = detected`. Stamps `confirmed_at` and returns
    /// whether this call made the transition.
    async fn mark_confirmed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Guarded on `status = pending` and used by the expiry sweep.
    async fn mark_expired(&self, id: &str) -> Result<bool, StorageError>;

    /// Reorg path: guarded on `status = detected`. Clears the linked txid
    /// and zeroes confirmations so detection can run again.
    async fn reset_to_pending(&self, id: &str) -> Result<bool, StorageError>;

    async fn set_confirmations(&self, id: &str, confirmations: u32) -> Result<(), StorageError>;
}

/// Access to on-chain transaction records, unique per
/// `(chain, txid, address)`.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Fails with [`StorageError::AlreadyExists`] on a uniqueness
    /// violation, which callers treat as "someone else got here first".
    async fn create(&self, record: NewTransaction) -> Result<ChainTransaction, StorageError>;

    async fn find_by_txid(
        &self,
        chain: Chain,
        txid: &str,
    ) -> Result<Vec<ChainTransaction>, StorageError>;

    async fn find_by_txid_and_address(
        &self,
        chain: Chain,
        txid: &str,
        address: &str,
    ) -> Result<Option<ChainTransaction>, StorageError>;

    async fn find_by_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> Result<Vec<ChainTransaction>, StorageError>;

    /// Records still below the confirmation threshold, i.e. the working
    /// set of the confirmation sweep.
    async fn find_unconfirmed(
        &self,
        chain: Chain,
        threshold: u32,
    ) -> Result<Vec<ChainTransaction>, StorageError>;

    async fn update_confirmations(
        &self,
        chain: Chain,
        txid: &str,
        confirmations: u32,
        block_hash: Option<String>,
        block_height: Option<BlockHeight>,
        confirmed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    /// The explicit reorg rewrite: drop block linkage and zero the
    /// confirmation count for every record of this transaction.
    async fn clear_block_linkage(&self, chain: Chain, txid: &str) -> Result<(), StorageError>;
}

/// Outbound notification rows. Creation only; delivery is external.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create(
        &self,
        merchant_id: &str,
        payment_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<OutboundEvent, StorageError>;
}

/// Per-chain persisted scan position.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, chain: Chain) -> Result<Option<BlockHeight>, StorageError>;

    async fn set(&self, chain: Chain, height: BlockHeight) -> Result<(), StorageError>;
}

/// Wallet collaborator supplying viewing keys for shielded addresses.
#[async_trait]
pub trait WalletService: Send + Sync {
    async fn viewing_key_for_address(
        &self,
        address: &str,
    ) -> Result<Option<ViewingKey>, StorageError>;
}
