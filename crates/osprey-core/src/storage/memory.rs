//! In-memory implementation of every repository trait.
//!
//! Backs the integration tests and the demo wiring in the binary. Write
//! guards mirror what a SQL implementation does with
//! `UPDATE … WHERE status = …`, so monitor logic exercised against this
//! store behaves the same against a real database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{
    BlockHeight, Chain, ChainTransaction, EventType, NewTransaction, OutboundEvent, Payment,
    PaymentStatus, ViewingKey,
};

use super::{
    CursorStore, EventRepository, PaymentRepository, StorageError, TransactionRepository,
    WalletService,
};

#[derive(Default)]
struct Tables {
    payments: HashMap<String, Payment>,
    transactions: Vec<ChainTransaction>,
    events: Vec<OutboundEvent>,
    cursors: HashMap<Chain, BlockHeight>,
    viewing_keys: HashMap<String, ViewingKey>,
}

/// One store implementing all repository traits over shared tables.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("in-memory store lock poisoned")
    }

    /// Seed a payment row, as the external payment service would.
    pub fn insert_payment(&self, payment: Payment) {
        self.lock().payments.insert(payment.id.clone(), payment);
    }

    /// Seed a viewing key for a shielded address.
    pub fn insert_viewing_key(&self, address: &str, key: ViewingKey) {
        self.lock().viewing_keys.insert(address.to_owned(), key);
    }

    // Inspection helpers for tests and the demo binary.

    pub fn payment(&self, id: &str) -> Option<Payment> {
        self.lock().payments.get(id).cloned()
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.lock().events.clone()
    }

    pub fn transactions(&self) -> Vec<ChainTransaction> {
        self.lock().transactions.clone()
    }

    pub fn cursor(&self, chain: Chain) -> Option<BlockHeight> {
        self.lock().cursors.get(&chain).copied()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Payment>, StorageError> {
        Ok(self.lock().payments.get(id).cloned())
    }

    async fn find_by_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> Result<Option<Payment>, StorageError> {
        Ok(self
            .lock()
            .payments
            .values()
            .find(|p| p.chain == chain && p.address == address)
            .cloned())
    }

    async fn find_non_terminal_by_chain(
        &self,
        chain: Chain,
    ) -> Result<Vec<Payment>, StorageError> {
        Ok(self
            .lock()
            .payments
            .values()
            .filter(|p| p.chain == chain && p.status.is_active())
            .cloned()
            .collect())
    }

    async fn mark_detected(
        &self,
        id: &str,
        txid: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.lock();
        let payment = tables
            .payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id}")))?;
        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }
        payment.status = PaymentStatus::Detected;
        payment.txid = Some(txid.to_owned());
        payment.detected_at = Some(at);
        Ok(true)
    }

    async fn mark_confirmed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut tables = self.lock();
        let payment = tables
            .payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id}")))?;
        if payment.status != PaymentStatus::Detected {
            return Ok(false);
        }
        payment.status = PaymentStatus::Confirmed;
        payment.confirmed_at = Some(at);
        Ok(true)
    }

    async fn mark_expired(&self, id: &str) -> Result<bool, StorageError> {
        let mut tables = self.lock();
        let payment = tables
            .payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id}")))?;
        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }
        payment.status = PaymentStatus::Expired;
        Ok(true)
    }

    async fn reset_to_pending(&self, id: &str) -> Result<bool, StorageError> {
        let mut tables = self.lock();
        let payment = tables
            .payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id}")))?;
        if payment.status != PaymentStatus::Detected {
            return Ok(false);
        }
        payment.status = PaymentStatus::Pending;
        payment.txid = None;
        payment.detected_at = None;
        payment.confirmations = 0;
        Ok(true)
    }

    async fn set_confirmations(&self, id: &str, confirmations: u32) -> Result<(), StorageError> {
        let mut tables = self.lock();
        let payment = tables
            .payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id}")))?;
        payment.confirmations = confirmations;
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for InMemoryStore {
    async fn create(&self, record: NewTransaction) -> Result<ChainTransaction, StorageError> {
        let mut tables = self.lock();
        let duplicate = tables.transactions.iter().any(|tx| {
            tx.chain == record.chain && tx.txid == record.txid && tx.address == record.address
        });
        if duplicate {
            return Err(StorageError::AlreadyExists);
        }
        let row = ChainTransaction {
            id: Uuid::new_v4().to_string(),
            payment_id: record.payment_id,
            chain: record.chain,
            txid: record.txid,
            address: record.address,
            amount: record.amount,
            confirmations: record.confirmations,
            block_height: record.block_height,
            block_hash: record.block_hash,
            shielded: record.shielded,
            memo: record.memo,
            detected_at: Utc::now(),
            confirmed_at: None,
        };
        tables.transactions.push(row.clone());
        Ok(row)
    }

    async fn find_by_txid(
        &self,
        chain: Chain,
        txid: &str,
    ) -> Result<Vec<ChainTransaction>, StorageError> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.chain == chain && tx.txid == txid)
            .cloned()
            .collect())
    }

    async fn find_by_txid_and_address(
        &self,
        chain: Chain,
        txid: &str,
        address: &str,
    ) -> Result<Option<ChainTransaction>, StorageError> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .find(|tx| tx.chain == chain && tx.txid == txid && tx.address == address)
            .cloned())
    }

    async fn find_by_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> Result<Vec<ChainTransaction>, StorageError> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.chain == chain && tx.address == address)
            .cloned()
            .collect())
    }

    async fn find_unconfirmed(
        &self,
        chain: Chain,
        threshold: u32,
    ) -> Result<Vec<ChainTransaction>, StorageError> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.chain == chain && tx.confirmations < threshold)
            .cloned()
            .collect())
    }

    async fn update_confirmations(
        &self,
        chain: Chain,
        txid: &str,
        confirmations: u32,
        block_hash: Option<String>,
        block_height: Option<BlockHeight>,
        confirmed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut tables = self.lock();
        for tx in tables
            .transactions
            .iter_mut()
            .filter(|tx| tx.chain == chain && tx.txid == txid)
        {
            tx.confirmations = confirmations;
            if block_hash.is_some() {
                tx.block_hash = block_hash.clone();
            }
            if block_height.is_some() {
                tx.block_height = block_height;
            }
            if tx.confirmed_at.is_none() {
                tx.confirmed_at = confirmed_at;
            }
        }
        Ok(())
    }

    async fn clear_block_linkage(&self, chain: Chain, txid: &str) -> Result<(), StorageError> {
        let mut tables = self.lock();
        for tx in tables
            .transactions
            .iter_mut()
            .filter(|tx| tx.chain == chain && tx.txid == txid)
        {
            tx.block_hash = None;
            tx.block_height = None;
            tx.confirmations = 0;
        }
        Ok(())
    }
}

#[async_trait]
impl EventRepository for InMemoryStore {
    async fn create(
        &self,
        merchant_id: &str,
        payment_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<OutboundEvent, StorageError> {
        let event = OutboundEvent {
            id: Uuid::new_v4().to_string(),
            merchant_id: merchant_id.to_owned(),
            payment_id: payment_id.to_owned(),
            event_type,
            payload,
            created_at: Utc::now(),
        };
        self.lock().events.push(event.clone());
        Ok(event)
    }
}

#[async_trait]
impl CursorStore for InMemoryStore {
    async fn get(&self, chain: Chain) -> Result<Option<BlockHeight>, StorageError> {
        Ok(self.lock().cursors.get(&chain).copied())
    }

    async fn set(&self, chain: Chain, height: BlockHeight) -> Result<(), StorageError> {
        self.lock().cursors.insert(chain, height);
        Ok(())
    }
}

#[async_trait]
impl WalletService for InMemoryStore {
    async fn viewing_key_for_address(
        &self,
        address: &str,
    ) -> Result<Option<ViewingKey>, StorageError> {
        Ok(self.lock().viewing_keys.get(address).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Amount;

    fn pending_payment(id: &str, chain: Chain, address: &str) -> Payment {
        Payment {
            id: id.to_owned(),
            merchant_id: "merch-1".into(),
            order_id: format!("order-{id}"),
            chain,
            address: address.to_owned(),
            expected_amount: Amount::from_base_units(100_000),
            status: PaymentStatus::Pending,
            confirmations: 0,
            txid: None,
            detected_at: None,
            confirmed_at: None,
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn detection_guard_fires_exactly_once() {
        let store = InMemoryStore::new();
        store.insert_payment(pending_payment("p1", Chain::Btc, "addr1"));

        assert!(store.mark_detected("p1", "tx1", Utc::now()).await.unwrap());
        assert!(!store.mark_detected("p1", "tx1", Utc::now()).await.unwrap());

        let payment = store.payment("p1").expect("payment exists");
        assert_eq!(payment.status, PaymentStatus::Detected);
        assert_eq!(payment.txid.as_deref(), Some("tx1"));
    }

    #[tokio::test]
    async fn confirmation_requires_prior_detection() {
        let store = InMemoryStore::new();
        store.insert_payment(pending_payment("p2", Chain::Btc, "addr2"));

        // No skipping pending → confirmed.
        assert!(!store.mark_confirmed("p2", Utc::now()).await.unwrap());

        store.mark_detected("p2", "tx2", Utc::now()).await.unwrap();
        assert!(store.mark_confirmed("p2", Utc::now()).await.unwrap());
        assert!(!store.mark_confirmed("p2", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_transaction_records_are_rejected() {
        let store = InMemoryStore::new();
        let record = NewTransaction {
            payment_id: "p3".into(),
            chain: Chain::Zec,
            txid: "tx3".into(),
            address: "t1addr".into(),
            amount: Amount::from_base_units(500),
            confirmations: 0,
            block_height: None,
            block_hash: None,
            shielded: false,
            memo: None,
        };
        TransactionRepository::create(&store, record.clone())
            .await
            .expect("first insert");
        let err = TransactionRepository::create(&store, record)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StorageError::AlreadyExists));
    }

    #[tokio::test]
    async fn non_terminal_excludes_finished_payments() {
        let store = InMemoryStore::new();
        store.insert_payment(pending_payment("p4", Chain::Btc, "addr4"));
        let mut confirmed = pending_payment("p5", Chain::Btc, "addr5");
        confirmed.status = PaymentStatus::Confirmed;
        store.insert_payment(confirmed);

        let active = store.find_non_terminal_by_chain(Chain::Btc).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "p4");
    }

    #[tokio::test]
    async fn reorg_reset_reopens_detection() {
        let store = InMemoryStore::new();
        store.insert_payment(pending_payment("p6", Chain::Btc, "addr6"));
        store.mark_detected("p6", "tx6", Utc::now()).await.unwrap();

        assert!(store.reset_to_pending("p6").await.unwrap());
        let payment = store.payment("p6").expect("payment exists");
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.txid.is_none());

        // A confirmed payment is never reset.
        store.mark_detected("p6", "tx6b", Utc::now()).await.unwrap();
        store.mark_confirmed("p6", Utc::now()).await.unwrap();
        assert!(!store.reset_to_pending("p6").await.unwrap());
    }
}
