//! The payment state machine shared by both monitors.
//!
//! Everything here is idempotent. The transaction repository's uniqueness
//! constraint and the payment repository's status guards carry the
//! serialization burden: running any routine twice, or concurrently from
//! the intake and sweep paths, produces the same rows and the same single
//! event per transition.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::rpc::BitcoinRpc;
use crate::storage::StorageError;
use crate::types::{
    Amount, BlockHeight, Chain, ChainTransaction, EventType, NewTransaction, Payment,
    PaymentStatus,
};

use super::Repositories;

/// Consecutive not-found sweeps before a linked transaction is treated as
/// reorged away.
pub(crate) const REORG_MISS_LIMIT: u32 = 3;

/// One observed output paying a monitored address, normalized across the
/// mempool, block-scan, UTXO, and shielded intake paths.
#[derive(Debug, Clone)]
pub(crate) struct ObservedPayment {
    pub txid: String,
    pub address: String,
    pub amount: Amount,
    pub confirmations: u32,
    pub block_hash: Option<String>,
    pub block_height: Option<BlockHeight>,
    pub shielded: bool,
    pub memo: Option<String>,
}

/// Tracks consecutive `getConfirmations == -1` sweeps per txid. In-memory
/// only: a restart resets the count, which errs on the side of patience.
#[derive(Default)]
pub(crate) struct ReorgTracker {
    misses: HashMap<String, u32>,
}

impl ReorgTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record one missed sweep and return the consecutive count.
    pub(crate) fn record_miss(&mut self, txid: &str) -> u32 {
        let count = self.misses.entry(txid.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// The transaction was seen again; any earlier misses were transient.
    pub(crate) fn clear(&mut self, txid: &str) {
        self.misses.remove(txid);
    }
}

/// Match-and-detect, confirmation updates, and expiry over the repository
/// seams. Chain-agnostic; each monitor owns one.
pub(crate) struct Engine {
    chain: Chain,
    threshold: u32,
    repos: Repositories,
}

impl Engine {
    pub(crate) fn new(chain: Chain, threshold: u32, repos: Repositories) -> Self {
        Self {
            chain,
            threshold,
            repos,
        }
    }

    /// The match-and-detect routine.
    ///
    /// The caller matched `obs.address` against the cache; the cache can be
    /// stale, so the payment is re-validated against the repository before
    /// anything is written.
    pub(crate) async fn process_observation(&self, obs: ObservedPayment) -> Result<(), CoreError> {
        let Some(payment) = self
            .repos
            .payments
            .find_by_address(self.chain, &obs.address)
            .await?
        else {
            debug!(address = %obs.address, "cache hit without a payment row; cache is stale");
            return Ok(());
        };

        if !payment.status.is_active() {
            debug!(
                payment_id = %payment.id,
                status = %payment.status,
                "ignoring observation for inactive payment"
            );
            return Ok(());
        }

        if let Some(_existing) = self
            .repos
            .transactions
            .find_by_txid_and_address(self.chain, &obs.txid, &obs.address)
            .await?
        {
            // Known transaction. The only live case is a payment that a
            // reorg reset to `pending`: re-link it through the same guard.
            if payment.status == PaymentStatus::Pending {
                self.link_and_emit(&payment, &obs).await?;
            }
            return Ok(());
        }

        match self
            .repos
            .transactions
            .create(NewTransaction {
                payment_id: payment.id.clone(),
                chain: self.chain,
                txid: obs.txid.clone(),
                address: obs.address.clone(),
                amount: obs.amount,
                confirmations: obs.confirmations,
                block_height: obs.block_height,
                block_hash: obs.block_hash.clone(),
                shielded: obs.shielded,
                memo: obs.memo.clone(),
            })
            .await
        {
            Ok(_) => {}
            // A concurrent handler recorded it first; its detection stands.
            Err(StorageError::AlreadyExists) => {
                debug!(txid = %obs.txid, "transaction record already created concurrently");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        self.link_and_emit(&payment, &obs).await
    }

    /// Transition `pending → detected` behind the repository guard and
    /// emit `payment.detected` only when this call won the transition.
    async fn link_and_emit(&self, payment: &Payment, obs: &ObservedPayment) -> Result<(), CoreError> {
        let now = Utc::now();
        if !self
            .repos
            .payments
            .mark_detected(&payment.id, &obs.txid, now)
            .await?
        {
            return Ok(());
        }

        info!(
            payment_id = %payment.id,
            chain = %self.chain,
            txid = %obs.txid,
            amount = %obs.amount,
            confirmations = obs.confirmations,
            shielded = obs.shielded,
            "payment detected"
        );
        self.repos
            .payments
            .set_confirmations(&payment.id, obs.confirmations)
            .await?;
        self.repos
            .events
            .create(
                &payment.merchant_id,
                &payment.id,
                EventType::PaymentDetected,
                self.event_payload(payment, &obs.txid, obs.amount, obs.confirmations, obs.shielded, obs.memo.as_deref()),
            )
            .await?;

        // A catch-up scan can first observe a transaction that is already
        // past the threshold; it still passes through `detected`, but the
        // confirmation sweep would never see it below the threshold.
        if obs.confirmations >= self.threshold {
            self.promote_to_confirmed(
                &payment.id,
                &obs.txid,
                obs.amount,
                obs.shielded,
                obs.memo.as_deref(),
                obs.confirmations,
            )
            .await?;
        }
        Ok(())
    }

    /// The confirmation-update sweep: refresh every below-threshold
    /// transaction from the node, promote payments that crossed the
    /// threshold, and feed the reorg tracker on vanished transactions.
    pub(crate) async fn update_confirmations<R: BitcoinRpc>(
        &self,
        rpc: &R,
        reorg: &mut ReorgTracker,
    ) -> Result<(), CoreError> {
        let unconfirmed = self
            .repos
            .transactions
            .find_unconfirmed(self.chain, self.threshold)
            .await?;

        for tx in unconfirmed {
            let confirmations = match rpc.get_confirmations(&tx.txid).await {
                Ok(confirmations) => confirmations,
                Err(err) => {
                    warn!(txid = %tx.txid, error = %err, "confirmation check failed; skipping");
                    continue;
                }
            };

            if confirmations < 0 {
                self.handle_vanished_tx(&tx, reorg).await?;
                continue;
            }
            reorg.clear(&tx.txid);

            let confirmations = confirmations as u32;
            if confirmations != tx.confirmations || (tx.block_hash.is_none() && confirmations > 0)
            {
                let (block_hash, block_height) =
                    if tx.block_hash.is_none() && confirmations > 0 {
                        match rpc.get_raw_transaction(&tx.txid).await {
                            Ok(raw) => (raw.block_hash, raw.block_height),
                            Err(err) => {
                                warn!(txid = %tx.txid, error = %err, "block linkage fetch failed");
                                (None, None)
                            }
                        }
                    } else {
                        (tx.block_hash.clone(), tx.block_height)
                    };

                let confirmed_at =
                    (confirmations >= self.threshold).then(Utc::now);
                self.repos
                    .transactions
                    .update_confirmations(
                        self.chain,
                        &tx.txid,
                        confirmations,
                        block_hash,
                        block_height,
                        confirmed_at,
                    )
                    .await?;
            }

            self.repos
                .payments
                .set_confirmations(&tx.payment_id, confirmations)
                .await?;

            if confirmations >= self.threshold {
                self.promote_to_confirmed(
                    &tx.payment_id,
                    &tx.txid,
                    tx.amount,
                    tx.shielded,
                    tx.memo.as_deref(),
                    confirmations,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Transition `detected → confirmed` behind the repository guard.
    async fn promote_to_confirmed(
        &self,
        payment_id: &str,
        txid: &str,
        amount: Amount,
        shielded: bool,
        memo: Option<&str>,
        confirmations: u32,
    ) -> Result<(), CoreError> {
        if !self
            .repos
            .payments
            .mark_confirmed(payment_id, Utc::now())
            .await?
        {
            return Ok(());
        }

        let Some(payment) = self.repos.payments.find_by_id(payment_id).await? else {
            warn!(payment_id = %payment_id, "confirmed payment row disappeared");
            return Ok(());
        };

        info!(
            payment_id = %payment.id,
            chain = %self.chain,
            txid = %txid,
            confirmations,
            "payment confirmed"
        );
        self.repos
            .events
            .create(
                &payment.merchant_id,
                &payment.id,
                EventType::PaymentConfirmed,
                self.event_payload(&payment, txid, amount, confirmations, shielded, memo),
            )
            .await?;
        Ok(())
    }

    /// A linked transaction the node no longer knows. One miss is noise
    /// (restart, eviction-and-rebroadcast); [`REORG_MISS_LIMIT`]
    /// consecutive misses is a suspected reorg.
    async fn handle_vanished_tx(
        &self,
        tx: &ChainTransaction,
        reorg: &mut ReorgTracker,
    ) -> Result<(), CoreError> {
        let misses = reorg.record_miss(&tx.txid);
        warn!(
            txid = %tx.txid,
            payment_id = %tx.payment_id,
            misses,
            "linked transaction not found on chain"
        );
        if misses < REORG_MISS_LIMIT {
            return Ok(());
        }
        reorg.clear(&tx.txid);

        let Some(payment) = self.repos.payments.find_by_id(&tx.payment_id).await? else {
            return Ok(());
        };
        if payment.status == PaymentStatus::Confirmed {
            // Never rolled back; downstream owns the payment from here.
            warn!(
                payment_id = %payment.id,
                txid = %tx.txid,
                "confirmed payment's transaction vanished; leaving status to downstream"
            );
            return Ok(());
        }

        if self.repos.payments.reset_to_pending(&payment.id).await? {
            self.repos
                .transactions
                .clear_block_linkage(self.chain, &tx.txid)
                .await?;
            warn!(
                payment_id = %payment.id,
                txid = %tx.txid,
                "suspected reorg; payment reset to pending for re-detection"
            );
            // Withdraw the earlier detection so consumers are not left
            // holding a txid the chain no longer knows.
            self.repos
                .events
                .create(
                    &payment.merchant_id,
                    &payment.id,
                    EventType::PaymentFailed,
                    serde_json::json!({
                        "payment_id": payment.id,
                        "order_id": payment.order_id,
                        "txid": tx.txid,
                        "reason": "transaction no longer found on chain",
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Expire overdue `pending` payments. A payment that has been detected
    /// is never expired, whatever the clock says.
    pub(crate) async fn expire_due(
        &self,
        payments: &[Payment],
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        for payment in payments {
            if payment.status != PaymentStatus::Pending || payment.expires_at >= now {
                continue;
            }
            if !self.repos.payments.mark_expired(&payment.id).await? {
                continue;
            }
            info!(payment_id = %payment.id, chain = %self.chain, "payment expired");
            self.repos
                .events
                .create(
                    &payment.merchant_id,
                    &payment.id,
                    EventType::PaymentExpired,
                    serde_json::json!({
                        "payment_id": payment.id,
                        "order_id": payment.order_id,
                        "timestamp": now.to_rfc3339(),
                    }),
                )
                .await?;
        }
        Ok(())
    }

    fn event_payload(
        &self,
        payment: &Payment,
        txid: &str,
        amount: Amount,
        confirmations: u32,
        shielded: bool,
        memo: Option<&str>,
    ) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "payment_id": payment.id,
            "order_id": payment.order_id,
            "txid": txid,
            "amount": amount.to_string(),
            "confirmations": confirmations,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if shielded {
            payload["is_shielded"] = serde_json::Value::Bool(true);
            if let Some(memo) = memo {
                payload["memo"] = serde_json::Value::String(memo.to_owned());
            }
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{payment_tx, MockRpc};
    use crate::storage::memory::InMemoryStore;
    use crate::storage::PaymentRepository;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryStore>, Engine) {
        let store = Arc::new(InMemoryStore::new());
        let repos = Repositories::from_single(store.clone());
        (store, Engine::new(Chain::Btc, 6, repos))
    }

    fn pending_payment(id: &str, address: &str) -> Payment {
        Payment {
            id: id.to_owned(),
            merchant_id: "merch-1".into(),
            order_id: format!("order-{id}"),
            chain: Chain::Btc,
            address: address.to_owned(),
            expected_amount: Amount::from_base_units(250_000),
            status: PaymentStatus::Pending,
            confirmations: 0,
            txid: None,
            detected_at: None,
            confirmed_at: None,
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        }
    }

    fn observation(txid: &str, address: &str) -> ObservedPayment {
        ObservedPayment {
            txid: txid.to_owned(),
            address: address.to_owned(),
            amount: Amount::from_base_units(250_000),
            confirmations: 0,
            block_hash: None,
            block_height: None,
            shielded: false,
            memo: None,
        }
    }

    #[tokio::test]
    async fn detection_is_idempotent() {
        let (store, engine) = setup();
        store.insert_payment(pending_payment("p1", "addr1"));

        engine.process_observation(observation("tx1", "addr1")).await.unwrap();
        engine.process_observation(observation("tx1", "addr1")).await.unwrap();

        assert_eq!(store.transactions().len(), 1);
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::PaymentDetected);
        assert_eq!(
            store.payment("p1").unwrap().status,
            PaymentStatus::Detected
        );
    }

    #[tokio::test]
    async fn observations_without_payment_rows_are_dropped() {
        let (store, engine) = setup();
        engine.process_observation(observation("tx1", "unknown")).await.unwrap();
        assert!(store.transactions().is_empty());
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn threshold_boundary_drives_confirmation() {
        let (store, engine) = setup();
        store.insert_payment(pending_payment("p1", "addr1"));

        let rpc = MockRpc::with_tip(100);
        rpc.add_mempool_tx(payment_tx("tx1", "addr1", Amount::from_base_units(250_000)));
        engine.process_observation(observation("tx1", "addr1")).await.unwrap();

        // threshold - 1 confirmations: still detected.
        rpc.mine_mempool();
        rpc.mine_empty_blocks(4);
        let mut reorg = ReorgTracker::new();
        engine.update_confirmations(&rpc, &mut reorg).await.unwrap();
        let payment = store.payment("p1").unwrap();
        assert_eq!(payment.status, PaymentStatus::Detected);
        assert_eq!(payment.confirmations, 5);

        // Exactly threshold: confirmed, once.
        rpc.mine_empty_blocks(1);
        engine.update_confirmations(&rpc, &mut reorg).await.unwrap();
        engine.update_confirmations(&rpc, &mut reorg).await.unwrap();
        let payment = store.payment("p1").unwrap();
        assert_eq!(payment.status, PaymentStatus::Confirmed);
        assert!(payment.confirmed_at.is_some());

        let confirmed_events: Vec<_> = store
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::PaymentConfirmed)
            .collect();
        assert_eq!(confirmed_events.len(), 1);
    }

    #[tokio::test]
    async fn observation_past_threshold_confirms_through_detected() {
        let (store, engine) = setup();
        store.insert_payment(pending_payment("p1", "addr1"));

        // A catch-up scan first sees the transaction 31 blocks deep.
        let mut obs = observation("tx1", "addr1");
        obs.confirmations = 31;
        obs.block_hash = Some("00".repeat(32));
        obs.block_height = Some(BlockHeight(120));
        engine.process_observation(obs).await.unwrap();

        let payment = store.payment("p1").unwrap();
        assert_eq!(payment.status, PaymentStatus::Confirmed);
        assert!(payment.detected_at.is_some());
        assert!(payment.confirmed_at.is_some());

        let kinds: Vec<_> = store.events().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![EventType::PaymentDetected, EventType::PaymentConfirmed]
        );
    }

    #[tokio::test]
    async fn confirmation_sweep_backfills_block_linkage() {
        let (store, engine) = setup();
        store.insert_payment(pending_payment("p1", "addr1"));

        let rpc = MockRpc::with_tip(100);
        rpc.add_mempool_tx(payment_tx("tx1", "addr1", Amount::from_base_units(250_000)));
        engine.process_observation(observation("tx1", "addr1")).await.unwrap();
        assert!(store.transactions()[0].block_hash.is_none());

        rpc.mine_mempool();
        let mut reorg = ReorgTracker::new();
        engine.update_confirmations(&rpc, &mut reorg).await.unwrap();

        let tx = &store.transactions()[0];
        assert!(tx.block_hash.is_some());
        assert_eq!(tx.block_height, Some(BlockHeight(101)));
        assert_eq!(tx.confirmations, 1);
    }

    #[tokio::test]
    async fn reorg_resets_after_three_consecutive_misses() {
        let (store, engine) = setup();
        store.insert_payment(pending_payment("p1", "addr1"));
        engine.process_observation(observation("tx1", "addr1")).await.unwrap();

        // The node never saw tx1 at all.
        let rpc = MockRpc::with_tip(100);
        let mut reorg = ReorgTracker::new();

        engine.update_confirmations(&rpc, &mut reorg).await.unwrap();
        engine.update_confirmations(&rpc, &mut reorg).await.unwrap();
        assert_eq!(store.payment("p1").unwrap().status, PaymentStatus::Detected);

        engine.update_confirmations(&rpc, &mut reorg).await.unwrap();
        let payment = store.payment("p1").unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.txid.is_none());
        assert_eq!(store.transactions()[0].confirmations, 0);
        assert!(store.transactions()[0].block_hash.is_none());

        // The withdrawn detection is announced to consumers.
        let failed: Vec<_> = store
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::PaymentFailed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].payload["reason"],
            serde_json::json!("transaction no longer found on chain")
        );
    }

    #[tokio::test]
    async fn reorg_relinks_through_existing_record() {
        let (store, engine) = setup();
        store.insert_payment(pending_payment("p1", "addr1"));
        engine.process_observation(observation("tx1", "addr1")).await.unwrap();

        let rpc = MockRpc::with_tip(100);
        let mut reorg = ReorgTracker::new();
        for _ in 0..REORG_MISS_LIMIT {
            engine.update_confirmations(&rpc, &mut reorg).await.unwrap();
        }
        assert_eq!(store.payment("p1").unwrap().status, PaymentStatus::Pending);

        // The transaction is re-mined and observed again: same record,
        // fresh detection event.
        engine.process_observation(observation("tx1", "addr1")).await.unwrap();
        assert_eq!(store.transactions().len(), 1);
        assert_eq!(store.payment("p1").unwrap().status, PaymentStatus::Detected);
        let detected: Vec<_> = store
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::PaymentDetected)
            .collect();
        assert_eq!(detected.len(), 2);
    }

    #[tokio::test]
    async fn expiry_skips_detected_payments() {
        let (store, engine) = setup();
        let mut overdue = pending_payment("p1", "addr1");
        overdue.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.insert_payment(overdue);

        let mut detected = pending_payment("p2", "addr2");
        detected.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.insert_payment(detected);
        engine.process_observation(observation("tx2", "addr2")).await.unwrap();

        let payments = store.find_non_terminal_by_chain(Chain::Btc).await.unwrap();
        engine.expire_due(&payments, Utc::now()).await.unwrap();

        assert_eq!(store.payment("p1").unwrap().status, PaymentStatus::Expired);
        assert_eq!(store.payment("p2").unwrap().status, PaymentStatus::Detected);

        let expired: Vec<_> = store
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::PaymentExpired)
            .collect();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].payment_id, "p1");
    }

    #[tokio::test]
    async fn shielded_payload_carries_memo() {
        let (store, engine) = setup();
        store.insert_payment(pending_payment("p1", "zs1addr"));

        let mut obs = observation("tx1", "zs1addr");
        obs.shielded = true;
        obs.memo = Some("order-42".into());
        engine.process_observation(obs).await.unwrap();

        let events = store.events();
        assert_eq!(events[0].payload["is_shielded"], serde_json::json!(true));
        assert_eq!(events[0].payload["memo"], serde_json::json!("order-42"));
        assert!(store.transactions()[0].shielded);
        assert_eq!(store.transactions()[0].memo.as_deref(), Some("order-42"));
    }
}
