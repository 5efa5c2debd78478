//! Scriptable fake node implementing both RPC surfaces for tests.
//!
//! Unlike a canned-response mock, this keeps a tiny chain model (tip
//! height, mined blocks, mempool, shielded receipts) behind a mutex so a
//! scenario can submit transactions and mine blocks while a monitor is
//! running against it. Confirmation counts are always computed from the
//! current tip, exactly like a real node.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::rpc::types::{
    AddressValidation, Block, ChainInfo, MempoolEntry, RawTransaction, RescanPolicy,
    ShieldedReceipt, TxOutput, UnspentOutput,
};
use crate::rpc::{BitcoinRpc, ZcashRpc};
use crate::types::{Amount, BlockHeight};

/// A viewing-key import observed by the fake node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedKey {
    pub key: String,
    pub rescan: RescanPolicy,
    pub start_height: BlockHeight,
}

#[derive(Default)]
struct MockState {
    tip: u64,
    /// Mined transactions by block height.
    txs_by_height: HashMap<u64, Vec<RawTransaction>>,
    mempool: Vec<RawTransaction>,
    /// Receipts by shielded address; confirmations resolved at read time.
    shielded: HashMap<String, Vec<ShieldedReceipt>>,
    imported_keys: Vec<ImportedKey>,
}

/// A fake chain node for driving monitor scenarios in tests.
pub struct MockRpc {
    state: Mutex<MockState>,
}

/// Build an unconfirmed transaction paying `amount` to `address`.
pub fn payment_tx(txid: &str, address: &str, amount: Amount) -> RawTransaction {
    RawTransaction {
        txid: txid.to_owned(),
        block_hash: None,
        block_height: None,
        confirmations: None,
        outputs: vec![TxOutput {
            value: amount,
            n: 0,
            addresses: vec![address.to_owned()],
        }],
    }
}

/// Deterministic block hash encoding the height, parseable back out.
fn block_hash_at(height: u64) -> String {
    format!("{height:064x}")
}

fn height_from_hash(hash: &str) -> Option<u64> {
    u64::from_str_radix(hash, 16).ok()
}

impl MockRpc {
    /// Start with an empty chain at height 100, like a freshly set up
    /// regtest node.
    pub fn new() -> Self {
        Self::with_tip(100)
    }

    pub fn with_tip(tip: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                tip,
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock rpc state lock poisoned")
    }

    pub fn tip(&self) -> BlockHeight {
        BlockHeight(self.lock().tip)
    }

    /// Submit a transaction to the mempool.
    pub fn add_mempool_tx(&self, tx: RawTransaction) {
        self.lock().mempool.push(tx);
    }

    /// Mine `n` blocks containing nothing of interest.
    pub fn mine_empty_blocks(&self, n: u64) {
        self.lock().tip += n;
    }

    /// Mine one block containing the given transactions, removing them
    /// from the mempool if present. Returns the new tip height.
    pub fn mine_block(&self, txs: Vec<RawTransaction>) -> BlockHeight {
        let mut state = self.lock();
        state.tip += 1;
        let height = state.tip;
        let txids: Vec<String> = txs.iter().map(|tx| tx.txid.clone()).collect();
        state.mempool.retain(|tx| !txids.contains(&tx.txid));
        state.txs_by_height.insert(height, txs);
        BlockHeight(height)
    }

    /// Mine everything currently in the mempool into one block.
    pub fn mine_mempool(&self) -> BlockHeight {
        let pending = std::mem::take(&mut self.lock().mempool);
        self.mine_block(pending)
    }

    /// Record a shielded receipt visible through `z_listreceivedbyaddress`.
    /// Confirmations are derived from where (if anywhere) `txid` is mined.
    pub fn add_shielded_receipt(
        &self,
        address: &str,
        txid: &str,
        amount: Amount,
        memo_hex: Option<String>,
    ) {
        self.lock()
            .shielded
            .entry(address.to_owned())
            .or_default()
            .push(ShieldedReceipt {
                txid: txid.to_owned(),
                amount,
                memo_hex,
                confirmations: 0,
                change: false,
            });
    }

    pub fn imported_keys(&self) -> Vec<ImportedKey> {
        self.lock().imported_keys.clone()
    }

    /// Locate a transaction and return it with block context and
    /// confirmations stamped relative to the current tip.
    fn find_tx(&self, txid: &str) -> Option<RawTransaction> {
        let state = self.lock();
        if let Some(tx) = state.mempool.iter().find(|tx| tx.txid == txid) {
            let mut tx = tx.clone();
            tx.confirmations = None;
            return Some(tx);
        }
        for (height, txs) in &state.txs_by_height {
            if let Some(tx) = txs.iter().find(|tx| tx.txid == txid) {
                let mut tx = tx.clone();
                tx.block_hash = Some(block_hash_at(*height));
                tx.block_height = Some(BlockHeight(*height));
                tx.confirmations = Some(state.tip - height + 1);
                return Some(tx);
            }
        }
        None
    }
}

impl Default for MockRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BitcoinRpc for MockRpc {
    async fn get_block_count(&self) -> Result<BlockHeight, CoreError> {
        Ok(BlockHeight(self.lock().tip))
    }

    async fn get_block_hash(&self, height: BlockHeight) -> Result<String, CoreError> {
        if height.0 > self.lock().tip {
            return Err(CoreError::BlockNotFound(height.to_string()));
        }
        Ok(block_hash_at(height.0))
    }

    async fn get_block(&self, hash: &str) -> Result<Block, CoreError> {
        let height =
            height_from_hash(hash).ok_or_else(|| CoreError::BlockNotFound(hash.to_owned()))?;
        let state = self.lock();
        if height > state.tip {
            return Err(CoreError::BlockNotFound(hash.to_owned()));
        }
        let confirmations = state.tip - height + 1;
        let transactions = state
            .txs_by_height
            .get(&height)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut tx| {
                tx.block_hash = Some(hash.to_owned());
                tx.block_height = Some(BlockHeight(height));
                tx.confirmations = Some(confirmations);
                tx
            })
            .collect();
        Ok(Block {
            hash: hash.to_owned(),
            height: BlockHeight(height),
            time: Some(1_700_000_000 + height),
            transactions,
        })
    }

    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError> {
        let state = self.lock();
        Ok(ChainInfo {
            chain: "regtest".into(),
            blocks: state.tip,
            best_block_hash: block_hash_at(state.tip),
        })
    }

    async fn validate_address(&self, address: &str) -> Result<AddressValidation, CoreError> {
        Ok(AddressValidation {
            is_valid: !address.is_empty(),
            address: Some(address.to_owned()),
        })
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, CoreError> {
        self.find_tx(txid)
            .ok_or_else(|| CoreError::TxNotFound(txid.to_owned()))
    }

    /// The fake wire format: the "raw transaction" is the hex of the txid
    /// itself. Decoding strips block context, as a real decode would.
    async fn decode_raw_transaction(&self, hex: &str) -> Result<RawTransaction, CoreError> {
        let bytes = hex::decode(hex)
            .map_err(|e| CoreError::InvalidData(format!("invalid raw tx hex: {e}")))?;
        let txid = String::from_utf8(bytes)
            .map_err(|_| CoreError::InvalidData("invalid raw tx payload".into()))?;
        let mut tx = self
            .find_tx(&txid)
            .ok_or_else(|| CoreError::InvalidData(format!("unknown raw tx {txid}")))?;
        tx.block_hash = None;
        tx.block_height = None;
        tx.confirmations = None;
        Ok(tx)
    }

    async fn get_raw_mempool(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.lock().mempool.iter().map(|tx| tx.txid.clone()).collect())
    }

    async fn get_mempool_entry(&self, txid: &str) -> Result<Option<MempoolEntry>, CoreError> {
        let present = self.lock().mempool.iter().any(|tx| tx.txid == txid);
        Ok(present.then_some(MempoolEntry { time: None }))
    }
}

#[async_trait]
impl ZcashRpc for MockRpc {
    async fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> Result<Vec<UnspentOutput>, CoreError> {
        let state = self.lock();
        let mut results = Vec::new();

        let mut push_matches = |tx: &RawTransaction, confirmations: u32| {
            for out in &tx.outputs {
                for addr in &out.addresses {
                    if addresses.contains(addr)
                        && confirmations >= min_conf
                        && confirmations <= max_conf
                    {
                        results.push(UnspentOutput {
                            txid: tx.txid.clone(),
                            vout: out.n,
                            address: addr.clone(),
                            amount: out.value,
                            confirmations,
                        });
                    }
                }
            }
        };

        for tx in &state.mempool {
            push_matches(tx, 0);
        }
        for (height, txs) in &state.txs_by_height {
            let confirmations = (state.tip - height + 1) as u32;
            for tx in txs {
                push_matches(tx, confirmations);
            }
        }
        Ok(results)
    }

    async fn z_list_received_by_address(
        &self,
        address: &str,
        min_conf: u32,
    ) -> Result<Vec<ShieldedReceipt>, CoreError> {
        let receipts = self.lock().shielded.get(address).cloned().unwrap_or_default();
        Ok(receipts
            .into_iter()
            .map(|mut receipt| {
                receipt.confirmations = self
                    .find_tx(&receipt.txid)
                    .and_then(|tx| tx.confirmations)
                    .unwrap_or(0) as u32;
                receipt
            })
            .filter(|receipt| receipt.confirmations >= min_conf)
            .collect())
    }

    async fn z_validate_address(&self, address: &str) -> Result<AddressValidation, CoreError> {
        Ok(AddressValidation {
            is_valid: !address.is_empty(),
            address: Some(address.to_owned()),
        })
    }

    async fn z_import_viewing_key(
        &self,
        key: &str,
        rescan: RescanPolicy,
        start_height: BlockHeight,
    ) -> Result<(), CoreError> {
        self.lock().imported_keys.push(ImportedKey {
            key: key.to_owned(),
            rescan,
            start_height,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hash_roundtrips_height() {
        let hash = block_hash_at(1234);
        assert_eq!(hash.len(), 64);
        assert_eq!(height_from_hash(&hash), Some(1234));
    }

    #[tokio::test]
    async fn mined_tx_confirmations_track_the_tip() {
        let rpc = MockRpc::with_tip(100);
        rpc.add_mempool_tx(payment_tx("tx1", "addr1", Amount::from_base_units(5_000)));
        assert_eq!(rpc.get_confirmations("tx1").await.unwrap(), 0);

        rpc.mine_mempool();
        assert_eq!(rpc.get_confirmations("tx1").await.unwrap(), 1);

        rpc.mine_empty_blocks(5);
        assert_eq!(rpc.get_confirmations("tx1").await.unwrap(), 6);

        assert_eq!(rpc.get_confirmations("missing").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn blocks_report_their_transactions() {
        let rpc = MockRpc::with_tip(10);
        let height = rpc.mine_block(vec![payment_tx(
            "tx2",
            "addr2",
            Amount::from_base_units(1_000),
        )]);
        let hash = rpc.get_block_hash(height).await.unwrap();
        let block = rpc.get_block(&hash).await.unwrap();
        assert_eq!(block.height, height);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].block_height, Some(height));
    }

    #[tokio::test]
    async fn shielded_receipts_follow_mined_confirmations() {
        let rpc = MockRpc::with_tip(50);
        rpc.add_shielded_receipt("zs1addr", "tx3", Amount::from_base_units(900), None);
        rpc.mine_block(vec![payment_tx("tx3", "", Amount::ZERO)]);

        let receipts = rpc.z_list_received_by_address("zs1addr", 0).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].confirmations, 1);
    }
}
