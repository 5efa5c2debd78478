use async_trait::async_trait;

use crate::error::CoreError;
use crate::rpc::types::{
    AddressValidation, Block, ChainInfo, MempoolEntry, RawTransaction, RescanPolicy,
    ShieldedReceipt, UnspentOutput,
};
use crate::rpc::{BitcoinRpc, ZcashRpc};
use crate::types::BlockHeight;

use super::client::RpcBase;
use super::connection::RpcConnection;
use super::parsing::{parse_amount, parse_str_optional, parse_str_required, parse_u32_required};

/// Zcash-family JSON-RPC client over HTTP(S). Speaks the shared surface
/// plus the transparent-UTXO and shielded-scanning extensions.
pub struct ZcashRpcClient {
    base: RpcBase,
}

impl ZcashRpcClient {
    pub fn new(conn: &RpcConnection) -> Result<Self, CoreError> {
        Ok(Self {
            base: RpcBase::new(conn)?,
        })
    }
}

#[async_trait]
impl BitcoinRpc for ZcashRpcClient {
    async fn get_block_count(&self) -> Result<BlockHeight, CoreError> {
        self.base.get_block_count().await
    }

    async fn get_block_hash(&self, height: BlockHeight) -> Result<String, CoreError> {
        self.base.get_block_hash(height).await
    }

    async fn get_block(&self, hash: &str) -> Result<Block, CoreError> {
        self.base.get_block(hash).await
    }

    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError> {
        self.base.get_blockchain_info().await
    }

    async fn validate_address(&self, address: &str) -> Result<AddressValidation, CoreError> {
        self.base.validate_address("validateaddress", address).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, CoreError> {
        self.base.get_raw_transaction(txid).await
    }

    async fn decode_raw_transaction(&self, hex: &str) -> Result<RawTransaction, CoreError> {
        self.base.decode_raw_transaction(hex).await
    }

    async fn get_raw_mempool(&self) -> Result<Vec<String>, CoreError> {
        self.base.get_raw_mempool().await
    }

    async fn get_mempool_entry(&self, txid: &str) -> Result<Option<MempoolEntry>, CoreError> {
        self.base.get_mempool_entry(txid).await
    }
}

#[async_trait]
impl ZcashRpc for ZcashRpcClient {
    async fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> Result<Vec<UnspentOutput>, CoreError> {
        let raw = self
            .base
            .call(
                "listunspent",
                vec![
                    serde_json::json!(min_conf),
                    serde_json::json!(max_conf),
                    serde_json::json!(addresses),
                ],
            )
            .await?;
        let entries = raw
            .as_array()
            .ok_or_else(|| CoreError::InvalidData(format!("invalid listunspent result: {raw}")))?;

        entries
            .iter()
            .map(|entry| {
                Ok(UnspentOutput {
                    txid: parse_str_required(entry.get("txid"), "listunspent.txid")?,
                    vout: parse_u32_required(entry.get("vout"), "listunspent.vout")?,
                    address: parse_str_required(entry.get("address"), "listunspent.address")?,
                    amount: parse_amount(entry.get("amount").ok_or_else(|| {
                        CoreError::InvalidData("missing amount in listunspent".into())
                    })?)?,
                    confirmations: parse_u32_required(
                        entry.get("confirmations"),
                        "listunspent.confirmations",
                    )?,
                })
            })
            .collect()
    }

    async fn z_list_received_by_address(
        &self,
        address: &str,
        min_conf: u32,
    ) -> Result<Vec<ShieldedReceipt>, CoreError> {
        let raw = self
            .base
            .call(
                "z_listreceivedbyaddress",
                vec![serde_json::json!(address), serde_json::json!(min_conf)],
            )
            .await?;
        let entries = raw.as_array().ok_or_else(|| {
            CoreError::InvalidData(format!("invalid z_listreceivedbyaddress result: {raw}"))
        })?;

        entries
            .iter()
            .map(|entry| {
                // Prefer the integer zatoshi field when the node provides it.
                let amount = match entry.get("amountZat").and_then(serde_json::Value::as_u64) {
                    Some(zats) => crate::types::Amount::from_base_units(zats),
                    None => parse_amount(entry.get("amount").ok_or_else(|| {
                        CoreError::InvalidData("missing amount in z_listreceivedbyaddress".into())
                    })?)?,
                };
                Ok(ShieldedReceipt {
                    txid: parse_str_required(entry.get("txid"), "received.txid")?,
                    amount,
                    memo_hex: parse_str_optional(entry.get("memo")),
                    confirmations: parse_u32_required(
                        entry.get("confirmations"),
                        "received.confirmations",
                    )?,
                    change: entry
                        .get("change")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false),
                })
            })
            .collect()
    }

    async fn z_validate_address(&self, address: &str) -> Result<AddressValidation, CoreError> {
        self.base
            .validate_address("z_validateaddress", address)
            .await
    }

    async fn z_import_viewing_key(
        &self,
        key: &str,
        rescan: RescanPolicy,
        start_height: BlockHeight,
    ) -> Result<(), CoreError> {
        self.base
            .call(
                "z_importviewingkey",
                vec![
                    serde_json::json!(key),
                    serde_json::json!(rescan.as_str()),
                    serde_json::json!(start_height.0),
                ],
            )
            .await?;
        Ok(())
    }
}
