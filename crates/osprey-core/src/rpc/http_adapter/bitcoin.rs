use async_trait::async_trait;

use crate::error::CoreError;
use crate::rpc::types::{AddressValidation, Block, ChainInfo, MempoolEntry, RawTransaction};
use crate::rpc::BitcoinRpc;
use crate::types::BlockHeight;

use super::client::RpcBase;
use super::connection::RpcConnection;

/// Bitcoin-family JSON-RPC client over HTTP(S).
pub struct BitcoinRpcClient {
    base: RpcBase,
}

impl BitcoinRpcClient {
    pub fn new(conn: &RpcConnection) -> Result<Self, CoreError> {
        Ok(Self {
            base: RpcBase::new(conn)?,
        })
    }
}

#[async_trait]
impl BitcoinRpc for BitcoinRpcClient {
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
