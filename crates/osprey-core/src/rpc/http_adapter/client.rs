use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use reqwest::header;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::error::{CoreError, RpcError};
use crate::rpc::types::{AddressValidation, Block, ChainInfo, MempoolEntry, RawTransaction};
use crate::types::BlockHeight;

use super::connection::{parse_connection, resolve_auth, RpcConnection};
use super::parsing::{
    parse_block, parse_raw_transaction, parse_str_optional, parse_str_required, parse_u64_optional,
    parse_u64_required,
};
use super::protocol::{parse_jsonrpc_error, JsonRpcRequest, JsonRpcResponse};

/// Maximum number of block-hash → height entries cached in memory.
const BLOCK_HEIGHT_CACHE_CAP: usize = 10_000;

/// Retry backoff doubles from the configured start up to this ceiling.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

// ==============================================================================
// Transport
// ==============================================================================

/// JSON-RPC transport over HTTP(S) with basic auth, strictly sequential
/// request ids, and a retry loop that distinguishes transient failures
/// from definitive node answers.
pub(super) struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
    next_id: AtomicU64,
    max_retries: u32,
    retry_initial: Duration,
}

impl JsonRpcClient {
    pub(super) fn new(conn: &RpcConnection) -> Result<Self, CoreError> {
        let url = parse_connection(&conn.url)?;
        let auth = resolve_auth(conn.user.as_deref(), conn.pass.as_deref())?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(conn.timeout)
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .expect("reqwest client builder uses valid static config");

        Ok(Self {
            client,
            url,
            auth,
            next_id: AtomicU64::new(initial_request_id()),
            max_retries: conn.max_retries.max(1),
            retry_initial: conn.retry_initial,
        })
    }

    /// Issue one JSON-RPC call, retrying retryable failures up to the
    /// configured attempt count with capped exponential backoff.
    pub(super) async fn call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError> {
        let mut backoff = self.retry_initial;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call_once(method, &params).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        rpc.method = method,
                        attempt,
                        max_attempts = self.max_retries,
                        error = %err,
                        "rpc call failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(
        &self,
        method: &str,
        params: &[serde_json::Value],
    ) -> Result<serde_json::Value, CoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            rpc.id = id,
            rpc.method = method,
            rpc.params = params.len(),
            "rpc call"
        );
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params: params.to_vec(),
        };

        let mut builder = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&req);
        if let Some((ref user, ref pass)) = self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }

        let response = builder.send().await.map_err(RpcError::Transport)?;
        let status = response.status();

        let body = response.text().await.map_err(RpcError::Transport)?;
        debug!(rpc.id = id, rpc.method = method, %status, body_len = body.len(), "rpc response");
        trace!(rpc.id = id, rpc.method = method, body = %body, "rpc response body");

        // Nodes answer structured errors with non-2xx statuses, so decode
        // the body first and fall back to the HTTP status only when the
        // body is not JSON-RPC at all.
        let decoded: JsonRpcResponse = match serde_json::from_str(&body) {
            Ok(decoded) => decoded,
            Err(_) if !status.is_success() => {
                return Err(RpcError::Http {
                    status: status.as_u16(),
                }
                .into());
            }
            Err(e) => {
                return Err(RpcError::InvalidResponse(format!(
                    "decode JSON-RPC response: {e}; body={body}"
                ))
                .into());
            }
        };

        if let Some(err) = decoded.error {
            return Err(parse_jsonrpc_error(err));
        }

        Ok(decoded.result.unwrap_or(serde_json::Value::Null))
    }
}

fn initial_request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

// ==============================================================================
// Shared Method Surface
// ==============================================================================

/// The method surface common to both chain families, layered over the
/// transport. Maintains an LRU cache of block-hash-to-height mappings so
/// confirmation sweeps do not repeat `getblockheader` for the same block.
pub(super) struct RpcBase {
    rpc: JsonRpcClient,
    /// Confirmed block heights are immutable, so entries never need
    /// invalidation, only eviction under memory pressure.
    block_height_cache: RwLock<LruCache<String, BlockHeight>>,
}

impl RpcBase {
    pub(super) fn new(conn: &RpcConnection) -> Result<Self, CoreError> {
        Ok(Self {
            rpc: JsonRpcClient::new(conn)?,
            block_height_cache: RwLock::new(LruCache::new(
                NonZeroUsize::new(BLOCK_HEIGHT_CACHE_CAP)
                    .expect("BLOCK_HEIGHT_CACHE_CAP is non-zero"),
            )),
        })
    }

    pub(super) async fn call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError> {
        self.rpc.call(method, params).await
    }

    pub(super) async fn get_block_count(&self) -> Result<BlockHeight, CoreError> {
        let raw = self.call("getblockcount", Vec::new()).await?;
        raw.as_u64()
            .map(BlockHeight)
            .ok_or_else(|| CoreError::InvalidData(format!("invalid getblockcount result: {raw}")))
    }

    pub(super) async fn get_block_hash(&self, height: BlockHeight) -> Result<String, CoreError> {
        let raw = self
            .call("getblockhash", vec![serde_json::json!(height.0)])
            .await
            .map_err(|err| match err {
                CoreError::Rpc(ref rpc) if rpc.is_not_found() => {
                    CoreError::BlockNotFound(height.to_string())
                }
                other => other,
            })?;
        raw.as_str()
            .map(str::to_owned)
            .ok_or_else(|| CoreError::InvalidData(format!("invalid getblockhash result: {raw}")))
    }

    pub(super) async fn get_block(&self, hash: &str) -> Result<Block, CoreError> {
        let raw = self
            .call(
                "getblock",
                vec![serde_json::json!(hash), serde_json::json!(2)],
            )
            .await
            .map_err(|err| match err {
                CoreError::Rpc(ref rpc) if rpc.is_not_found() => {
                    CoreError::BlockNotFound(hash.to_owned())
                }
                other => other,
            })?;
        parse_block(&raw)
    }

    pub(super) async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError> {
        let raw = self.call("getblockchaininfo", Vec::new()).await?;
        Ok(ChainInfo {
            chain: parse_str_required(raw.get("chain"), "chain")?,
            blocks: parse_u64_required(raw.get("blocks"), "blocks")?,
            best_block_hash: parse_str_required(raw.get("bestblockhash"), "bestblockhash")?,
        })
    }

    pub(super) async fn validate_address(
        &self,
        method: &str,
        address: &str,
    ) -> Result<AddressValidation, CoreError> {
        let raw = self.call(method, vec![serde_json::json!(address)]).await?;
        let is_valid = raw
            .get("isvalid")
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| CoreError::InvalidData(format!("invalid {method} result: {raw}")))?;
        Ok(AddressValidation {
            is_valid,
            address: parse_str_optional(raw.get("address")),
        })
    }

    pub(super) async fn get_raw_transaction(
        &self,
        txid: &str,
    ) -> Result<RawTransaction, CoreError> {
        let raw = self
            .call(
                "getrawtransaction",
                vec![serde_json::json!(txid), serde_json::json!(1)],
            )
            .await
            .map_err(|err| match err {
                CoreError::Rpc(ref rpc) if rpc.is_not_found() => {
                    CoreError::TxNotFound(txid.to_owned())
                }
                other => other,
            })?;
        let mut tx = parse_raw_transaction(&raw)?;

        // Bitcoin-family nodes omit the height; resolve it from the block
        // hash once the transaction is confirmed.
        if tx.block_height.is_none() {
            if let Some(block_hash) = tx.block_hash.clone() {
                if tx.confirmations.unwrap_or(0) > 0 {
                    tx.block_height = self.block_height_for_hash(&block_hash).await?;
                }
            }
        }
        Ok(tx)
    }

    pub(super) async fn decode_raw_transaction(
        &self,
        hex: &str,
    ) -> Result<RawTransaction, CoreError> {
        let raw = self
            .call("decoderawtransaction", vec![serde_json::json!(hex)])
            .await?;
        parse_raw_transaction(&raw)
    }

    pub(super) async fn get_raw_mempool(&self) -> Result<Vec<String>, CoreError> {
        let raw = self
            .call("getrawmempool", vec![serde_json::json!(false)])
            .await?;
        raw.as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .ok_or_else(|| CoreError::InvalidData(format!("invalid getrawmempool result: {raw}")))
    }

    pub(super) async fn get_mempool_entry(
        &self,
        txid: &str,
    ) -> Result<Option<MempoolEntry>, CoreError> {
        match self
            .call("getmempoolentry", vec![serde_json::json!(txid)])
            .await
        {
            Ok(raw) => Ok(Some(MempoolEntry {
                time: parse_u64_optional(raw.get("time")),
            })),
            Err(CoreError::Rpc(ref rpc)) if rpc.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn block_height_for_hash(
        &self,
        block_hash: &str,
    ) -> Result<Option<BlockHeight>, CoreError> {
        // The LRU cache requires a write lock for `get` (it updates
        // recency), but the lookup is fast so the write lock is acceptable.
        if let Some(height) = self
            .block_height_cache
            .write()
            .await
            .get(block_hash)
            .copied()
        {
            return Ok(Some(height));
        }

        let raw = self
            .call(
                "getblockheader",
                vec![serde_json::json!(block_hash), serde_json::json!(true)],
            )
            .await?;
        let height = parse_u64_optional(raw.get("height")).map(BlockHeight);
        if let Some(height) = height {
            self.block_height_cache
                .write()
                .await
                .put(block_hash.to_owned(), height);
        }
        Ok(height)
    }
}
