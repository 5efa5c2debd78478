//! Schema-checked data-transfer objects for the chain RPC surfaces.
//!
//! Every field the monitors consume is validated and converted at the RPC
//! boundary; nothing downstream touches raw `serde_json::Value`s.

use crate::types::{Amount, BlockHeight};

/// Basic chain info from `getblockchaininfo`.
#[derive(Debug, Clone)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
    pub best_block_hash: String,
}

/// A block fetched at verbosity 2: header fields plus decoded transactions.
#[derive(Debug, Clone)]
pub struct Block {
    pub hash: String,
    pub height: BlockHeight,
    pub time: Option<u64>,
    pub transactions: Vec<RawTransaction>,
}

/// A decoded transaction. Inputs are irrelevant to payment detection and
/// are not carried.
#[derive(Debug, Clone)]
pub struct RawTransaction {
    pub txid: String,
    /// `None` while unconfirmed.
    pub block_hash: Option<String>,
    pub block_height: Option<BlockHeight>,
    /// `None` for mempool transactions and `decoderawtransaction` output.
    pub confirmations: Option<u64>,
    pub outputs: Vec<TxOutput>,
}

/// One transaction output with its decoded destination addresses.
#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value: Amount,
    pub n: u32,
    /// Usually one entry; bare multisig can carry several. Empty for
    /// non-address scripts (op_return, shielded outputs).
    pub addresses: Vec<String>,
}

/// A `getmempoolentry` result, reduced to what the monitors use.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub time: Option<u64>,
}

/// One unspent output from `listunspent`.
#[derive(Debug, Clone)]
pub struct UnspentOutput {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: Amount,
    pub confirmations: u32,
}

/// One entry from `z_listreceivedbyaddress`. The amount comes from the
/// node's decryption of the note; transaction outputs are opaque.
#[derive(Debug, Clone)]
pub struct ShieldedReceipt {
    pub txid: String,
    pub amount: Amount,
    /// Raw memo field as hex, still undecoded.
    pub memo_hex: Option<String>,
    pub confirmations: u32,
    /// Change notes are the wallet paying itself; never a customer payment.
    pub change: bool,
}

/// Result of `validateaddress` / `z_validateaddress`.
#[derive(Debug, Clone)]
pub struct AddressValidation {
    pub is_valid: bool,
    /// Canonical form echoed by the node when valid.
    pub address: Option<String>,
}

/// Rescan behavior for `z_importviewingkey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanPolicy {
    /// Rescan only if the node has not seen this key before. The right
    /// choice when the start height is the key's birthday.
    WhenKeyIsNew,
    Yes,
    No,
}

impl RescanPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RescanPolicy::WhenKeyIsNew => "whenkeyisnew",
            RescanPolicy::Yes => "yes",
            RescanPolicy::No => "no",
        }
    }
}
