//! HTTP JSON-RPC adapter for Bitcoin-family and Zcash-family nodes.
//!
//! `client` holds the transport (auth, sequential request ids, retry with
//! capped exponential backoff) and the method surface shared by both chain
//! families; `bitcoin` and `zcash` expose the per-chain clients.

mod bitcoin;
mod client;
mod connection;
mod parsing;
mod protocol;
mod zcash;

pub use bitcoin::BitcoinRpcClient;
pub use connection::RpcConnection;
pub use zcash::ZcashRpcClient;
