//! Core library for **Osprey** — the chain-monitoring half of a
//! cryptocurrency payment-acceptance platform.
//!
//! This crate watches a Bitcoin-family chain and a Zcash-family chain for
//! transactions paying addresses owned by outstanding payment requests,
//! tracks confirmations, and drives each payment through
//! `pending → detected → confirmed` while recording outbound notification
//! events for an external delivery service.
//!
//! It is intentionally transport- and storage-agnostic: chain access goes
//! through the [`rpc`] traits (HTTP JSON-RPC, a mock, or any future
//! transport) and persistence goes through the [`storage`] traits. The
//! monitors in [`monitor`] are correct across restarts (persistent
//! cursor), node outages (retry plus periodic reconciliation), and
//! reorganizations (conservative reset, never rolling back a confirmed
//! payment).

pub mod cache;
pub mod config;
pub mod error;
pub mod monitor;
pub mod rpc;
pub mod storage;
pub mod stream;
pub mod types;

pub use config::MonitorConfig;
pub use error::{CoreError, RpcError};
pub use monitor::{BitcoinMonitor, Repositories, ZcashMonitor};
pub use types::{Amount, BlockHeight, Chain, Payment, PaymentStatus};
