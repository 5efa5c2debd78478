//! Shared fixtures for the monitor scenario tests.

#![allow(dead_code)]

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use osprey_core::types::{Amount, Chain, Payment, PaymentStatus};
use osprey_core::MonitorConfig;

/// Config with millisecond cadences so scenarios complete quickly.
pub fn fast_config() -> MonitorConfig {
    MonitorConfig {
        confirmation_threshold: 6,
        poll_interval_ms: 25,
        reconcile_interval_ms: 25,
        address_cache_refresh_ms: 50,
        rpc_max_retries: 1,
        rpc_retry_initial_ms: 10,
        rpc_timeout_ms: 1_000,
        subscriber_max_reconnect_attempts: 2,
        catch_up_max_blocks_per_tick: 500,
        shielded_import_lookback: 1_000,
        shutdown_grace_ms: 1_000,
    }
}

pub fn pending_payment(id: &str, chain: Chain, address: &str) -> Payment {
    Payment {
        id: id.to_owned(),
        merchant_id: "merch-1".into(),
        order_id: format!("order-{id}"),
        chain,
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

/// Poll `condition` until it holds or a generous deadline passes.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Write one length-prefixed frame the way the node's pub/sub feed does.
pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).expect("test frame fits in u32");
    stream
        .write_all(&len.to_le_bytes())
        .await
        .expect("write frame length");
    stream.write_all(bytes).await.expect("write frame body");
}

/// Publish one full message: topic, payload, little-endian sequence.
pub async fn publish_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    topic: &str,
    payload: &[u8],
    sequence: u32,
) {
    write_frame(stream, topic.as_bytes()).await;
    write_frame(stream, payload).await;
    write_frame(stream, &sequence.to_le_bytes()).await;
    stream.flush().await.expect("flush message");
}
