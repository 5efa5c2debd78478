//! Event-stream subscriber for the Bitcoin-family node's pub/sub feed.
//!
//! The node publishes framed binary messages: three length-prefixed frames
//! per message (topic, payload, and a little-endian `u32` sequence number).
//! The subscriber connects over TCP, writes one subscription frame per
//! registered topic, then dispatches payloads to per-topic handlers in
//! arrival order.
//!
//! Delivery is best-effort and at-most-once; the monitors never rely on it
//! for correctness. The reconciliation sweep rediscovers anything a dropped
//! connection missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::CoreError;

/// Topic carrying the hash of each newly accepted block.
pub const TOPIC_HASH_BLOCK: &str = "hashblock";
/// Topic carrying each newly seen raw transaction.
pub const TOPIC_RAW_TX: &str = "rawtx";

/// Frames above this size indicate a desynchronized or hostile stream.
const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

/// Reconnect backoff bounds.
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// A per-topic message handler. Handlers run sequentially on the receive
/// loop and must only enqueue work, never block on it.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, payload: Vec<u8>) -> Result<(), CoreError>;
}

/// One decoded pub/sub message.
#[derive(Debug, PartialEq, Eq)]
struct StreamMessage {
    topic: String,
    payload: Vec<u8>,
    sequence: u32,
}

/// Consumer for the node's pub/sub feed with automatic reconnect.
///
/// Topics are fixed at construction. After
/// `max_reconnect_attempts` consecutive connection failures the subscriber
/// raises its degraded flag (visible through the handle returned by
/// [`degraded_flag`](Self::degraded_flag)) but keeps trying at the capped
/// backoff; only the shutdown signal stops it.
pub struct EventStreamSubscriber {
    endpoint: String,
    handlers: Vec<(String, Arc<dyn StreamHandler>)>,
    max_reconnect_attempts: u32,
    degraded: Arc<AtomicBool>,
}

impl EventStreamSubscriber {
    pub fn new(endpoint: impl Into<String>, max_reconnect_attempts: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            handlers: Vec::new(),
            max_reconnect_attempts,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a handler for a topic. Multiple handlers per topic run in
    /// registration order.
    pub fn on_topic(mut self, topic: &str, handler: Arc<dyn StreamHandler>) -> Self {
        self.handlers.push((topic.to_owned(), handler));
        self
    }

    /// Shared health flag: `true` while the subscriber has exhausted its
    /// reconnect budget without reaching the endpoint.
    pub fn degraded_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.degraded)
    }

    /// Run until the shutdown signal fires. Never returns an error: stream
    /// failures degrade health, they do not terminate the process.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = RECONNECT_INITIAL;
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return;
            }

            match TcpStream::connect(&self.endpoint).await {
                Ok(stream) => {
                    info!(endpoint = %self.endpoint, "event stream connected");
                    failures = 0;
                    backoff = RECONNECT_INITIAL;
                    self.degraded.store(false, Ordering::Relaxed);

                    match self.consume(stream, &mut shutdown).await {
                        Ok(()) => return, // shutdown requested
                        Err(err) => {
                            warn!(endpoint = %self.endpoint, error = %err, "event stream dropped")
                        }
                    }
                }
                Err(err) => {
                    warn!(endpoint = %self.endpoint, error = %err, "event stream connect failed");
                }
            }

            failures += 1;
            if failures == self.max_reconnect_attempts {
                error!(
                    endpoint = %self.endpoint,
                    failures,
                    "event stream degraded; reconciliation sweep is the only intake"
                );
                self.degraded.store(true, Ordering::Relaxed);
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// Subscribe and dispatch messages until the stream fails or shutdown
    /// is requested. `Ok(())` means shutdown.
    async fn consume<S>(
        &self,
        mut stream: S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), CoreError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        for (topic, _) in &self.handlers {
            write_frame(&mut stream, topic.as_bytes()).await?;
        }
        stream
            .flush()
            .await
            .map_err(|e| CoreError::Stream(format!("flush subscriptions: {e}")))?;

        let mut last_sequence: HashMap<String, u32> = HashMap::new();

        loop {
            let message = tokio::select! {
                message = read_message(&mut stream) => message?,
                _ = shutdown.changed() => return Ok(()),
            };

            if let Some(previous) = last_sequence.get(&message.topic) {
                let expected = previous.wrapping_add(1);
                if message.sequence != expected {
                    warn!(
                        topic = %message.topic,
                        expected,
                        got = message.sequence,
                        "sequence gap on event stream"
                    );
                }
            }
            last_sequence.insert(message.topic.clone(), message.sequence);
            debug!(topic = %message.topic, sequence = message.sequence, payload_len = message.payload.len(), "stream message");

            for (topic, handler) in &self.handlers {
                if topic != &message.topic {
                    continue;
                }
                // A handler failure must not tear down the stream.
                if let Err(err) = handler.handle(message.payload.clone()).await {
                    warn!(topic = %message.topic, error = %err, "stream handler failed");
                }
            }
        }
    }
}

// ==============================================================================
// Frame Codec
// ==============================================================================

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<(), CoreError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CoreError::Stream("frame too large to encode".into()))?;
    stream
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| CoreError::Stream(format!("write frame length: {e}")))?;
    stream
        .write_all(bytes)
        .await
        .map_err(|e| CoreError::Stream(format!("write frame body: {e}")))?;
    Ok(())
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, CoreError> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| CoreError::Stream(format!("read frame length: {e}")))?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(CoreError::Stream(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| CoreError::Stream(format!("read frame body: {e}")))?;
    Ok(body)
}

async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<StreamMessage, CoreError> {
    let topic_bytes = read_frame(stream).await?;
    let topic = String::from_utf8(topic_bytes)
        .map_err(|_| CoreError::Stream("topic frame is not UTF-8".into()))?;
    let payload = read_frame(stream).await?;

    let sequence_bytes = read_frame(stream).await?;
    let sequence: [u8; 4] = sequence_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::Stream("sequence frame must be 4 bytes".into()))?;

    Ok(StreamMessage {
        topic,
        payload,
        sequence: u32::from_le_bytes(sequence),
    })
}

/// Encode a full message the way the node publishes it. Used by tests and
/// kept next to the codec it mirrors.
#[cfg(test)]
async fn write_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    topic: &str,
    payload: &[u8],
    sequence: u32,
) -> Result<(), CoreError> {
    write_frame(stream, topic.as_bytes()).await?;
    write_frame(stream, payload).await?;
    write_frame(stream, &sequence.to_le_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn frame_codec_roundtrips() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_message(&mut server, TOPIC_RAW_TX, b"payload", 7)
            .await
            .expect("write must succeed");
        let message = read_message(&mut client).await.expect("read must succeed");
        assert_eq!(
            message,
            StreamMessage {
                topic: TOPIC_RAW_TX.into(),
                payload: b"payload".to_vec(),
                sequence: 7,
            }
        );
    }

    #[tokio::test]
    async fn rejects_oversized_frames() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge = (MAX_FRAME_BYTES + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut server, &huge)
            .await
            .expect("write must succeed");

        let err = read_frame(&mut client).await.expect_err("must reject");
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn rejects_malformed_sequence_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut server, b"rawtx").await.unwrap();
        write_frame(&mut server, b"data").await.unwrap();
        write_frame(&mut server, b"123").await.unwrap(); // 3 bytes, not 4

        let err = read_message(&mut client).await.expect_err("must reject");
        assert!(err.to_string().contains("sequence frame"));
    }

    struct Recorder {
        seen: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    #[async_trait]
    impl StreamHandler for Recorder {
        async fn handle(&self, payload: Vec<u8>) -> Result<(), CoreError> {
            self.seen.lock().expect("lock").push(payload);
            if self.fail {
                Err(CoreError::Stream("handler failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn dispatches_by_topic_and_survives_handler_failure() {
        let failing = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let healthy = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });

        let subscriber = EventStreamSubscriber::new("unused:0", 3)
            .on_topic(TOPIC_RAW_TX, failing.clone())
            .on_topic(TOPIC_HASH_BLOCK, healthy.clone());

        let (client, mut server) = tokio::io::duplex(4096);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let consume = tokio::spawn(async move {
            let mut client = client;
            subscriber.consume(&mut client, &mut shutdown_rx).await
        });

        // Two subscription frames arrive first.
        assert_eq!(read_frame(&mut server).await.unwrap(), b"rawtx");
        assert_eq!(read_frame(&mut server).await.unwrap(), b"hashblock");

        write_message(&mut server, TOPIC_RAW_TX, b"tx-a", 1).await.unwrap();
        write_message(&mut server, TOPIC_HASH_BLOCK, b"blk-1", 1).await.unwrap();
        write_message(&mut server, TOPIC_RAW_TX, b"tx-b", 2).await.unwrap();

        // Give the consumer a chance to drain, then stop it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("send shutdown");
        consume.await.expect("join").expect("consume returns ok on shutdown");

        assert_eq!(
            *failing.seen.lock().expect("lock"),
            vec![b"tx-a".to_vec(), b"tx-b".to_vec()]
        );
        assert_eq!(*healthy.seen.lock().expect("lock"), vec![b"blk-1".to_vec()]);
    }
}
