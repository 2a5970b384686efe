use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::{ConfigError, TransportConfig};
use crate::retry::{RetryError, RetryPolicy, Retryable, retry};
use crate::schema::{Record, encode_batch};

/// Broadcast channel: one message makes every collector run a cycle.
pub const REFRESH_CHANNEL: &str = "refresh";

/// Point-to-point queue from every collector to the aggregator.
pub const BATCH_QUEUE: &str = "providers";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("cannot encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("bad transport settings: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    GaveUp(String),
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Broker(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            Self::Encode(_) | Self::Config(_) | Self::GaveUp(_) => false,
        }
    }
}

impl From<RetryError<TransportError>> for TransportError {
    fn from(err: RetryError<TransportError>) -> Self {
        match err {
            RetryError::Fatal(e) => e,
            exhausted @ RetryError::Exhausted { .. } => Self::GaveUp(exhausted.to_string()),
        }
    }
}

/// Where a finished collector cycle sends its batch.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn publish_batch(&self, records: &[Record]) -> Result<(), TransportError>;
}

/// ============================================================
/// Transport
/// ============================================================
///
/// Redis-backed message bus with two channels:
///
/// - `refresh` (PUBLISH/SUBSCRIBE): payload-less broadcast. Delivery is
///   best-effort; a collector that is down when it fires misses it.
/// - `providers` (list): producers RPUSH one JSON batch per cycle, the
///   aggregator LPOPs. A popped message is gone, so delivery is
///   at-most-once, like an auto-acknowledged queue.
///
/// Publishing runs through the retry executor with "reconnect" as the
/// recovery step.
///
/// Cloning is cheap; clones share the cached connection.
#[derive(Clone)]
pub struct Transport {
    client: redis::Client,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl Transport {
    /// Opens the broker connection. Failure here is fatal for startup.
    pub async fn connect(cfg: &TransportConfig, retry: RetryPolicy) -> Result<Self, TransportError> {
        log::info!("Connecting to broker at {}:{}", cfg.host, cfg.port);

        let transport = Self {
            client: redis::Client::open(cfg.url()?.as_str())?,
            conn: Arc::new(Mutex::new(None)),
            retry,
            poll_interval: cfg.poll_interval(),
        };
        transport.reconnect().await?;
        Ok(transport)
    }

    /// Replaces the cached connection with a fresh one.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.conn.lock().await = Some(conn);
        Ok(())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, TransportError> {
        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Broadcasts one refresh signal. Returns how many collectors got it.
    pub async fn publish_refresh(&self) -> Result<usize, TransportError> {
        let receivers = retry(
            &self.retry,
            "refresh publish",
            || async {
                let mut conn = self.connection().await?;
                let receivers: usize = conn.publish(REFRESH_CHANNEL, "").await?;
                Ok::<_, TransportError>(receivers)
            },
            || self.reconnect(),
        )
        .await?;

        Ok(receivers)
    }

    /// Appends one encoded batch to the `providers` queue.
    pub async fn push_batch(&self, payload: &[u8]) -> Result<(), TransportError> {
        retry(
            &self.retry,
            "batch publish",
            || async {
                let mut conn = self.connection().await?;
                let _: usize = conn.rpush(BATCH_QUEUE, payload).await?;
                Ok::<_, TransportError>(())
            },
            || self.reconnect(),
        )
        .await?;

        Ok(())
    }

    /// Takes the oldest batch, if any.
    pub async fn pop_batch(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut conn = self.connection().await?;
        Ok(conn.lpop(BATCH_QUEUE, None).await?)
    }

    /// Waits for the next batch, polling the queue.
    pub async fn next_batch(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(payload) = self.pop_batch().await? {
                return Ok(payload);
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Subscribes a dedicated connection to the refresh broadcast.
    pub async fn subscribe_refresh(&self) -> Result<RefreshSignals, TransportError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(REFRESH_CHANNEL).await?;

        Ok(RefreshSignals {
            messages: Box::pin(pubsub.into_on_message()),
        })
    }

    /// Drops the cached connection.
    pub async fn close(&self) {
        self.conn.lock().await.take();
    }
}

#[async_trait]
impl BatchSink for Transport {
    async fn publish_batch(&self, records: &[Record]) -> Result<(), TransportError> {
        let payload = encode_batch(records)?;
        self.push_batch(&payload).await
    }
}

/// Stream of refresh signals for one subscriber.
pub struct RefreshSignals {
    messages: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

impl RefreshSignals {
    /// Resolves on the next signal; `None` once the subscription died.
    pub async fn next(&mut self) -> Option<()> {
        self.messages.next().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_connections_are_retryable() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(TransportError::Broker(io).is_retryable());
    }

    #[test]
    fn encoding_and_exhaustion_are_not_retryable() {
        let encode = serde_json::from_str::<u8>("x").unwrap_err();
        assert!(!TransportError::Encode(encode).is_retryable());
        assert!(!TransportError::GaveUp("gave up".into()).is_retryable());
    }

    #[test]
    fn exhausted_retry_keeps_its_context() {
        let err: TransportError = RetryError::Exhausted {
            attempts: 3,
            last: TransportError::GaveUp("broker down".into()),
        }
        .into();

        assert_eq!(err.to_string(), "gave up after 3 attempts: broker down");
    }
}
