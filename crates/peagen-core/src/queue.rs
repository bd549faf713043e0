//! Pluggable queue contract: one queue per pool, plus an orthogonal
//! publish/subscribe fan-out channel.
//!
//! Two implementations ship here: [`in_memory::InMemoryQueue`] for tests and
//! local/dev mode, and [`redis_backend::RedisQueue`] for production. Both
//! preserve the same blocking/cancellation semantics so the dispatcher and
//! worker runtime can be written once against the [`Queue`] trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

/// The queued work unit, per the glossary: `{task_id, kind, args, attempt, deadline}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: String,
    pub args: serde_json::Value,
    pub attempt: i64,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Why a caller is requeuing an envelope; determines head-vs-tail placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// Dispatch failed transiently (e.g. network blip); retry fast, at head.
    DispatchFailed,
    /// No eligible worker was available; retry after a backoff, at head.
    NoWorker,
    /// The owning worker was evicted; recovery retry, at tail.
    WorkerLost,
}

impl RequeueReason {
    fn to_head(self) -> bool {
        !matches!(self, RequeueReason::WorkerLost)
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn push(&self, pool: &str, envelope: Envelope) -> Result<()>;

    async fn pop_blocking(&self, pool: &str, timeout: Duration) -> Result<Option<Envelope>>;

    async fn ack(&self, pool: &str, envelope_id: Uuid) -> Result<()>;

    async fn requeue(&self, pool: &str, envelope: Envelope, reason: RequeueReason) -> Result<()>;

    /// Current depth of the named pool's queue, for backpressure reporting.
    async fn depth(&self, pool: &str) -> Result<u64>;

    async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<()>;

    /// Subscribe to a fan-out channel. Returns a receiver; messages published
    /// before the subscription is established are not replayed.
    async fn subscribe(&self, channel: &str) -> Result<tokio::sync::mpsc::Receiver<serde_json::Value>>;
}

pub mod in_memory {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use tokio::sync::{broadcast, Mutex, Notify};

    struct PoolQueue {
        items: Mutex<VecDeque<Envelope>>,
        notify: Notify,
    }

    impl PoolQueue {
        fn new() -> Self {
            Self {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }
        }
    }

    /// Single-process queue backend. Safe under concurrent consumers: each
    /// pop removes its item under the pool's mutex before returning, so
    /// delivery is at-most-one per envelope.
    pub struct InMemoryQueue {
        pools: Mutex<HashMap<String, Arc<PoolQueue>>>,
        channels: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
    }

    impl Default for InMemoryQueue {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryQueue {
        pub fn new() -> Self {
            Self {
                pools: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
            }
        }

        async fn pool_queue(&self, pool: &str) -> Arc<PoolQueue> {
            let mut pools = self.pools.lock().await;
            pools
                .entry(pool.to_string())
                .or_insert_with(|| Arc::new(PoolQueue::new()))
                .clone()
        }

        async fn channel(&self, channel: &str) -> broadcast::Sender<serde_json::Value> {
            let mut channels = self.channels.lock().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(1024).0)
                .clone()
        }
    }

    #[async_trait]
    impl Queue for InMemoryQueue {
        async fn push(&self, pool: &str, envelope: Envelope) -> Result<()> {
            let pq = self.pool_queue(pool).await;
            pq.items.lock().await.push_back(envelope);
            pq.notify.notify_one();
            Ok(())
        }

        async fn pop_blocking(&self, pool: &str, timeout: Duration) -> Result<Option<Envelope>> {
            let pq = self.pool_queue(pool).await;
            let deadline = tokio::time::Instant::now() + timeout;

            loop {
                if let Some(envelope) = pq.items.lock().await.pop_front() {
                    return Ok(Some(envelope));
                }

                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(None);
                }

                tokio::select! {
                    _ = pq.notify.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => { return Ok(None); }
                }
            }
        }

        async fn ack(&self, _pool: &str, _envelope_id: Uuid) -> Result<()> {
            // Items are removed from the queue on pop; ack is a no-op here
            // because this backend never re-delivers an unacked item.
            Ok(())
        }

        async fn requeue(&self, pool: &str, envelope: Envelope, reason: RequeueReason) -> Result<()> {
            let pq = self.pool_queue(pool).await;
            let mut items = pq.items.lock().await;
            if reason.to_head() {
                items.push_front(envelope);
            } else {
                items.push_back(envelope);
            }
            drop(items);
            pq.notify.notify_one();
            Ok(())
        }

        async fn depth(&self, pool: &str) -> Result<u64> {
            let pq = self.pool_queue(pool).await;
            Ok(pq.items.lock().await.len() as u64)
        }

        async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<()> {
            let sender = self.channel(channel).await;
            // No subscribers is not an error: publish is fire-and-forget.
            let _ = sender.send(message);
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> Result<tokio::sync::mpsc::Receiver<serde_json::Value>> {
            let sender = self.channel(channel).await;
            let mut broadcast_rx = sender.subscribe();
            let (tx, rx) = tokio::sync::mpsc::channel(1024);

            tokio::spawn(async move {
                loop {
                    match broadcast_rx.recv().await {
                        Ok(msg) => {
                            if tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });

            Ok(rx)
        }
    }
}

#[cfg(feature = "redis-queue")]
pub mod redis_backend {
    use super::*;
    use redis::AsyncCommands;
    use std::sync::Arc;

    /// Redis `LIST` + `BLPOP` queue, `PUBSUB` fan-out.
    ///
    /// `popBlocking` issues `BLPOP` with the caller's timeout; Redis rounds
    /// fractional seconds, so sub-second timeouts are clamped up to 1s.
    #[derive(Clone)]
    pub struct RedisQueue {
        client: Arc<redis::Client>,
    }

    impl RedisQueue {
        pub fn new(url: &str) -> Result<Self> {
            let client = redis::Client::open(url).map_err(crate::error::CoreError::from)?;
            Ok(Self { client: Arc::new(client) })
        }

        fn list_key(pool: &str) -> String {
            format!("peagen:queue:{pool}")
        }

        async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
            Ok(self.client.get_multiplexed_async_connection().await?)
        }
    }

    #[async_trait]
    impl Queue for RedisQueue {
        async fn push(&self, pool: &str, envelope: Envelope) -> Result<()> {
            let mut conn = self.conn().await?;
            let payload = serde_json::to_string(&envelope).map_err(|e| anyhow::anyhow!(e))?;
            let _: () = conn.rpush(Self::list_key(pool), payload).await?;
            Ok(())
        }

        async fn pop_blocking(&self, pool: &str, timeout: Duration) -> Result<Option<Envelope>> {
            let mut conn = self.conn().await?;
            let secs = timeout.as_secs_f64().max(1.0);
            let result: Option<(String, String)> = conn.blpop(Self::list_key(pool), secs).await?;
            match result {
                Some((_, payload)) => {
                    let envelope: Envelope =
                        serde_json::from_str(&payload).map_err(|e| anyhow::anyhow!(e))?;
                    Ok(Some(envelope))
                }
                None => Ok(None),
            }
        }

        async fn ack(&self, _pool: &str, _envelope_id: Uuid) -> Result<()> {
            // BLPOP already removed the item; nothing further to acknowledge.
            Ok(())
        }

        async fn requeue(&self, pool: &str, envelope: Envelope, reason: RequeueReason) -> Result<()> {
            let mut conn = self.conn().await?;
            let payload = serde_json::to_string(&envelope).map_err(|e| anyhow::anyhow!(e))?;
            if reason.to_head() {
                let _: () = conn.lpush(Self::list_key(pool), payload).await?;
            } else {
                let _: () = conn.rpush(Self::list_key(pool), payload).await?;
            }
            Ok(())
        }

        async fn depth(&self, pool: &str) -> Result<u64> {
            let mut conn = self.conn().await?;
            let len: u64 = conn.llen(Self::list_key(pool)).await?;
            Ok(len)
        }

        async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<()> {
            let mut conn = self.conn().await?;
            let payload = serde_json::to_string(&message).map_err(|e| anyhow::anyhow!(e))?;
            let _: () = conn.publish(channel, payload).await?;
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> Result<tokio::sync::mpsc::Receiver<serde_json::Value>> {
            let client = self.client.clone();
            let channel = channel.to_string();
            let (tx, rx) = tokio::sync::mpsc::channel(1024);

            tokio::spawn(async move {
                let conn = match client.get_async_pubsub().await {
                    Ok(c) => c,
                    Err(err) => {
                        tracing::error!(error = %err, "redis pubsub connect failed");
                        return;
                    }
                };
                let mut pubsub = conn;
                if let Err(err) = pubsub.subscribe(&channel).await {
                    tracing::error!(error = %err, "redis subscribe failed");
                    return;
                }

                let mut stream = pubsub.on_message();
                use futures_util_compat::StreamExt as _;
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(err) => {
                            tracing::warn!(error = %err, "redis message payload decode failed");
                            continue;
                        }
                    };
                    let value: serde_json::Value = match serde_json::from_str(&payload) {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(error = %err, "redis message json decode failed");
                            continue;
                        }
                    };
                    if tx.send(value).await.is_err() {
                        return;
                    }
                }
            });

            Ok(rx)
        }
    }

    // `redis`'s pubsub stream needs `StreamExt`; re-export under a local alias
    // so we don't force a top-level `futures-util` dependency for one call site.
    mod futures_util_compat {
        pub use futures_util::StreamExt;
    }
}
