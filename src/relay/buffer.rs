// Pending-content buffer: parts that arrived while a run was active, kept per thread and user.
use crate::config::BufferConfig;
use crate::relay::content::ContentPart;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const MAX_PARTS_PER_SUBMISSION: usize = 10;
const DEFAULT_TTL_S: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub thread_id: String,
    pub user_channel_id: String,
}

impl BufferKey {
    pub fn new(thread_id: impl Into<String>, user_channel_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_channel_id: user_channel_id.into(),
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message-list:{}-{}", self.thread_id, self.user_channel_id)
    }
}

/// Ordered per-conversation queue. `append` and `drain_all` are each atomic:
/// a drain never returns an item twice and an append racing a drain lands
/// either in the drained batch or in the next one.
#[async_trait]
pub trait PendingBuffer: Send + Sync {
    async fn append(&self, key: &BufferKey, parts: &[ContentPart]) -> Result<()>;
    /// Puts parts back at the head, ahead of anything appended since they were drained.
    async fn prepend(&self, key: &BufferKey, parts: &[ContentPart]) -> Result<()>;
    async fn drain_all(&self, key: &BufferKey) -> Result<Vec<ContentPart>>;
    async fn pending_len(&self, key: &BufferKey) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryPendingBuffer {
    lists: Mutex<HashMap<String, Vec<ContentPart>>>,
}

impl MemoryPendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingBuffer for MemoryPendingBuffer {
    async fn append(&self, key: &BufferKey, parts: &[ContentPart]) -> Result<()> {
        if parts.is_empty() {
            return Ok(());
        }
        let mut guard = self.lists.lock();
        guard
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(parts);
        Ok(())
    }

    async fn prepend(&self, key: &BufferKey, parts: &[ContentPart]) -> Result<()> {
        if parts.is_empty() {
            return Ok(());
        }
        let mut guard = self.lists.lock();
        let list = guard.entry(key.to_string()).or_default();
        list.splice(0..0, parts.iter().cloned());
        Ok(())
    }

    async fn drain_all(&self, key: &BufferKey) -> Result<Vec<ContentPart>> {
        let mut guard = self.lists.lock();
        Ok(guard.remove(&key.to_string()).unwrap_or_default())
    }

    async fn pending_len(&self, key: &BufferKey) -> Result<usize> {
        let guard = self.lists.lock();
        Ok(guard.get(&key.to_string()).map(Vec::len).unwrap_or(0))
    }
}

/// Redis list per key; drain is `LRANGE` + `DEL` inside one MULTI block.
#[derive(Clone)]
pub struct RedisPendingBuffer {
    manager: ConnectionManager,
    ttl_s: u64,
}

impl RedisPendingBuffer {
    pub async fn connect(redis_url: &str, ttl_s: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url.to_string())
            .with_context(|| format!("failed to open redis client for {redis_url}"))?;
        let manager = client
            .get_connection_manager()
            .await
            .with_context(|| "failed to connect to redis")?;
        Ok(Self {
            manager,
            ttl_s: if ttl_s == 0 { DEFAULT_TTL_S } else { ttl_s },
        })
    }
}

#[async_trait]
impl PendingBuffer for RedisPendingBuffer {
    async fn append(&self, key: &BufferKey, parts: &[ContentPart]) -> Result<()> {
        if parts.is_empty() {
            return Ok(());
        }
        let encoded = parts
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let key = key.to_string();
        let mut conn = self.manager.clone();
        let _: redis::Value = redis::pipe()
            .atomic()
            .rpush(&key, encoded)
            .expire(&key, self.ttl_s as i64)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to append to {key}"))?;
        Ok(())
    }

    async fn prepend(&self, key: &BufferKey, parts: &[ContentPart]) -> Result<()> {
        if parts.is_empty() {
            return Ok(());
        }
        // LPUSH inserts one by one, so the last argument ends up first.
        let encoded = parts
            .iter()
            .rev()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let key = key.to_string();
        let mut conn = self.manager.clone();
        let _: redis::Value = redis::pipe()
            .atomic()
            .lpush(&key, encoded)
            .expire(&key, self.ttl_s as i64)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to prepend to {key}"))?;
        Ok(())
    }

    async fn drain_all(&self, key: &BufferKey) -> Result<Vec<ContentPart>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        let (raw, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to drain {key}"))?;
        raw.iter()
            .map(|item| {
                serde_json::from_str::<ContentPart>(item)
                    .map_err(|err| anyhow!("corrupt buffered part in {key}: {err}"))
            })
            .collect()
    }

    async fn pending_len(&self, key: &BufferKey) -> Result<usize> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        let len: usize = conn
            .llen(&key)
            .await
            .with_context(|| format!("failed to read length of {key}"))?;
        Ok(len)
    }
}

pub async fn build_buffer(config: &BufferConfig) -> Result<Arc<dyn PendingBuffer>> {
    match config.backend.trim().to_lowercase().as_str() {
        "" | "memory" => Ok(Arc::new(MemoryPendingBuffer::new())),
        "redis" => {
            let url = config.redis_url.trim();
            if url.is_empty() {
                return Err(anyhow!("buffer.redis_url is required for the redis buffer"));
            }
            Ok(Arc::new(RedisPendingBuffer::connect(url, config.ttl_s).await?))
        }
        other => Err(anyhow!("unknown buffer backend: {other}")),
    }
}

/// Splits into submission-sized batches without reordering.
pub fn chunk_parts(parts: Vec<ContentPart>, max_parts: usize) -> Vec<Vec<ContentPart>> {
    let max_parts = if max_parts == 0 {
        MAX_PARTS_PER_SUBMISSION
    } else {
        max_parts
    };
    parts
        .chunks(max_parts)
        .map(|chunk| chunk.to_vec())
        .collect()
}
