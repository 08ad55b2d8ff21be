//! Durable Redis-backed queue: main list, delayed sorted set, dead-letter
//! list (spec §4.1). Used for both the ingest queue and the webhook queue —
//! callers pick the key prefix, the operations are identical.
//!
//! Grounded on the `redis` crate's multiplexed-async-connection idiom (open
//! a client once, clone a cheap multiplexed connection per call) and its
//! GET/SET/EXPIRE/ZADD usage pattern; `promote` is implemented as a
//! `redis::Script` so the "find due, move to main" step is race-free across
//! concurrent worker processes instead of a check-then-act round trip.

use redis::AsyncCommands;
use redis::Script;
use serde::{Serialize, de::DeserializeOwned};

use crate::errors::IngestError;

/// Moves up to `n` delayed items whose score <= now from the delayed zset
/// into the head of the main list, removing them from the zset.
const PROMOTE_SCRIPT: &str = r#"
local delayed_key = KEYS[1]
local main_key = KEYS[2]
local now = ARGV[1]
local limit = ARGV[2]

local due = redis.call('ZRANGEBYSCORE', delayed_key, '-inf', now, 'LIMIT', 0, limit)
if #due == 0 then
    return 0
end

for i = 1, #due do
    redis.call('LPUSH', main_key, due[i])
    redis.call('ZREM', delayed_key, due[i])
end

return #due
"#;

/// A named queue backed by a Redis list + delayed zset + dead-letter list,
/// all namespaced under `{prefix}:main` / `{prefix}:delayed` / `{prefix}:dlq`.
#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
    promote_script: Script,
}

impl RedisQueue {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            promote_script: Script::new(PROMOTE_SCRIPT),
        }
    }

    fn main_key(&self) -> String {
        format!("{}:main", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.prefix)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, IngestError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))
    }

    /// Push `msg` to the head of the main list.
    pub async fn enqueue<T: Serialize>(&self, msg: &T) -> Result<(), IngestError> {
        let payload = serde_json::to_string(msg)
            .map_err(|e| IngestError::Validation(format!("serialize failed: {e}")))?;
        let mut conn = self.conn().await?;
        conn.lpush::<_, _, ()>(self.main_key(), payload)
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))
    }

    /// Blocking-pop one message from the tail of the main list, waiting up
    /// to `timeout`. Returns `None` on timeout.
    pub async fn reserve<T: DeserializeOwned>(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Option<T>, IngestError> {
        let mut conn = self.conn().await?;
        let result: Option<(String, String)> = conn
            .brpop(self.main_key(), timeout.as_secs_f64())
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))?;

        match result {
            None => Ok(None),
            Some((_key, payload)) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|e| IngestError::Validation(format!("deserialize failed: {e}"))),
        }
    }

    /// Add `msg` to the delayed set, scored by `available_at` (epoch millis).
    pub async fn schedule<T: Serialize>(
        &self,
        msg: &T,
        available_at_ms: i64,
    ) -> Result<(), IngestError> {
        let payload = serde_json::to_string(msg)
            .map_err(|e| IngestError::Validation(format!("serialize failed: {e}")))?;
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(self.delayed_key(), payload, available_at_ms)
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))
    }

    /// Atomically move up to `n` due delayed messages into the main list.
    /// Returns how many were promoted.
    pub async fn promote(&self, now_ms: i64, n: usize) -> Result<usize, IngestError> {
        let mut conn = self.conn().await?;
        let promoted: i64 = self
            .promote_script
            .key(self.delayed_key())
            .key(self.main_key())
            .arg(now_ms)
            .arg(n)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))?;
        Ok(promoted as usize)
    }

    /// Push `msg` to the dead-letter list with a reason recorded alongside.
    pub async fn park<T: Serialize>(&self, msg: &T, reason: &str) -> Result<(), IngestError> {
        let entry = serde_json::json!({ "message": msg, "reason": reason });
        let payload = serde_json::to_string(&entry)
            .map_err(|e| IngestError::Validation(format!("serialize failed: {e}")))?;
        let mut conn = self.conn().await?;
        conn.lpush::<_, _, ()>(self.dlq_key(), payload)
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))
    }

    /// Current depth of the main list, for metrics reporting.
    pub async fn main_len(&self) -> Result<usize, IngestError> {
        let mut conn = self.conn().await?;
        conn.llen(self.main_key())
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))
    }

    /// Current depth of the delayed zset, for metrics reporting.
    pub async fn delayed_len(&self) -> Result<usize, IngestError> {
        let mut conn = self.conn().await?;
        conn.zcard(self.delayed_key())
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))
    }

    /// Current depth of the dead-letter list, for metrics reporting.
    pub async fn dlq_len(&self) -> Result<usize, IngestError> {
        let mut conn = self.conn().await?;
        conn.llen(self.dlq_key())
            .await
            .map_err(|e| IngestError::TransientStore(e.into()))
    }
}

/// Compute the retry backoff per spec §4.1: `base * 2^(attempts-1) +
/// random(0, jitter)`, all in milliseconds.
pub fn retry_backoff_ms(attempts: u32, base_ms: u64, jitter_ms: u64) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempts.saturating_sub(1).min(32));
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::random::<u64>() % jitter_ms
    };
    exp.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_with_attempts() {
        let b1 = retry_backoff_ms(1, 1000, 0);
        let b2 = retry_backoff_ms(2, 1000, 0);
        let b3 = retry_backoff_ms(3, 1000, 0);
        assert_eq!(b1, 1000);
        assert_eq!(b2, 2000);
        assert_eq!(b3, 4000);
    }

    #[test]
    fn backoff_jitter_stays_within_bound() {
        for _ in 0..100 {
            let b = retry_backoff_ms(1, 1000, 250);
            assert!(b >= 1000 && b < 1250);
        }
    }

    #[test]
    fn backoff_with_zero_jitter_is_deterministic() {
        assert_eq!(retry_backoff_ms(4, 500, 0), 4000);
    }
}
