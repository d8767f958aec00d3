//! Redis-backed queue.
//!
//! Each queue `q` uses these keys under the configured prefix:
//! - `{prefix}:{q}:ready` list of message ids waiting for delivery
//! - `{prefix}:{q}:payloads` hash id → payload bytes
//! - `{prefix}:{q}:enqueued` hash id → enqueue time (ms since epoch)
//! - `{prefix}:{q}:deliveries` hash id → delivery count
//! - `{prefix}:{q}:inflight` sorted set id → visibility deadline (ms)
//! - `{prefix}:{q}:receipts` hash id → current ack token
//!
//! Every operation is a Lua script so it is atomic on the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use redis::{Script, ScriptInvocation};
use redis::aio::ConnectionManager;

use crate::{AckToken, MessagingError, QueueClient, QueueDepth, QueueEnvelope, Result};

const PUSH: &str = r#"
    if redis.call("HEXISTS", KEYS[2], ARGV[1]) == 1 then
        return 0
    end
    redis.call("HSET", KEYS[2], ARGV[1], ARGV[2])
    redis.call("HSET", KEYS[3], ARGV[1], ARGV[3])
    redis.call("RPUSH", KEYS[1], ARGV[1])
    return 1
"#;

const POP: &str = r#"
    local expired = redis.call("ZRANGEBYSCORE", KEYS[5], "-inf", ARGV[1])
    for i = #expired, 1, -1 do
        redis.call("ZREM", KEYS[5], expired[i])
        redis.call("HDEL", KEYS[6], expired[i])
        redis.call("LPUSH", KEYS[1], expired[i])
    end

    while true do
        local id = redis.call("LPOP", KEYS[1])
        if not id then
            return nil
        end
        if redis.call("HEXISTS", KEYS[2], id) == 1 and redis.call("ZSCORE", KEYS[5], id) == false then
            local count = redis.call("HINCRBY", KEYS[4], id, 1)
            redis.call("ZADD", KEYS[5], ARGV[2], id)
            redis.call("HSET", KEYS[6], id, ARGV[3])
            local payload = redis.call("HGET", KEYS[2], id)
            local enqueued = redis.call("HGET", KEYS[3], id)
            return {id, payload, enqueued, count}
        end
    end
"#;

const ACK: &str = r#"
    if redis.call("HEXISTS", KEYS[2], ARGV[1]) == 0 then
        return 1
    end
    if redis.call("HGET", KEYS[6], ARGV[1]) ~= ARGV[2] then
        return -1
    end
    redis.call("HDEL", KEYS[2], ARGV[1])
    redis.call("HDEL", KEYS[3], ARGV[1])
    redis.call("HDEL", KEYS[4], ARGV[1])
    redis.call("HDEL", KEYS[6], ARGV[1])
    redis.call("ZREM", KEYS[5], ARGV[1])
    redis.call("LREM", KEYS[1], 0, ARGV[1])
    return 1
"#;

const NACK: &str = r#"
    if redis.call("HGET", KEYS[6], ARGV[1]) ~= ARGV[2] then
        return 0
    end
    redis.call("ZREM", KEYS[5], ARGV[1])
    redis.call("HDEL", KEYS[6], ARGV[1])
    redis.call("LPUSH", KEYS[1], ARGV[1])
    return 1
"#;

const EXTEND: &str = r#"
    if redis.call("HGET", KEYS[6], ARGV[1]) ~= ARGV[2] then
        return 0
    end
    redis.call("ZADD", KEYS[5], "XX", ARGV[3], ARGV[1])
    return 1
"#;

/// Configuration for [`RedisQueue`].
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL.
    pub redis_url: String,

    /// Prefix of every key the queue writes.
    pub key_prefix: String,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "relay:queue".to_string(),
        }
    }
}

impl RedisQueueConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

struct Keys([String; 6]);

struct Scripts {
    push: Script,
    pop: Script,
    ack: Script,
    nack: Script,
    extend: Script,
}

/// [`QueueClient`] over Redis.
///
/// Cloning is cheap; clones share one multiplexed connection that
/// reconnects on its own.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    key_prefix: String,
    scripts: Arc<Scripts>,
}

impl RedisQueue {
    /// Connects to Redis.
    pub async fn connect(config: RedisQueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| MessagingError::Config(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;

        tracing::info!(key_prefix = %config.key_prefix, "connected to redis queue backend");
        Ok(Self {
            conn,
            key_prefix: config.key_prefix,
            scripts: Arc::new(Scripts {
                push: Script::new(PUSH),
                pop: Script::new(POP),
                ack: Script::new(ACK),
                nack: Script::new(NACK),
                extend: Script::new(EXTEND),
            }),
        })
    }

    fn keys(&self, queue: &str) -> Keys {
        let base = format!("{}:{}", self.key_prefix, queue);
        Keys([
            format!("{base}:ready"),
            format!("{base}:payloads"),
            format!("{base}:enqueued"),
            format!("{base}:deliveries"),
            format!("{base}:inflight"),
            format!("{base}:receipts"),
        ])
    }

    /// Prepares a script call with the key set of `queue`.
    ///
    /// `Script` caches its SHA; the call uses EVALSHA and falls back to EVAL
    /// when the server has not seen the script yet.
    fn invoke<'a>(&self, script: &'a Script, queue: &str) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in self.keys(queue).0 {
            invocation.key(key);
        }
        invocation
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn deadline_millis(visibility: Duration) -> i64 {
    now_millis() + i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX / 2)
}

#[async_trait]
impl QueueClient for RedisQueue {
    #[tracing::instrument(skip(self, payload), fields(message_id = %message_id))]
    async fn push(&self, queue: &str, message_id: MessageId, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let pushed: i32 = self
            .invoke(&self.scripts.push, queue)
            .arg(message_id.to_string())
            .arg(payload)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;

        if pushed == 0 {
            tracing::debug!("duplicate push ignored");
        }
        Ok(())
    }

    async fn pop(&self, queue: &str, visibility: Duration) -> Result<Option<QueueEnvelope>> {
        let mut conn = self.conn.clone();
        let token = AckToken::generate();
        let popped: Option<(String, Vec<u8>, i64, u32)> = self
            .invoke(&self.scripts.pop, queue)
            .arg(now_millis())
            .arg(deadline_millis(visibility))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        let Some((id, payload, enqueued_ms, delivery_count)) = popped else {
            return Ok(None);
        };
        let message_id = id
            .parse::<MessageId>()
            .map_err(|e| MessagingError::Transport(format!("corrupt message id '{id}': {e}")))?;

        Ok(Some(QueueEnvelope {
            message_id,
            queue: queue.to_string(),
            payload,
            enqueued_at: DateTime::from_timestamp_millis(enqueued_ms).unwrap_or_else(Utc::now),
            delivery_count,
            ack_token: token,
        }))
    }

    async fn ack(&self, envelope: &QueueEnvelope) -> Result<()> {
        let mut conn = self.conn.clone();
        let acked: i32 = self
            .invoke(&self.scripts.ack, &envelope.queue)
            .arg(envelope.message_id.to_string())
            .arg(envelope.ack_token.as_str())
            .invoke_async(&mut conn)
            .await?;

        match acked {
            -1 => Err(MessagingError::StaleAckToken(envelope.message_id)),
            _ => Ok(()),
        }
    }

    async fn nack(&self, envelope: &QueueEnvelope) -> Result<()> {
        let mut conn = self.conn.clone();
        let nacked: i32 = self
            .invoke(&self.scripts.nack, &envelope.queue)
            .arg(envelope.message_id.to_string())
            .arg(envelope.ack_token.as_str())
            .invoke_async(&mut conn)
            .await?;

        if nacked == 1 {
            Ok(())
        } else {
            Err(MessagingError::NotInFlight(envelope.message_id))
        }
    }

    async fn extend_visibility(&self, envelope: &QueueEnvelope, visibility: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let extended: i32 = self
            .invoke(&self.scripts.extend, &envelope.queue)
            .arg(envelope.message_id.to_string())
            .arg(envelope.ack_token.as_str())
            .arg(deadline_millis(visibility))
            .invoke_async(&mut conn)
            .await?;

        if extended == 1 {
            Ok(())
        } else {
            Err(MessagingError::NotInFlight(envelope.message_id))
        }
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let (ready, in_flight): (u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(&keys.0[0])
            .cmd("ZCARD")
            .arg(&keys.0[4])
            .query_async(&mut conn)
            .await?;

        Ok(QueueDepth { ready, in_flight })
    }
}
