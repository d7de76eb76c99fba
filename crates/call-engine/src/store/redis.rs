//! Redis-backed [`SharedStore`] implementation.
//!
//! A multiplexed [`ConnectionManager`] serves all commands; transient IO
//! failures are retried with backoff up to a bounded attempt count before
//! the operation is surfaced as failed. Lock release goes through a Lua
//! check-and-delete so only the current token holder can delete the key.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{SharedStore, StoreError, StoreOp, StoreResult};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

const DEL_IF_VALUE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis shared store.
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(map_err)?;
        let manager = client.get_connection_manager().await.map_err(map_err)?;
        debug!("connected to shared store at {}", url);
        Ok(Self { client, manager })
    }

    /// Run `f` against the connection, retrying transient failures.
    async fn retrying<T, F, Fut>(&self, op: &str, f: F) -> StoreResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f(self.manager.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let mapped = map_err(err);
                    let transient = matches!(mapped, StoreError::Unavailable(_));
                    if !transient || attempt >= MAX_ATTEMPTS {
                        return Err(mapped);
                    }
                    warn!("store op {} failed (attempt {}): {}", op, attempt, mapped);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
            }
        }
    }
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

fn push_op(pipe: &mut redis::Pipeline, op: &StoreOp) {
    match op {
        StoreOp::Set { key, value } => {
            pipe.cmd("SET").arg(key).arg(value).ignore();
        }
        StoreOp::SetEx { key, value, ttl_secs } => {
            pipe.cmd("SETEX").arg(key).arg(*ttl_secs).arg(value).ignore();
        }
        StoreOp::Del { key } => {
            pipe.cmd("DEL").arg(key).ignore();
        }
        StoreOp::Expire { key, ttl_secs } => {
            pipe.cmd("EXPIRE").arg(key).arg(*ttl_secs).ignore();
        }
        StoreOp::HSet { key, field, value } => {
            pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
        }
        StoreOp::HSetAll { key, fields } => {
            let mut cmd = pipe.cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd.ignore();
        }
        StoreOp::HIncrBy { key, field, delta } => {
            pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta).ignore();
        }
        StoreOp::SAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        StoreOp::SRem { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member).ignore();
        }
        StoreOp::ZAdd { key, score, member } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
        }
        StoreOp::ZRem { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member).ignore();
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.retrying("GET", |mut conn| async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.retrying("SET", |mut conn| async move {
            redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        self.retrying("SETEX", |mut conn| async move {
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl_secs)
                .arg(value)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let removed: i64 = self
            .retrying("DEL", |mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        self.retrying("EXPIRE", |mut conn| async move {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<i64>> {
        let ttl: i64 = self
            .retrying("TTL", |mut conn| async move {
                redis::cmd("TTL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(if ttl < 0 { None } else { Some(ttl) })
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let reply: Option<String> = self
            .retrying("SET NX EX", |mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn del_if_value(&self, key: &str, value: &str) -> StoreResult<bool> {
        let removed: i64 = self
            .retrying("DEL IF VALUE", |mut conn| async move {
                let script = redis::Script::new(DEL_IF_VALUE_SCRIPT);
                script.key(key).arg(value).invoke_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.retrying("HSET", |mut conn| async move {
            redis::cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .query_async::<_, i64>(&mut conn)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn hset_all(&self, key: &str, fields: Vec<(String, String)>) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.retrying("HSET ALL", |mut conn| {
            let fields = fields.clone();
            async move {
                let mut cmd = redis::cmd("HSET");
                cmd.arg(key);
                for (field, value) in &fields {
                    cmd.arg(field).arg(value);
                }
                cmd.query_async::<_, i64>(&mut conn).await.map(|_| ())
            }
        })
        .await
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.retrying("HGETALL", |mut conn| async move {
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.retrying("HINCRBY", |mut conn| async move {
            redis::cmd("HINCRBY")
                .arg(key)
                .arg(field)
                .arg(delta)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let added: i64 = self
            .retrying("SADD", |mut conn| async move {
                redis::cmd("SADD").arg(key).arg(member).query_async(&mut conn).await
            })
            .await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: i64 = self
            .retrying("SREM", |mut conn| async move {
                redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.retrying("SMEMBERS", |mut conn| async move {
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        self.retrying("ZADD", |mut conn| async move {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async::<_, i64>(&mut conn)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: i64 = self
            .retrying("ZREM", |mut conn| async move {
                redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.retrying("ZCARD", |mut conn| async move {
            redis::cmd("ZCARD").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        self.retrying("ZRANGEBYSCORE", |mut conn| async move {
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        self.retrying("ZRANGE WITHSCORES", |mut conn| async move {
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn apply_batch(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.retrying("MULTI/EXEC", |mut conn| {
            let ops = ops.clone();
            async move {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for op in &ops {
                    push_op(&mut pipe, op);
                }
                pipe.query_async::<_, ()>(&mut conn).await
            }
        })
        .await
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.retrying("PUBLISH", |mut conn| async move {
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(message)
                .query_async::<_, i64>(&mut conn)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::UnboundedReceiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(map_err)?;
        pubsub.subscribe(channel).await.map_err(map_err)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("bad payload on channel {}: {}", channel, err),
                }
            }
            debug!("subscription to {} closed", channel);
        });
        Ok(rx)
    }
}
