//! In-memory [`SharedStore`] implementation.
//!
//! Backs the test suites and lets the engine run degraded when no shared
//! store is reachable. A single mutex over the whole state makes every
//! operation — including batches — trivially atomic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{SharedStore, StoreOp, StoreResult};

#[derive(Default)]
struct State {
    kv: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    expiries: HashMap<String, Instant>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

impl State {
    fn purge(&mut self, key: &str) -> bool {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.expiries.remove(key);
                self.kv.remove(key);
                self.hashes.remove(key);
                self.sets.remove(key);
                self.zsets.remove(key);
                return true;
            }
        }
        false
    }

    fn exists(&self, key: &str) -> bool {
        self.kv.contains_key(key)
            || self.hashes.contains_key(key)
            || self.sets.contains_key(key)
            || self.zsets.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        let existed = self.exists(key);
        self.kv.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        self.zsets.remove(key);
        self.expiries.remove(key);
        existed
    }

    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::Set { key, value } => {
                self.kv.insert(key, value);
            }
            StoreOp::SetEx { key, value, ttl_secs } => {
                self.expiries
                    .insert(key.clone(), Instant::now() + Duration::from_secs(ttl_secs));
                self.kv.insert(key, value);
            }
            StoreOp::Del { key } => {
                self.remove(&key);
            }
            StoreOp::Expire { key, ttl_secs } => {
                if self.exists(&key) {
                    self.expiries
                        .insert(key, Instant::now() + Duration::from_secs(ttl_secs));
                }
            }
            StoreOp::HSet { key, field, value } => {
                self.hashes.entry(key).or_default().insert(field, value);
            }
            StoreOp::HSetAll { key, fields } => {
                let hash = self.hashes.entry(key).or_default();
                for (field, value) in fields {
                    hash.insert(field, value);
                }
            }
            StoreOp::HIncrBy { key, field, delta } => {
                let hash = self.hashes.entry(key).or_default();
                let current: i64 = hash.get(&field).and_then(|v| v.parse().ok()).unwrap_or(0);
                hash.insert(field, (current + delta).to_string());
            }
            StoreOp::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            StoreOp::SRem { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
            StoreOp::ZAdd { key, score, member } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            StoreOp::ZRem { key, member } => {
                if let Some(zset) = self.zsets.get_mut(&key) {
                    zset.remove(&member);
                }
            }
        }
    }
}

/// In-memory shared store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.expiries.remove(key);
        state.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.apply(StoreOp::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
        });
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        Ok(self.state.lock().remove(key))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if state.exists(key) {
            state
                .expiries
                .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state
            .expiries
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs() as i64))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if state.kv.contains_key(key) {
            return Ok(false);
        }
        state.apply(StoreOp::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
        });
        Ok(true)
    }

    async fn del_if_value(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if state.kv.get(key).map(String::as_str) == Some(value) {
            state.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.state.lock().apply(StoreOp::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn hset_all(&self, key: &str, fields: Vec<(String, String)>) -> StoreResult<()> {
        self.state.lock().apply(StoreOp::HSetAll {
            key: key.to_string(),
            fields,
        });
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut state = self.state.lock();
        state.apply(StoreOp::HIncrBy {
            key: key.to_string(),
            field: field.to_string(),
            delta,
        });
        Ok(state
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        Ok(state
            .sets
            .get_mut(key)
            .map(|s| s.remove(member))
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        self.state.lock().apply(StoreOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        });
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        Ok(state
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock();
        state.purge(key);
        let mut members: Vec<(String, f64)> = state
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(members.into_iter().map(|(m, _)| m).collect())
    }

    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        let mut state = self.state.lock();
        state.purge(key);
        let mut members: Vec<(String, f64)> = state
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(members)
    }

    async fn apply_batch(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        let mut state = self.state.lock();
        for op in ops {
            state.apply(op);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(subscribers) = state.subscribers.get_mut(channel) {
            subscribers.retain(|tx| tx.send(message.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
