use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stellar_domain::FastStore;
use stellar_errors::{StellarError, StellarResult};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::debug;

const PUBLISH_HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    ZSet(HashMap<String, i64>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<String>>,
    history: VecDeque<(String, String)>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn list_mut(&mut self, key: &str, create: bool) -> StellarResult<Option<&mut VecDeque<String>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.entries
                .insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn zset_mut(&mut self, key: &str, create: bool) -> StellarResult<Option<&mut HashMap<String, i64>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.entries
                .insert(key.to_string(), Entry::new(Value::ZSet(HashMap::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::ZSet(set)) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn set_mut(&mut self, key: &str, create: bool) -> StellarResult<Option<&mut HashSet<String>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.entries
                .insert(key.to_string(), Entry::new(Value::Set(HashSet::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    /// 集合类值为空时删除键，与Redis行为一致
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::List(l)) => l.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }
}

fn wrong_type(key: &str) -> StellarError {
    StellarError::fast_store(format!("WRONGTYPE 键 {key} 的值类型不匹配"))
}

/// 进程内快速存储
///
/// 用一把异步锁模拟Redis命令的原子性，TTL基于 `tokio::time::Instant`，
/// 测试中可以通过 `tokio::time::pause/advance` 让键过期。
#[derive(Clone, Default)]
pub struct InMemoryFastStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可用，之后的所有操作都返回 `FastStore` 错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut state = self.state.lock().await;
        state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    /// 某个频道上已发布过的消息（最近的若干条）
    pub async fn published(&self, channel: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    async fn lock(&self) -> StellarResult<tokio::sync::MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StellarError::fast_store("快速存储不可用"));
        }
        Ok(self.state.lock().await)
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn get(&self, key: &str) -> StellarResult<Option<String>> {
        let mut state = self.lock().await?;
        match state.live(key).map(|e| &e.value) {
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StellarResult<()> {
        let mut state = self.lock().await?;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StellarResult<bool> {
        let mut state = self.lock().await?;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StellarResult<bool> {
        let mut state = self.lock().await?;
        let matches = matches!(
            state.live(key).map(|e| &e.value),
            Some(Value::Str(v)) if v == expected
        );
        if matches {
            state.entries.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> StellarResult<bool> {
        let mut state = self.lock().await?;
        let existed = state.live(key).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> StellarResult<bool> {
        let mut state = self.lock().await?;
        Ok(state.live(key).is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StellarResult<i64> {
        let mut state = self.lock().await?;
        let current = match state.live(key) {
            Some(Entry {
                value: Value::Str(v),
                ..
            }) => v
                .parse::<i64>()
                .map_err(|_| StellarError::fast_store(format!("键 {key} 的值不是整数")))?,
            Some(_) => return Err(wrong_type(key)),
            None => 0,
        };
        let next = current + delta;
        let expires_at = state.live(key).and_then(|e| e.expires_at);
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn push_back(&self, key: &str, value: &str) -> StellarResult<u64> {
        let mut state = self.lock().await?;
        let list = state.list_mut(key, true)?.ok_or_else(|| wrong_type(key))?;
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn push_front(&self, key: &str, value: &str) -> StellarResult<u64> {
        let mut state = self.lock().await?;
        let list = state.list_mut(key, true)?.ok_or_else(|| wrong_type(key))?;
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn pop_front(&self, key: &str) -> StellarResult<Option<String>> {
        let mut state = self.lock().await?;
        let value = match state.list_mut(key, false)? {
            Some(list) => list.pop_front(),
            None => None,
        };
        state.drop_if_empty(key);
        Ok(value)
    }

    async fn peek_front(&self, key: &str) -> StellarResult<Option<String>> {
        let mut state = self.lock().await?;
        Ok(state
            .list_mut(key, false)?
            .and_then(|list| list.front().cloned()))
    }

    async fn list_remove(&self, key: &str, value: &str) -> StellarResult<u64> {
        let mut state = self.lock().await?;
        let removed = match state.list_mut(key, false)? {
            Some(list) => {
                let before = list.len();
                list.retain(|v| v != value);
                (before - list.len()) as u64
            }
            None => 0,
        };
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> StellarResult<u64> {
        let mut state = self.lock().await?;
        Ok(state.list_mut(key, false)?.map_or(0, |l| l.len() as u64))
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> StellarResult<Vec<String>> {
        let mut state = self.lock().await?;
        let Some(list) = state.list_mut(key, false)? else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let norm = |i: isize| if i < 0 { (len + i).max(0) } else { i };
        let (start, stop) = (norm(start), norm(stop).min(len - 1));
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> StellarResult<()> {
        let mut state = self.lock().await?;
        let set = state.zset_mut(key, true)?.ok_or_else(|| wrong_type(key))?;
        set.insert(member.to_string(), score);
        Ok(())
    }

    async fn zpop_due(&self, key: &str, max_score: i64, limit: usize) -> StellarResult<Vec<String>> {
        let mut state = self.lock().await?;
        let due = match state.zset_mut(key, false)? {
            Some(set) => {
                let mut due: Vec<(String, i64)> = set
                    .iter()
                    .filter(|(_, score)| **score <= max_score)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect();
                due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                due.truncate(limit);
                for (member, _) in &due {
                    set.remove(member);
                }
                due.into_iter().map(|(m, _)| m).collect()
            }
            None => Vec::new(),
        };
        state.drop_if_empty(key);
        Ok(due)
    }

    async fn zremove(&self, key: &str, member: &str) -> StellarResult<bool> {
        let mut state = self.lock().await?;
        let removed = match state.zset_mut(key, false)? {
            Some(set) => set.remove(member).is_some(),
            None => false,
        };
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StellarResult<u64> {
        let mut state = self.lock().await?;
        Ok(state.zset_mut(key, false)?.map_or(0, |s| s.len() as u64))
    }

    async fn set_add(&self, key: &str, member: &str) -> StellarResult<bool> {
        let mut state = self.lock().await?;
        let set = state.set_mut(key, true)?.ok_or_else(|| wrong_type(key))?;
        Ok(set.insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> StellarResult<bool> {
        let mut state = self.lock().await?;
        let removed = match state.set_mut(key, false)? {
            Some(set) => set.remove(member),
            None => false,
        };
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StellarResult<Vec<String>> {
        let mut state = self.lock().await?;
        let mut members: Vec<String> = state
            .set_mut(key, false)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn publish(&self, channel: &str, message: &str) -> StellarResult<u64> {
        let mut state = self.lock().await?;
        state
            .history
            .push_back((channel.to_string(), message.to_string()));
        if state.history.len() > PUBLISH_HISTORY_LIMIT {
            state.history.pop_front();
        }
        let receivers = match state.channels.get(channel) {
            Some(tx) => tx.send(message.to_string()).unwrap_or(0) as u64,
            None => 0,
        };
        debug!("发布消息到频道 {channel}，接收者 {receivers} 个");
        Ok(receivers)
    }
}
