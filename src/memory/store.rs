//! 进程内 TTL 存储
//!
//! 使用DashMap保存条目，支持绝对过期、滑动过期、按优先级的容量淘汰和 trim。
//!
//! 存储本身从不自行删除条目：过期、容量淘汰和 trim 只会把候选条目放入
//! 待处理队列，由上层后端在持有该键的同步锁后调用 [`MemoryStore::remove_if_same`]
//! 完成真正的删除（淘汰回调）。这样同一个键上的所有修改都在同一把锁下串行化。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::item::{CacheItemConfiguration, CacheItemPriority};

/// 条目过期/淘汰策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryPolicy {
    pub absolute_expiration: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
    pub priority: CacheItemPriority,
}

impl EntryPolicy {
    /// 只带绝对过期时间的策略（用于墓碑）
    ///
    /// 墓碑不参与容量淘汰和 trim，只能由自身的过期时间结束。
    pub fn expiring_after(ttl: Duration) -> Self {
        Self {
            absolute_expiration: Some(ttl),
            sliding_expiration: None,
            priority: CacheItemPriority::NotRemovable,
        }
    }
}

impl From<Option<&CacheItemConfiguration>> for EntryPolicy {
    fn from(configuration: Option<&CacheItemConfiguration>) -> Self {
        match configuration {
            Some(c) => Self {
                absolute_expiration: c.absolute_expiration,
                sliding_expiration: c.sliding_expiration,
                priority: c.priority,
            },
            None => Self::default(),
        }
    }
}

/// 非显式删除的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// 过期
    Expired,
    /// 容量压力
    Capacity,
    /// clear / trim
    Trimmed,
}

/// 待处理的淘汰候选
#[derive(Debug)]
pub struct Eviction<V> {
    pub key: String,
    pub value: Arc<V>,
    pub reason: EvictionReason,
}

#[derive(Debug)]
struct StoreEntry<V> {
    value: Arc<V>,
    absolute_deadline: Option<Instant>,
    sliding: Option<Duration>,
    last_accessed: Instant,
    priority: CacheItemPriority,
}

impl<V> StoreEntry<V> {
    fn new(value: Arc<V>, policy: EntryPolicy) -> Self {
        let now = Instant::now();
        Self {
            value,
            absolute_deadline: policy.absolute_expiration.map(|d| now + d),
            sliding: policy.sliding_expiration,
            last_accessed: now,
            priority: policy.priority,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        if let Some(deadline) = self.absolute_deadline {
            if now >= deadline {
                return true;
            }
        }
        if let Some(sliding) = self.sliding {
            if now.duration_since(self.last_accessed) >= sliding {
                return true;
            }
        }
        false
    }

    /// 淘汰顺序：Low < Default < High，NotRemovable 不参与
    fn eviction_rank(&self) -> Option<u8> {
        match self.priority {
            CacheItemPriority::Low => Some(0),
            CacheItemPriority::Default => Some(1),
            CacheItemPriority::High => Some(2),
            CacheItemPriority::NotRemovable => None,
        }
    }
}

/// 进程内 TTL 存储
pub struct MemoryStore<V> {
    entries: DashMap<String, StoreEntry<V>>,
    /// 容量（0表示不限制）
    capacity: usize,
    pending: Mutex<Vec<Eviction<V>>>,
}

impl<V: Send + Sync> MemoryStore<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// 读取未过期的条目并刷新访问时间；过期条目会被登记为淘汰候选
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = Instant::now();
        let mut entry = self.entries.get_mut(key)?;
        if entry.is_expired(now) {
            let value = Arc::clone(&entry.value);
            drop(entry);
            self.schedule(key, value, EvictionReason::Expired);
            return None;
        }
        entry.last_accessed = now;
        Some(Arc::clone(&entry.value))
    }

    /// 检查是否存在未过期的条目（不刷新访问时间）
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// 读取原始条目（包含已过期但尚未处理的条目）
    pub fn peek_entry(&self, key: &str) -> Option<Arc<V>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.value))
    }

    /// 检查 `value` 是否仍是 `key` 的当前条目
    pub fn is_current(&self, key: &str, value: &Arc<V>) -> bool {
        self.entries
            .get(key)
            .map(|entry| Arc::ptr_eq(&entry.value, value))
            .unwrap_or(false)
    }

    /// 写入或替换条目
    pub fn insert(&self, key: &str, value: Arc<V>, policy: EntryPolicy) {
        self.entries
            .insert(key.to_string(), StoreEntry::new(value, policy));
        self.enforce_capacity();
    }

    /// 仅当键不存在时写入；键已存在（包括已过期未处理的条目）时原样返回值
    pub fn insert_if_absent(&self, key: &str, value: V, policy: EntryPolicy) -> Result<Arc<V>, V> {
        let inserted = match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => return Err(value),
            Entry::Vacant(vacant) => {
                let value = Arc::new(value);
                vacant.insert(StoreEntry::new(Arc::clone(&value), policy));
                value
            }
        };
        self.enforce_capacity();
        Ok(inserted)
    }

    /// 仅当当前条目就是 `value` 时删除
    pub fn remove_if_same(&self, key: &str, value: &Arc<V>) -> bool {
        self.entries
            .remove_if(key, |_, entry| Arc::ptr_eq(&entry.value, value))
            .is_some()
    }

    /// 扫描所有过期条目并登记为淘汰候选，返回数量
    pub fn collect_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Arc<V>)> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.value)))
            .collect();

        let count = expired.len();
        for (key, value) in expired {
            self.schedule(&key, value, EvictionReason::Expired);
        }
        count
    }

    /// 按优先级和最近访问时间裁剪 `percent`% 的可淘汰条目，返回登记数量
    pub fn trim(&self, percent: u8) -> usize {
        let removable = self
            .entries
            .iter()
            .filter(|entry| entry.eviction_rank().is_some())
            .count();
        let target = (removable * usize::from(percent.min(100))).div_ceil(100);
        let victims = self.select_victims(target);
        let count = victims.len();
        for (key, value) in victims {
            self.schedule(&key, value, EvictionReason::Trimmed);
        }
        debug!("trim {}%: 登记 {} 个淘汰候选", percent, count);
        count
    }

    /// 取出所有待处理的淘汰候选
    pub fn take_pending(&self) -> Vec<Eviction<V>> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn schedule(&self, key: &str, value: Arc<V>, reason: EvictionReason) {
        trace!("登记淘汰候选: key={}, reason={:?}", key, reason);
        self.pending.lock().push(Eviction {
            key: key.to_string(),
            value,
            reason,
        });
    }

    fn enforce_capacity(&self) {
        if self.capacity == 0 {
            return;
        }
        let len = self.entries.len();
        if len <= self.capacity {
            return;
        }
        for (key, value) in self.select_victims(len - self.capacity) {
            self.schedule(&key, value, EvictionReason::Capacity);
        }
    }

    /// 选出 `count` 个淘汰对象：已过期的优先，其次 Low、Default、High，同级按最久未访问
    fn select_victims(&self, count: usize) -> Vec<(String, Arc<V>)> {
        if count == 0 {
            return Vec::new();
        }
        let now = Instant::now();
        let mut candidates: Vec<(bool, u8, Instant, String, Arc<V>)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                entry.eviction_rank().map(|rank| {
                    (
                        !entry.is_expired(now),
                        rank,
                        entry.last_accessed,
                        entry.key().clone(),
                        Arc::clone(&entry.value),
                    )
                })
            })
            .collect();
        candidates.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        candidates
            .into_iter()
            .take(count)
            .map(|(_, _, _, key, value)| (key, value))
            .collect()
    }
}
