//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 内存缓存后端
//!
//! 进程内实现：键值存储 + 依赖反向索引 + 每键同步锁。
//!
//! # 锁顺序
//!
//! - 修改某个键的依赖登记前，必须先持有该键的 `sync` 锁
//! - 任何时刻最多持有一个依赖集合锁
//! - 淘汰回调在触发它的操作释放所有锁之后才执行，因此不会同时持有两个 `sync`
//!
//! # 使用示例
//!
//! ```no_run
//! use cacheron::backend::CachingBackend;
//! use cacheron::item::CacheItem;
//! use cacheron::memory::MemoryCachingBackend;
//!
//! # fn main() -> Result<(), cacheron::error::CacheError> {
//! let backend = MemoryCachingBackend::new();
//! backend.set_item("user:1", CacheItem::new("alice").with_dependencies(["users"]))?;
//! backend.invalidate_dependency("users")?;
//! assert!(!backend.contains_item("user:1")?);
//! # Ok(())
//! # }
//! ```

pub mod dependency;
pub mod store;
pub mod value;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::backend::{CachingBackend, SupportedFeatures};
use crate::constants::{
    DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_MEMORY_CAPACITY,
};
use crate::error::CacheResult;
use crate::events::{BackendEvent, BackendId, EventHub, ItemRemovedReason};
use crate::item::{CacheItem, CacheValue, ClearOptions};

pub use dependency::DependencyIndex;
pub use store::{EntryPolicy, EvictionReason, MemoryStore};
pub use value::{MemoryCacheContent, MemoryCacheValue};

/// 内存后端配置
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryBackendConfig {
    /// 容量（0表示不限制）
    pub capacity: usize,
    /// 过期清理间隔
    pub cleanup_interval: Duration,
    /// 事件通道容量
    pub event_channel_capacity: usize,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl MemoryBackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }
}

/// 内存后端统计信息
#[derive(Debug, Default)]
pub struct MemoryBackendStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryBackendStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

impl From<EvictionReason> for ItemRemovedReason {
    fn from(reason: EvictionReason) -> Self {
        match reason {
            EvictionReason::Expired => ItemRemovedReason::Expired,
            EvictionReason::Capacity | EvictionReason::Trimmed => ItemRemovedReason::Evicted,
        }
    }
}

struct MemoryBackendInner {
    id: BackendId,
    store: MemoryStore<MemoryCacheValue>,
    dependencies: DependencyIndex,
    events: EventHub,
    stats: MemoryBackendStats,
}

impl MemoryBackendInner {
    /// 写入新内容，沿用旧值的同步锁
    fn store_content(&self, key: &str, content: MemoryCacheContent, policy: EntryPolicy) {
        let mut content = content;
        loop {
            match self.store.peek_entry(key) {
                Some(current) => {
                    let _guard = current.sync().lock();
                    if !self.store.is_current(key, &current) {
                        continue;
                    }

                    self.unregister_dependencies(key, &current);
                    let value = Arc::new(MemoryCacheValue::new(
                        content,
                        Arc::clone(current.sync()),
                    ));
                    self.register_dependencies(key, &value);
                    self.store.insert(key, value, policy);
                    return;
                }
                None => {
                    let sync = Arc::new(Mutex::new(()));
                    let _guard = sync.lock();
                    let value = MemoryCacheValue::new(content, Arc::clone(&sync));
                    match self.store.insert_if_absent(key, value, policy) {
                        Ok(value) => {
                            self.register_dependencies(key, &value);
                            return;
                        }
                        Err(rejected) => {
                            trace!("并发首次写入，重试: key={}", key);
                            content = rejected.into_content();
                        }
                    }
                }
            }
        }
    }

    /// 删除键，或在同一把锁下用 `replacement` 替换。返回是否移除了一个普通值。
    fn remove_entry(
        &self,
        key: &str,
        replacement: Option<(MemoryCacheContent, EntryPolicy)>,
    ) -> bool {
        let mut replacement = replacement;
        loop {
            match self.store.peek_entry(key) {
                Some(current) => {
                    let _guard = current.sync().lock();
                    if !self.store.is_current(key, &current) {
                        continue;
                    }

                    match replacement {
                        None => {
                            if !self.store.remove_if_same(key, &current) {
                                trace!("键已被并发删除: key={}", key);
                                return false;
                            }
                        }
                        Some((content, policy)) => {
                            let value = Arc::new(MemoryCacheValue::new(
                                content,
                                Arc::clone(current.sync()),
                            ));
                            self.store.insert(key, value, policy);
                        }
                    }
                    self.unregister_dependencies(key, &current);
                    return !current.is_tombstone();
                }
                None => match replacement {
                    None => return false,
                    Some((content, policy)) => {
                        let sync = Arc::new(Mutex::new(()));
                        let _guard = sync.lock();
                        let value = MemoryCacheValue::new(content, Arc::clone(&sync));
                        match self.store.insert_if_absent(key, value, policy) {
                            Ok(_) => return false,
                            Err(rejected) => {
                                replacement = Some((rejected.into_content(), policy));
                            }
                        }
                    }
                },
            }
        }
    }

    fn invalidate(&self, dependency: &str, tombstone: Option<(DateTime<Utc>, Duration)>) {
        if let Some(members) = self.dependencies.snapshot(dependency) {
            debug!(
                "依赖失效: dependency={}, 受影响条目={}",
                dependency,
                members.len()
            );
            for member in members {
                let replacement = tombstone.map(|(timestamp, ttl)| {
                    (
                        MemoryCacheContent::Removed { timestamp },
                        EntryPolicy::expiring_after(ttl),
                    )
                });
                if self.remove_entry(&member, replacement) {
                    self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
                    self.events
                        .item_removed(&member, ItemRemovedReason::Invalidated, self.id);
                }
            }
        }
        self.events.dependency_invalidated(dependency, self.id);
    }

    fn register_dependencies(&self, key: &str, value: &MemoryCacheValue) {
        for dependency in value.dependencies() {
            self.dependencies.add(dependency, key);
        }
    }

    fn unregister_dependencies(&self, key: &str, value: &MemoryCacheValue) {
        for dependency in value.dependencies() {
            self.dependencies.remove(dependency, key);
        }
    }

    /// 淘汰回调：处理存储登记的非显式删除
    fn process_evictions(&self) {
        for eviction in self.store.take_pending() {
            let value = eviction.value;
            {
                let _guard = value.sync().lock();
                // 已被覆盖写入或显式删除的条目由对应操作负责清理
                if !self.store.remove_if_same(&eviction.key, &value) {
                    continue;
                }
                self.unregister_dependencies(&eviction.key, &value);
            }

            if value.is_tombstone() {
                trace!("墓碑过期: key={}", eviction.key);
                continue;
            }

            match eviction.reason {
                EvictionReason::Expired => self.stats.expirations.fetch_add(1, Ordering::Relaxed),
                _ => self.stats.evictions.fetch_add(1, Ordering::Relaxed),
            };
            trace!("条目被淘汰: key={}, reason={:?}", eviction.key, eviction.reason);
            self.events
                .item_removed(&eviction.key, eviction.reason.into(), self.id);
        }
    }
}

/// 内存缓存后端
pub struct MemoryCachingBackend {
    inner: Arc<MemoryBackendInner>,
    config: MemoryBackendConfig,
    /// 清理任务句柄
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCachingBackend {
    /// 使用默认配置创建
    pub fn new() -> Self {
        Self::with_config(MemoryBackendConfig::default())
    }

    /// 使用配置创建；在 Tokio 运行时内创建时会启动过期清理任务
    pub fn with_config(config: MemoryBackendConfig) -> Self {
        let inner = Arc::new(MemoryBackendInner {
            id: BackendId::new(),
            store: MemoryStore::new(config.capacity),
            dependencies: DependencyIndex::new(),
            events: EventHub::new(config.event_channel_capacity),
            stats: MemoryBackendStats::default(),
        });
        let cleanup_handle =
            Self::start_cleanup_task(Arc::downgrade(&inner), config.cleanup_interval);

        debug!(
            "创建内存缓存后端: id={}, capacity={}",
            inner.id, config.capacity
        );

        Self {
            inner,
            config,
            cleanup_handle: Mutex::new(cleanup_handle),
        }
    }

    /// 启动清理任务
    fn start_cleanup_task(
        inner: Weak<MemoryBackendInner>,
        interval: Duration,
    ) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        Some(handle.spawn(async move {
            let mut cleanup_interval = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            cleanup_interval.tick().await;
            loop {
                cleanup_interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let expired = inner.store.collect_expired();
                inner.process_evictions();
                if expired > 0 {
                    debug!("清理了 {} 条过期数据", expired);
                }
            }
        }))
    }

    /// 读取原始条目（包括墓碑），刷新滑动过期
    pub fn get_entry(&self, key: &str) -> Option<Arc<MemoryCacheValue>> {
        let entry = self.inner.store.get(key);
        self.inner.process_evictions();
        entry
    }

    /// 用墓碑替换键（键不存在时也会写入墓碑）
    pub fn remove_with_tombstone(&self, key: &str, timestamp: DateTime<Utc>, ttl: Duration) {
        let replacement = (
            MemoryCacheContent::Removed { timestamp },
            EntryPolicy::expiring_after(ttl),
        );
        if self.inner.remove_entry(key, Some(replacement)) {
            self.inner.stats.removals.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.process_evictions();
    }

    /// 使依赖失效，受影响的键被替换为墓碑
    pub fn invalidate_dependency_with_tombstones(
        &self,
        key: &str,
        timestamp: DateTime<Utc>,
        ttl: Duration,
    ) {
        self.inner.invalidate(key, Some((timestamp, ttl)));
        self.inner.process_evictions();
    }

    /// 立即扫描并处理过期条目，返回处理前登记的过期数量
    pub fn cleanup_expired(&self) -> usize {
        let expired = self.inner.store.collect_expired();
        self.inner.process_evictions();
        expired
    }

    /// 存储中的条目数（包括墓碑和尚未处理的过期条目）
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// 依赖索引中的依赖数量
    pub fn dependency_count(&self) -> usize {
        self.inner.dependencies.len()
    }

    /// 获取统计信息
    pub fn stats(&self) -> &MemoryBackendStats {
        &self.inner.stats
    }

    /// 获取配置
    pub fn config(&self) -> &MemoryBackendConfig {
        &self.config
    }

    fn stop_cleanup_task(&self) {
        if let Some(handle) = self.cleanup_handle.lock().take() {
            handle.abort();
            debug!("内存缓存后端清理任务已停止: id={}", self.inner.id);
        }
    }
}

impl Default for MemoryCachingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CachingBackend for MemoryCachingBackend {
    fn id(&self) -> BackendId {
        self.inner.id
    }

    fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            blocking: true,
            contains_dependency: true,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.events.subscribe()
    }

    fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        let policy = EntryPolicy::from(item.configuration.as_ref());
        let dependencies = item.normalized_dependencies();
        let content = MemoryCacheContent::Item(CacheValue::new(item.value, dependencies));

        self.inner.store_content(key, content, policy);
        self.inner.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.process_evictions();
        Ok(())
    }

    fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        let value = self
            .get_entry(key)
            .and_then(|entry| entry.value().cloned())
            .map(|value| {
                if include_dependencies {
                    value
                } else {
                    value.without_dependencies()
                }
            });

        if value.is_some() {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    fn remove_item(&self, key: &str) -> CacheResult<()> {
        if self.inner.remove_entry(key, None) {
            self.inner.stats.removals.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.process_evictions();
        Ok(())
    }

    fn contains_item(&self, key: &str) -> CacheResult<bool> {
        let live = self.inner.store.contains(key)
            && self
                .inner
                .store
                .peek_entry(key)
                .map(|entry| !entry.is_tombstone())
                .unwrap_or(false);
        Ok(live)
    }

    fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        self.inner.invalidate(key, None);
        self.inner.process_evictions();
        Ok(())
    }

    fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        Ok(self.inner.dependencies.contains(key))
    }

    fn clear(&self, options: ClearOptions) -> CacheResult<()> {
        let expired = self.inner.store.collect_expired();
        let trimmed = self.inner.store.trim(options.trim_percent);
        self.inner.process_evictions();
        info!(
            "内存缓存后端已清理: id={}, expired={}, trimmed={}",
            self.inner.id, expired, trimmed
        );
        Ok(())
    }

    async fn shutdown(&self) -> CacheResult<()> {
        self.stop_cleanup_task();
        Ok(())
    }

    fn dispose(&self) -> CacheResult<()> {
        self.stop_cleanup_task();
        Ok(())
    }
}

impl Drop for MemoryCachingBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.get_mut().take() {
            handle.abort();
        }
    }
}
