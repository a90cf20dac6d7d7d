//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 两级缓存增强器
//!
//! 本地 [`MemoryCachingBackend`] 在前，远端后端在后。远端保存的是带写入时间戳的
//! [`TwoLayerCacheValue`]；远端为非阻塞后端时，本地删除以墓碑代替，读取时用
//! 时间戳比较判断远端数据是否早于删除。
//!
//! # 读取流程
//!
//! - 本地命中普通值：直接返回
//! - 本地未命中：读远端，命中则回填本地
//! - 本地命中墓碑：读远端，只有远端时间戳严格晚于墓碑时间戳时才回填并返回

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::backend::{ensure_not_cancelled, CachingBackend, SupportedFeatures};
use crate::constants::{
    DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_REMOVED_ITEM_TRANSITION_PERIOD_SECS,
};
use crate::enhancer::{CachingBackendEnhancer, EventRelay};
use crate::error::{CacheError, CacheResult};
use crate::events::{BackendEvent, BackendId, EventHub};
use crate::item::{
    CacheItem, CacheItemConfiguration, CacheItemPriority, CachePayload, CacheValue, ClearOptions,
};
use crate::memory::MemoryCachingBackend;

/// 远端保存的包装值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoLayerCacheValue {
    pub value: CachePayload,
    /// 写入时间
    pub timestamp: DateTime<Utc>,
    pub absolute_expiration: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
    #[serde(default)]
    pub priority: CacheItemPriority,
}

impl TwoLayerCacheValue {
    pub fn new(item: &CacheItem, timestamp: DateTime<Utc>) -> Self {
        let configuration = item.configuration.clone().unwrap_or_default();
        Self {
            value: item.value.clone(),
            timestamp,
            absolute_expiration: configuration.absolute_expiration,
            sliding_expiration: configuration.sliding_expiration,
            priority: configuration.priority,
        }
    }

    /// 构造写入远端的缓存项
    pub fn to_remote_item(&self, dependencies: Vec<String>) -> CacheResult<CacheItem> {
        Ok(CacheItem {
            value: serde_json::to_value(self)?,
            dependencies,
            configuration: self.configuration(),
        })
    }

    /// 从远端读到的值中解出包装值
    pub fn from_remote(value: &CacheValue) -> CacheResult<Self> {
        Ok(serde_json::from_value(value.value.clone())?)
    }

    /// 还原为写入本地的缓存项
    pub fn into_local_item(self, dependencies: Vec<String>) -> CacheItem {
        let configuration = self.configuration();
        CacheItem {
            value: self.value,
            dependencies,
            configuration,
        }
    }

    fn configuration(&self) -> Option<CacheItemConfiguration> {
        let configuration = CacheItemConfiguration {
            absolute_expiration: self.absolute_expiration,
            sliding_expiration: self.sliding_expiration,
            priority: self.priority,
        };
        if configuration == CacheItemConfiguration::default() {
            None
        } else {
            Some(configuration)
        }
    }
}

/// 两级缓存配置
#[derive(Debug, Clone, PartialEq)]
pub struct TwoLayerConfig {
    /// 本地墓碑保留时长
    pub removed_item_transition_period: Duration,
    /// 事件通道容量
    pub event_channel_capacity: usize,
}

impl Default for TwoLayerConfig {
    fn default() -> Self {
        Self {
            removed_item_transition_period: Duration::from_secs(
                DEFAULT_REMOVED_ITEM_TRANSITION_PERIOD_SECS,
            ),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl TwoLayerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn removed_item_transition_period(mut self, period: Duration) -> Self {
        self.removed_item_transition_period = period;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }
}

/// 本地查找结果
enum LocalLookup {
    Hit(CacheValue),
    Tombstone(DateTime<Utc>),
    Miss,
}

/// 两级缓存增强器
pub struct TwoLayerCachingBackendEnhancer {
    id: BackendId,
    local: Arc<MemoryCachingBackend>,
    remote: Arc<dyn CachingBackend>,
    config: TwoLayerConfig,
    events: Arc<EventHub>,
    relay: EventRelay,
}

impl TwoLayerCachingBackendEnhancer {
    pub fn new(local: MemoryCachingBackend, remote: Arc<dyn CachingBackend>) -> Self {
        Self::with_config(local, remote, TwoLayerConfig::default())
    }

    pub fn with_config(
        local: MemoryCachingBackend,
        remote: Arc<dyn CachingBackend>,
        config: TwoLayerConfig,
    ) -> Self {
        let id = BackendId::new();
        let local = Arc::new(local);
        let events = Arc::new(EventHub::new(config.event_channel_capacity));

        let remote_id = remote.id();
        let mirror = Arc::clone(&local);
        let relay = EventRelay::start(
            "TwoLayerCachingBackendEnhancer",
            remote.as_ref(),
            Arc::clone(&events),
            move |event| relay_remote_event(&mirror, event, remote_id, id),
        );

        debug!(
            "创建两级缓存增强器: id={}, local={}, remote={}",
            id,
            local.id(),
            remote_id
        );

        Self {
            id,
            local,
            remote,
            config,
            events,
            relay,
        }
    }

    /// 本地缓存
    pub fn local_cache(&self) -> &MemoryCachingBackend {
        &self.local
    }

    pub fn config(&self) -> &TwoLayerConfig {
        &self.config
    }

    fn remote_is_blocking(&self) -> bool {
        self.remote.supported_features().blocking
    }

    fn lookup_local(&self, key: &str, include_dependencies: bool) -> LocalLookup {
        match self.local.get_entry(key) {
            Some(entry) => match (entry.value(), entry.removed_at()) {
                (Some(value), _) if include_dependencies => LocalLookup::Hit(value.clone()),
                (Some(value), _) => {
                    LocalLookup::Hit(CacheValue::new(value.value.clone(), Vec::new()))
                }
                (None, Some(removed_at)) => LocalLookup::Tombstone(removed_at),
                (None, None) => LocalLookup::Miss,
            },
            None => LocalLookup::Miss,
        }
    }

    /// 处理远端读取结果：按墓碑时间过滤并回填本地
    fn accept_remote(
        &self,
        key: &str,
        remote: Option<CacheValue>,
        tombstone: Option<DateTime<Utc>>,
        include_dependencies: bool,
    ) -> CacheResult<Option<CacheValue>> {
        let Some(remote) = remote else {
            return Ok(None);
        };
        let wrapped = TwoLayerCacheValue::from_remote(&remote)?;

        if let Some(removed_at) = tombstone {
            if wrapped.timestamp <= removed_at {
                trace!(
                    "远端数据早于本地删除，忽略: key={}, written={}, removed={}",
                    key,
                    wrapped.timestamp,
                    removed_at
                );
                return Ok(None);
            }
        }

        let value = wrapped.value.clone();
        self.local
            .set_item(key, wrapped.into_local_item(remote.dependencies.clone()))?;
        trace!("从远端回填本地缓存: key={}", key);

        let dependencies = if include_dependencies {
            remote.dependencies
        } else {
            Vec::new()
        };
        Ok(Some(CacheValue::new(value, dependencies)))
    }

    fn removal_timestamp(&self) -> (DateTime<Utc>, Duration) {
        (Utc::now(), self.config.removed_item_transition_period)
    }
}

/// 处理远端事件：对端造成的删除先同步到本地，同步失败时不再转发
fn relay_remote_event(
    local: &MemoryCachingBackend,
    event: BackendEvent,
    remote_id: BackendId,
    id: BackendId,
) -> Option<BackendEvent> {
    if event.source_id() != remote_id {
        let result = match &event {
            BackendEvent::ItemRemoved { key, .. } => local.remove_item(key),
            BackendEvent::DependencyInvalidated { key, .. } => local.invalidate_dependency(key),
        };
        match result {
            Ok(()) => trace!(
                "同步远端删除到本地: key={}, source={}",
                event.key(),
                event.source_id()
            ),
            Err(e) => {
                error!(
                    "同步远端删除到本地失败，事件不再转发: key={}, error={}",
                    event.key(),
                    e
                );
                return None;
            }
        }
    }
    Some(event.reattributed(remote_id, id))
}

#[async_trait]
impl CachingBackend for TwoLayerCachingBackendEnhancer {
    fn id(&self) -> BackendId {
        self.id
    }

    fn supported_features(&self) -> SupportedFeatures {
        let remote = self.remote.supported_features();
        SupportedFeatures {
            blocking: remote.blocking,
            contains_dependency: remote.blocking && remote.contains_dependency,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        let dependencies = item.normalized_dependencies();
        let wrapped = TwoLayerCacheValue::new(&item, Utc::now()).to_remote_item(dependencies)?;
        self.local.set_item(key, item)?;
        self.remote.set_item(key, wrapped)
    }

    fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        let tombstone = match self.lookup_local(key, include_dependencies) {
            LocalLookup::Hit(value) => return Ok(Some(value)),
            LocalLookup::Tombstone(removed_at) => Some(removed_at),
            LocalLookup::Miss => None,
        };
        let remote = self.remote.get_item(key, true)?;
        self.accept_remote(key, remote, tombstone, include_dependencies)
    }

    fn remove_item(&self, key: &str) -> CacheResult<()> {
        if self.remote_is_blocking() {
            self.local.remove_item(key)?;
            self.remote.remove_item(key)
        } else {
            let (timestamp, ttl) = self.removal_timestamp();
            self.remote.remove_item(key)?;
            self.local.remove_with_tombstone(key, timestamp, ttl);
            Ok(())
        }
    }

    fn contains_item(&self, key: &str) -> CacheResult<bool> {
        if self.remote_is_blocking() {
            Ok(self.local.contains_item(key)? || self.remote.contains_item(key)?)
        } else {
            Ok(self.get_item(key, false)?.is_some())
        }
    }

    fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        if self.remote_is_blocking() {
            self.local.invalidate_dependency(key)?;
            self.remote.invalidate_dependency(key)
        } else {
            let (timestamp, ttl) = self.removal_timestamp();
            self.remote.invalidate_dependency(key)?;
            self.local
                .invalidate_dependency_with_tombstones(key, timestamp, ttl);
            Ok(())
        }
    }

    fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        if !self.remote_is_blocking() {
            return Err(CacheError::NotSupported(
                "远端为非阻塞后端时无法检查依赖是否存在".to_string(),
            ));
        }
        Ok(self.local.contains_dependency(key)? || self.remote.contains_dependency(key)?)
    }

    fn clear(&self, options: ClearOptions) -> CacheResult<()> {
        self.local.clear(options)?;
        self.remote.clear(options)
    }

    async fn set_item_async(
        &self,
        key: &str,
        item: CacheItem,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        let dependencies = item.normalized_dependencies();
        let wrapped = TwoLayerCacheValue::new(&item, Utc::now()).to_remote_item(dependencies)?;
        self.local.set_item_async(key, item, cancel).await?;
        self.remote.set_item_async(key, wrapped, cancel).await
    }

    async fn get_item_async(
        &self,
        key: &str,
        include_dependencies: bool,
        cancel: &CancellationToken,
    ) -> CacheResult<Option<CacheValue>> {
        ensure_not_cancelled(cancel)?;
        let tombstone = match self.lookup_local(key, include_dependencies) {
            LocalLookup::Hit(value) => return Ok(Some(value)),
            LocalLookup::Tombstone(removed_at) => Some(removed_at),
            LocalLookup::Miss => None,
        };
        let remote = self.remote.get_item_async(key, true, cancel).await?;
        self.accept_remote(key, remote, tombstone, include_dependencies)
    }

    async fn remove_item_async(&self, key: &str, cancel: &CancellationToken) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        if self.remote_is_blocking() {
            self.local.remove_item_async(key, cancel).await?;
            self.remote.remove_item_async(key, cancel).await
        } else {
            let (timestamp, ttl) = self.removal_timestamp();
            self.remote.remove_item_async(key, cancel).await?;
            self.local.remove_with_tombstone(key, timestamp, ttl);
            Ok(())
        }
    }

    async fn contains_item_async(&self, key: &str, cancel: &CancellationToken) -> CacheResult<bool> {
        ensure_not_cancelled(cancel)?;
        if self.remote_is_blocking() {
            if self.local.contains_item_async(key, cancel).await? {
                return Ok(true);
            }
            self.remote.contains_item_async(key, cancel).await
        } else {
            Ok(self.get_item_async(key, false, cancel).await?.is_some())
        }
    }

    async fn invalidate_dependency_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        if self.remote_is_blocking() {
            self.local.invalidate_dependency_async(key, cancel).await?;
            self.remote.invalidate_dependency_async(key, cancel).await
        } else {
            let (timestamp, ttl) = self.removal_timestamp();
            self.remote.invalidate_dependency_async(key, cancel).await?;
            self.local
                .invalidate_dependency_with_tombstones(key, timestamp, ttl);
            Ok(())
        }
    }

    async fn contains_dependency_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<bool> {
        ensure_not_cancelled(cancel)?;
        if !self.remote_is_blocking() {
            return Err(CacheError::NotSupported(
                "远端为非阻塞后端时无法检查依赖是否存在".to_string(),
            ));
        }
        if self.local.contains_dependency_async(key, cancel).await? {
            return Ok(true);
        }
        self.remote.contains_dependency_async(key, cancel).await
    }

    async fn clear_async(&self, options: ClearOptions, cancel: &CancellationToken) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        self.local.clear_async(options, cancel).await?;
        self.remote.clear_async(options, cancel).await
    }

    async fn shutdown(&self) -> CacheResult<()> {
        self.relay.stop();
        let local = self.local.shutdown().await;
        let remote = self.remote.shutdown().await;
        if let Err(e) = &remote {
            error!("两级缓存远端关闭失败: {}", e);
        }
        info!("两级缓存增强器已关闭: id={}", self.id);
        local.and(remote)
    }

    fn dispose(&self) -> CacheResult<()> {
        self.relay.stop();
        let local = self.local.dispose();
        let remote = self.remote.dispose();
        if let Err(e) = &remote {
            error!("两级缓存远端关闭失败: {}", e);
        }
        local.and(remote)
    }
}

impl CachingBackendEnhancer for TwoLayerCachingBackendEnhancer {
    fn underlying_backend(&self) -> &Arc<dyn CachingBackend> {
        &self.remote
    }
}
