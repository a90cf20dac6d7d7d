//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 非阻塞增强器
//!
//! 所有写操作提交到 [`BackgroundTaskScheduler`] 后立即返回，读操作直接转发。
//! 同一实例上的写操作按提交顺序生效。

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::{ensure_not_cancelled, CachingBackend, SupportedFeatures};
use crate::constants::DEFAULT_EVENT_CHANNEL_CAPACITY;
use crate::enhancer::{CachingBackendEnhancer, EventRelay};
use crate::error::CacheResult;
use crate::events::{BackendEvent, BackendId, EventHub};
use crate::item::{CacheItem, CacheValue, ClearOptions};
use crate::scheduler::{BackgroundTaskScheduler, SchedulerStats};

/// 非阻塞增强器
pub struct NonBlockingCachingBackendEnhancer {
    id: BackendId,
    underlying: Arc<dyn CachingBackend>,
    scheduler: BackgroundTaskScheduler,
    events: Arc<EventHub>,
    relay: EventRelay,
}

impl NonBlockingCachingBackendEnhancer {
    /// 包装底层后端；需要在Tokio运行时中调用
    pub fn new(underlying: Arc<dyn CachingBackend>) -> CacheResult<Self> {
        Ok(Self::with_scheduler(
            underlying,
            BackgroundTaskScheduler::new()?,
        ))
    }

    /// 使用指定的调度器
    pub fn with_scheduler(
        underlying: Arc<dyn CachingBackend>,
        scheduler: BackgroundTaskScheduler,
    ) -> Self {
        let id = BackendId::new();
        let underlying_id = underlying.id();
        let events = Arc::new(EventHub::new(DEFAULT_EVENT_CHANNEL_CAPACITY));
        let relay = EventRelay::start(
            "NonBlockingCachingBackendEnhancer",
            underlying.as_ref(),
            Arc::clone(&events),
            move |event| Some(event.reattributed(underlying_id, id)),
        );

        debug!("创建非阻塞增强器: id={}, underlying={}", id, underlying_id);

        Self {
            id,
            underlying,
            scheduler,
            events,
            relay,
        }
    }

    /// 等待此前提交的写操作全部执行完毕
    pub async fn drain(&self) -> CacheResult<()> {
        self.scheduler.drain().await
    }

    pub fn scheduler_stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    fn submit<F, Fut>(&self, operation: &'static str, key: &str, task: F) -> CacheResult<()>
    where
        F: FnOnce(Arc<dyn CachingBackend>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CacheResult<()>> + Send + 'static,
    {
        let underlying = Arc::clone(&self.underlying);
        debug!("提交后台写操作: op={}, key={}", operation, key);
        self.scheduler.enqueue(move || task(underlying))
    }
}

#[async_trait]
impl CachingBackend for NonBlockingCachingBackendEnhancer {
    fn id(&self) -> BackendId {
        self.id
    }

    fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            blocking: false,
            contains_dependency: self.underlying.supported_features().contains_dependency,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        let owned = key.to_string();
        self.submit("set_item", key, move |backend| async move {
            backend
                .set_item_async(&owned, item, &CancellationToken::new())
                .await
        })
    }

    fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        self.underlying.get_item(key, include_dependencies)
    }

    fn remove_item(&self, key: &str) -> CacheResult<()> {
        let owned = key.to_string();
        self.submit("remove_item", key, move |backend| async move {
            backend
                .remove_item_async(&owned, &CancellationToken::new())
                .await
        })
    }

    fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.underlying.contains_item(key)
    }

    fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        let owned = key.to_string();
        self.submit("invalidate_dependency", key, move |backend| async move {
            backend
                .invalidate_dependency_async(&owned, &CancellationToken::new())
                .await
        })
    }

    fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        self.underlying.contains_dependency(key)
    }

    fn clear(&self, options: ClearOptions) -> CacheResult<()> {
        self.submit("clear", "*", move |backend| async move {
            backend.clear_async(options, &CancellationToken::new()).await
        })
    }

    async fn set_item_async(
        &self,
        key: &str,
        item: CacheItem,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        let owned = key.to_string();
        let cancel = cancel.clone();
        self.submit("set_item", key, move |backend| async move {
            backend.set_item_async(&owned, item, &cancel).await
        })
    }

    async fn get_item_async(
        &self,
        key: &str,
        include_dependencies: bool,
        cancel: &CancellationToken,
    ) -> CacheResult<Option<CacheValue>> {
        self.underlying
            .get_item_async(key, include_dependencies, cancel)
            .await
    }

    async fn remove_item_async(&self, key: &str, cancel: &CancellationToken) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        let owned = key.to_string();
        let cancel = cancel.clone();
        self.submit("remove_item", key, move |backend| async move {
            backend.remove_item_async(&owned, &cancel).await
        })
    }

    async fn contains_item_async(&self, key: &str, cancel: &CancellationToken) -> CacheResult<bool> {
        self.underlying.contains_item_async(key, cancel).await
    }

    async fn invalidate_dependency_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        let owned = key.to_string();
        let cancel = cancel.clone();
        self.submit("invalidate_dependency", key, move |backend| async move {
            backend.invalidate_dependency_async(&owned, &cancel).await
        })
    }

    async fn contains_dependency_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<bool> {
        self.underlying.contains_dependency_async(key, cancel).await
    }

    async fn clear_async(&self, options: ClearOptions, cancel: &CancellationToken) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        let cancel = cancel.clone();
        self.submit("clear", "*", move |backend| async move {
            backend.clear_async(options, &cancel).await
        })
    }

    async fn shutdown(&self) -> CacheResult<()> {
        let drained = self.scheduler.shutdown().await;
        if let Err(e) = &drained {
            error!("非阻塞增强器等待后台任务失败: {}", e);
        }
        self.relay.stop();
        let underlying = self.underlying.shutdown().await;
        info!("非阻塞增强器已关闭: id={}", self.id);
        drained.and(underlying)
    }

    fn dispose(&self) -> CacheResult<()> {
        // 队列未处理完时保留底层后端
        if let Err(e) = self.scheduler.dispose() {
            error!("非阻塞增强器等待后台任务失败，底层后端未关闭: {}", e);
            return Err(e);
        }
        self.relay.stop();
        self.underlying.dispose()
    }
}

impl CachingBackendEnhancer for NonBlockingCachingBackendEnhancer {
    fn underlying_backend(&self) -> &Arc<dyn CachingBackend> {
        &self.underlying
    }
}
