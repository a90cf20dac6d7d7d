//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 跨实例失效广播
//!
//! [`InvalidationBroker`] 包装一个后端：本地删除/依赖失效生效后，把消息发布到
//! 传输层主题；收到对端消息时直接对底层后端执行相同操作，不再转发。
//! 来源为自身 id 的消息被忽略。
//!
//! 执行对端依赖失效时，底层后端产生的失效事件归属于发出消息的对端。

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{ensure_not_cancelled, CachingBackend, SupportedFeatures};
use crate::constants::{
    DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_INVALIDATION_TOPIC, DEFAULT_TRANSPORT_CHANNEL_CAPACITY,
};
use crate::enhancer::{CachingBackendEnhancer, EventRelay};
use crate::error::{CacheError, CacheResult};
use crate::events::{BackendEvent, BackendId, EventHub, ItemRemovedReason};
use crate::item::{CacheItem, CacheValue, ClearOptions};

/// 发布/订阅传输层
#[async_trait]
pub trait InvalidationTransport: Send + Sync {
    /// 向主题发布消息
    async fn publish(&self, topic: &str, payload: String) -> CacheResult<()>;

    /// 订阅主题
    fn subscribe(&self, topic: &str) -> CacheResult<broadcast::Receiver<String>>;
}

/// 进程内传输层
#[derive(Debug)]
pub struct InMemoryTransport {
    topics: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
    published: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TRANSPORT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
        }
    }

    /// 已发布的消息数
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvalidationTransport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: String) -> CacheResult<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!("发布失效消息: topic={}, payload={}", topic, payload);
        // 没有订阅者时消息被丢弃
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> CacheResult<broadcast::Receiver<String>> {
        Ok(self.sender(topic).subscribe())
    }
}

/// 失效消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    RemoveItem,
    InvalidateDependency,
}

/// 失效消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub kind: InvalidationKind,
    pub key: String,
    pub source_id: BackendId,
}

impl InvalidationMessage {
    pub fn to_json(&self) -> CacheResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> CacheResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// 广播统计信息
#[derive(Debug, Default)]
pub struct BrokerStats {
    published: AtomicU64,
    received: AtomicU64,
    applied: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
}

impl BrokerStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// 执行成功的对端消息数
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// 因来源为自身而忽略的消息数
    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// 对端依赖失效期间底层事件的来源归属
///
/// 底层后端先为每个成员发出 `ItemRemoved(Invalidated)`，最后发出一次
/// `DependencyInvalidated`；成员事件暂存到依赖事件到达后再统一改记来源。
#[derive(Debug, Default)]
struct PeerAttribution {
    pending: HashMap<String, VecDeque<BackendId>>,
    held: Vec<BackendEvent>,
}

impl PeerAttribution {
    fn expect(&mut self, dependency: &str, peer: BackendId) {
        self.pending
            .entry(dependency.to_string())
            .or_default()
            .push_back(peer);
    }

    fn take_pending(&mut self, dependency: &str) -> Option<BackendId> {
        let queue = self.pending.get_mut(dependency)?;
        let peer = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(dependency);
        }
        peer
    }

    /// 对端失效执行失败，撤销等待
    fn cancel(
        &mut self,
        dependency: &str,
        peer: BackendId,
        underlying: BackendId,
    ) -> Vec<BackendEvent> {
        self.take_pending(dependency);
        if self.pending.is_empty() {
            self.release(underlying, peer)
        } else {
            Vec::new()
        }
    }

    fn release(&mut self, underlying: BackendId, target: BackendId) -> Vec<BackendEvent> {
        self.held
            .drain(..)
            .map(|event| event.reattributed(underlying, target))
            .collect()
    }

    /// 返回需要转发的事件（可能为空，也可能包含之前暂存的事件）
    fn attribute(
        &mut self,
        event: BackendEvent,
        underlying: BackendId,
        own: BackendId,
    ) -> Vec<BackendEvent> {
        if event.source_id() != underlying {
            return vec![event];
        }
        match &event {
            BackendEvent::ItemRemoved {
                reason: ItemRemovedReason::Invalidated,
                ..
            } if !self.pending.is_empty() => {
                self.held.push(event);
                Vec::new()
            }
            BackendEvent::DependencyInvalidated { key, .. } => {
                let target = self.take_pending(key).unwrap_or(own);
                let mut released = self.release(underlying, target);
                released.push(event.reattributed(underlying, target));
                released
            }
            _ => vec![event.reattributed(underlying, own)],
        }
    }
}

/// 失效广播增强器
pub struct InvalidationBroker {
    id: BackendId,
    underlying: Arc<dyn CachingBackend>,
    transport: Arc<dyn InvalidationTransport>,
    topic: String,
    events: Arc<EventHub>,
    relay: EventRelay,
    stats: Arc<BrokerStats>,
    runtime: Handle,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationBroker {
    /// 使用默认主题创建
    pub fn new(
        underlying: Arc<dyn CachingBackend>,
        transport: Arc<dyn InvalidationTransport>,
    ) -> CacheResult<Self> {
        Self::with_topic(underlying, transport, DEFAULT_INVALIDATION_TOPIC)
    }

    /// 订阅指定主题；需要在Tokio运行时中调用
    pub fn with_topic(
        underlying: Arc<dyn CachingBackend>,
        transport: Arc<dyn InvalidationTransport>,
        topic: &str,
    ) -> CacheResult<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            CacheError::ConfigError("失效广播需要在Tokio运行时中创建".to_string())
        })?;

        let id = BackendId::new();
        let underlying_id = underlying.id();
        let events = Arc::new(EventHub::new(DEFAULT_EVENT_CHANNEL_CAPACITY));
        let stats = Arc::new(BrokerStats::default());
        let attribution = Arc::new(Mutex::new(PeerAttribution::default()));

        let relay_attribution = Arc::clone(&attribution);
        let relay_events = Arc::clone(&events);
        let relay = EventRelay::start(
            "InvalidationBroker",
            underlying.as_ref(),
            Arc::clone(&events),
            move |event| {
                let mut forwarded = relay_attribution
                    .lock()
                    .attribute(event, underlying_id, id);
                let last = forwarded.pop();
                for earlier in forwarded {
                    relay_events.publish(earlier);
                }
                last
            },
        );

        let receiver = transport.subscribe(topic)?;
        let subscription = runtime.spawn(Self::subscription_task(
            id,
            topic.to_string(),
            receiver,
            Arc::clone(&underlying),
            Arc::clone(&events),
            Arc::clone(&stats),
            attribution,
        ));

        info!("失效广播已启动: id={}, topic={}", id, topic);

        Ok(Self {
            id,
            underlying,
            transport,
            topic: topic.to_string(),
            events,
            relay,
            stats,
            runtime,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    async fn subscription_task(
        id: BackendId,
        topic: String,
        mut receiver: broadcast::Receiver<String>,
        underlying: Arc<dyn CachingBackend>,
        events: Arc<EventHub>,
        stats: Arc<BrokerStats>,
        attribution: Arc<Mutex<PeerAttribution>>,
    ) {
        loop {
            let payload = match receiver.recv().await {
                Ok(payload) => payload,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("失效广播订阅滞后: topic={}, 丢弃 {} 条消息", topic, skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            stats.received.fetch_add(1, Ordering::Relaxed);

            let message = match InvalidationMessage::from_json(&payload) {
                Ok(message) => message,
                Err(e) => {
                    stats.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!("无法解析失效消息: topic={}, error={}", topic, e);
                    continue;
                }
            };

            if message.source_id == id {
                stats.ignored.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            Self::apply_peer_message(&underlying, &events, &stats, &attribution, message)
                .await;
        }

        debug!("失效广播订阅任务结束: topic={}", topic);
    }

    /// 对底层后端执行对端的删除
    ///
    /// 依赖失效的事件由底层后端产生并改记为对端来源；
    /// 显式删除不产生底层事件，这里以对端来源补发一次。
    async fn apply_peer_message(
        underlying: &Arc<dyn CachingBackend>,
        events: &EventHub,
        stats: &BrokerStats,
        attribution: &Mutex<PeerAttribution>,
        message: InvalidationMessage,
    ) {
        let cancel = CancellationToken::new();
        let result = match message.kind {
            InvalidationKind::RemoveItem => underlying.remove_item_async(&message.key, &cancel).await,
            InvalidationKind::InvalidateDependency => {
                attribution.lock().expect(&message.key, message.source_id);
                let result = underlying
                    .invalidate_dependency_async(&message.key, &cancel)
                    .await;
                if result.is_err() {
                    let released = attribution.lock().cancel(
                        &message.key,
                        message.source_id,
                        underlying.id(),
                    );
                    for event in released {
                        events.publish(event);
                    }
                }
                result
            }
        };

        match result {
            Ok(()) => {
                stats.applied.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "已应用对端失效消息: kind={:?}, key={}, source={}",
                    message.kind,
                    message.key,
                    message.source_id
                );
                if message.kind == InvalidationKind::RemoveItem {
                    events.item_removed(
                        &message.key,
                        ItemRemovedReason::Removed,
                        message.source_id,
                    );
                }
            }
            Err(e) => error!(
                "应用对端失效消息失败: kind={:?}, key={}, error={}",
                message.kind, message.key, e
            ),
        }
    }

    async fn publish(&self, kind: InvalidationKind, key: &str) -> CacheResult<()> {
        let message = InvalidationMessage {
            kind,
            key: key.to_string(),
            source_id: self.id,
        };
        self.transport
            .publish(&self.topic, message.to_json()?)
            .await?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 同步上下文中发布：在创建时捕获的运行时上派生发布任务
    fn publish_detached(&self, kind: InvalidationKind, key: &str) -> CacheResult<()> {
        let message = InvalidationMessage {
            kind,
            key: key.to_string(),
            source_id: self.id,
        };
        let payload = message.to_json()?;

        let transport = Arc::clone(&self.transport);
        let topic = self.topic.clone();
        let stats = Arc::clone(&self.stats);
        self.runtime.spawn(async move {
            match transport.publish(&topic, payload).await {
                Ok(()) => {
                    stats.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => error!("发布失效消息失败: topic={}, error={}", topic, e),
            }
        });
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    fn stop(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            handle.abort();
            debug!("失效广播订阅已停止: id={}", self.id);
        }
        self.relay.stop();
    }
}

#[async_trait]
impl CachingBackend for InvalidationBroker {
    fn id(&self) -> BackendId {
        self.id
    }

    fn supported_features(&self) -> SupportedFeatures {
        self.underlying.supported_features()
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        self.underlying.set_item(key, item)
    }

    fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        self.underlying.get_item(key, include_dependencies)
    }

    fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.underlying.remove_item(key)?;
        self.publish_detached(InvalidationKind::RemoveItem, key)
    }

    fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.underlying.contains_item(key)
    }

    fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        self.underlying.invalidate_dependency(key)?;
        self.publish_detached(InvalidationKind::InvalidateDependency, key)
    }

    fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        self.underlying.contains_dependency(key)
    }

    fn clear(&self, options: ClearOptions) -> CacheResult<()> {
        self.underlying.clear(options)
    }

    async fn set_item_async(
        &self,
        key: &str,
        item: CacheItem,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        self.underlying.set_item_async(key, item, cancel).await
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
        self.underlying.remove_item_async(key, cancel).await?;
        ensure_not_cancelled(cancel)?;
        self.publish(InvalidationKind::RemoveItem, key).await
    }

    async fn contains_item_async(&self, key: &str, cancel: &CancellationToken) -> CacheResult<bool> {
        self.underlying.contains_item_async(key, cancel).await
    }

    async fn invalidate_dependency_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        self.underlying
            .invalidate_dependency_async(key, cancel)
            .await?;
        ensure_not_cancelled(cancel)?;
        self.publish(InvalidationKind::InvalidateDependency, key)
            .await
    }

    async fn contains_dependency_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<bool> {
        self.underlying.contains_dependency_async(key, cancel).await
    }

    async fn clear_async(&self, options: ClearOptions, cancel: &CancellationToken) -> CacheResult<()> {
        self.underlying.clear_async(options, cancel).await
    }

    async fn shutdown(&self) -> CacheResult<()> {
        self.stop();
        self.underlying.shutdown().await
    }

    fn dispose(&self) -> CacheResult<()> {
        self.stop();
        self.underlying.dispose()
    }
}

impl CachingBackendEnhancer for InvalidationBroker {
    fn underlying_backend(&self) -> &Arc<dyn CachingBackend> {
        &self.underlying
    }
}

impl Drop for InvalidationBroker {
    fn drop(&mut self) {
        if let Some(handle) = self.subscription.get_mut().take() {
            handle.abort();
        }
    }
}
