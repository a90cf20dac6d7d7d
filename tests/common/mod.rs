//! 测试通用工具模块
//!
//! 提供测试中常用的工具函数和辅助结构。

#![allow(dead_code)]

use async_trait::async_trait;
use cacheron::{
    backend::{CachingBackend, SupportedFeatures},
    enhancer::EventRelay,
    error::{CacheError, CacheResult, StorageError},
    events::{BackendEvent, BackendId, EventHub},
    item::{CacheItem, CacheValue, ClearOptions},
    memory::MemoryCachingBackend,
    two_layer::TwoLayerCacheValue,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// 模拟远端后端
///
/// 内部使用内存后端保存数据，可以切换阻塞标志、注入写入失败，
/// 以及以任意来源发布事件（模拟对端造成的删除）。
pub struct FakeRemoteBackend {
    id: BackendId,
    store: Arc<MemoryCachingBackend>,
    blocking: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicU64,
    shutdowns: AtomicU64,
    events: Arc<EventHub>,
    _relay: EventRelay,
}

impl FakeRemoteBackend {
    pub fn new(blocking: bool) -> Self {
        let id = BackendId::new();
        let store = Arc::new(MemoryCachingBackend::new());
        let store_id = store.id();
        let events = Arc::new(EventHub::new(256));
        let relay = EventRelay::start(
            "FakeRemoteBackend",
            store.as_ref(),
            Arc::clone(&events),
            move |event| Some(event.reattributed(store_id, id)),
        );

        Self {
            id,
            store,
            blocking: AtomicBool::new(blocking),
            fail_writes: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            shutdowns: AtomicU64::new(0),
            events,
            _relay: relay,
        }
    }

    pub fn blocking() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    pub fn non_blocking() -> Arc<Self> {
        Arc::new(Self::new(false))
    }

    /// 直接访问远端存储（绕过两级缓存）
    pub fn store(&self) -> &MemoryCachingBackend {
        &self.store
    }

    /// 模拟延迟落地的写入：直接写入指定时间戳的包装值
    pub fn write_wrapped(&self, key: &str, value: i64, timestamp: DateTime<Utc>) {
        let item = CacheItem::new(value);
        let wrapped = TwoLayerCacheValue::new(&item, timestamp)
            .to_remote_item(Vec::new())
            .unwrap();
        self.store.set_item(key, wrapped).unwrap();
    }

    /// 以指定来源发布事件
    pub fn inject(&self, event: BackendEvent) {
        self.events.publish(event);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> u64 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> CacheResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError("remote unavailable".to_string()).into());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CachingBackend for FakeRemoteBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            blocking: self.blocking.load(Ordering::SeqCst),
            contains_dependency: true,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()> {
        self.check_write()?;
        self.store.set_item(key, item)
    }

    fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>> {
        self.store.get_item(key, include_dependencies)
    }

    fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.check_write()?;
        self.store.remove_item(key)
    }

    fn contains_item(&self, key: &str) -> CacheResult<bool> {
        self.store.contains_item(key)
    }

    fn invalidate_dependency(&self, key: &str) -> CacheResult<()> {
        self.check_write()?;
        self.store.invalidate_dependency(key)
    }

    fn contains_dependency(&self, key: &str) -> CacheResult<bool> {
        self.store.contains_dependency(key)
    }

    fn clear(&self, options: ClearOptions) -> CacheResult<()> {
        self.store.clear(options)
    }

    async fn shutdown(&self) -> CacheResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.store.shutdown().await
    }
}

/// 轮询直到条件成立或超时
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// 在给定时间窗口内收集事件
pub async fn collect_events(
    receiver: &mut broadcast::Receiver<BackendEvent>,
    window: Duration,
) -> Vec<BackendEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, receiver.recv()).await {
        events.push(event);
    }
    events
}

/// 等待指定时间（简化测试代码）
pub async fn wait_millis(ms: u64) {
    sleep(Duration::from_millis(ms)).await;
}

/// 断言结果为Ok
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// 断言结果为Err
pub fn assert_err<T, E: std::fmt::Debug>(result: Result<T, E>) -> E {
    match result {
        Ok(_) => panic!("Expected Err, got Ok"),
        Err(e) => e,
    }
}

/// 判断是否为存储错误
pub fn is_storage_error(error: &CacheError) -> bool {
    matches!(error, CacheError::StorageError(_))
}
