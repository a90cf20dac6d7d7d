//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 缓存后端接口
//!
//! 所有后端与增强器都实现 [`CachingBackend`]。每个操作都有同步形式和
//! 接受 [`CancellationToken`] 的异步形式；默认的异步实现先检查取消
//! 信号再委托给同步形式，真正进行 IO 的后端应覆盖异步形式。

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};
use crate::events::{BackendEvent, BackendId};
use crate::item::{CacheItem, CacheValue, ClearOptions};

/// 后端能力描述
///
/// 组合增强器根据这些标志选择行为，而不是假设底层后端的语义。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedFeatures {
    /// 写操作在调用返回前是否已生效
    pub blocking: bool,
    /// 是否可以低成本地查询依赖是否存在
    pub contains_dependency: bool,
}

impl Default for SupportedFeatures {
    fn default() -> Self {
        Self {
            blocking: true,
            contains_dependency: true,
        }
    }
}

/// 缓存后端接口
#[async_trait]
pub trait CachingBackend: Send + Sync {
    /// 实例唯一标识，会写入该实例发布的所有事件
    fn id(&self) -> BackendId;

    /// 能力描述
    fn supported_features(&self) -> SupportedFeatures;

    /// 订阅 `ItemRemoved` / `DependencyInvalidated` 事件
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;

    /// 写入缓存项
    fn set_item(&self, key: &str, item: CacheItem) -> CacheResult<()>;

    /// 读取缓存项
    fn get_item(&self, key: &str, include_dependencies: bool) -> CacheResult<Option<CacheValue>>;

    /// 删除缓存项；键不存在时静默成功
    fn remove_item(&self, key: &str) -> CacheResult<()>;

    /// 检查缓存项是否存在
    fn contains_item(&self, key: &str) -> CacheResult<bool>;

    /// 使依赖失效，移除所有依赖它的缓存项
    fn invalidate_dependency(&self, key: &str) -> CacheResult<()>;

    /// 检查依赖是否存在
    fn contains_dependency(&self, key: &str) -> CacheResult<bool>;

    /// 清空缓存（尽力而为）
    fn clear(&self, options: ClearOptions) -> CacheResult<()>;

    async fn set_item_async(
        &self,
        key: &str,
        item: CacheItem,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        self.set_item(key, item)
    }

    async fn get_item_async(
        &self,
        key: &str,
        include_dependencies: bool,
        cancel: &CancellationToken,
    ) -> CacheResult<Option<CacheValue>> {
        ensure_not_cancelled(cancel)?;
        self.get_item(key, include_dependencies)
    }

    async fn remove_item_async(&self, key: &str, cancel: &CancellationToken) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        self.remove_item(key)
    }

    async fn contains_item_async(&self, key: &str, cancel: &CancellationToken) -> CacheResult<bool> {
        ensure_not_cancelled(cancel)?;
        self.contains_item(key)
    }

    async fn invalidate_dependency_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        self.invalidate_dependency(key)
    }

    async fn contains_dependency_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> CacheResult<bool> {
        ensure_not_cancelled(cancel)?;
        self.contains_dependency(key)
    }

    async fn clear_async(&self, options: ClearOptions, cancel: &CancellationToken) -> CacheResult<()> {
        ensure_not_cancelled(cancel)?;
        self.clear(options)
    }

    /// 异步关闭：停止后台任务并等待未完成的工作。重复调用无副作用。
    async fn shutdown(&self) -> CacheResult<()> {
        Ok(())
    }

    /// 同步关闭，语义同 [`CachingBackend::shutdown`]
    fn dispose(&self) -> CacheResult<()> {
        Ok(())
    }
}

/// 取消信号已触发时返回 [`CacheError::Cancelled`]
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> CacheResult<()> {
    if cancel.is_cancelled() {
        Err(CacheError::Cancelled)
    } else {
        Ok(())
    }
}
