//! 内存后端中实际存储的值
//!
//! 每个值都携带所属逻辑键的同步锁 `sync`。覆盖写入时新值沿用旧值的
//! `sync`，只有键被硬删除后才会创建新的锁对象。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::item::CacheValue;

/// 每个逻辑键独占的锁对象
pub(crate) type KeySync = Arc<Mutex<()>>;

/// 存储内容：普通值或墓碑
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryCacheContent {
    Item(CacheValue),
    /// 删除标记，记录删除时间
    Removed { timestamp: DateTime<Utc> },
}

/// 内存后端存储的值
#[derive(Debug)]
pub struct MemoryCacheValue {
    content: MemoryCacheContent,
    sync: KeySync,
}

impl MemoryCacheValue {
    pub(crate) fn new(content: MemoryCacheContent, sync: KeySync) -> Self {
        Self { content, sync }
    }

    pub fn content(&self) -> &MemoryCacheContent {
        &self.content
    }

    /// 普通值；墓碑返回 None
    pub fn value(&self) -> Option<&CacheValue> {
        match &self.content {
            MemoryCacheContent::Item(value) => Some(value),
            MemoryCacheContent::Removed { .. } => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.content, MemoryCacheContent::Removed { .. })
    }

    /// 墓碑的删除时间
    pub fn removed_at(&self) -> Option<DateTime<Utc>> {
        match &self.content {
            MemoryCacheContent::Removed { timestamp } => Some(*timestamp),
            MemoryCacheContent::Item(_) => None,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        match &self.content {
            MemoryCacheContent::Item(value) => &value.dependencies,
            MemoryCacheContent::Removed { .. } => &[],
        }
    }

    /// 是否与 `other` 共享同一把键锁
    pub fn shares_sync_with(&self, other: &MemoryCacheValue) -> bool {
        Arc::ptr_eq(&self.sync, &other.sync)
    }

    pub(crate) fn sync(&self) -> &KeySync {
        &self.sync
    }

    pub(crate) fn into_content(self) -> MemoryCacheContent {
        self.content
    }
}
