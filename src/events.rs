//! 后端事件
//!
//! 每个后端实例拥有唯一的 [`BackendId`]，并通过 [`EventHub`] 广播
//! `ItemRemoved` / `DependencyInvalidated` 事件。事件上的 `source_id`
//! 用于在组合/分布式后端之间抑制回声。

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// 后端实例标识（跨进程唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendId(Uuid);

impl BackendId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BackendId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 缓存项被移除的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemRemovedReason {
    /// 显式删除
    Removed,
    /// 容量压力或 trim 淘汰
    Evicted,
    /// 过期
    Expired,
    /// 依赖失效
    Invalidated,
    /// 其他原因
    Other,
}

/// 后端事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendEvent {
    ItemRemoved {
        key: String,
        reason: ItemRemovedReason,
        source_id: BackendId,
    },
    DependencyInvalidated {
        key: String,
        source_id: BackendId,
    },
}

impl BackendEvent {
    pub fn key(&self) -> &str {
        match self {
            BackendEvent::ItemRemoved { key, .. } => key,
            BackendEvent::DependencyInvalidated { key, .. } => key,
        }
    }

    pub fn source_id(&self) -> BackendId {
        match self {
            BackendEvent::ItemRemoved { source_id, .. } => *source_id,
            BackendEvent::DependencyInvalidated { source_id, .. } => *source_id,
        }
    }

    /// 来源为 `from` 的事件改记为 `to`，其他来源保持不变
    pub fn reattributed(self, from: BackendId, to: BackendId) -> Self {
        if self.source_id() != from {
            return self;
        }
        match self {
            BackendEvent::ItemRemoved { key, reason, .. } => BackendEvent::ItemRemoved {
                key,
                reason,
                source_id: to,
            },
            BackendEvent::DependencyInvalidated { key, .. } => {
                BackendEvent::DependencyInvalidated { key, source_id: to }
            }
        }
    }
}

/// 事件广播中心
#[derive(Debug)]
pub struct EventHub {
    sender: broadcast::Sender<BackendEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件；没有订阅者时事件被丢弃
    pub fn publish(&self, event: BackendEvent) {
        trace!("发布事件: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn item_removed(&self, key: &str, reason: ItemRemovedReason, source_id: BackendId) {
        self.publish(BackendEvent::ItemRemoved {
            key: key.to_string(),
            reason,
            source_id,
        });
    }

    pub fn dependency_invalidated(&self, key: &str, source_id: BackendId) {
        self.publish(BackendEvent::DependencyInvalidated {
            key: key.to_string(),
            source_id,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
