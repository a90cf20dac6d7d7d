//! 依赖反向索引
//!
//! 依赖键 -> 依赖它的缓存键集合。每个集合有自己的锁；集合变空时，
//! 持有集合锁的线程把它标记为 retired 并从索引中摘除。并发的 `add`
//! 若拿到了已 retired 的集合，会重新创建一个新集合再插入。

use ahash::AHashSet as HashSet;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct DependencyKeys {
    items: HashSet<String>,
    retired: bool,
}

#[derive(Debug, Default)]
struct DependencyEntry {
    state: Mutex<DependencyKeys>,
}

/// 依赖反向索引
#[derive(Debug, Default)]
pub struct DependencyIndex {
    entries: DashMap<String, Arc<DependencyEntry>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 `item_key` 依赖 `dependency`
    pub fn add(&self, dependency: &str, item_key: &str) {
        loop {
            let entry = Arc::clone(
                self.entries
                    .entry(dependency.to_string())
                    .or_default()
                    .value(),
            );

            let mut state = entry.state.lock();
            if state.retired {
                // 集合刚被清空摘除，重新创建
                trace!("依赖集合已摘除，重试: dependency={}", dependency);
                continue;
            }
            state.items.insert(item_key.to_string());
            return;
        }
    }

    /// 移除 `item_key` 对 `dependency` 的依赖；集合变空时删除整个条目
    pub fn remove(&self, dependency: &str, item_key: &str) {
        let Some(entry) = self.entries.get(dependency).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let mut state = entry.state.lock();
        state.items.remove(item_key);
        if state.items.is_empty() && !state.retired {
            state.retired = true;
            self.entries
                .remove_if(dependency, |_, current| Arc::ptr_eq(current, &entry));
        }
    }

    /// 在集合锁内拍下成员快照
    pub fn snapshot(&self, dependency: &str) -> Option<Vec<String>> {
        let entry = self.entries.get(dependency).map(|e| Arc::clone(e.value()))?;
        let state = entry.state.lock();
        Some(state.items.iter().cloned().collect())
    }

    pub fn contains(&self, dependency: &str) -> bool {
        self.entries.contains_key(dependency)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
