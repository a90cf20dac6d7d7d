//! 缓存项数据模型
//!
//! 定义调用方构造的 [`CacheItem`]、存储后返回的只读视图 [`CacheValue`]
//! 以及过期/优先级配置。

use ahash::AHashSet as HashSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::DEFAULT_CLEAR_TRIM_PERCENT;

/// 缓存负载（不透明值）
pub type CachePayload = serde_json::Value;

/// 缓存项优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheItemPriority {
    #[default]
    Default,
    Low,
    High,
    /// 不会因容量压力或 trim 被淘汰，只会过期或被显式删除
    NotRemovable,
}

/// 缓存项配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheItemConfiguration {
    /// 绝对过期时间（从写入时刻起算）
    pub absolute_expiration: Option<Duration>,
    /// 滑动过期时间（每次读取后重新计时）
    pub sliding_expiration: Option<Duration>,
    /// 优先级
    #[serde(default)]
    pub priority: CacheItemPriority,
}

impl CacheItemConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absolute_expiration(mut self, ttl: Duration) -> Self {
        self.absolute_expiration = Some(ttl);
        self
    }

    pub fn sliding_expiration(mut self, ttl: Duration) -> Self {
        self.sliding_expiration = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: CacheItemPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// 调用方构造的缓存项
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    /// 缓存值
    pub value: CachePayload,
    /// 依赖键（去重，顺序无关）
    pub dependencies: Vec<String>,
    /// 可选配置
    pub configuration: Option<CacheItemConfiguration>,
}

impl CacheItem {
    /// 创建不带依赖和配置的缓存项
    pub fn new(value: impl Into<CachePayload>) -> Self {
        Self {
            value: value.into(),
            dependencies: Vec::new(),
            configuration: None,
        }
    }

    /// 设置依赖键，重复的依赖会被合并
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dedup_dependencies(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_configuration(mut self, configuration: CacheItemConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub(crate) fn normalized_dependencies(&self) -> Vec<String> {
        dedup_dependencies(self.dependencies.iter().cloned())
    }
}

fn dedup_dependencies(dependencies: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    dependencies.filter(|d| seen.insert(d.clone())).collect()
}

/// 存储后返回的缓存值
#[derive(Debug, Clone, PartialEq)]
pub struct CacheValue {
    pub value: CachePayload,
    pub dependencies: Vec<String>,
}

impl CacheValue {
    pub fn new(value: CachePayload, dependencies: Vec<String>) -> Self {
        Self {
            value,
            dependencies,
        }
    }

    /// 返回不含依赖信息的副本
    pub(crate) fn without_dependencies(&self) -> Self {
        Self {
            value: self.value.clone(),
            dependencies: Vec::new(),
        }
    }
}

/// Clear 选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOptions {
    /// 需要裁剪的可淘汰条目百分比（1-100）
    pub trim_percent: u8,
}

impl Default for ClearOptions {
    fn default() -> Self {
        Self {
            trim_percent: DEFAULT_CLEAR_TRIM_PERCENT,
        }
    }
}

impl ClearOptions {
    pub fn trim(percent: u8) -> Self {
        Self {
            trim_percent: percent.clamp(1, 100),
        }
    }
}
