//! 配置模块
//!
//! 定义缓存后端栈的配置结构，支持从 YAML / TOML 加载。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::constants::{
    DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_MEMORY_CAPACITY,
    DEFAULT_REMOVED_ITEM_TRANSITION_PERIOD_SECS,
};
use crate::error::{CacheError, CacheResult};
use crate::memory::MemoryBackendConfig;
use crate::two_layer::TwoLayerConfig;

/// 缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachingConfig {
    pub version: String,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// 两级缓存（需要提供远端后端）
    #[serde(default)]
    pub two_layer: Option<TwoLayerSection>,
    /// 是否在最外层包装非阻塞增强器
    #[serde(default)]
    pub non_blocking: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            memory: MemoryConfig::default(),
            two_layer: None,
            non_blocking: false,
        }
    }
}

impl CachingConfig {
    /// 从YAML字符串解析
    pub fn from_yaml_str(yaml: &str) -> CacheResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// 从TOML字符串解析
    pub fn from_toml_str(toml: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载，按扩展名选择格式
    pub fn from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        debug!("加载缓存配置: {}", path.display());

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(CacheError::ConfigError(format!(
                "不支持的配置文件格式: {:?}",
                other
            ))),
        }
    }

    /// 校验配置
    pub fn validate(&self) -> CacheResult<()> {
        if self.version.is_empty() {
            return Err(CacheError::ConfigError("版本号不能为空".to_string()));
        }

        self.memory
            .validate()
            .map_err(|e| CacheError::ConfigError(format!("memory: {}", e)))?;

        if let Some(two_layer) = &self.two_layer {
            two_layer
                .validate()
                .map_err(|e| CacheError::ConfigError(format!("two_layer: {}", e)))?;
        }

        Ok(())
    }
}

/// 内存后端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// 容量（0表示不限制）
    pub capacity: usize,
    pub cleanup_interval_secs: u64,
    pub event_channel_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cleanup_interval_secs == 0 {
            return Err("清理间隔必须大于0".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err("事件通道容量必须大于0".to_string());
        }
        Ok(())
    }

    pub fn to_backend_config(&self) -> MemoryBackendConfig {
        MemoryBackendConfig::new()
            .capacity(self.capacity)
            .cleanup_interval(Duration::from_secs(self.cleanup_interval_secs))
            .event_channel_capacity(self.event_channel_capacity)
    }
}

/// 两级缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoLayerSection {
    /// 本地墓碑保留时长
    pub removed_item_transition_period_secs: u64,
    /// 远端是否包装为非阻塞后端
    pub non_blocking_remote: bool,
}

impl Default for TwoLayerSection {
    fn default() -> Self {
        Self {
            removed_item_transition_period_secs: DEFAULT_REMOVED_ITEM_TRANSITION_PERIOD_SECS,
            non_blocking_remote: false,
        }
    }
}

impl TwoLayerSection {
    pub fn validate(&self) -> Result<(), String> {
        if self.removed_item_transition_period_secs == 0 {
            return Err("墓碑保留时长必须大于0".to_string());
        }
        Ok(())
    }

    pub fn to_two_layer_config(&self) -> TwoLayerConfig {
        TwoLayerConfig::new().removed_item_transition_period(Duration::from_secs(
            self.removed_item_transition_period_secs,
        ))
    }
}
