//! 日志初始化模块
//!
//! 为二进制程序和测试安装 `tracing-subscriber` 的 fmt 订阅者。库本身只使用
//! `tracing` 宏，不会主动安装订阅者。
//!
//! # 示例
//!
//! ```rust,no_run
//! use cacheron::telemetry::{init_tracing, TelemetryConfig};
//!
//! init_tracing(&TelemetryConfig::new("cacheron=debug")).unwrap();
//! ```

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::{CacheError, CacheResult};

/// 日志配置
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// `EnvFilter` 语法的过滤规则；设置了 `RUST_LOG` 时以环境变量为准
    pub filter: String,
    /// 是否输出模块路径
    pub with_target: bool,
    /// 是否使用彩色输出
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            with_target: true,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    fn env_filter(&self) -> CacheResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.filter).map_err(|e| {
                CacheError::ConfigError(format!("无效的日志过滤规则 {}: {}", self.filter, e))
            }),
        }
    }
}

/// 安装全局订阅者；已安装过时返回错误
pub fn init_tracing(config: &TelemetryConfig) -> CacheResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(config.env_filter()?)
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .try_init()
        .map_err(|e| CacheError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    info!("日志系统已初始化: filter={}", config.filter);
    Ok(())
}
