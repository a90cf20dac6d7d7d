//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。

use thiserror::Error;

/// 缓存后端错误类型
#[derive(Error, Debug)]
pub enum CacheError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 当前配置下不支持的操作
    #[error("不支持的操作: {0}")]
    NotSupported(String),

    /// 操作被取消
    #[error("操作已取消")]
    Cancelled,

    /// 后端或调度器已关闭
    #[error("组件已关闭: {0}")]
    Disposed(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// 后台任务错误
    #[error("后台任务错误: {0}")]
    TaskError(String),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// 远端存储 / 传输层错误
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

/// 结果类型别名
pub type CacheResult<T> = Result<T, CacheError>;
