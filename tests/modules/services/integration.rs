//! 缓存服务集成测试
//!
//! 从配置文件构建后端栈并统一关闭

use crate::common::*;
use cacheron::prelude::*;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;

fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

/// 从YAML文件构建两级缓存栈
#[tokio::test]
async fn test_services_from_yaml_file() {
    let file = write_config(
        ".yaml",
        r#"
version: "1.0"
memory:
  capacity: 100
two_layer:
  removed_item_transition_period_secs: 5
"#,
    );
    let config = CachingConfig::from_file(file.path()).unwrap();
    let remote = FakeRemoteBackend::blocking();

    let shared: Arc<dyn CachingBackend> = remote.clone();
    let services = CachingServices::from_config(&config, Some(shared)).unwrap();
    let cache = services.default_backend();
    assert!(cache.supported_features().blocking);

    cache
        .set_item("k", CacheItem::new("v").with_dependencies(["d"]))
        .unwrap();
    assert!(remote.store().contains_item("k").unwrap());
    assert_eq!(cache.get_item("k", false).unwrap().unwrap().value, json!("v"));

    cache.invalidate_dependency("d").unwrap();
    assert!(!remote.store().contains_item("k").unwrap());

    services.shutdown().await.unwrap();
    assert_eq!(remote.shutdowns(), 1);
}

/// 从TOML文件构建非阻塞栈
#[tokio::test]
async fn test_services_from_toml_file() {
    let file = write_config(
        ".toml",
        r#"
version = "1.0"
non_blocking = true

[two_layer]
non_blocking_remote = true
"#,
    );
    let config = CachingConfig::from_file(file.path()).unwrap();
    let remote = FakeRemoteBackend::blocking();

    let shared: Arc<dyn CachingBackend> = remote.clone();
    let services = CachingServices::from_config(&config, Some(shared)).unwrap();
    let cache = services.default_backend();
    assert!(!cache.supported_features().blocking);

    cache.set_item("k", CacheItem::new(1)).unwrap();
    services.shutdown().await.unwrap();

    // 关闭会等待两层后台队列执行完毕
    assert!(remote.store().contains_item("k").unwrap());
    assert_eq!(remote.shutdowns(), 1);
}

/// 未知扩展名和无效内容
#[tokio::test]
async fn test_invalid_config_files() {
    let unknown = write_config(".ini", "version = 1");
    let error = assert_err(CachingConfig::from_file(unknown.path()));
    assert!(matches!(error, CacheError::ConfigError(_)));

    let invalid = write_config(
        ".yml",
        r#"
version: "1.0"
memory:
  cleanup_interval_secs: 0
"#,
    );
    assert!(CachingConfig::from_file(invalid.path()).is_err());

    let missing = CachingConfig::from_file("/nonexistent/cacheron.yaml");
    assert!(matches!(missing, Err(CacheError::IoError(_))));
}

/// 命名后端与默认后端共享时只关闭一次
#[tokio::test]
async fn test_shared_backend_closed_once() {
    let remote = FakeRemoteBackend::blocking();
    let services = CachingServices::init(remote.clone());
    services.register("sessions", remote.clone()).unwrap();
    services
        .register("local", Arc::new(MemoryCachingBackend::new()))
        .unwrap();
    assert_eq!(services.backend_names(), vec!["local", "sessions"]);

    services.shutdown().await.unwrap();
    services.shutdown().await.unwrap();
    assert_eq!(remote.shutdowns(), 1);

    let error = assert_err(services.register("late", remote.clone()));
    assert!(matches!(error, CacheError::Disposed(_)));
}
