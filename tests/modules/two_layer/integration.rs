//! 两级缓存集成测试
//!
//! 使用模拟远端验证本地/远端协调、墓碑和事件回声抑制

use crate::common::*;
use cacheron::prelude::*;
use cacheron::{MemoryBackendConfig, TwoLayerCacheValue, TwoLayerConfig};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn two_layer(remote: &Arc<FakeRemoteBackend>) -> TwoLayerCachingBackendEnhancer {
    TwoLayerCachingBackendEnhancer::new(MemoryCachingBackend::new(), remote.clone())
}

/// 写入同时到达两层，远端保存包装值
#[tokio::test]
async fn test_set_writes_wrapped_value_to_remote() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);

    cache
        .set_item("k", CacheItem::new("v").with_dependencies(["d"]))
        .unwrap();

    let local = cache.local_cache().get_item("k", true).unwrap().unwrap();
    assert_eq!(local.value, json!("v"));
    assert_eq!(local.dependencies, vec!["d".to_string()]);

    let stored = remote.store().get_item("k", true).unwrap().unwrap();
    assert_eq!(stored.dependencies, vec!["d".to_string()]);
    let wrapped = TwoLayerCacheValue::from_remote(&stored).unwrap();
    assert_eq!(wrapped.value, json!("v"));
}

/// 本地未命中时从远端读取并回填
#[tokio::test]
async fn test_remote_hit_repopulates_local() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);
    remote.write_wrapped("k", 7, Utc::now());

    assert!(cache.local_cache().get_item("k", false).unwrap().is_none());
    let value = cache.get_item("k", false).unwrap().unwrap();
    assert_eq!(value.value, json!(7));
    assert!(cache.local_cache().contains_item("k").unwrap());
}

/// 阻塞远端：删除和失效直接作用于两层
#[tokio::test]
async fn test_blocking_remote_hard_deletes() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);
    cache
        .set_item("a", CacheItem::new(1).with_dependencies(["d"]))
        .unwrap();
    cache.set_item("b", CacheItem::new(2)).unwrap();

    cache.remove_item("b").unwrap();
    cache.invalidate_dependency("d").unwrap();

    assert!(cache.local_cache().get_entry("a").is_none());
    assert!(cache.local_cache().get_entry("b").is_none());
    assert!(!remote.store().contains_item("a").unwrap());
    assert!(!remote.store().contains_item("b").unwrap());
    assert!(!cache.contains_dependency("d").unwrap());
}

/// 非阻塞远端：删除后本地留下墓碑，早于删除的远端写入被忽略
#[tokio::test]
async fn test_tombstone_hides_stale_remote_write() {
    let remote = FakeRemoteBackend::non_blocking();
    let cache = two_layer(&remote);
    cache.set_item("k", CacheItem::new(1)).unwrap();

    let before_removal = Utc::now() - ChronoDuration::seconds(1);
    cache.remove_item("k").unwrap();
    assert!(cache.local_cache().get_entry("k").unwrap().is_tombstone());

    // 删除之前发出、之后才落地的远端写入
    remote.write_wrapped("k", 1, before_removal);
    assert!(cache.get_item("k", false).unwrap().is_none());
    assert!(!cache.contains_item("k").unwrap());

    // 删除之后的新写入可见
    remote.write_wrapped("k", 2, Utc::now() + ChronoDuration::seconds(1));
    let value = cache.get_item("k", false).unwrap().unwrap();
    assert_eq!(value.value, json!(2));
    assert!(!cache.local_cache().get_entry("k").unwrap().is_tombstone());
}

/// 非阻塞远端：依赖失效把本地成员替换为墓碑
#[tokio::test]
async fn test_non_blocking_invalidation_installs_tombstones() {
    let remote = FakeRemoteBackend::non_blocking();
    let cache = two_layer(&remote);
    cache
        .set_item("a", CacheItem::new(1).with_dependencies(["d"]))
        .unwrap();

    let before = Utc::now() - ChronoDuration::seconds(1);
    cache.invalidate_dependency("d").unwrap();
    assert!(cache.local_cache().get_entry("a").unwrap().is_tombstone());

    remote.write_wrapped("a", 1, before);
    assert!(cache.get_item("a", false).unwrap().is_none());

    let error = assert_err(cache.contains_dependency("d"));
    assert!(matches!(error, CacheError::NotSupported(_)));
}

/// 本地容量压力不会提前淘汰墓碑
#[tokio::test]
async fn test_tombstone_survives_local_capacity_pressure() {
    let remote = FakeRemoteBackend::non_blocking();
    let local = MemoryCachingBackend::with_config(MemoryBackendConfig::new().capacity(1));
    let cache = TwoLayerCachingBackendEnhancer::new(local, remote.clone());
    cache.set_item("i", CacheItem::new(1)).unwrap();

    let before_removal = Utc::now() - ChronoDuration::seconds(1);
    cache.remove_item("i").unwrap();
    let high = CacheItemConfiguration::new().priority(CacheItemPriority::High);
    cache
        .set_item("j", CacheItem::new(2).with_configuration(high))
        .unwrap();
    assert!(cache.local_cache().get_entry("i").unwrap().is_tombstone());

    remote.write_wrapped("i", 1, before_removal);
    assert!(cache.get_item("i", false).unwrap().is_none());
}

/// 墓碑在过渡期之后过期
#[tokio::test]
async fn test_tombstone_expires_after_transition_period() {
    let remote = FakeRemoteBackend::non_blocking();
    let cache = TwoLayerCachingBackendEnhancer::with_config(
        MemoryCachingBackend::new(),
        remote.clone(),
        TwoLayerConfig::new().removed_item_transition_period(Duration::from_millis(30)),
    );
    cache.set_item("k", CacheItem::new(1)).unwrap();
    cache.remove_item("k").unwrap();
    assert!(cache.local_cache().get_entry("k").is_some());

    wait_millis(80).await;
    cache.local_cache().cleanup_expired();
    assert!(cache.local_cache().get_entry("k").is_none());
}

/// 对端造成的远端删除同步到本地，事件保留对端来源
#[tokio::test]
async fn test_foreign_removal_mirrored_into_local() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);
    let mut receiver = cache.subscribe();
    cache.set_item("k", CacheItem::new(1)).unwrap();

    let peer = BackendId::new();
    remote.store().remove_item("k").unwrap();
    remote.inject(BackendEvent::ItemRemoved {
        key: "k".to_string(),
        reason: ItemRemovedReason::Removed,
        source_id: peer,
    });

    let local = cache.local_cache();
    assert!(wait_until(Duration::from_secs(1), || !local.contains_item("k").unwrap()).await);

    let events = collect_events(&mut receiver, Duration::from_millis(50)).await;
    assert!(events
        .iter()
        .any(|event| event.key() == "k" && event.source_id() == peer));
}

/// 对端依赖失效同步到本地
#[tokio::test]
async fn test_foreign_dependency_invalidation_mirrored() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);
    cache
        .set_item("a", CacheItem::new(1).with_dependencies(["d"]))
        .unwrap();

    remote.inject(BackendEvent::DependencyInvalidated {
        key: "d".to_string(),
        source_id: BackendId::new(),
    });

    let local = cache.local_cache();
    assert!(wait_until(Duration::from_secs(1), || !local.contains_item("a").unwrap()).await);
}

/// 远端自身发布的事件不会回写本地
#[tokio::test]
async fn test_remote_own_events_not_mirrored() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);
    let mut receiver = cache.subscribe();
    cache.set_item("k", CacheItem::new(1)).unwrap();

    remote.inject(BackendEvent::ItemRemoved {
        key: "k".to_string(),
        reason: ItemRemovedReason::Evicted,
        source_id: remote.id(),
    });

    let events = collect_events(&mut receiver, Duration::from_millis(100)).await;
    // 事件被改记为两级缓存的来源
    assert_eq!(
        events,
        vec![BackendEvent::ItemRemoved {
            key: "k".to_string(),
            reason: ItemRemovedReason::Evicted,
            source_id: cache.id(),
        }]
    );
    assert!(cache.local_cache().contains_item("k").unwrap());
}

/// 本实例造成的失效事件以本实例为来源
#[tokio::test]
async fn test_own_invalidation_events_attributed_to_enhancer() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);
    let mut receiver = cache.subscribe();
    cache
        .set_item("a", CacheItem::new(1).with_dependencies(["d"]))
        .unwrap();

    cache.invalidate_dependency("d").unwrap();

    let events = collect_events(&mut receiver, Duration::from_millis(100)).await;
    assert!(!events.is_empty());
    assert!(events.iter().all(|event| event.source_id() == cache.id()));
}

/// 远端写入失败时返回存储错误
#[tokio::test]
async fn test_remote_failure_propagates() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);
    remote.set_fail_writes(true);

    let error = assert_err(cache.set_item("k", CacheItem::new(1)));
    assert!(is_storage_error(&error));
}

/// 关闭时同时关闭远端
#[tokio::test]
async fn test_shutdown_closes_remote() {
    let remote = FakeRemoteBackend::blocking();
    let cache = two_layer(&remote);
    assert_ok(cache.shutdown().await);
    assert_eq!(remote.shutdowns(), 1);
}
