//! 内存后端集成测试
//!
//! 测试依赖失效、事件和并发写入

use crate::common::*;
use cacheron::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// 失效一个依赖只移除依赖它的条目
#[tokio::test]
async fn test_invalidation_removes_only_members() {
    let backend = MemoryCachingBackend::new();
    backend
        .set_item("a", CacheItem::new(1).with_dependencies(["d1"]))
        .unwrap();
    backend
        .set_item("b", CacheItem::new(2).with_dependencies(["d1", "d2"]))
        .unwrap();
    backend
        .set_item("c", CacheItem::new(3).with_dependencies(["d2"]))
        .unwrap();

    backend.invalidate_dependency("d1").unwrap();

    assert!(!backend.contains_item("a").unwrap());
    assert!(!backend.contains_item("b").unwrap());
    assert!(backend.contains_item("c").unwrap());
    assert!(!backend.contains_dependency("d1").unwrap());
    // b 被移除后 d2 只剩 c
    assert!(backend.contains_dependency("d2").unwrap());

    backend.remove_item("c").unwrap();
    assert!(!backend.contains_dependency("d2").unwrap());
    assert_eq!(backend.dependency_count(), 0);
}

/// 覆盖写入时旧依赖被替换
#[tokio::test]
async fn test_overwrite_moves_item_between_dependencies() {
    let backend = MemoryCachingBackend::new();
    backend
        .set_item("k", CacheItem::new("v1").with_dependencies(["old"]))
        .unwrap();
    backend
        .set_item("k", CacheItem::new("v2").with_dependencies(["new"]))
        .unwrap();

    backend.invalidate_dependency("old").unwrap();
    let value = backend.get_item("k", true).unwrap().unwrap();
    assert_eq!(value.value, json!("v2"));
    assert_eq!(value.dependencies, vec!["new".to_string()]);

    backend.invalidate_dependency("new").unwrap();
    assert!(backend.get_item("k", false).unwrap().is_none());
}

/// 失效事件携带本实例的标识
#[tokio::test]
async fn test_invalidation_events_carry_backend_id() {
    let backend = MemoryCachingBackend::new();
    let mut receiver = backend.subscribe();
    backend
        .set_item("k", CacheItem::new(1).with_dependencies(["d"]))
        .unwrap();

    backend.invalidate_dependency("d").unwrap();

    let events = collect_events(&mut receiver, Duration::from_millis(50)).await;
    assert_eq!(
        events,
        vec![
            BackendEvent::ItemRemoved {
                key: "k".to_string(),
                reason: ItemRemovedReason::Invalidated,
                source_id: backend.id(),
            },
            BackendEvent::DependencyInvalidated {
                key: "d".to_string(),
                source_id: backend.id(),
            },
        ]
    );
}

/// 过期条目读取不到并发布过期事件
#[tokio::test]
async fn test_absolute_expiration() {
    let backend = MemoryCachingBackend::new();
    let mut receiver = backend.subscribe();
    backend
        .set_item(
            "short",
            CacheItem::new(1)
                .with_configuration(
                    CacheItemConfiguration::new().absolute_expiration(Duration::from_millis(30)),
                ),
        )
        .unwrap();
    assert!(backend.contains_item("short").unwrap());

    wait_millis(80).await;
    assert!(backend.get_item("short", false).unwrap().is_none());

    let events = collect_events(&mut receiver, Duration::from_millis(50)).await;
    assert!(events.iter().any(|event| matches!(
        event,
        BackendEvent::ItemRemoved {
            reason: ItemRemovedReason::Expired,
            ..
        }
    )));
}

/// 异步形式在取消后拒绝执行
#[tokio::test]
async fn test_async_forms_respect_cancellation() {
    let backend = MemoryCachingBackend::new();
    let cancel = CancellationToken::new();
    backend
        .set_item_async("k", CacheItem::new(1), &cancel)
        .await
        .unwrap();
    assert!(backend.contains_item_async("k", &cancel).await.unwrap());

    cancel.cancel();
    let error = assert_err(backend.get_item_async("k", false, &cancel).await);
    assert!(matches!(error, CacheError::Cancelled));
    // 取消不影响已写入的数据
    assert!(backend.contains_item("k").unwrap());
}

/// 同一依赖下的并发写入与失效不会遗留索引
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_and_invalidations() {
    let backend = Arc::new(MemoryCachingBackend::new());

    let mut handles = Vec::new();
    for worker in 0..4 {
        let backend = Arc::clone(&backend);
        handles.push(tokio::task::spawn_blocking(move || {
            for i in 0..500 {
                let key = format!("k{}", (i + worker) % 16);
                if i % 7 == 0 {
                    backend.invalidate_dependency("shared").unwrap();
                } else {
                    backend
                        .set_item(&key, CacheItem::new(i).with_dependencies(["shared"]))
                        .unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    backend.invalidate_dependency("shared").unwrap();
    assert!(backend.is_empty());
    assert_eq!(backend.dependency_count(), 0);
}

/// 统计信息
#[tokio::test]
async fn test_stats() {
    let backend = MemoryCachingBackend::new();
    backend.set_item("k", CacheItem::new(1)).unwrap();
    backend.get_item("k", false).unwrap();
    backend.get_item("missing", false).unwrap();
    backend.remove_item("k").unwrap();

    let stats = backend.stats();
    assert_eq!(stats.writes(), 1);
    assert_eq!(stats.hits(), 1);
    assert_eq!(stats.misses(), 1);
    assert_eq!(stats.removals(), 1);
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}
