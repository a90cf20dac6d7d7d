//! 非阻塞增强器集成测试
//!
//! 测试后台写入顺序、失败处理和关闭流程

use crate::common::*;
use cacheron::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn enhancer(remote: &Arc<FakeRemoteBackend>) -> NonBlockingCachingBackendEnhancer {
    NonBlockingCachingBackendEnhancer::new(remote.clone()).unwrap()
}

/// 混合操作按提交顺序执行
#[tokio::test]
async fn test_mixed_operations_keep_submission_order() {
    let remote = FakeRemoteBackend::blocking();
    let cache = enhancer(&remote);

    cache
        .set_item("k", CacheItem::new(1).with_dependencies(["d"]))
        .unwrap();
    cache.invalidate_dependency("d").unwrap();
    cache.set_item("k", CacheItem::new(2)).unwrap();
    cache.remove_item("other").unwrap();
    cache.drain().await.unwrap();

    let value = remote.store().get_item("k", false).unwrap().unwrap();
    assert_eq!(value.value, json!(2));
    assert_eq!(remote.writes(), 4);
    assert_eq!(cache.scheduler_stats().completed(), 4);
}

/// 后台失败只记录，不影响后续任务
#[tokio::test]
async fn test_background_failure_recorded() {
    let remote = FakeRemoteBackend::blocking();
    let cache = enhancer(&remote);

    remote.set_fail_writes(true);
    assert_ok(cache.set_item("lost", CacheItem::new(1)));
    cache.drain().await.unwrap();
    remote.set_fail_writes(false);

    cache.set_item("kept", CacheItem::new(2)).unwrap();
    cache.drain().await.unwrap();

    let stats = cache.scheduler_stats();
    assert_eq!(stats.failed(), 1);
    assert_eq!(stats.completed(), 1);
    assert_eq!(stats.pending(), 0);
    assert!(stats.last_error().is_some());
    assert!(!remote.store().contains_item("lost").unwrap());
    assert!(remote.store().contains_item("kept").unwrap());
}

/// 读取直接转发到底层
#[tokio::test]
async fn test_reads_forwarded() {
    let remote = FakeRemoteBackend::blocking();
    let cache = enhancer(&remote);
    remote
        .store()
        .set_item("k", CacheItem::new("v").with_dependencies(["d"]))
        .unwrap();

    assert_eq!(
        cache.get_item("k", false).unwrap().unwrap().value,
        json!("v")
    );
    assert!(cache.contains_item("k").unwrap());
    assert!(cache.contains_dependency("d").unwrap());
    assert!(!cache.supported_features().blocking);
}

/// 底层事件改记为增强器来源，对端事件保持原来源
#[tokio::test]
async fn test_event_attribution() {
    let remote = FakeRemoteBackend::blocking();
    let cache = enhancer(&remote);
    let mut receiver = cache.subscribe();

    cache
        .set_item("k", CacheItem::new(1).with_dependencies(["d"]))
        .unwrap();
    cache.invalidate_dependency("d").unwrap();
    cache.drain().await.unwrap();
    // 等待底层事件经过两级转发
    wait_millis(50).await;

    let peer = BackendId::new();
    remote.inject(BackendEvent::DependencyInvalidated {
        key: "peer-dep".to_string(),
        source_id: peer,
    });

    let events = collect_events(&mut receiver, Duration::from_millis(100)).await;
    assert_eq!(
        events,
        vec![
            BackendEvent::ItemRemoved {
                key: "k".to_string(),
                reason: ItemRemovedReason::Invalidated,
                source_id: cache.id(),
            },
            BackendEvent::DependencyInvalidated {
                key: "d".to_string(),
                source_id: cache.id(),
            },
            BackendEvent::DependencyInvalidated {
                key: "peer-dep".to_string(),
                source_id: peer,
            },
        ]
    );
}

/// 关闭时先执行完队列，之后拒绝新写入并关闭底层
#[tokio::test]
async fn test_shutdown_drains_then_closes_underlying() {
    let remote = FakeRemoteBackend::blocking();
    let cache = enhancer(&remote);

    for i in 0..100 {
        cache.set_item(&format!("k{}", i), CacheItem::new(i)).unwrap();
    }
    cache.shutdown().await.unwrap();

    assert!(remote.store().contains_item("k99").unwrap());
    assert_eq!(remote.shutdowns(), 1);

    let error = assert_err(cache.set_item("late", CacheItem::new(0)));
    assert!(matches!(error, CacheError::Disposed(_)));
    // 重复关闭只再次关闭底层
    assert_ok(cache.shutdown().await);
}

/// 多线程运行时中同步关闭会等待队列
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_in_multi_thread_runtime() {
    let remote = FakeRemoteBackend::blocking();
    let cache = enhancer(&remote);
    for i in 0..50 {
        cache.set_item("k", CacheItem::new(i)).unwrap();
    }

    cache.dispose().unwrap();

    let value = remote.store().get_item("k", false).unwrap().unwrap();
    assert_eq!(value.value, json!(49));
}

/// 单线程运行时中同步关闭被拒绝，队列和底层保持可用
#[tokio::test]
async fn test_dispose_in_current_thread_runtime_rejected() {
    let remote = FakeRemoteBackend::blocking();
    let cache = enhancer(&remote);
    cache.set_item("k", CacheItem::new(1)).unwrap();

    let error = assert_err(cache.dispose());
    assert!(matches!(error, CacheError::NotSupported(_)));
    assert_eq!(remote.shutdowns(), 0);

    assert_ok(cache.shutdown().await);
    assert!(remote.store().contains_item("k").unwrap());
    assert_eq!(remote.shutdowns(), 1);
}

/// 已取消的令牌在入队前被拒绝
#[tokio::test]
async fn test_cancelled_async_write_not_enqueued() {
    let remote = FakeRemoteBackend::blocking();
    let cache = enhancer(&remote);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = assert_err(cache.remove_item_async("k", &cancel).await);
    assert!(matches!(error, CacheError::Cancelled));
    assert_eq!(cache.scheduler_stats().submitted(), 0);
}

/// 两级缓存叠加在非阻塞远端之上
#[tokio::test]
async fn test_two_layer_over_non_blocking_remote() {
    let remote = FakeRemoteBackend::blocking();
    let queued = Arc::new(enhancer(&remote));
    let cache = TwoLayerCachingBackendEnhancer::new(MemoryCachingBackend::new(), queued.clone());

    cache.set_item("k", CacheItem::new(1)).unwrap();
    cache.remove_item("k").unwrap();
    queued.drain().await.unwrap();

    assert!(cache.local_cache().get_entry("k").unwrap().is_tombstone());
    assert!(!remote.store().contains_item("k").unwrap());
    assert!(cache.get_item("k", false).unwrap().is_none());
}
