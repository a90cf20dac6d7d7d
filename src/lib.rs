//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Cacheron - Composable Caching Backends
//!
//! Provides an in-process caching backend with dependency invalidation and
//! enhancers that stack on top of any backend.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use cacheron::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`CachingBackend`] - Contract shared by every backend and enhancer
//! - [`MemoryCachingBackend`] - In-process store with a dependency index
//! - [`CacheItem`] / [`CacheValue`] - What callers write and read
//! - [`BackendEvent`] - `ItemRemoved` / `DependencyInvalidated` notifications
//! - [`CacheError`] - Error types
//!
//! ## Enhancers
//!
//! - [`TwoLayerCachingBackendEnhancer`] - Local memory cache in front of a remote backend
//! - [`NonBlockingCachingBackendEnhancer`] - Writes queued on a background scheduler
//! - [`InvalidationBroker`] - Propagates removals to peer instances over a transport
//!
//! # Examples
//!
//! ```rust
//! use cacheron::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let remote: Arc<dyn CachingBackend> = Arc::new(MemoryCachingBackend::new());
//!     let cache = TwoLayerCachingBackendEnhancer::new(MemoryCachingBackend::new(), remote);
//!
//!     cache.set_item("user:1", CacheItem::new("alice").with_dependencies(["users"]))?;
//!     assert!(cache.contains_item("user:1")?);
//!
//!     cache.invalidate_dependency("users")?;
//!     assert!(cache.get_item("user:1", false)?.is_none());
//!
//!     cache.shutdown().await
//! }
//! ```
//!
//! # Features
//!
//! - **Dependency invalidation**: invalidating a dependency key removes every item that declared it
//! - **Per-key serialization**: writers of one key never race on its dependency bookkeeping
//! - **Two-layer reconciliation**: tombstones and write timestamps hide stale remote writes
//! - **Non-blocking writes**: FIFO background scheduler with drain-on-shutdown
//! - **Echo suppression**: every event carries the id of the instance that caused it

pub mod prelude;

pub mod backend;
pub mod config;
pub mod constants;
pub mod enhancer;
pub mod error;
pub mod events;
pub mod invalidation;
pub mod item;
pub mod memory;
pub mod non_blocking;
pub mod scheduler;
pub mod services;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod two_layer;

// 重新导出常用类型
pub use backend::{CachingBackend, SupportedFeatures};
pub use config::{CachingConfig, MemoryConfig, TwoLayerSection};
pub use enhancer::{CachingBackendEnhancer, EventRelay};
pub use error::{CacheError, CacheResult, StorageError};
pub use events::{BackendEvent, BackendId, EventHub, ItemRemovedReason};
pub use invalidation::{
    BrokerStats, InMemoryTransport, InvalidationBroker, InvalidationKind, InvalidationMessage,
    InvalidationTransport,
};
pub use item::{
    CacheItem, CacheItemConfiguration, CacheItemPriority, CachePayload, CacheValue, ClearOptions,
};
pub use memory::{
    MemoryBackendConfig, MemoryBackendStats, MemoryCacheContent, MemoryCacheValue,
    MemoryCachingBackend,
};
pub use non_blocking::NonBlockingCachingBackendEnhancer;
pub use scheduler::{BackgroundTaskScheduler, SchedulerStats};
pub use services::{build_backend, CachingServices};
#[cfg(feature = "telemetry")]
pub use telemetry::{init_tracing, TelemetryConfig};
pub use tokio_util::sync::CancellationToken;
pub use two_layer::{TwoLayerCacheValue, TwoLayerCachingBackendEnhancer, TwoLayerConfig};
