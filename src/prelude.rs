//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Cacheron,
//! allowing users to import them with a single `use cacheron::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::backend::{CachingBackend, SupportedFeatures};
pub use crate::error::{CacheError, CacheResult};
pub use crate::events::{BackendEvent, BackendId, ItemRemovedReason};
pub use crate::item::{CacheItem, CacheItemConfiguration, CacheItemPriority, CacheValue, ClearOptions};
pub use crate::memory::MemoryCachingBackend;

// Enhancers
pub use crate::enhancer::CachingBackendEnhancer;
pub use crate::non_blocking::NonBlockingCachingBackendEnhancer;
pub use crate::two_layer::TwoLayerCachingBackendEnhancer;

// Wiring
pub use crate::config::CachingConfig;
pub use crate::invalidation::{InMemoryTransport, InvalidationBroker};
pub use crate::services::CachingServices;
pub use tokio_util::sync::CancellationToken;

// Feature-gated exports
#[cfg(feature = "telemetry")]
pub use crate::telemetry::init_tracing;
