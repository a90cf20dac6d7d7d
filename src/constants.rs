//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Cacheron.
//!
//! This module provides well-documented constants used throughout the library.
//! All magic numbers are defined here with their purpose and usage context.

// ============================================================================
// Memory Backend Constants
// ============================================================================

/// Default capacity for the memory backend (0 means unbounded).
///
/// When non-zero, inserting beyond this many entries evicts the least
/// recently accessed removable entries.
pub const DEFAULT_MEMORY_CAPACITY: usize = 0;

/// Default cleanup interval for the memory backend (30 seconds).
///
/// How often the background task sweeps expired entries.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 30;

/// Default capacity of a backend's event broadcast channel.
///
/// Slow subscribers that fall further behind than this lose the oldest events
/// and observe a `Lagged` notification.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Default trim percentage used by `clear` (100%).
pub const DEFAULT_CLEAR_TRIM_PERCENT: u8 = 100;

// ============================================================================
// Two-Layer Enhancer Constants
// ============================================================================

/// Default lifetime of a local tombstone (1 minute).
///
/// Long enough for an in-flight remote write issued before a removal to land,
/// after which the tombstone expires like any other entry.
pub const DEFAULT_REMOVED_ITEM_TRANSITION_PERIOD_SECS: u64 = 60;

// ============================================================================
// Background Scheduler Constants
// ============================================================================

/// Timeout of the synchronous `dispose` drain when it is called outside any
/// runtime (30 seconds).
pub const DEFAULT_DISPOSE_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Invalidation Broker Constants
// ============================================================================

/// Default pub/sub topic carrying invalidation messages.
pub const DEFAULT_INVALIDATION_TOPIC: &str = "cacheron.invalidation";

/// Default capacity of an in-memory transport topic.
pub const DEFAULT_TRANSPORT_CHANNEL_CAPACITY: usize = 1024;
