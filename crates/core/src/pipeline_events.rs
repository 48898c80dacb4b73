//! Event type names published on the pipeline event bus.
//!
//! Shared between the actors that publish them and the control plane
//! (and tests) that filter on them.

/// A worker claimed a pending item.
pub const EVENT_ITEM_CLAIMED: &str = "item.claimed";

/// A worker finished an item and its log set is complete.
pub const EVENT_ITEM_COMPLETED: &str = "item.completed";

/// An item failed terminally.
pub const EVENT_ITEM_FAILED: &str = "item.failed";

/// An item failed but went back to pending with retry budget left.
pub const EVENT_ITEM_RETRIED: &str = "item.retried";

/// The reclaimer returned a stale item to pending.
pub const EVENT_ITEM_RECLAIMED: &str = "item.reclaimed";

/// A discovery pass finished.
pub const EVENT_SCAN_COMPLETED: &str = "scan.completed";

/// A discovery batch insert failed twice and was dropped.
pub const EVENT_SCAN_BATCH_DROPPED: &str = "scan.batch_dropped";

/// The sampler pool changed size.
pub const EVENT_POOL_RESIZED: &str = "pool.resized";

/// The synthesizer persisted events for newly completed items.
pub const EVENT_EVENTS_SYNTHESIZED: &str = "events.synthesized";
