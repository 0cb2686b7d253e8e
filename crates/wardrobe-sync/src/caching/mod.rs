//! # In-memory caching
//!
//! The sync layer keeps three kinds of short-lived state so the UI does not hammer the backend:
//!
//! - Signed URLs for photos, held in a [`TtlCache`] keyed by storage path. A signed URL is only
//!   served while it has more than the configured `expiry_buffer` of its lifetime left, so a URL
//!   handed to an image loader does not expire before the image finished loading.
//! - The current auth session, see [`SessionCache`](crate::session::SessionCache).
//! - In-flight destructive operations, see
//!   [`OperationDeduplicator`](crate::dedup::OperationDeduplicator).
//!
//! Nothing here is persisted. A process restart starts with empty caches.
//!
//! ## Expiry
//!
//! Expired entries are evicted lazily when they are looked up, and eagerly by a [`CleanupTask`]
//! that sweeps the cache every `cleanup_interval`. The sweep only removes entries that are fully
//! expired; entries that are merely inside the buffer stay until they are accessed or expire.
//!
//! ## Metrics
//!
//! - `cache.purged`: Entries removed by the sweep, tagged with `cache`.
//! - `cache.entries`: Gauge of entries after each sweep, tagged with `cache`.

mod cleanup;
mod ttl;

pub use cleanup::CleanupTask;
pub use ttl::TtlCache;
