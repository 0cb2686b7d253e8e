//! A client-side synchronization and caching layer for the wardrobe backend.
//!
//! The [`SyncLayer`] sits between the UI and the remote backend and keeps it from issuing
//! redundant requests: signed photo URLs are cached while they stay valid, concurrent session
//! lookups are coalesced into one, and destructive operations run at most once at a time per item.
//!
//! The backend is reached through the traits in [`providers`], implemented for the real backend
//! by [`providers::HttpBackend`].

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod dedup;
pub mod layer;
pub mod logging;
pub mod providers;
pub mod session;
pub mod types;
pub mod utils;

pub use layer::SyncLayer;
