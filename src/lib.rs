//! `nrtk-sync` mirrors a newsroom site payload into a local file tree and
//! serves that tree over HTTP.

/// Runtime configuration loading and validation.
pub mod config;
/// Logging setup.
pub mod logging;
/// Persisted metadata and staleness detection.
pub mod meta;
/// Runtime metrics counters.
pub mod metrics;
/// Sitemap rendering.
pub mod render;
/// HTTP request resolution, sync trigger and listener.
pub mod server;
/// Payload and metadata data model.
pub mod site;
/// Remote and local payload sources.
pub mod source;
/// Sync cycle orchestration.
pub mod sync;
/// The served content tree and generation publishing.
pub mod tree;
