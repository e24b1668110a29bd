//! casefile-daemon library: Exposes internal modules for testing.
//!
//! This is a thin native layer over casefile-core: file-backed storage,
//! an HTTP transport and the on-disk configuration.

pub mod client;
pub mod config;
pub mod http_client;
pub mod native_store;

// Re-export key types for convenience
pub use client::CaseClient;
pub use config::Config;
pub use http_client::HttpApi;
pub use native_store::NativeKv;
