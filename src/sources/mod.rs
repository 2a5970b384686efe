//! Source adapter registry and factory
//!
//! This module provides:
//! - The `SourceAdapter` capability every scraped site implements
//! - Central registration of all supported sources
//! - A factory function to resolve adapters by service name
//!
//! All site-specific extraction logic must live in dedicated adapter
//! modules. The rest of the application interacts exclusively through
//! the `SourceAdapter` trait.

pub mod adapter;
pub mod pics;
mod provider1;
mod provider2;

use std::sync::Arc;

pub use adapter::{ExtractError, SourceAdapter};
pub use provider1::Provider1Adapter;
pub use provider2::Provider2Adapter;

/// Names accepted by [`get_adapter`].
pub const SUPPORTED: [&str; 2] = ["provider1", "provider2"];

/// Returns a source adapter instance by service name.
///
/// CONTRACT:
/// - `name` matches the service name the collector was started with
/// - Adapter names are lowercase and stable
///
/// THREADING:
/// - Adapters are wrapped in `Arc` and shared by every pool worker
///
pub fn get_adapter(name: &str) -> Option<Arc<dyn SourceAdapter>> {
    match name {
        "provider1" => Some(Arc::new(Provider1Adapter)),
        "provider2" => Some(Arc::new(Provider2Adapter)),
        _ => None,
    }
}
