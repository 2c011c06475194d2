//! Provider cache: bundles scoped by user, session and configuration.

pub mod key;
mod pending;
pub mod provider_cache;

pub use key::{stable_hash, CacheKey};
pub use provider_cache::{CacheStats, ProviderCache};
