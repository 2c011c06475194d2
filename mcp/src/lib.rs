//! MCP provider bundles and the per-session provider cache.
//!
//! ## Modules
//!
//! - [`core`]: endpoint configuration, connection establishment, bundle
//!   coordination and metrics
//! - [`cache`]: the provider cache with single-flight creation, per-user and
//!   global LRU bounds, and TTL expiry
//!
//! ## Shared Types
//!
//! - [`ToolAnnotations`] / [`AccessLevel`]: read versus write classification
//! - [`UserId`] / [`SessionId`]: cache scoping identifiers

// Shared types (used across modules)
pub mod annotations;
pub mod error;
pub mod identity;

// Subsystems
pub mod cache;
pub mod core;

pub use annotations::{AccessLevel, ToolAnnotations};
pub use cache::{stable_hash, CacheKey, CacheStats, ProviderCache};
pub use core::{
    BundleConfig, ConnectConfig, ConnectionHandle, Connector, Coordinator, EndpointConfig,
    Establisher, ListenerId, McpCacheConfig, McpMetrics, McpProtocol, McpProxyConfig,
    MetricsSnapshot, ProviderBundle, ProviderCacheConfig, ReconnectionManager, RmcpConnector,
    Tool, ToolClient,
};
pub use error::{McpError, McpResult};
pub use identity::{SessionId, UserId};
