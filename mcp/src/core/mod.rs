//! Core connection infrastructure.

pub mod bundle;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod metrics;
pub mod proxy;
pub mod reconnect;
pub mod transport;

pub use bundle::{ListenerId, ProviderBundle};
pub use config::{
    BundleConfig, ConnectConfig, EndpointConfig, McpCacheConfig, McpProtocol, McpProxyConfig,
    ProviderCacheConfig, Tool,
};
pub use connection::{ConnectionHandle, Establisher};
pub use coordinator::Coordinator;
pub use metrics::{McpMetrics, MetricsSnapshot};
pub use reconnect::ReconnectionManager;
pub use transport::{Connector, RmcpConnector, ToolClient};
