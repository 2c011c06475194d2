//! Connection establisher.
//!
//! [`Establisher::connect`] never fails: any transport, handshake or catalog
//! error (or a panic in the transport plumbing) degrades to a stub
//! [`ConnectionHandle`] with no tools, so one bad endpoint cannot fail a
//! whole bundle.

use std::{
    collections::BTreeMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use rmcp::model::{CallToolResult, JsonObject};
use serde_json::Value;
use tracing::{error, info, warn};

use super::{
    config::{ConnectConfig, EndpointConfig, McpProxyConfig, Tool},
    metrics::McpMetrics,
    reconnect::ReconnectionManager,
    transport::{Connector, RmcpConnector, ToolClient},
};
use crate::{
    annotations::AccessLevel,
    error::{McpError, McpResult},
};

/// One live or stub connection to one endpoint.
///
/// Owned by exactly one bundle. `dispose()` closes the session the first
/// time it is called and is a no-op afterwards.
pub struct ConnectionHandle {
    endpoint: String,
    label: String,
    client: Option<Arc<dyn ToolClient>>,
    tools: BTreeMap<String, Tool>,
    disposed: AtomicBool,
}

impl ConnectionHandle {
    fn connected(endpoint: &EndpointConfig, client: Arc<dyn ToolClient>, tools: Vec<Tool>) -> Self {
        Self {
            endpoint: endpoint.url.clone(),
            label: endpoint.label().to_string(),
            client: Some(client),
            tools: tools.into_iter().map(|t| (t.name.to_string(), t)).collect(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Placeholder for a failed connection attempt.
    pub fn stub(endpoint: &EndpointConfig) -> Self {
        Self {
            endpoint: endpoint.url.clone(),
            label: endpoint.label().to_string(),
            client: None,
            tools: BTreeMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Exposed tools, keyed by name.
    pub fn tools(&self) -> &BTreeMap<String, Tool> {
        &self.tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Invoke an exposed tool. `arguments` must be a JSON object or null.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        if !self.tools.contains_key(name) {
            return Err(McpError::ToolNotFound(format!("{}:{}", self.label, name)));
        }
        let client = match &self.client {
            Some(client) if !self.is_disposed() => client,
            _ => return Err(McpError::ServerDisconnected(self.endpoint.clone())),
        };

        let arguments = match arguments {
            Value::Null => None,
            Value::Object(map) => Some(map),
            other => {
                return Err(McpError::InvalidArguments(format!(
                    "expected a JSON object for '{}', got {}",
                    name, other
                )))
            }
        };
        client.call_tool(name, arguments).await
    }

    /// Close the underlying session. Only the first call does any work.
    pub async fn dispose(&self) -> McpResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.client {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Drop write-access tools unless the endpoint allows them.
pub(crate) fn filter_tools(tools: Vec<Tool>, allow_write: bool) -> Vec<Tool> {
    if allow_write {
        return tools;
    }
    tools
        .into_iter()
        .filter(|tool| !AccessLevel::of(tool).is_write())
        .collect()
}

/// Opens connections to single endpoints.
pub struct Establisher {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectionManager,
    metrics: Arc<McpMetrics>,
}

impl Establisher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            reconnect: ReconnectionManager::new(),
            metrics: Arc::new(McpMetrics::new()),
        }
    }

    /// Production establisher speaking MCP through rmcp.
    pub fn rmcp(connect: &ConnectConfig, global_proxy: Option<McpProxyConfig>) -> Self {
        let connector = RmcpConnector::new(
            global_proxy,
            Duration::from_secs(connect.connect_timeout_secs),
        );
        Self::new(Arc::new(connector)).with_reconnect(ReconnectionManager::from_config(connect))
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectionManager) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<McpMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<McpMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Connect to `endpoint`, falling back to a stub handle on any failure.
    pub async fn connect(&self, endpoint: &EndpointConfig) -> ConnectionHandle {
        let attempt = AssertUnwindSafe(self.try_connect(endpoint))
            .catch_unwind()
            .await;

        match attempt {
            Ok(Ok(handle)) => {
                self.metrics.record_connection_opened();
                info!(
                    endpoint = %endpoint.url,
                    label = endpoint.label(),
                    tools = handle.tools.len(),
                    "Connected to MCP endpoint"
                );
                handle
            }
            Ok(Err(e)) => {
                self.metrics.record_connection_error(&endpoint.url);
                warn!(
                    endpoint = %endpoint.url,
                    label = endpoint.label(),
                    error = %e,
                    "Failed to connect to MCP endpoint, continuing without its tools"
                );
                ConnectionHandle::stub(endpoint)
            }
            Err(_) => {
                self.metrics.record_connection_error(&endpoint.url);
                error!(
                    endpoint = %endpoint.url,
                    label = endpoint.label(),
                    "MCP transport panicked while connecting, continuing without its tools"
                );
                ConnectionHandle::stub(endpoint)
            }
        }
    }

    async fn try_connect(&self, endpoint: &EndpointConfig) -> McpResult<ConnectionHandle> {
        let url = url::Url::parse(&endpoint.url)
            .map_err(|e| McpError::Config(format!("invalid endpoint URL '{}': {}", endpoint.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(McpError::Config(format!(
                "unsupported endpoint scheme '{}'",
                url.scheme()
            )));
        }

        let connector = &self.connector;
        let client = self
            .reconnect
            .retry(&endpoint.url, move || connector.open(endpoint))
            .await?;

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    warn!(
                        endpoint = %endpoint.url,
                        error = %close_err,
                        "Failed to close session after catalog error"
                    );
                }
                return Err(e);
            }
        };

        let total = tools.len();
        let tools = filter_tools(tools, endpoint.allow_write);
        if tools.len() < total {
            info!(
                endpoint = %endpoint.url,
                hidden = total - tools.len(),
                "Hiding write-access tools on read-only endpoint"
            );
        }

        Ok(ConnectionHandle::connected(endpoint, client, tools))
    }
}
