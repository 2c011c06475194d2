//! Transport capability used by the connection establisher.
//!
//! [`Connector`] opens a session to one endpoint and [`ToolClient`] talks to
//! it. [`RmcpConnector`] is the production implementation over Streamable
//! HTTP or SSE; tests substitute in-memory connectors.

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, JsonObject, Tool},
    service::{Peer, RunningService},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        SseClientTransport, StreamableHttpClientTransport,
    },
    RoleClient, ServiceExt,
};
use tracing::debug;

use super::config::{EndpointConfig, McpProtocol, McpProxyConfig};
use crate::error::{McpError, McpResult};

/// A live session with one tool-serving endpoint.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Fetch the complete tool catalog.
    async fn list_tools(&self) -> McpResult<Vec<Tool>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult>;

    /// Close the session. Called at most once by the owning handle.
    async fn close(&self) -> McpResult<()>;
}

/// Opens sessions (transport + protocol handshake) to endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &EndpointConfig) -> McpResult<Arc<dyn ToolClient>>;
}

/// Build request headers from token and custom headers.
fn build_request_headers(
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
) -> McpResult<reqwest::header::HeaderMap> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(tok) = token {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", tok)
                .parse()
                .map_err(|e| McpError::Config(format!("auth token: {}", e)))?,
        );
    }

    for (key, value) in custom_headers {
        headers.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::Config(format!("header name: {}", e)))?,
            value
                .parse()
                .map_err(|e| McpError::Config(format!("header value: {}", e)))?,
        );
    }

    Ok(headers)
}

/// Build HTTP client with proxy and default headers.
fn build_http_client(
    endpoint: &EndpointConfig,
    global_proxy: Option<&McpProxyConfig>,
    connect_timeout: Duration,
) -> McpResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);

    if let Some(proxy_cfg) = super::proxy::resolve_proxy_config(endpoint, global_proxy) {
        builder = super::proxy::apply_proxy_to_builder(builder, proxy_cfg)?;
    }

    let req_headers = build_request_headers(&endpoint.token, &endpoint.headers)?;
    if !req_headers.is_empty() {
        builder = builder.default_headers(req_headers);
    }

    builder
        .build()
        .map_err(|e| McpError::Transport(format!("build HTTP client: {}", e)))
}

type McpClient = RunningService<RoleClient, ()>;

/// Connector speaking MCP through rmcp.
#[derive(Debug, Clone)]
pub struct RmcpConnector {
    global_proxy: Option<McpProxyConfig>,
    connect_timeout: Duration,
}

impl RmcpConnector {
    pub fn new(global_proxy: Option<McpProxyConfig>, connect_timeout: Duration) -> Self {
        Self {
            global_proxy,
            connect_timeout,
        }
    }
}

impl Default for RmcpConnector {
    fn default() -> Self {
        Self::new(McpProxyConfig::from_env(), Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn open(&self, endpoint: &EndpointConfig) -> McpResult<Arc<dyn ToolClient>> {
        let http_client =
            build_http_client(endpoint, self.global_proxy.as_ref(), self.connect_timeout)?;

        let service: McpClient = match endpoint.protocol {
            McpProtocol::Sse => {
                let cfg = SseClientConfig {
                    sse_endpoint: endpoint.url.clone().into(),
                    ..Default::default()
                };
                let transport = SseClientTransport::start_with_client(http_client, cfg)
                    .await
                    .map_err(|e| McpError::Transport(format!("create SSE transport: {}", e)))?;

                ().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize SSE client: {}", e))
                })?
            }
            McpProtocol::Streamable => {
                let cfg = StreamableHttpClientTransportConfig::with_uri(endpoint.url.as_str());
                let transport = StreamableHttpClientTransport::with_client(http_client, cfg);

                ().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize streamable client: {}", e))
                })?
            }
        };

        debug!(endpoint = %endpoint.url, protocol = ?endpoint.protocol, "MCP handshake complete");
        Ok(Arc::new(RmcpToolClient::new(service)))
    }
}

/// rmcp session; the peer handles requests while the service is kept for shutdown.
struct RmcpToolClient {
    peer: Peer<RoleClient>,
    service: Mutex<Option<McpClient>>,
}

impl RmcpToolClient {
    fn new(service: McpClient) -> Self {
        Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl ToolClient for RmcpToolClient {
    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.peer
            .list_all_tools()
            .await
            .map_err(|e| McpError::Transport(format!("list tools: {}", e)))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        let request = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments,
        };
        self.peer
            .call_tool(request)
            .await
            .map_err(|e| McpError::ToolExecution(format!("Failed to call tool: {}", e)))
    }

    async fn close(&self) -> McpResult<()> {
        let service = self.service.lock().take();
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|e| McpError::Transport(format!("close session: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_headers() {
        let mut custom = HashMap::new();
        custom.insert("X-API-Key".to_string(), "abc".to_string());

        let headers = build_request_headers(&Some("tok".to_string()), &custom).unwrap();
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer tok"
        );
        assert_eq!(headers.get("x-api-key").unwrap(), "abc");
    }

    #[test]
    fn test_build_request_headers_rejects_invalid_name() {
        let mut custom = HashMap::new();
        custom.insert("bad header".to_string(), "v".to_string());

        let result = build_request_headers(&None, &custom);
        assert!(matches!(result, Err(McpError::Config(_))));
    }

    #[test]
    fn test_build_http_client_with_endpoint_proxy() {
        let mut endpoint = EndpointConfig::new("http://localhost:3000/mcp").with_token("t");
        endpoint.proxy = Some(McpProxyConfig {
            http: Some("http://proxy:8080".to_string()),
            https: None,
            no_proxy: None,
            username: None,
            password: None,
        });

        assert!(build_http_client(&endpoint, None, Duration::from_secs(1)).is_ok());
    }
}
