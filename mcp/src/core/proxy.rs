//! HTTP proxy configuration for MCP connections.
//!
//! Resolves proxy settings per endpoint and applies them to HTTP client builders.

use super::config::{EndpointConfig, McpProxyConfig};
use crate::error::{McpError, McpResult};

/// Resolve proxy configuration for an endpoint.
/// Priority: endpoint.proxy > global proxy > None
pub(crate) fn resolve_proxy_config<'a>(
    endpoint: &'a EndpointConfig,
    global_proxy: Option<&'a McpProxyConfig>,
) -> Option<&'a McpProxyConfig> {
    endpoint.proxy.as_ref().or(global_proxy)
}

/// Apply proxy configuration to a ClientBuilder without building the client,
/// so auth headers can still be added afterward.
pub(crate) fn apply_proxy_to_builder(
    mut builder: reqwest::ClientBuilder,
    proxy_cfg: &McpProxyConfig,
) -> McpResult<reqwest::ClientBuilder> {
    if let Some(ref http_proxy) = proxy_cfg.http {
        let proxy = reqwest::Proxy::http(http_proxy)
            .map_err(|e| McpError::Config(format!("Invalid HTTP proxy: {}", e)))?;
        builder = builder.proxy(configure_proxy(proxy, proxy_cfg));
    }

    if let Some(ref https_proxy) = proxy_cfg.https {
        let proxy = reqwest::Proxy::https(https_proxy)
            .map_err(|e| McpError::Config(format!("Invalid HTTPS proxy: {}", e)))?;
        builder = builder.proxy(configure_proxy(proxy, proxy_cfg));
    }

    Ok(builder)
}

fn configure_proxy(mut proxy: reqwest::Proxy, proxy_cfg: &McpProxyConfig) -> reqwest::Proxy {
    if let Some(ref no_proxy) = proxy_cfg.no_proxy {
        proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
    }

    if let (Some(ref username), Some(ref password)) = (&proxy_cfg.username, &proxy_cfg.password) {
        proxy = proxy.basic_auth(username, password);
    }

    proxy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(http: &str) -> McpProxyConfig {
        McpProxyConfig {
            http: Some(http.to_string()),
            https: None,
            no_proxy: None,
            username: None,
            password: None,
        }
    }

    #[test]
    fn test_resolve_proxy_no_config() {
        let endpoint = EndpointConfig::new("http://localhost:3000/sse");
        assert!(resolve_proxy_config(&endpoint, None).is_none());
    }

    #[test]
    fn test_resolve_proxy_global_only() {
        let endpoint = EndpointConfig::new("http://localhost:3000/sse");
        let global = proxy("http://global-proxy:8080");

        let result = resolve_proxy_config(&endpoint, Some(&global));
        assert_eq!(
            result.and_then(|p| p.http.as_deref()),
            Some("http://global-proxy:8080")
        );
    }

    #[test]
    fn test_resolve_proxy_endpoint_override() {
        let mut endpoint = EndpointConfig::new("http://localhost:3000/sse");
        endpoint.proxy = Some(proxy("http://endpoint-proxy:9090"));
        let global = proxy("http://global-proxy:8080");

        let result = resolve_proxy_config(&endpoint, Some(&global));
        assert_eq!(
            result.and_then(|p| p.http.as_deref()),
            Some("http://endpoint-proxy:9090"),
            "Endpoint proxy should override global"
        );
    }

    #[test]
    fn test_apply_proxy_to_builder_with_auth() {
        let mut cfg = proxy("http://proxy.example.com:8080");
        cfg.no_proxy = Some("localhost,127.0.0.1".to_string());
        cfg.username = Some("user".to_string());
        cfg.password = Some("pass".to_string());

        let result = apply_proxy_to_builder(reqwest::Client::builder(), &cfg);
        assert!(result.is_ok());
        assert!(result.unwrap().build().is_ok());
    }

    #[test]
    fn test_apply_proxy_to_builder_invalid_url() {
        let result = apply_proxy_to_builder(reqwest::Client::builder(), &proxy("://invalid"));
        assert!(matches!(result, Err(McpError::Config(_))));
    }
}
