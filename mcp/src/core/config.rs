//! Configuration for endpoints, bundle construction and the provider cache.
//!
//! All structs deserialize from YAML with defaults for every optional field.

use std::{collections::HashMap, fmt, time::Duration};

pub use rmcp::model::Tool;
use serde::{Deserialize, Serialize};

use crate::error::{McpError, McpResult};

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpCacheConfig {
    /// Provider cache limits and expiry
    #[serde(default)]
    pub cache: ProviderCacheConfig,

    /// Bundle construction timeouts
    #[serde(default)]
    pub bundle: BundleConfig,

    /// Connect retry settings
    #[serde(default)]
    pub connect: ConnectConfig,

    /// Global MCP proxy configuration (default for all endpoints)
    /// Can be overridden per-endpoint
    #[serde(default)]
    pub proxy: Option<McpProxyConfig>,
}

/// Provider cache limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderCacheConfig {
    #[serde(default = "default_max_entries_per_user")]
    pub max_entries_per_user: usize,

    #[serde(default = "default_max_total_entries")]
    pub max_total_entries: usize,

    /// Entry lifetime measured from creation (milliseconds)
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Expiry sweep period (milliseconds)
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl ProviderCacheConfig {
    pub fn new(
        max_entries_per_user: usize,
        max_total_entries: usize,
        ttl: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            max_entries_per_user,
            max_total_entries,
            ttl_ms: ttl.as_millis() as u64,
            cleanup_interval_ms: cleanup_interval.as_millis() as u64,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn validate(&self) -> McpResult<()> {
        if self.max_entries_per_user == 0 {
            return Err(McpError::Config(
                "max_entries_per_user must be at least 1".to_string(),
            ));
        }
        if self.max_total_entries == 0 {
            return Err(McpError::Config(
                "max_total_entries must be at least 1".to_string(),
            ));
        }
        if self.max_entries_per_user > self.max_total_entries {
            return Err(McpError::Config(format!(
                "max_entries_per_user ({}) exceeds max_total_entries ({})",
                self.max_entries_per_user, self.max_total_entries
            )));
        }
        if self.ttl_ms == 0 {
            return Err(McpError::Config("ttl_ms must be positive".to_string()));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(McpError::Config(
                "cleanup_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timeouts applied while building and tearing down a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BundleConfig {
    /// How long a caller waits for the endpoint set (milliseconds)
    #[serde(default = "default_bundle_timeout_ms")]
    pub timeout_ms: u64,

    /// How long `dispose()` waits for member connections to close (milliseconds)
    #[serde(default = "default_dispose_grace_ms")]
    pub dispose_grace_ms: u64,
}

impl BundleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_dispose_grace(mut self, grace: Duration) -> Self {
        self.dispose_grace_ms = grace.as_millis() as u64;
        self
    }
}

/// Connect retry policy for a single endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectConfig {
    /// Total connect attempts before degrading to a stub (1 = no retry)
    #[serde(default = "default_connect_attempts")]
    pub attempts: u32,

    /// TCP connect timeout for HTTP transports (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Transport protocol spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McpProtocol {
    Sse,
    #[default]
    Streamable,
}

/// One tool-serving endpoint of a bundle.
#[derive(Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Label used in logs; defaults to the URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub url: String,

    #[serde(default)]
    pub protocol: McpProtocol,

    /// Bearer token for Authorization header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Additional headers (e.g., X-API-Key, per-user auth)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Expose write-access tools from this endpoint
    #[serde(default)]
    pub allow_write: bool,

    /// Per-endpoint proxy override (overrides global proxy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<McpProxyConfig>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: None,
            url: url.into(),
            protocol: McpProtocol::default(),
            token: None,
            headers: HashMap::new(),
            allow_write: false,
            proxy: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: McpProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_write_access(mut self, allow_write: bool) -> Self {
        self.allow_write = allow_write;
        self
    }

    /// Label for logs and tool ownership.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("token", &self.token.as_ref().map(|_| "****"))
            .field("headers", &format!("{} headers", self.headers.len()))
            .field("allow_write", &self.allow_write)
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// MCP-specific proxy configuration (does NOT affect LLM API traffic)
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct McpProxyConfig {
    /// HTTP proxy URL (e.g., "http://proxy.internal:8080")
    pub http: Option<String>,

    /// HTTPS proxy URL
    pub https: Option<String>,

    /// Comma-separated hosts to exclude from proxying
    pub no_proxy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for McpProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpProxyConfig")
            .field("http", &self.http)
            .field("https", &self.https)
            .field("no_proxy", &self.no_proxy)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

// Default value functions
fn default_max_entries_per_user() -> usize {
    5
}

fn default_max_total_entries() -> usize {
    100
}

fn default_ttl_ms() -> u64 {
    30 * 60 * 1000 // 30 minutes
}

fn default_cleanup_interval_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_bundle_timeout_ms() -> u64 {
    60_000
}

fn default_dispose_grace_ms() -> u64 {
    15_000
}

fn default_connect_attempts() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for ProviderCacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_user: default_max_entries_per_user(),
            max_total_entries: default_max_total_entries(),
            ttl_ms: default_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_bundle_timeout_ms(),
            dispose_grace_ms: default_dispose_grace_ms(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_connect_attempts(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl McpProxyConfig {
    /// Load proxy config from standard environment variables
    pub fn from_env() -> Option<Self> {
        let http = std::env::var("MCP_HTTP_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTP_PROXY").ok());

        let https = std::env::var("MCP_HTTPS_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTPS_PROXY").ok());

        let no_proxy = std::env::var("MCP_NO_PROXY")
            .ok()
            .or_else(|| std::env::var("NO_PROXY").ok());

        if http.is_some() || https.is_some() {
            Some(Self {
                http,
                https,
                no_proxy,
                username: None,
                password: None,
            })
        } else {
            None
        }
    }
}

impl McpCacheConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> McpResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> McpResult<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| McpError::Config(format!("parse config: {}", e)))?;
        config.cache.validate()?;
        Ok(config)
    }

    /// Merge with environment-based proxy config
    #[must_use]
    pub fn with_env_proxy(mut self) -> Self {
        if self.proxy.is_none() {
            self.proxy = McpProxyConfig::from_env();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_default_cache_config() {
        let config = ProviderCacheConfig::default();
        assert_eq!(config.max_entries_per_user, 5);
        assert_eq!(config.max_total_entries, 100);
        assert_eq!(config.ttl(), Duration::from_secs(1800));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_bundle_config() {
        let config = BundleConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.dispose_grace(), Duration::from_secs(15));
    }

    #[test]
    fn test_cache_config_validation() {
        let zero_user = ProviderCacheConfig {
            max_entries_per_user: 0,
            ..Default::default()
        };
        assert!(matches!(zero_user.validate(), Err(McpError::Config(_))));

        let inverted = ProviderCacheConfig {
            max_entries_per_user: 10,
            max_total_entries: 2,
            ..Default::default()
        };
        assert!(matches!(inverted.validate(), Err(McpError::Config(_))));

        let no_ttl = ProviderCacheConfig {
            ttl_ms: 0,
            ..Default::default()
        };
        assert!(no_ttl.validate().is_err());

        let no_interval = ProviderCacheConfig {
            cleanup_interval_ms: 0,
            ..Default::default()
        };
        assert!(no_interval.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_proxy_from_env_empty() {
        std::env::remove_var("MCP_HTTP_PROXY");
        std::env::remove_var("MCP_HTTPS_PROXY");
        std::env::remove_var("HTTP_PROXY");
        std::env::remove_var("HTTPS_PROXY");

        assert!(McpProxyConfig::from_env().is_none());
    }

    #[test]
    #[serial]
    fn test_proxy_from_env_with_vars() {
        std::env::set_var("MCP_HTTP_PROXY", "http://test-proxy:8080");
        std::env::set_var("MCP_NO_PROXY", "localhost,127.0.0.1");

        let proxy = McpProxyConfig::from_env().unwrap();
        assert_eq!(proxy.http.as_deref(), Some("http://test-proxy:8080"));
        assert_eq!(proxy.no_proxy.as_deref(), Some("localhost,127.0.0.1"));

        std::env::remove_var("MCP_HTTP_PROXY");
        std::env::remove_var("MCP_NO_PROXY");
    }

    #[test]
    fn test_yaml_minimal_config() {
        let config = McpCacheConfig::from_yaml("{}").unwrap();
        assert_eq!(config.cache, ProviderCacheConfig::default());
        assert_eq!(config.bundle, BundleConfig::default());
        assert_eq!(config.connect.attempts, 1);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_yaml_full_config() {
        let yaml = r#"
cache:
  max_entries_per_user: 2
  max_total_entries: 10
  ttl_ms: 60000
  cleanup_interval_ms: 5000
bundle:
  timeout_ms: 100
  dispose_grace_ms: 50
connect:
  attempts: 3
  retry_base_delay_ms: 10
proxy:
  http: "http://proxy:8080"
  https: null
  no_proxy: "localhost"
"#;
        let config = McpCacheConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.cache.max_entries_per_user, 2);
        assert_eq!(config.cache.max_total_entries, 10);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert_eq!(config.bundle.timeout(), Duration::from_millis(100));
        assert_eq!(config.connect.attempts, 3);
        assert_eq!(config.connect.retry_base_delay_ms, 10);
        assert_eq!(config.connect.retry_max_delay_ms, 30_000);
        assert_eq!(
            config.proxy.unwrap().http.as_deref(),
            Some("http://proxy:8080")
        );
    }

    #[test]
    fn test_yaml_rejects_invalid_limits() {
        let yaml = r#"
cache:
  max_entries_per_user: 0
"#;
        assert!(matches!(
            McpCacheConfig::from_yaml(yaml),
            Err(McpError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-cache.yaml");
        tokio::fs::write(&path, "cache:\n  max_total_entries: 7\n")
            .await
            .unwrap();

        let config = McpCacheConfig::from_file(&path).await.unwrap();
        assert_eq!(config.cache.max_total_entries, 7);
        assert_eq!(config.cache.max_entries_per_user, 5);
    }

    #[test]
    fn test_endpoint_yaml() {
        let yaml = r#"
name: github
url: "https://mcp.example.com/sse"
protocol: sse
token: "secret"
headers:
  X-Tenant: acme
allow_write: true
"#;
        let endpoint: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(endpoint.label(), "github");
        assert_eq!(endpoint.protocol, McpProtocol::Sse);
        assert_eq!(endpoint.token.as_deref(), Some("secret"));
        assert_eq!(endpoint.headers.get("X-Tenant").map(String::as_str), Some("acme"));
        assert!(endpoint.allow_write);
    }

    #[test]
    fn test_endpoint_defaults() {
        let endpoint: EndpointConfig = serde_yaml::from_str("url: http://localhost:3000/mcp").unwrap();
        assert_eq!(endpoint.protocol, McpProtocol::Streamable);
        assert!(!endpoint.allow_write);
        assert_eq!(endpoint.label(), "http://localhost:3000/mcp");
    }

    #[test]
    fn test_endpoint_debug_redacts_secrets() {
        let endpoint = EndpointConfig::new("http://localhost:3000")
            .with_token("super-secret")
            .with_header("X-API-Key", "hidden-value");
        let debug = format!("{:?}", endpoint);
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("hidden-value"));
        assert!(debug.contains("1 headers"));
    }
}
