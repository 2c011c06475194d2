//! Common test utilities for provider cache tests

#![allow(dead_code)]

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{CallToolResult, Content, JsonObject};
use smg_mcp_cache::{
    BundleConfig, Connector, Coordinator, EndpointConfig, Establisher, McpError, McpResult,
    ProviderBundle, Tool, ToolClient,
};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

pub fn tool(name: &str, description: &str) -> Tool {
    Tool {
        name: Cow::Owned(name.to_string()),
        title: None,
        description: Some(Cow::Owned(description.to_string())),
        input_schema: Arc::new(serde_json::Map::new()),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

/// How a scripted endpoint answers `open`.
#[derive(Clone)]
pub enum Script {
    Serve(Vec<Tool>),
    /// Serve after a delay
    Slow(Duration, Vec<Tool>),
    /// Never settles
    Hang,
    Refuse,
    Panic,
}

/// In-memory connector answering per endpoint label.
#[derive(Default)]
pub struct MockConnector {
    scripts: Mutex<HashMap<String, Script>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    close_delay: Mutex<Duration>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, label: &str, script: Script) {
        self.scripts.lock().insert(label.to_string(), script);
    }

    /// Every client opened afterwards takes `delay` to close.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, endpoint: &EndpointConfig) -> McpResult<Arc<dyn ToolClient>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .get(endpoint.label())
            .cloned()
            .unwrap_or(Script::Serve(Vec::new()));

        let tools = match script {
            Script::Serve(tools) => tools,
            Script::Slow(delay, tools) => {
                tokio::time::sleep(delay).await;
                tools
            }
            Script::Hang => std::future::pending().await,
            Script::Refuse => {
                return Err(McpError::ConnectionFailed(format!(
                    "{} refused",
                    endpoint.label()
                )))
            }
            Script::Panic => panic!("transport for {} exploded", endpoint.label()),
        };

        Ok(Arc::new(MockClient {
            label: endpoint.label().to_string(),
            tools,
            closes: Arc::clone(&self.closes),
            close_delay: *self.close_delay.lock(),
        }))
    }
}

struct MockClient {
    label: String,
    tools: Vec<Tool>,
    closes: Arc<AtomicUsize>,
    close_delay: Duration,
}

#[async_trait]
impl ToolClient for MockClient {
    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        Ok(CallToolResult::success(vec![Content::text(format!(
            "{}:{}",
            self.label, name
        ))]))
    }

    /// Counts closes once they complete.
    async fn close(&self) -> McpResult<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn endpoint(label: &str) -> EndpointConfig {
    EndpointConfig::new(format!("http://{}.test/mcp", label)).with_name(label)
}

pub fn coordinator(connector: Arc<MockConnector>, timeout: Duration) -> Arc<Coordinator> {
    let establisher = Establisher::new(connector);
    Arc::new(Coordinator::new(
        Arc::new(establisher),
        BundleConfig::default()
            .with_timeout(timeout)
            .with_dispose_grace(Duration::from_secs(1)),
    ))
}

/// Counts dispose notifications across bundles.
#[derive(Clone, Default)]
pub struct DisposeCounter(Arc<AtomicUsize>);

impl DisposeCounter {
    pub fn watch(&self, bundle: &ProviderBundle) {
        let count = Arc::clone(&self.0);
        bundle.add_dispose_listener(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Factory producing an empty bundle that reports its disposal to `counter`.
pub fn tracked_bundle(
    counter: &DisposeCounter,
) -> impl FnOnce() -> std::future::Ready<McpResult<ProviderBundle>> {
    let counter = counter.clone();
    move || {
        let bundle = ProviderBundle::empty();
        counter.watch(&bundle);
        std::future::ready(Ok(bundle))
    }
}
