//! Connection set coordinator.
//!
//! Connects to every endpoint of a bundle concurrently and waits for them
//! up to a shared deadline. Whatever settled in time goes into the bundle.
//! Connections still pending at the deadline are left to their own tasks,
//! which close them as soon as they settle.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use super::{
    bundle::ProviderBundle,
    config::{BundleConfig, EndpointConfig},
    connection::{ConnectionHandle, Establisher},
};

/// Where one endpoint's connection attempt stands.
enum Slot {
    Waiting,
    Ready(ConnectionHandle),
    Rejected,
    /// The caller stopped waiting; the task disposes whatever it gets.
    Abandoned,
}

pub struct Coordinator {
    establisher: Arc<Establisher>,
    config: BundleConfig,
}

impl Coordinator {
    pub fn new(establisher: Arc<Establisher>, config: BundleConfig) -> Self {
        Self {
            establisher,
            config,
        }
    }

    pub fn establisher(&self) -> &Arc<Establisher> {
        &self.establisher
    }

    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    /// Build a bundle using the configured timeout.
    pub async fn create_bundle(&self, endpoints: &[EndpointConfig]) -> ProviderBundle {
        self.create_bundle_with_timeout(endpoints, self.config.timeout())
            .await
    }

    /// Build a bundle from the endpoints that settle within `timeout`.
    ///
    /// Never waits longer than `timeout`. Handles appear in endpoint order.
    pub async fn create_bundle_with_timeout(
        &self,
        endpoints: &[EndpointConfig],
        timeout: Duration,
    ) -> ProviderBundle {
        let deadline = deadline_after(timeout);
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<usize>();
        let metrics = self.establisher.metrics();

        let slots: Vec<Arc<Mutex<Slot>>> = endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                let slot = Arc::new(Mutex::new(Slot::Waiting));
                let task_slot = Arc::clone(&slot);
                let establisher = Arc::clone(&self.establisher);
                let endpoint = endpoint.clone();
                let settled_tx = settled_tx.clone();
                let metrics = Arc::clone(&metrics);

                tokio::spawn(async move {
                    let attempt = AssertUnwindSafe(establisher.connect(&endpoint))
                        .catch_unwind()
                        .await;

                    let late = {
                        let mut state = task_slot.lock();
                        if matches!(*state, Slot::Abandoned) {
                            attempt.ok()
                        } else {
                            *state = match attempt {
                                Ok(handle) => Slot::Ready(handle),
                                Err(_) => Slot::Rejected,
                            };
                            None
                        }
                    };

                    match late {
                        Some(handle) => {
                            metrics.record_connection_abandoned();
                            debug!(
                                endpoint = %endpoint.url,
                                "Connection settled after bundle timeout, disposing"
                            );
                            if let Err(e) = handle.dispose().await {
                                warn!(
                                    endpoint = %endpoint.url,
                                    error = %e,
                                    "Error closing late MCP connection"
                                );
                            }
                        }
                        None => {
                            // Receiver is gone once the caller stopped waiting
                            let _ = settled_tx.send(index);
                        }
                    }
                });

                slot
            })
            .collect();
        drop(settled_tx);

        let mut settled = 0;
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        while settled < endpoints.len() {
            tokio::select! {
                msg = settled_rx.recv() => match msg {
                    Some(_) => settled += 1,
                    None => break,
                },
                _ = &mut sleep => break,
            }
        }

        let mut handles = Vec::with_capacity(endpoints.len());
        let mut pending = 0;
        for (slot, endpoint) in slots.iter().zip(endpoints) {
            let previous = std::mem::replace(&mut *slot.lock(), Slot::Abandoned);
            match previous {
                Slot::Ready(handle) => handles.push(handle),
                Slot::Rejected => {
                    warn!(
                        endpoint = %endpoint.url,
                        "Connection task failed, skipping endpoint"
                    );
                }
                Slot::Waiting => {
                    pending += 1;
                    warn!(
                        endpoint = %endpoint.url,
                        timeout = ?timeout,
                        "Endpoint did not connect in time, closing it in the background"
                    );
                }
                Slot::Abandoned => {}
            }
        }

        let bundle = ProviderBundle::new(handles, self.config.dispose_grace()).with_metrics(metrics);
        info!(
            endpoints = endpoints.len(),
            connected = bundle.connected_count(),
            stubs = bundle.handles().len() - bundle.connected_count(),
            pending,
            tools = bundle.tool_count(),
            "Built provider bundle"
        );
        bundle
    }
}

/// Timeouts too large to add to the clock wait about thirty years instead.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

#[cfg(test)]
mod tests {
    use std::{
        borrow::Cow,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use rmcp::model::{CallToolResult, JsonObject};

    use super::*;
    use crate::{
        core::{
            config::Tool,
            transport::{Connector, ToolClient},
        },
        error::{McpError, McpResult},
    };

    struct NamedClient {
        tool: String,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolClient for NamedClient {
        async fn list_tools(&self) -> McpResult<Vec<Tool>> {
            Ok(vec![Tool {
                name: Cow::Owned(self.tool.clone()),
                title: None,
                description: None,
                input_schema: Arc::new(serde_json::Map::new()),
                output_schema: None,
                annotations: None,
                icons: None,
            }])
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: Option<JsonObject>,
        ) -> McpResult<CallToolResult> {
            Ok(CallToolResult::success(vec![]))
        }

        async fn close(&self) -> McpResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Host decides the behaviour: `slow` sleeps 5s, `down` refuses.
    struct HostConnector {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for HostConnector {
        async fn open(&self, endpoint: &EndpointConfig) -> McpResult<Arc<dyn ToolClient>> {
            let host = endpoint.label().to_string();
            match host.as_str() {
                "down" => return Err(McpError::ConnectionFailed("refused".to_string())),
                "slow" => tokio::time::sleep(Duration::from_secs(5)).await,
                _ => {}
            }
            Ok(Arc::new(NamedClient {
                tool: format!("{}_tool", host),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn coordinator() -> (Coordinator, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let est = Establisher::new(Arc::new(HostConnector {
            closes: Arc::clone(&closes),
        }));
        (
            Coordinator::new(Arc::new(est), BundleConfig::default()),
            closes,
        )
    }

    fn endpoint(name: &str) -> EndpointConfig {
        EndpointConfig::new(format!("http://{}/mcp", name)).with_name(name)
    }

    #[tokio::test]
    async fn test_all_endpoints_settle() {
        let (coordinator, _) = coordinator();
        let bundle = coordinator
            .create_bundle(&[endpoint("a"), endpoint("down"), endpoint("b")])
            .await;

        assert_eq!(bundle.handles().len(), 3);
        assert_eq!(bundle.connected_count(), 2);
        assert_eq!(
            bundle.tool_names().collect::<Vec<_>>(),
            vec!["a_tool", "b_tool"]
        );
        let labels: Vec<_> = bundle.handles().iter().map(|h| h.label()).collect();
        assert_eq!(labels, vec!["a", "down", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_slow_endpoint() {
        let (coordinator, closes) = coordinator();
        let started = Instant::now();
        let bundle = coordinator
            .create_bundle_with_timeout(&[endpoint("slow"), endpoint("a")], Duration::from_secs(1))
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(bundle.handles().len(), 1);
        assert!(bundle.has_tool("a_tool"));
        assert!(!bundle.has_tool("slow_tool"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator
                .establisher()
                .metrics()
                .snapshot()
                .connections_abandoned,
            1
        );
    }

    #[tokio::test]
    async fn test_unbounded_timeout_waits_for_settlement() {
        let (coordinator, _) = coordinator();
        let bundle = coordinator
            .create_bundle_with_timeout(&[endpoint("a"), endpoint("down")], Duration::MAX)
            .await;

        assert_eq!(bundle.handles().len(), 2);
        assert!(bundle.has_tool("a_tool"));
    }

    #[test]
    fn test_deadline_saturates() {
        let now = Instant::now();
        assert!(deadline_after(Duration::MAX) > now + Duration::from_secs(86400 * 365));
        assert!(deadline_after(Duration::from_secs(1)) <= Instant::now() + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_no_endpoints() {
        let (coordinator, _) = coordinator();
        let bundle = coordinator.create_bundle(&[]).await;
        assert_eq!(bundle.tool_count(), 0);
    }
}
