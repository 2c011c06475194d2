//! Provider bundle: the connections built for one cache entry.
//!
//! Tools from all member connections are merged into one map. When two
//! connections expose the same name, the connection registered first keeps
//! it and the later duplicate is dropped.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use rmcp::model::CallToolResult;
use serde_json::Value;
use tracing::{debug, warn};

use super::{config::Tool, connection::ConnectionHandle, metrics::McpMetrics};
use crate::error::{McpError, McpResult};

/// Identifies a registered dispose listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type DisposeListener = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    fired: bool,
    registered: Vec<(ListenerId, DisposeListener)>,
}

/// Aggregate of the connections established for one cache entry.
pub struct ProviderBundle {
    handles: Vec<Arc<ConnectionHandle>>,
    /// tool name -> index of the owning handle
    routes: BTreeMap<String, usize>,
    dispose_grace: Duration,
    disposed: AtomicBool,
    listeners: Mutex<Listeners>,
    metrics: Option<Arc<McpMetrics>>,
}

impl ProviderBundle {
    /// Build a bundle from handles in creation order.
    pub fn new(handles: Vec<ConnectionHandle>, dispose_grace: Duration) -> Self {
        let mut routes = BTreeMap::new();
        for (index, handle) in handles.iter().enumerate() {
            for name in handle.tools().keys() {
                match routes.get(name) {
                    Some(&owner) => {
                        let owner: &ConnectionHandle = &handles[owner];
                        warn!(
                            tool = %name,
                            kept = owner.label(),
                            dropped = handle.label(),
                            "Duplicate tool name across endpoints, keeping first registration"
                        );
                    }
                    None => {
                        routes.insert(name.clone(), index);
                    }
                }
            }
        }

        Self {
            handles: handles.into_iter().map(Arc::new).collect(),
            routes,
            dispose_grace,
            disposed: AtomicBool::new(false),
            listeners: Mutex::new(Listeners::default()),
            metrics: None,
        }
    }

    /// A bundle with no connections.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<McpMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handles(&self) -> &[Arc<ConnectionHandle>] {
        &self.handles
    }

    pub fn connected_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_connected()).count()
    }

    pub fn tool_count(&self) -> usize {
        self.routes.len()
    }

    /// Merged tool names, sorted.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn tools(&self) -> impl Iterator<Item = &Tool> {
        self.routes
            .iter()
            .filter_map(|(name, &index)| self.handles[index].tools().get(name))
    }

    pub fn tool(&self, name: &str) -> Option<&Tool> {
        let index = *self.routes.get(name)?;
        self.handles[index].tools().get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Label of the endpoint serving `name`.
    pub fn tool_owner(&self, name: &str) -> Option<&str> {
        self.routes
            .get(name)
            .map(|&index| self.handles[index].label())
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        let index = *self
            .routes
            .get(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        self.handles[index].call_tool(name, arguments).await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Register a callback run once when the bundle is disposed.
    ///
    /// If the bundle is already disposed the callback runs immediately.
    pub fn add_dispose_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut listeners = self.listeners.lock();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        if listeners.fired {
            drop(listeners);
            listener();
        } else {
            listeners.registered.push((id, Box::new(listener)));
        }
        id
    }

    /// Returns false if the listener was unknown or has already run.
    pub fn remove_dispose_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.registered.len();
        listeners.registered.retain(|(registered, _)| *registered != id);
        listeners.registered.len() != before
    }

    /// Dispose every member connection, then notify listeners.
    ///
    /// Members are closed concurrently on their own tasks. Waits at most the
    /// dispose grace period; closes still running after it finish in the
    /// background. Close errors are logged and do not stop the siblings.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let closes: Vec<_> = self
            .handles
            .iter()
            .map(|handle| {
                let handle = Arc::clone(handle);
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.dispose().await {
                        if let Some(metrics) = metrics {
                            metrics.record_dispose_error();
                        }
                        warn!(
                            endpoint = handle.endpoint(),
                            error = %e,
                            "Error closing MCP connection"
                        );
                    }
                })
            })
            .collect();

        // Dropping the join handles detaches the closes instead of cancelling them
        if tokio::time::timeout(self.dispose_grace, join_all(closes))
            .await
            .is_err()
        {
            warn!(
                connections = self.handles.len(),
                grace = ?self.dispose_grace,
                "Bundle disposal exceeded grace period, leaving remaining closes in the background"
            );
        }

        let registered = {
            let mut listeners = self.listeners.lock();
            listeners.fired = true;
            std::mem::take(&mut listeners.registered)
        };
        for (_, listener) in registered {
            listener();
        }
        debug!(connections = self.handles.len(), "Bundle disposed");
    }
}

impl fmt::Debug for ProviderBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderBundle")
            .field("connections", &self.handles.len())
            .field("connected", &self.connected_count())
            .field("tools", &self.routes.keys().collect::<Vec<_>>())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for ProviderBundle {
    /// Best-effort close for bundles dropped without `dispose()`.
    fn drop(&mut self) {
        if self.is_disposed() || self.handles.iter().all(|h| !h.is_connected()) {
            return;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handles = std::mem::take(&mut self.handles);
            runtime.spawn(async move {
                for handle in handles {
                    if let Err(err) = handle.dispose().await {
                        warn!("Error closing dropped bundle connection: {}", err);
                    }
                }
            });
        } else {
            warn!("No tokio runtime available for bundle cleanup");
        }
    }
}
