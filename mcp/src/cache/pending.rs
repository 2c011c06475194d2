//! In-flight bundle creations, one per cache key.
//!
//! Every caller that misses on a key with a creation already running
//! subscribes to that creation's watch channel instead of calling its own
//! factory. The first outcome published wins; later ones are ignored.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::watch;

use super::key::CacheKey;
use crate::{
    core::bundle::ProviderBundle,
    error::{McpError, McpResult},
    identity::UserId,
};

/// Result of a shared creation as seen by subscribers.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Ready(Arc<ProviderBundle>),
    Failed(String),
    Cancelled(String),
}

impl Outcome {
    fn into_result(self) -> McpResult<Arc<ProviderBundle>> {
        match self {
            Outcome::Ready(bundle) => Ok(bundle),
            Outcome::Failed(message) => Err(McpError::Factory(message)),
            Outcome::Cancelled(reason) => Err(McpError::CreationCancelled(reason)),
        }
    }
}

/// Publishing side of one in-flight creation.
#[derive(Debug, Clone)]
pub(crate) struct PendingCreation {
    id: u64,
    user: UserId,
    sender: Arc<watch::Sender<Option<Outcome>>>,
}

impl PendingCreation {
    fn new(id: u64, user: UserId) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            id,
            user,
            sender: Arc::new(sender),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn subscribe(&self) -> Waiter {
        Waiter {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish `outcome` unless one was already published.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    pub(crate) fn cancel(&self, reason: &str) -> bool {
        self.complete(Outcome::Cancelled(reason.to_string()))
    }
}

/// Receiving side handed to coalesced callers.
pub(crate) struct Waiter {
    receiver: watch::Receiver<Option<Outcome>>,
}

impl Waiter {
    pub(crate) async fn wait(mut self) -> McpResult<Arc<ProviderBundle>> {
        let outcome = match self.receiver.wait_for(Option::is_some).await {
            Ok(published) => published.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(McpError::CreationCancelled(
                "creation task ended without a result".to_string(),
            )),
        }
    }
}

/// Registry of in-flight creations, guarded by the cache lock.
#[derive(Debug, Default)]
pub(crate) struct PendingCreations {
    by_key: HashMap<CacheKey, PendingCreation>,
}

impl PendingCreations {
    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn subscribe(&self, key: &CacheKey) -> Option<Waiter> {
        self.by_key.get(key).map(PendingCreation::subscribe)
    }

    pub(crate) fn register(&mut self, key: CacheKey, id: u64) -> PendingCreation {
        let pending = PendingCreation::new(id, key.user().clone());
        self.by_key.insert(key, pending.clone());
        pending
    }

    /// Remove the creation under `key` only if it is still the one with `id`.
    pub(crate) fn remove_if_current(&mut self, key: &CacheKey, id: u64) -> bool {
        if self.by_key.get(key).is_some_and(|p| p.id == id) {
            self.by_key.remove(key);
            true
        } else {
            false
        }
    }

    pub(crate) fn drain_user(&mut self, user: &UserId) -> Vec<PendingCreation> {
        let keys: Vec<CacheKey> = self
            .by_key
            .iter()
            .filter(|(_, pending)| &pending.user == user)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.by_key.remove(key))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingCreation> {
        self.by_key.drain().map(|(_, pending)| pending).collect()
    }
}
