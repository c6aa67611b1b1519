//! Action registry: hubs of named capabilities and name-based dispatch.
//!
//! A `Hub` groups the actions contributed by one provider (a file-system
//! tool set, a shell tool, a remote MCP server). The `Registry` aggregates
//! hubs and is the single name-to-action resolution path used by the
//! execution engine.
//!
//! Resolution is by registration order: the first hub containing an action
//! with the requested name wins. Re-registering a hub name replaces the
//! prior hub in place, so the tie-break stays stable across updates.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{CallError, CallResult};

/// The contract a capability provider implements for each action.
///
/// Handlers are treated as non-preemptible: once invoked they run to
/// completion even if the surrounding plan is cancelled.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn invoke(&self, params: Value) -> anyhow::Result<Value>;
}

type BoxedActionFn = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

struct FnHandler {
    f: Box<BoxedActionFn>,
}

#[async_trait]
impl ActionHandler for FnHandler {
    async fn invoke(&self, params: Value) -> anyhow::Result<Value> {
        (self.f)(params).await
    }
}

/// An atomic invokable capability: a name, a description, and a handler.
///
/// Immutable once registered.
#[derive(Clone)]
pub struct Action {
    pub name: String,
    pub description: String,
    handler: Arc<dyn ActionHandler>,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            handler,
        }
    }

    /// Build an action from an async closure, the common case for tests
    /// and for providers that don't need a stateful handler type.
    pub fn from_fn<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let boxed: Box<BoxedActionFn> = Box::new(move |params| Box::pin(f(params)));
        Self {
            name: name.into(),
            description: description.into(),
            handler: Arc::new(FnHandler { f: boxed }),
        }
    }

    pub async fn invoke(&self, params: Value) -> anyhow::Result<Value> {
        self.handler.invoke(params).await
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// A named, described collection of actions from one provider.
#[derive(Debug, Clone)]
pub struct Hub {
    pub name: String,
    pub description: String,
    actions: Vec<Action>,
}

impl Hub {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            actions: Vec::new(),
        }
    }

    /// Add an action, keeping declaration order.
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }
}

/// Summary of a registered action, for capability discovery.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ActionInfo {
    pub name: String,
    pub description: String,
    pub hub: String,
}

/// Aggregates hubs and resolves action names to their owning hub.
///
/// The hub table is copy-on-write: `register`/`unregister` swap in a new
/// `Arc<Vec<_>>` under a write lock while in-flight dispatches keep reading
/// the snapshot they started with. Readers observe either the pre- or
/// post-registration state, never a partially updated list.
pub struct Registry {
    pub name: String,
    pub description: String,
    hubs: RwLock<Arc<Vec<Arc<Hub>>>>,
}

impl Registry {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            hubs: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Register a hub. Idempotent by hub name: re-registering replaces the
    /// prior hub at its original position in registration order.
    pub fn register(&self, hub: Hub) {
        let hub = Arc::new(hub);
        let mut guard = self.hubs.write();
        let mut next: Vec<Arc<Hub>> = guard.as_ref().clone();
        match next.iter().position(|h| h.name == hub.name) {
            Some(idx) => {
                debug!(hub = %hub.name, "replacing registered hub");
                next[idx] = hub;
            }
            None => {
                debug!(hub = %hub.name, actions = hub.actions.len(), "registering hub");
                next.push(hub);
            }
        }
        *guard = Arc::new(next);
    }

    /// Remove a hub by name. Returns whether a hub was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut guard = self.hubs.write();
        let before = guard.len();
        let next: Vec<Arc<Hub>> = guard
            .as_ref()
            .iter()
            .filter(|h| h.name != name)
            .cloned()
            .collect();
        let removed = next.len() != before;
        if removed {
            debug!(hub = %name, "unregistered hub");
            *guard = Arc::new(next);
        }
        removed
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Hub>>> {
        self.hubs.read().clone()
    }

    /// Find the first hub, in registration order, containing `action_name`.
    pub fn resolve(&self, action_name: &str) -> Option<Arc<Hub>> {
        self.snapshot()
            .iter()
            .find(|h| h.action(action_name).is_some())
            .cloned()
    }

    /// Resolve and invoke an action by name, awaiting its completion.
    ///
    /// Fails with `ActionNotFound` when no registered hub carries the name
    /// and `ActionFailed` when the handler itself errors; the underlying
    /// cause is preserved, not flattened to a string.
    pub async fn dispatch(&self, action_name: &str, params: Value) -> CallResult<Value> {
        let hub = self
            .resolve(action_name)
            .ok_or_else(|| CallError::ActionNotFound(action_name.to_string()))?;

        // The hub may have been replaced between resolve and lookup; treat a
        // vanished action the same as an unknown one.
        let action = hub
            .action(action_name)
            .ok_or_else(|| CallError::ActionNotFound(action_name.to_string()))?
            .clone();

        debug!(action = %action_name, hub = %hub.name, "dispatching action");
        action
            .invoke(params)
            .await
            .map_err(|source| {
                warn!(action = %action_name, error = %source, "action failed");
                CallError::ActionFailed {
                    action: action_name.to_string(),
                    source,
                }
            })
    }

    /// Flattened list of registered actions, de-duplicated by name.
    ///
    /// When two hubs carry the same action name, the entry from the hub
    /// registered first is kept, matching `resolve`'s tie-break.
    pub fn list_actions(&self) -> Vec<ActionInfo> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for hub in self.snapshot().iter() {
            for action in hub.actions() {
                if seen.insert(action.name.clone()) {
                    out.push(ActionInfo {
                        name: action.name.clone(),
                        description: action.description.clone(),
                        hub: hub.name.clone(),
                    });
                }
            }
        }
        out
    }

    pub fn hub_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|h| h.name.clone()).collect()
    }

    pub fn hub_count(&self) -> usize {
        self.snapshot().len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("hubs", &self.hub_names())
            .finish()
    }
}
