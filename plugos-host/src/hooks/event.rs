//! Event hook: publish/subscribe between plugs and the host
//!
//! Functions subscribe with an `events` list in their definition:
//!
//! ```json
//! { "functions": { "onSave": { "code": "...", "events": ["page:saved", "page:*"] } } }
//! ```
//!
//! `*` in a subscription matches any run of characters. Dispatching an
//! event invokes every matching function concurrently and collects the
//! non-null results.
//!
//! The hook itself dispatches `plug:load` (argument: plug name) whenever a
//! plug is loaded.

use crate::hook::{Hook, LifecycleListener};
use crate::syscall::SyscallMapping;
use crate::system::{System, WeakSystem};
use crate::Plug;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use plugos_api::{Manifest, Value};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use wildmatch::WildMatch;

/// Event fired by the hook when a plug is loaded
pub const PLUG_LOAD_EVENT: &str = "plug:load";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event hook is not initialized")]
    NotInitialized,
}

/// Event hook metadata on a function definition
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventHookT {
    #[serde(default)]
    pub events: Option<Vec<String>>,
}

type LocalListener = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

struct Subscription {
    pattern: WildMatch,
    event: String,
    plug: String,
    function: String,
}

/// Routes events to subscribed plug functions and local listeners
#[derive(Default)]
pub struct EventHook {
    system: RwLock<Option<WeakSystem>>,
    subscriptions: RwLock<Vec<Subscription>>,
    local_listeners: RwLock<BTreeMap<String, Vec<LocalListener>>>,
}

impl EventHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to an event from host code
    pub fn add_local_listener<F, Fut>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let listener: LocalListener = Arc::new(move |args: Vec<Value>| listener(args).boxed());
        self.local_listeners
            .write()
            .unwrap()
            .entry(event.into())
            .or_default()
            .push(listener);
    }

    fn system(&self) -> Result<System, EventError> {
        self.system
            .read()
            .unwrap()
            .as_ref()
            .and_then(WeakSystem::upgrade)
            .ok_or(EventError::NotInitialized)
    }

    /// Every event name something listens to, sorted
    pub fn list_events(&self) -> Result<Vec<String>, EventError> {
        self.system()?;

        let mut events: BTreeSet<String> = self
            .subscriptions
            .read()
            .unwrap()
            .iter()
            .map(|s| s.event.clone())
            .collect();
        events.extend(self.local_listeners.read().unwrap().keys().cloned());
        Ok(events.into_iter().collect())
    }

    /// Invoke every listener of `event`, returning the non-null results
    ///
    /// Failing listeners are logged and skipped.
    pub async fn dispatch_event(&self, event: &str, args: Vec<Value>) -> Result<Vec<Value>, EventError> {
        let system = self.system()?;

        let targets: Vec<(Arc<Plug>, String)> = self
            .subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.pattern.matches(event))
            .filter_map(|s| {
                let plug = system.plug(&s.plug)?;
                plug.can_invoke(&s.function).then(|| (plug, s.function.clone()))
            })
            .collect();

        let local: Vec<LocalListener> = self
            .local_listeners
            .read()
            .unwrap()
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut calls: Vec<BoxFuture<'_, Option<Value>>> = Vec::new();
        for (plug, function) in targets {
            let args = args.clone();
            calls.push(
                async move {
                    match plug.invoke(&function, args).await {
                        Ok(value) => Some(value),
                        Err(e) => {
                            tracing::error!(
                                event = %event,
                                plug = %plug.name(),
                                function = %function,
                                error = %e,
                                "Error dispatching event"
                            );
                            None
                        }
                    }
                }
                .boxed(),
            );
        }
        for listener in local {
            let args = args.clone();
            calls.push(
                async move {
                    match listener(args).await {
                        Ok(value) => Some(value),
                        Err(e) => {
                            tracing::error!(event = %event, error = %e, "Local event listener failed");
                            None
                        }
                    }
                }
                .boxed(),
            );
        }

        Ok(join_all(calls)
            .await
            .into_iter()
            .flatten()
            .filter(|value| !value.is_null())
            .collect())
    }

    fn rebuild_index(&self) {
        let Ok(system) = self.system() else {
            return;
        };

        // Snapshot and store under one lock so a stale rebuild cannot land last
        let mut subscriptions = self.subscriptions.write().unwrap();
        subscriptions.clear();
        for plug in system.loaded_plugs() {
            for (function, def) in &plug.manifest().functions {
                let Ok(EventHookT { events: Some(events) }) = def.hook_metadata::<EventHookT>() else {
                    continue;
                };
                for event in events {
                    subscriptions.push(Subscription {
                        pattern: WildMatch::new(&event),
                        event,
                        plug: plug.name().to_string(),
                        function: function.clone(),
                    });
                }
            }
        }

        tracing::debug!(subscriptions = subscriptions.len(), "Event index rebuilt");
    }
}

impl Hook for EventHook {
    fn validate_manifest(&self, manifest: &Manifest) -> Vec<String> {
        manifest
            .functions
            .values()
            .filter(|def| def.hooks.contains_key("events"))
            .filter(|def| def.hook_metadata::<EventHookT>().is_err())
            .map(|_| "'events' key must be an array of strings".to_string())
            .collect()
    }

    fn apply(self: Arc<Self>, system: &System) {
        *self.system.write().unwrap() = Some(system.downgrade());
        system.add_listener(self.clone());
        self.rebuild_index();
    }
}

#[async_trait]
impl LifecycleListener for EventHook {
    async fn plug_loaded(&self, plug: &Arc<Plug>) {
        self.rebuild_index();
        let args = vec![Value::String(plug.name().to_string())];
        if let Err(e) = self.dispatch_event(PLUG_LOAD_EVENT, args).await {
            tracing::warn!(error = %e, "Failed to dispatch {}", PLUG_LOAD_EVENT);
        }
    }

    async fn plug_unloaded(&self, _name: &str) {
        self.rebuild_index();
    }
}

/// Syscalls exposing an event hook to plugs
///
/// - `event.dispatch(eventName, ...args)` returns the collected results
/// - `event.listEvents()` returns all event names with listeners
pub fn event_syscalls(hook: &Arc<EventHook>) -> SyscallMapping {
    let dispatch = hook.clone();
    let list = hook.clone();

    SyscallMapping::new()
        .with("event.dispatch", move |_ctx, args: Vec<Value>| {
            let hook = dispatch.clone();
            async move {
                let mut args = args.into_iter();
                let event = match args.next() {
                    Some(Value::String(event)) => event,
                    _ => anyhow::bail!("event.dispatch expects an event name"),
                };
                let results = hook.dispatch_event(&event, args.collect()).await?;
                anyhow::Ok(Value::Array(results))
            }
        })
        .with("event.listEvents", move |_ctx, _args| {
            let hook = list.clone();
            async move {
                let events = hook.list_events()?;
                anyhow::Ok(Value::Array(events.into_iter().map(Value::String).collect()))
            }
        })
}
