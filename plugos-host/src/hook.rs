//! Extension points of the runtime
//!
//! A [`Hook`] gives meaning to extra fields of function definitions (event
//! subscriptions, HTTP routes, ...). It vetoes manifests it cannot accept
//! and keeps its own index of loaded plugs up to date by listening to
//! lifecycle events.

use crate::{Plug, System};
use async_trait::async_trait;
use plugos_api::Manifest;
use std::sync::Arc;

/// A runtime extension
pub trait Hook: Send + Sync {
    /// Check the hook's metadata on a manifest about to be loaded
    ///
    /// Returns human readable errors; any error rejects the manifest.
    fn validate_manifest(&self, manifest: &Manifest) -> Vec<String>;

    /// Attach to a system
    ///
    /// Called once, when the hook is added with [`System::add_hook`].
    /// Typically registers a [`LifecycleListener`] and keeps a weak handle
    /// to the system.
    fn apply(self: Arc<Self>, system: &System);
}

/// Receives plug lifecycle events
///
/// Events are delivered after the system's state has changed. A reload
/// produces `plug_unloaded` followed by `plug_loaded`.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn plug_loaded(&self, _plug: &Arc<Plug>) {}

    async fn plug_unloaded(&self, _name: &str) {}
}
