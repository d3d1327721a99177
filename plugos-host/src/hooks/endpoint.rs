//! Endpoint hook: expose plug functions as HTTP-style routes
//!
//! A function declares one or more routes with an `http` field:
//!
//! ```json
//! { "http": { "path": "/hello", "method": "GET" } }
//! { "http": [{ "path": "/items" }, { "path": "/items", "method": "POST" }] }
//! ```
//!
//! A route is served at `{prefix}/{plug}{path}`. This hook only does the
//! routing; embedding it in an actual HTTP server is up to the host.

use crate::hook::{Hook, LifecycleListener};
use crate::system::{System, WeakSystem};
use crate::Plug;
use async_trait::async_trait;
use plugos_api::{Manifest, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Accepted values of `method`
pub const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "ANY"];

const DEFAULT_METHOD: &str = "GET";

/// Endpoint hook metadata on a function definition
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointHookT {
    #[serde(default)]
    pub http: Option<EndpointDefs>,
}

/// One route or a list of them
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EndpointDefs {
    Many(Vec<EndpointDef>),
    One(EndpointDef),
}

impl EndpointDefs {
    pub fn into_vec(self) -> Vec<EndpointDef> {
        match self {
            EndpointDefs::Many(defs) => defs,
            EndpointDefs::One(def) => vec![def],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointDef {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

/// Request handed to an endpoint function as its only argument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl EndpointRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Response an endpoint function must return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl EndpointResponse {
    fn error(message: String) -> Self {
        Self {
            status: 500,
            headers: BTreeMap::new(),
            body: Value::String(message),
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    path: String,
    method: String,
    plug: String,
    function: String,
}

impl Route {
    fn matches(&self, request: &EndpointRequest) -> bool {
        self.path == request.path
            && (self.method == "ANY" || self.method.eq_ignore_ascii_case(&request.method))
    }
}

/// Routes requests under a prefix to plug functions
pub struct EndpointHook {
    prefix: String,
    system: RwLock<Option<WeakSystem>>,
    routes: RwLock<Vec<Route>>,
}

impl EndpointHook {
    /// Serve routes under `prefix` (e.g. `/_`)
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            system: RwLock::new(None),
            routes: RwLock::new(Vec::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full paths and methods of every route, in registration order
    pub fn routes(&self) -> Vec<(String, String)> {
        self.routes
            .read()
            .unwrap()
            .iter()
            .map(|route| (route.method.clone(), route.path.clone()))
            .collect()
    }

    /// Serve a request, or `None` if no route matches
    pub async fn handle(&self, request: EndpointRequest) -> Option<EndpointResponse> {
        if !request.path.starts_with(&self.prefix) {
            return None;
        }

        let route = self
            .routes
            .read()
            .unwrap()
            .iter()
            .find(|route| route.matches(&request))
            .cloned()?;
        let system = self.system.read().unwrap().as_ref()?.upgrade()?;
        let plug = system.plug(&route.plug)?;

        tracing::debug!(path = %request.path, plug = %route.plug, function = %route.function, "Endpoint request");

        let args = match serde_json::to_value(&request) {
            Ok(value) => vec![value],
            Err(e) => return Some(EndpointResponse::error(e.to_string())),
        };

        let response = match plug.invoke(&route.function, args).await {
            Ok(value) => serde_json::from_value(value)
                .unwrap_or_else(|e| EndpointResponse::error(format!("Invalid endpoint response: {}", e))),
            Err(e) => {
                tracing::error!(plug = %route.plug, function = %route.function, error = %e, "Error executing endpoint");
                EndpointResponse::error(e.to_string())
            }
        };
        Some(response)
    }

    fn rebuild_routes(&self) {
        let Some(system) = self.system.read().unwrap().as_ref().and_then(WeakSystem::upgrade) else {
            return;
        };

        let mut routes = Vec::new();
        for plug in system.loaded_plugs() {
            for (function, def) in &plug.manifest().functions {
                let Ok(EndpointHookT { http: Some(defs) }) = def.hook_metadata::<EndpointHookT>() else {
                    continue;
                };
                for def in defs.into_vec() {
                    let Some(path) = def.path else { continue };
                    routes.push(Route {
                        path: format!("{}/{}{}", self.prefix, plug.name(), path),
                        method: def.method.unwrap_or_else(|| DEFAULT_METHOD.to_string()),
                        plug: plug.name().to_string(),
                        function: function.clone(),
                    });
                }
            }
        }
        *self.routes.write().unwrap() = routes;
    }
}

impl Hook for EndpointHook {
    fn validate_manifest(&self, manifest: &Manifest) -> Vec<String> {
        let mut errors = Vec::new();
        for def in manifest.functions.values() {
            if !def.hooks.contains_key("http") {
                continue;
            }
            let defs = match def.hook_metadata::<EndpointHookT>() {
                Ok(EndpointHookT { http: Some(defs) }) => defs.into_vec(),
                Ok(_) => continue,
                Err(_) => {
                    errors.push("'http' key must be an endpoint definition or a list of them".to_string());
                    continue;
                }
            };

            for EndpointDef { path, method } in defs {
                if path.is_none() {
                    errors.push("Path not defined for endpoint".to_string());
                }
                if let Some(method) = method {
                    if !METHODS.contains(&method.as_str()) {
                        errors.push(format!(
                            "Invalid method {} for end point with {}",
                            method,
                            path.as_deref().unwrap_or_default()
                        ));
                    }
                }
            }
        }
        errors
    }

    fn apply(self: Arc<Self>, system: &System) {
        *self.system.write().unwrap() = Some(system.downgrade());
        system.add_listener(self.clone());
        self.rebuild_routes();
    }
}

#[async_trait]
impl LifecycleListener for EndpointHook {
    async fn plug_loaded(&self, _plug: &Arc<Plug>) {
        self.rebuild_routes();
    }

    async fn plug_unloaded(&self, _name: &str) {
        self.rebuild_routes();
    }
}
