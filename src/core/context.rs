//! Request context management
//!
//! This module provides the ProxyContext that holds per-request state
//! and facilitates communication between different components.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Instant,
};

use pingora_core::upstreams::peer::HttpPeer;

use super::plugin::{ProxyPlugin, ProxyPluginExecutor};
use crate::proxy::route::ProxyRoute;

/// Context that holds per-request state and metadata, threaded through
/// every phase of a single request's lifecycle.
pub struct ProxyContext {
    /// The matched route, if any.
    pub route: Option<Arc<ProxyRoute>>,

    /// Named parameters extracted from the route's URI pattern.
    pub route_params: BTreeMap<String, String>,

    /// Number of upstream connection attempts so far.
    pub tries: usize,

    /// Plugin chain compiled from the matched route (and its service, if any).
    pub plugin: Arc<ProxyPluginExecutor>,

    /// Plugin chain compiled from global rules, run in addition to `plugin`.
    pub global_plugin: Arc<ProxyPluginExecutor>,

    /// When the request started being processed, used for latency metrics.
    pub request_start: Instant,

    /// The upstream peer selected for this request, once known.
    pub peer: Option<HttpPeer>,

    /// etcd config revision in effect when this request was routed, if config
    /// came from etcd.
    pub conf_version: Option<String>,

    /// Username of the consumer identified by key-auth/basic-auth, if any.
    pub consumer_username: Option<String>,

    /// Plugins configured on the identified consumer. Once set, these take
    /// precedence over same-named route/service plugins for the rest of the request.
    pub consumer_plugins: Option<Vec<Arc<dyn ProxyPlugin>>>,

    /// Custom variables available to plugins (type-erased, thread-safe).
    vars: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self {
            route: None,
            route_params: BTreeMap::new(),
            tries: 0,
            plugin: Arc::new(ProxyPluginExecutor::default()),
            global_plugin: Arc::new(ProxyPluginExecutor::default()),
            request_start: Instant::now(),
            peer: None,
            conf_version: None,
            consumer_username: None,
            consumer_plugins: None,
            vars: HashMap::new(),
        }
    }
}

impl ProxyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds elapsed since `request_start`, for latency metrics.
    pub fn elapsed_ms_f64(&self) -> f64 {
        self.request_start.elapsed().as_secs_f64() * 1000.0
    }

    /// Store a typed value into the context.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.vars.insert(key.into(), Box::new(value));
    }

    /// Get a typed reference from the context.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.vars.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Get a string slice if the stored value is a `String`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get::<String>(key).map(|s| s.as_str())
    }

    /// Check if a key exists in the context.
    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Remove a value from the context.
    pub fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.vars.remove(key)
    }

    /// Clear all custom variables.
    pub fn clear_custom_vars(&mut self) {
        self.vars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let mut ctx = ProxyContext::new();
        ctx.set("answer", 42i32);
        assert_eq!(ctx.get::<i32>("answer"), Some(&42));
        assert!(ctx.contains("answer"));
        ctx.remove("answer");
        assert!(!ctx.contains("answer"));
    }

    #[test]
    fn elapsed_ms_is_non_negative() {
        let ctx = ProxyContext::new();
        assert!(ctx.elapsed_ms_f64() >= 0.0);
    }
}
