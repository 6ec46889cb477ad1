pub mod basic_auth;
pub mod csrf;
pub mod echo;
pub mod fault_injection;
pub mod key_auth;
pub mod prometheus;
pub mod redirect;
pub mod response_rewrite;
pub mod traffic_split;

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;

use crate::core::{PluginCreateFn, ProxyError, ProxyPlugin, ProxyResult};

/// Global registry mapping plugin names to their factory functions.
///
/// Plugins are registered with their priority values as comments for reference.
/// Higher priority values execute earlier in the plugin chain.
static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> = vec![
        (echo::PLUGIN_NAME, echo::create_echo_plugin), // 412
        (
            prometheus::PLUGIN_NAME,
            prometheus::create_prometheus_plugin,
        ), // 500
        (
            response_rewrite::PLUGIN_NAME,
            response_rewrite::create_response_rewrite_plugin,
        ), // 899
        (redirect::PLUGIN_NAME, redirect::create_redirect_plugin), // 900
        (
            traffic_split::PLUGIN_NAME,
            traffic_split::create_traffic_split_plugin,
        ), // 966
        (
            fault_injection::PLUGIN_NAME,
            fault_injection::create_fault_injection_plugin,
        ), // 11000
        (key_auth::PLUGIN_NAME, key_auth::create_key_auth_plugin), // 2500
        (
            basic_auth::PLUGIN_NAME,
            basic_auth::create_basic_auth_plugin,
        ), // 2520
        (csrf::PLUGIN_NAME, csrf::create_csrf_plugin), // 2980
    ];
    arr.into_iter().collect()
});

/// Creates plugin instances from configuration using a factory pattern.
///
/// Looks up the plugin builder function in the global registry and invokes it
/// with the provided configuration. Fails fast for unknown plugin types.
///
/// # Arguments
/// - `name`: Plugin identifier (must match registry keys)
/// - `cfg`: Plugin configuration as JSON
///
/// # Returns
/// Arc-wrapped plugin instance for thread-safe sharing across requests
///
/// # Errors
/// Returns `ReadError` for unknown plugin names or configuration parsing failures
pub fn build_plugin(name: &str, cfg: JsonValue) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let builder = PLUGIN_BUILDER_REGISTRY
        .get(name)
        .ok_or_else(|| ProxyError::Plugin(format!("Unknown plugin type: {name}")))?;
    builder(cfg)
}
