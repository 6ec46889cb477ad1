//! Consumer registry and credential indices.
//!
//! A [`config::Consumer`] is an identity attached to a request by the
//! key-auth or basic-auth plugin. Once identified, the consumer's own
//! plugins overlay the route/service plugin chain for the rest of the
//! request (see [`crate::core::plugin::ProxyPluginExecutor::request_filter`]).

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::{
    config::{self, Identifiable},
    core::{sort_plugins_by_priority_desc, ProxyError, ProxyPlugin, ProxyResult},
    plugins::{basic_auth, key_auth},
};

use super::MapOperations;

/// A loaded consumer: its config plus the runtime plugins it overlays.
pub struct ProxyConsumer {
    pub inner: config::Consumer,
    pub plugins: Vec<Arc<dyn ProxyPlugin>>,
}

impl Identifiable for ProxyConsumer {
    fn id(&self) -> &str {
        &self.inner.username
    }

    fn set_id(&mut self, id: String) {
        self.inner.username = id;
    }
}

impl ProxyConsumer {
    /// Builds a consumer's plugin chain, skipping `key-auth`/`basic-auth`
    /// entries since those are credential declarations consumed by
    /// [`reload_auth_indices`] rather than runtime plugins.
    pub fn new_with_plugins(consumer: config::Consumer) -> ProxyResult<Self> {
        let mut plugins = Vec::with_capacity(consumer.plugins.len());

        for (name, value) in consumer.plugins.clone() {
            if name == key_auth::PLUGIN_NAME || name == basic_auth::PLUGIN_NAME {
                continue;
            }
            log::info!("Loading plugin: {name}");
            let plugin = crate::plugins::build_plugin(&name, value).map_err(|e| {
                ProxyError::Plugin(format!(
                    "Failed to build plugin '{}' for consumer '{}': {}",
                    name, consumer.username, e
                ))
            })?;
            plugins.push(plugin);
        }

        sort_plugins_by_priority_desc(plugins.as_mut_slice());

        Ok(ProxyConsumer {
            inner: consumer,
            plugins,
        })
    }
}

pub static CONSUMER_MAP: Lazy<DashMap<String, Arc<ProxyConsumer>>> = Lazy::new(DashMap::new);

/// `key -> username`, built from every consumer's `key-auth` credential.
static KEY_AUTH_INDEX: Lazy<ArcSwap<HashMap<String, String>>> =
    Lazy::new(|| ArcSwap::new(Arc::new(HashMap::new())));

/// `basic-auth username -> (password, consumer username)`.
static BASIC_AUTH_INDEX: Lazy<ArcSwap<HashMap<String, (String, String)>>> =
    Lazy::new(|| ArcSwap::new(Arc::new(HashMap::new())));

/// Fetches a consumer by its own username.
pub fn consumer_fetch(username: &str) -> Option<Arc<ProxyConsumer>> {
    CONSUMER_MAP.get(username)
}

/// Fetches a consumer by a key presented to the key-auth plugin.
pub fn consumer_fetch_by_key(key: &str) -> Option<Arc<ProxyConsumer>> {
    let username = KEY_AUTH_INDEX.load().get(key).cloned()?;
    consumer_fetch(&username)
}

/// Fetches a consumer by the username presented to the basic-auth plugin,
/// returning the expected password alongside the consumer so the caller can
/// perform the actual comparison.
pub fn consumer_fetch_by_basic_auth(username: &str) -> Option<(String, Arc<ProxyConsumer>)> {
    let (password, consumer_username) = BASIC_AUTH_INDEX.load().get(username).cloned()?;
    let consumer = consumer_fetch(&consumer_username)?;
    Some((password, consumer))
}

/// Rebuilds the key-auth and basic-auth reverse indices from every consumer
/// currently in [`CONSUMER_MAP`]. Must be called after any change to it.
pub fn reload_auth_indices() {
    let mut key_index = HashMap::new();
    let mut basic_index = HashMap::new();

    for entry in CONSUMER_MAP.iter() {
        let consumer = entry.value();
        let username = &consumer.inner.username;

        if let Some(cfg) = consumer.inner.plugins.get(key_auth::PLUGIN_NAME) {
            for key in extract_keys(cfg) {
                key_index.insert(key, username.clone());
            }
        }

        if let Some(cfg) = consumer.inner.plugins.get(basic_auth::PLUGIN_NAME) {
            if let (Some(basic_username), Some(password)) = (
                cfg.get("username").and_then(|v| v.as_str()),
                cfg.get("password").and_then(|v| v.as_str()),
            ) {
                basic_index.insert(
                    basic_username.to_string(),
                    (password.to_string(), username.clone()),
                );
            }
        }
    }

    KEY_AUTH_INDEX.store(Arc::new(key_index));
    BASIC_AUTH_INDEX.store(Arc::new(basic_index));
}

/// Pulls every key out of a consumer's `key-auth` credential config, which
/// may declare a single `key` or multiple `keys` for rotation.
fn extract_keys(cfg: &serde_json::Value) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(key) = cfg.get("key").and_then(|v| v.as_str()) {
        keys.push(key.to_string());
    }
    if let Some(arr) = cfg.get("keys").and_then(|v| v.as_array()) {
        for v in arr {
            if let Some(k) = v.as_str() {
                keys.push(k.to_string());
            }
        }
    }
    keys
}

/// Loads consumers from static configuration, replacing the current set and
/// rebuilding the credential indices.
pub fn load_static_consumers(config: &config::Config) -> ProxyResult<()> {
    let proxy_consumers: Vec<Arc<ProxyConsumer>> = config
        .consumers
        .iter()
        .map(|consumer| {
            log::info!("Configuring Consumer: {}", consumer.username);
            ProxyConsumer::new_with_plugins(consumer.clone()).map(Arc::new)
        })
        .collect::<ProxyResult<Vec<_>>>()?;

    CONSUMER_MAP.reload_resources(proxy_consumers);
    reload_auth_indices();

    Ok(())
}
