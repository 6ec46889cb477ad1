//! Core abstractions and interfaces for the gateway.
//!
//! This module provides the foundational traits, types, and utilities
//! that form the backbone of the proxy: the request context, the plugin
//! trait and execution chain, error handling, readiness state, and small
//! stateless helpers shared across plugins.

pub mod context;
pub mod error;
pub mod plugin;
pub mod status;
pub mod util;

pub use context::ProxyContext;
pub use error::{ErrorContext, ProxyError, ProxyResult};
pub use plugin::{sort_plugins_by_priority_desc, PluginCreateFn, ProxyPlugin, ProxyPluginExecutor, UpstreamSelector};
pub use util::{apply_regex_uri_template, constant_time_eq};
