//! Plugin trait and execution chain.
//!
//! A plugin hooks into the same request lifecycle phases Pingora's
//! `ProxyHttp` trait exposes. Route, service, consumer and global-rule
//! plugin lists are each compiled into a [`ProxyPluginExecutor`], which
//! itself implements [`ProxyPlugin`] so the HTTP service can drive it like
//! any single plugin.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pingora_error::{Error, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_load_balancing::Backend;
use pingora_proxy::Session;

use super::context::ProxyContext;
use super::error::ProxyResult;

/// A single plugin instance, built from its YAML/JSON configuration.
///
/// All phase methods default to a no-op so a plugin only needs to
/// override the phases it actually participates in.
#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Unique plugin name, used for registry lookup and deterministic sort.
    fn name(&self) -> &str;

    /// Higher values run earlier within a phase.
    fn priority(&self) -> i32 {
        0
    }

    async fn early_request_filter(
        &self,
        _session: &mut Session,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Returning `Ok(true)` short-circuits the chain: the plugin has already
    /// written a response and no further phases should run for this request.
    async fn request_filter(&self, _session: &mut Session, _ctx: &mut ProxyContext) -> Result<bool> {
        Ok(false)
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        _body: &mut Option<Bytes>,
        _end_of_stream: bool,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        _upstream_request: &mut RequestHeader,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        _upstream_response: &mut ResponseHeader,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        _body: &mut Option<Bytes>,
        _end_of_stream: bool,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    async fn logging(&self, _session: &mut Session, _e: Option<&Error>, _ctx: &mut ProxyContext) {}
}

/// Factory function registered under a plugin's name, turning its JSON
/// configuration into a boxed instance.
pub type PluginCreateFn = fn(serde_json::Value) -> ProxyResult<Arc<dyn ProxyPlugin>>;

/// Sorts plugins by descending priority, breaking ties by name so the
/// resulting order is independent of registration/iteration order.
pub fn sort_plugins_by_priority_desc(plugins: &mut [Arc<dyn ProxyPlugin>]) {
    plugins.sort_by(|a, b| b.priority().cmp(&a.priority()).then_with(|| a.name().cmp(b.name())));
}

/// A pre-sorted, pre-merged chain of plugins, itself runnable as a single
/// [`ProxyPlugin`]. Built once per route/service/consumer/global-rule set
/// and shared via `Arc` across requests.
#[derive(Default)]
pub struct ProxyPluginExecutor {
    pub plugins: Vec<Arc<dyn ProxyPlugin>>,
}

impl ProxyPluginExecutor {
    pub fn new(mut plugins: Vec<Arc<dyn ProxyPlugin>>) -> Self {
        sort_plugins_by_priority_desc(&mut plugins);
        Self { plugins }
    }
}

#[async_trait]
impl ProxyPlugin for ProxyPluginExecutor {
    fn name(&self) -> &str {
        "plugin-executor"
    }

    async fn early_request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<()> {
        for plugin in self.plugins.iter() {
            plugin.early_request_filter(session, ctx).await?;
        }
        Ok(())
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        // A plugin (key-auth, basic-auth) may identify a consumer mid-chain.
        // When that happens, splice the consumer's own plugins over whatever
        // plugins are left to run so the consumer overlay takes effect for
        // the rest of this request, per request-filter call.
        let mut remaining = self.plugins.clone();
        let mut i = 0;
        while i < remaining.len() {
            let had_consumer = ctx.consumer_plugins.is_some();
            if remaining[i].request_filter(session, ctx).await? {
                return Ok(true);
            }
            if !had_consumer {
                if let Some(consumer_plugins) = ctx.consumer_plugins.clone() {
                    let rest = merge_consumer_plugins(&remaining[i + 1..], &consumer_plugins);
                    remaining.truncate(i + 1);
                    remaining.extend(rest);
                }
            }
            i += 1;
        }
        Ok(false)
    }

    async fn request_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in self.plugins.iter() {
            plugin.request_body_filter(session, body, end_of_stream, ctx).await?;
        }
        Ok(())
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in self.plugins.iter() {
            plugin
                .upstream_request_filter(session, upstream_request, ctx)
                .await?;
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        // Response-side phases unwind in the opposite order from request-side
        // phases, so the most specific (route) plugin is the last to touch
        // the response before it reaches the client.
        for plugin in self.plugins.iter().rev() {
            plugin.response_filter(session, upstream_response, ctx).await?;
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in self.plugins.iter().rev() {
            plugin.response_body_filter(session, body, end_of_stream, ctx)?;
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut ProxyContext) {
        for plugin in self.plugins.iter() {
            plugin.logging(session, e, ctx).await;
        }
    }
}

/// Anything that can hand out a backend for a request: a concrete upstream,
/// or a plugin-selected override (see the traffic-split plugin).
pub trait UpstreamSelector: Send + Sync {
    fn select_backend(&self, session: &mut Session) -> Option<Backend>;
    fn upstream_host_rewrite(&self, upstream_request: &mut RequestHeader);
    fn get_retries(&self) -> Option<usize>;
    fn get_retry_timeout(&self) -> Option<u64>;

    /// Records the outcome of a request against `backend` for passive health
    /// checking. `status` is the upstream's response status, if one was
    /// received; `tcp_error` marks a connection-level failure.
    fn report_outcome(&self, backend: &Backend, status: Option<u16>, tcp_error: bool);
}

/// Overlays `consumer_plugins` onto `rest`: same-named plugins are replaced,
/// new ones are appended, and the result is re-sorted by priority.
fn merge_consumer_plugins(
    rest: &[Arc<dyn ProxyPlugin>],
    consumer_plugins: &[Arc<dyn ProxyPlugin>],
) -> Vec<Arc<dyn ProxyPlugin>> {
    let mut merged: Vec<Arc<dyn ProxyPlugin>> = rest
        .iter()
        .filter(|p| !consumer_plugins.iter().any(|cp| cp.name() == p.name()))
        .cloned()
        .collect();
    merged.extend(consumer_plugins.iter().cloned());
    sort_plugins_by_priority_desc(&mut merged);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedPlugin {
        name: &'static str,
        priority: i32,
    }

    #[async_trait]
    impl ProxyPlugin for NamedPlugin {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
    }

    #[test]
    fn sorts_by_priority_desc_then_name_asc() {
        let mut plugins: Vec<Arc<dyn ProxyPlugin>> = vec![
            Arc::new(NamedPlugin { name: "b", priority: 10 }),
            Arc::new(NamedPlugin { name: "a", priority: 20 }),
            Arc::new(NamedPlugin { name: "c", priority: 20 }),
        ];
        sort_plugins_by_priority_desc(&mut plugins);
        let order: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }
}
