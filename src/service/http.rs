use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use pingora::modules::http::HttpModules;
use pingora::modules::http::{compression::ResponseCompressionBuilder, grpc_web::GrpcWeb};
use pingora_core::upstreams::peer::{HttpPeer, Peer};
use pingora_error::{Error, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_load_balancing::Backend;
use pingora_proxy::{ProxyHttp, Session};

use crate::core::{sort_plugins_by_priority_desc, ProxyContext, ProxyPlugin, ProxyPluginExecutor};
use crate::proxy::{global_rule::global_plugin_fetch, route::global_match_fetch, service::service_fetch};

/// Proxy service.
///
/// Dispatches every request through the route/global plugin chains and
/// selects an upstream peer, relying on the statically matched route held
/// in `ProxyContext` rather than owning any routing state itself.
#[derive(Default)]
pub struct HttpService;

/// Builds the plugin chain for a matched route: the route's own plugins
/// merged with its service's (if any), deterministically ordered.
fn build_route_plugin_executor(route: &crate::proxy::route::ProxyRoute) -> Arc<ProxyPluginExecutor> {
    let mut plugins: Vec<Arc<dyn ProxyPlugin>> = route.plugins.clone();

    if let Some(service_id) = route.inner.service_id.as_ref() {
        if let Some(service) = service_fetch(service_id) {
            plugins.extend(service.plugins.iter().cloned());
        }
    }

    sort_plugins_by_priority_desc(&mut plugins);
    Arc::new(ProxyPluginExecutor::new(plugins))
}

impl HttpService {
    /// Feeds this request's outcome into the matched upstream's passive
    /// health check. A response was never written when the request failed
    /// before reaching the upstream (connect/handshake failure), which we
    /// treat as a TCP-level failure.
    fn report_passive_outcome(&self, session: &mut Session, e: Option<&Error>, ctx: &ProxyContext) {
        let (Some(route), Some(peer)) = (ctx.route.clone(), ctx.peer.clone()) else {
            return;
        };
        let Some(upstream) = route.resolve_upstream(ctx) else {
            return;
        };

        let status = session.response_written().map(|r| r.status.as_u16());
        let tcp_error = status.is_none() && e.is_some();

        if let Ok(backend) = Backend::new(&peer.address().to_string()) {
            upstream.report_outcome(&backend, status, tcp_error);
        }
    }
}

#[async_trait]
impl ProxyHttp for HttpService {
    type CTX = ProxyContext;

    /// Creates a new context for each request
    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    /// Selects an upstream peer for the request
    async fn upstream_peer(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let route = ctx
            .route
            .clone()
            .ok_or_else(|| Error::new_str("No route matched for request"))?;
        let peer = route.select_http_peer(session, ctx)?;
        ctx.peer = Some((*peer).clone());
        Ok(peer)
    }

    /// Set up downstream modules.
    ///
    /// set up [ResponseCompressionBuilder] for gzip and brotli compression.
    /// set up [GrpcWeb] for grpc-web protocol.
    fn init_downstream_modules(&self, modules: &mut HttpModules) {
        // Add disabled downstream compression module by default
        modules.add_module(ResponseCompressionBuilder::enable(0));
        // Add the gRPC web module
        modules.add_module(Box::new(GrpcWeb));
    }

    /// Handle the incoming request before any downstream module is executed.
    async fn early_request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<()> {
        if let Some((route_params, route)) = global_match_fetch().match_request(session) {
            ctx.plugin = build_route_plugin_executor(&route);
            ctx.conf_version = Some(route.conf_version());
            ctx.route_params = route_params;
            ctx.route = Some(route);
        }
        ctx.global_plugin = global_plugin_fetch();

        ctx.global_plugin.clone().early_request_filter(session, ctx).await?;
        ctx.plugin.clone().early_request_filter(session, ctx).await
    }

    /// Filters incoming requests
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        if ctx.route.is_none() {
            session
                .respond_error(StatusCode::NOT_FOUND.as_u16())
                .await?;
            return Ok(true);
        }

        if ctx.global_plugin.clone().request_filter(session, ctx).await? {
            return Ok(true);
        }
        ctx.plugin.clone().request_filter(session, ctx).await
    }

    async fn request_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        ctx.global_plugin
            .clone()
            .request_body_filter(session, body, end_of_stream, ctx)
            .await?;
        ctx.plugin
            .clone()
            .request_body_filter(session, body, end_of_stream, ctx)
            .await
    }

    // Modify the request before it is sent to the upstream
    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        ctx.global_plugin
            .clone()
            .upstream_request_filter(session, upstream_request, ctx)
            .await?;
        ctx.plugin
            .clone()
            .upstream_request_filter(session, upstream_request, ctx)
            .await?;

        if let Some(route) = ctx.route.clone() {
            if let Some(upstream) = route.resolve_upstream(ctx) {
                upstream.upstream_host_rewrite(upstream_request);
            }
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        ctx.plugin
            .clone()
            .response_filter(session, upstream_response, ctx)
            .await?;
        ctx.global_plugin
            .clone()
            .response_filter(session, upstream_response, ctx)
            .await
    }

    fn response_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        ctx.plugin
            .clone()
            .response_body_filter(session, body, end_of_stream, ctx)?;
        ctx.global_plugin
            .clone()
            .response_body_filter(session, body, end_of_stream, ctx)?;
        Ok(None)
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        ctx.plugin.clone().logging(session, e, ctx).await;
        ctx.global_plugin.clone().logging(session, e, ctx).await;

        self.report_passive_outcome(session, e, ctx);
    }

    /// This filter is called when there is an error in the process of establishing a connection to the upstream.
    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        let Some(route) = ctx.route.clone() else {
            return e;
        };
        let Some(upstream) = route.resolve_upstream(ctx) else {
            return e;
        };

        if let Some(retries) = upstream.get_retries() {
            if retries == 0 || ctx.tries >= retries {
                return e;
            }

            if let Some(timeout) = upstream.get_retry_timeout() {
                if ctx.request_start.elapsed().as_millis() > (timeout * 1000) as u128 {
                    return e;
                }
            }

            ctx.tries += 1;
            e.set_retry(true);
        }

        e
    }
}
