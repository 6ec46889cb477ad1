use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::debug;
use matchit::{InsertError, Router as MatchRouter};
use once_cell::sync::Lazy;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, Result};
use pingora_proxy::Session;

use crate::{
    config::{self, Identifiable},
    core::{sort_plugins_by_priority_desc, ProxyPlugin, UpstreamSelector},
    plugins::build_plugin,
    utils::request::{get_request_host, resolve_var},
};

use super::{
    service::service_fetch,
    upstream::{upstream_fetch, ProxyUpstream},
    MapOperations,
};

use crate::core::context::ProxyContext;
use crate::plugins::traffic_split::CTX_KEY_UPSTREAM_OVERRIDE;

/// Proxy route.
///
/// Manages routing of requests to appropriate proxy load balancers.
pub struct ProxyRoute {
    pub inner: config::Route,
    pub upstream: Option<Arc<ProxyUpstream>>,
    pub plugins: Vec<Arc<dyn ProxyPlugin>>,
}

impl From<config::Route> for ProxyRoute {
    /// Creates a new `ProxyRoute` instance from a `Route` configuration.
    fn from(value: config::Route) -> Self {
        Self {
            inner: value,
            upstream: None,
            plugins: Vec::new(),
        }
    }
}

impl Identifiable for ProxyRoute {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn set_id(&mut self, id: String) {
        self.inner.id = id;
    }
}

impl ProxyRoute {
    pub fn new_with_upstream_and_plugins(
        route: config::Route,
        work_stealing: bool,
    ) -> Result<Self> {
        let mut proxy_route = Self::from(route.clone());

        // Inline upstream definitions start their own health check runtime,
        // same as a static top-level upstream.
        if let Some(upstream_config) = route.upstream {
            let mut proxy_upstream = ProxyUpstream::try_from(upstream_config)?;
            proxy_upstream.start_health_check(work_stealing);
            proxy_route.upstream = Some(Arc::new(proxy_upstream));
        }

        for (name, value) in route.plugins {
            let plugin = build_plugin(&name, value).map_err(|e| {
                Error::explain(
                    pingora_error::ErrorType::InternalError,
                    format!("Failed to build plugin '{name}' for route '{}': {e}", route.id),
                )
            })?;
            proxy_route.plugins.push(plugin);
        }

        sort_plugins_by_priority_desc(proxy_route.plugins.as_mut_slice());

        Ok(proxy_route)
    }

    /// Gets the upstream for the route, preferring (in order): an explicit
    /// plugin-selected override, the route's own upstream, its referenced
    /// service's upstream.
    pub fn resolve_upstream(&self, ctx: &ProxyContext) -> Option<Arc<dyn UpstreamSelector>> {
        if let Some(override_upstream) = ctx.get::<Arc<dyn UpstreamSelector>>(CTX_KEY_UPSTREAM_OVERRIDE) {
            return Some(override_upstream.clone());
        }

        self.upstream
            .clone()
            .map(|u| u as Arc<dyn UpstreamSelector>)
            .or_else(|| {
                self.inner
                    .upstream_id
                    .as_ref()
                    .and_then(|id| upstream_fetch(id.as_str()))
                    .map(|u| u as Arc<dyn UpstreamSelector>)
            })
            .or_else(|| {
                self.inner
                    .service_id
                    .as_ref()
                    .and_then(|id| service_fetch(id).and_then(|s| s.resolve_upstream()))
            })
    }

    /// Gets the list of hosts for the route.
    fn get_hosts(&self) -> Vec<String> {
        let hosts = self.inner.get_hosts();
        if !hosts.is_empty() {
            hosts
        } else if let Some(service) = self
            .inner
            .service_id
            .as_ref()
            .and_then(|id| service_fetch(id.as_str()))
        {
            service.inner.hosts.clone()
        } else {
            vec![]
        }
    }

    pub fn select_http_peer<'a>(
        &'a self,
        session: &'a mut Session,
        ctx: &ProxyContext,
    ) -> Result<Box<HttpPeer>> {
        self.resolve_upstream(ctx)
            .ok_or_else(|| Error::new_str("Failed to retrieve upstream configuration for route"))
            .and_then(|upstream| {
                upstream
                    .select_backend(session)
                    .ok_or_else(|| Error::new_str("Unable to determine backend for the request"))
            })
            .and_then(|mut backend| {
                backend
                    .ext
                    .get_mut::<HttpPeer>()
                    .map(|peer| {
                        self.set_timeout(peer);
                        Box::new(peer.clone())
                    })
                    .ok_or_else(|| Error::new_str("Missing selected backend metadata for HttpPeer"))
            })
    }

    /// Assembles a version string identifying the exact config snapshot this
    /// route currently resolves to: `<route.version>[&<service.version>][#<generation>]`,
    /// where `generation` bumps only when the resolved upstream's DNS-backed
    /// node set actually changes (see `discovery::resolved_generation`).
    pub fn conf_version(&self) -> String {
        let mut version = self.inner.version.to_string();

        if let Some(service) = self
            .inner
            .service_id
            .as_ref()
            .and_then(|id| service_fetch(id.as_str()))
        {
            version = format!("{}&{}", version, service.inner.version);
        }

        let upstream = self.upstream.clone().or_else(|| {
            self.inner
                .upstream_id
                .as_ref()
                .and_then(|id| upstream_fetch(id.as_str()))
        });

        if let Some(upstream) = upstream {
            let generation =
                super::discovery::resolved_generation(&upstream.inner.id, upstream.inner.version);
            if generation > 0 {
                version = format!("{}#{}", version, generation);
            }
        }

        version
    }

    /// Sets the timeout for an `HttpPeer` based on the route configuration.
    fn set_timeout(&self, p: &mut HttpPeer) {
        if let Some(config::Timeout {
            connect,
            read,
            send,
        }) = self.inner.timeout
        {
            p.options.connection_timeout = Some(Duration::from_secs(connect));
            p.options.read_timeout = Some(Duration::from_secs(read));
            p.options.write_timeout = Some(Duration::from_secs(send));
        }
    }
}

#[derive(Default)]
pub struct MatchEntry {
    /// Router for non-host URI matching
    non_host_uri: MatchRouter<Vec<Arc<ProxyRoute>>>,
    /// Router for host URI matching
    host_uris: MatchRouter<MatchRouter<Vec<Arc<ProxyRoute>>>>,
}

impl MatchEntry {
    fn insert_into_router(
        router: &mut MatchRouter<Vec<Arc<ProxyRoute>>>,
        uri: &str,
        proxy_route: Arc<ProxyRoute>,
    ) -> Result<(), InsertError> {
        match router.at_mut(uri) {
            Ok(routes) => {
                routes.value.push(proxy_route);
                routes
                    .value
                    .sort_by(|a, b| b.inner.priority.cmp(&a.inner.priority));
            }
            Err(_) => {
                router.insert(uri, vec![proxy_route])?;
            }
        }
        Ok(())
    }

    /// Inserts a route into the match entry.
    pub fn insert_route(&mut self, proxy_route: Arc<ProxyRoute>) -> Result<(), InsertError> {
        let hosts = proxy_route.get_hosts();
        let uris = proxy_route.inner.get_uris();

        if hosts.is_empty() {
            // Insert for non-host URIs
            for uri in &uris {
                Self::insert_into_router(&mut self.non_host_uri, uri, proxy_route.clone())?;
            }
        } else {
            // Insert for host URIs
            for host in hosts.iter() {
                let reversed_host = host.chars().rev().collect::<String>();
                let inner_router = self.host_uris.at_mut(reversed_host.as_str());

                let inner_router = match inner_router {
                    Ok(router) => router.value,
                    Err(_) => {
                        let new_router = MatchRouter::new();
                        self.host_uris.insert(reversed_host.clone(), new_router)?;
                        self.host_uris.at_mut(reversed_host.as_str()).unwrap().value
                    }
                };

                for uri in &uris {
                    Self::insert_into_router(inner_router, uri, proxy_route.clone())?;
                }
            }
        }

        Ok(())
    }

    /// Matches a request to a route.
    pub fn match_request(
        &self,
        session: &mut Session,
    ) -> Option<(BTreeMap<String, String>, Arc<ProxyRoute>)> {
        let host = get_request_host(session.req_header()).map(|h| h.to_string());
        let uri = session.req_header().uri.path().to_string();
        let method = session.req_header().method.as_str().to_string();

        log::debug!(
            "match request: host={:?}, uri={:?}, method={:?}",
            host,
            uri,
            method
        );

        // Attempt to match using host_uris if a valid host is provided
        if let Some(reversed_host) = host
            .filter(|h| !h.is_empty())
            .map(|h| h.chars().rev().collect::<String>())
        {
            if let Ok(v) = self.host_uris.at(&reversed_host) {
                if let Some(result) = Self::match_uri_method(v.value, &uri, &method, session) {
                    return Some(result);
                }
            }
        }

        // Fall back to non-host URI matching
        Self::match_uri_method(&self.non_host_uri, &uri, &method, session)
    }

    /// Matches a URI to a route, then filters the candidates by method,
    /// `remote_addrs` CIDR membership and `vars` predicates, in priority order.
    fn match_uri_method(
        match_router: &MatchRouter<Vec<Arc<ProxyRoute>>>,
        uri: &str,
        method: &str,
        session: &mut Session,
    ) -> Option<(BTreeMap<String, String>, Arc<ProxyRoute>)> {
        if let Ok(v) = match_router.at(uri) {
            let params: BTreeMap<String, String> = v
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();

            for route in v.value.iter() {
                let method_ok =
                    route.inner.methods.is_empty() || route.inner.methods.iter().any(|m| m.to_string() == method);

                if method_ok && Self::matches_predicates(&route.inner, session) {
                    return Some((params, route.clone()));
                }
            }
        }
        None
    }

    /// Evaluates a route's `remote_addrs` and `vars` predicates against the request.
    fn matches_predicates(route: &config::Route, session: &mut Session) -> bool {
        if let Some(remote_addrs) = &route.remote_addrs {
            let client_ip = session.client_addr().and_then(|a| a.as_inet()).map(|i| i.ip());

            let allowed = match client_ip {
                Some(ip) => remote_addrs.iter().any(|cidr| {
                    cidr.parse::<ipnetwork::IpNetwork>()
                        .map(|net| net.contains(ip))
                        .unwrap_or(false)
                }),
                None => false,
            };

            if !allowed {
                return false;
            }
        }

        if let Some(vars) = &route.vars {
            for predicate in vars {
                let actual = resolve_var(session, &predicate.var);
                if !predicate.matches(&actual) {
                    return false;
                }
            }
        }

        true
    }
}

/// Global map to store global rules, initialized lazily.
pub static ROUTE_MAP: Lazy<DashMap<String, Arc<ProxyRoute>>> = Lazy::new(DashMap::new);
static GLOBAL_MATCH: Lazy<ArcSwap<MatchEntry>> =
    Lazy::new(|| ArcSwap::new(Arc::new(MatchEntry::default())));

pub fn global_match_fetch() -> Arc<MatchEntry> {
    GLOBAL_MATCH.load().clone()
}

pub fn reload_global_route_match() {
    let mut matcher = MatchEntry::default();

    for route in ROUTE_MAP.iter() {
        debug!("Inserting route: {}", route.inner.id);
        matcher.insert_route(route.clone()).unwrap();
    }

    GLOBAL_MATCH.store(Arc::new(matcher));
}

/// Loads routes from the given configuration.
pub fn load_static_routes(config: &config::Config) -> Result<()> {
    let proxy_routes: Vec<Arc<ProxyRoute>> = config
        .routes
        .iter()
        .map(|route| {
            log::info!("Configuring Route: {}", route.id);
            match ProxyRoute::new_with_upstream_and_plugins(
                route.clone(),
                config.pingora.work_stealing,
            ) {
                Ok(proxy_route) => Ok(Arc::new(proxy_route)),
                Err(e) => {
                    log::error!("Failed to configure Route {}: {}", route.id, e);
                    Err(e)
                }
            }
        })
        .collect::<Result<Vec<_>>>()?;

    ROUTE_MAP.reload_resources(proxy_routes);

    reload_global_route_match();

    Ok(())
}

/// Fetches an upstream by its ID.
pub fn route_fetch(id: &str) -> Option<Arc<ProxyRoute>> {
    match ROUTE_MAP.get(id) {
        Some(rule) => Some(rule.value().clone()),
        None => {
            log::warn!("Route with id '{}' not found", id);
            None
        }
    }
}
