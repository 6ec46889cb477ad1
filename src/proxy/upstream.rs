use std::{
    collections::HashSet,
    sync::Arc,
    time::{self, Duration},
};

use dashmap::DashMap;
use http::Uri;
use log::info;
use once_cell::sync::Lazy;
use pingora::services::background::background_service;
use pingora_core::services::Service;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_load_balancing::{
    health_check::{HealthCheck as HealthCheckTrait, HttpHealthCheck, TcpHealthCheck},
    selection::{
        consistent::KetamaHashing, BackendIter, BackendSelection, FVNHash, Random, RoundRobin,
    },
    Backend, Backends, LoadBalancer,
};
use pingora_proxy::Session;
use pingora_runtime::Runtime;
use tokio::sync::watch;

use crate::config::{
    ActiveCheckType, Config, HealthCheck, Identifiable, SelectionType, Timeout, Upstream,
    UpstreamPassHost,
};
use crate::core::{ProxyError, ProxyResult, UpstreamSelector};
use crate::utils::request::request_selector_key;

use super::discovery::HybridDiscovery;
use super::MapOperations;

// Define a global upstream map, initialized lazily
pub static UPSTREAM_MAP: Lazy<DashMap<String, Arc<ProxyUpstream>>> = Lazy::new(DashMap::new);

/// Loads upstreams from the given configuration.
pub fn load_upstreams(config: &Config) -> Result<()> {
    let proxy_upstreams: std::result::Result<Vec<_>, _> = config
        .upstreams
        .iter()
        .map(|upstream| {
            info!("Configuring Upstream: {}", upstream.id);
            ProxyUpstream::new_with_health_check(upstream.clone(), config.pingora.work_stealing)
                .map(Arc::new)
        })
        .collect();

    UPSTREAM_MAP.reload_resources(proxy_upstreams?);
    Ok(())
}

/// Fetches an upstream by its ID.
pub fn upstream_fetch(id: &str) -> Option<Arc<ProxyUpstream>> {
    match UPSTREAM_MAP.get(id) {
        Some(upstream) => Some(upstream.value().clone()),
        None => {
            log::debug!("Upstream '{id}' not found in cache");
            None
        }
    }
}

/// Proxy load balancer.
///
/// Manages the load balancing of requests to upstream servers.
pub struct ProxyUpstream {
    pub inner: Upstream,
    lb: SelectionLB,

    /// Consecutive success/failure counts per backend address, used for
    /// passive health reporting.
    passive_counters: DashMap<String, PassiveCounters>,

    runtime: Option<Runtime>,
    watch: Option<watch::Sender<bool>>,
}

#[derive(Default)]
struct PassiveCounters {
    success: u32,
    failure: u32,
}

impl TryFrom<Upstream> for ProxyUpstream {
    type Error = Box<Error>;

    /// Creates a new `ProxyLB` instance from an `Upstream` configuration.
    fn try_from(value: Upstream) -> Result<Self> {
        Ok(Self {
            inner: value.clone(),
            lb: SelectionLB::try_from(value)?,
            passive_counters: DashMap::new(),
            runtime: None,
            watch: None,
        })
    }
}

impl Identifiable for ProxyUpstream {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn set_id(&mut self, id: String) {
        self.inner.id = id;
    }
}

impl UpstreamSelector for ProxyUpstream {
    fn select_backend(&self, session: &mut Session) -> Option<Backend> {
        ProxyUpstream::select_backend(self, session)
    }

    fn upstream_host_rewrite(&self, upstream_request: &mut RequestHeader) {
        ProxyUpstream::upstream_host_rewrite(self, upstream_request)
    }

    fn get_retries(&self) -> Option<usize> {
        ProxyUpstream::get_retries(self)
    }

    fn get_retry_timeout(&self) -> Option<u64> {
        ProxyUpstream::get_retry_timeout(self)
    }

    fn report_outcome(&self, backend: &Backend, status: Option<u16>, tcp_error: bool) {
        ProxyUpstream::report_outcome(self, backend, status, tcp_error)
    }
}

impl ProxyUpstream {
    /// Builds a `ProxyUpstream` and starts its health check service, used when
    /// loading resources from etcd (one background service per upstream).
    pub fn new_with_health_check(upstream: Upstream, work_stealing: bool) -> Result<Self> {
        let mut proxy_upstream = ProxyUpstream::try_from(upstream)?;
        proxy_upstream.start_health_check(work_stealing);
        Ok(proxy_upstream)
    }

    /// Builds a `ProxyUpstream` for an inline upstream definition (e.g. one
    /// embedded in a route or traffic-split plugin config) without spawning a
    /// dedicated health-check runtime, since those are expected to be
    /// short-lived and numerous.
    pub fn new_with_shared_health_check(upstream: Upstream) -> ProxyResult<Self> {
        ProxyUpstream::try_from(upstream).map_err(|e| ProxyError::from(*e))
    }

    /// Starts the health check service, runs only once.
    pub fn start_health_check(&mut self, work_stealing: bool) {
        if let Some(mut service) = self.take_background_service() {
            let (tx, rx) = watch::channel(false);
            self.watch = Some(tx);

            let threads = service.threads().unwrap_or(1);

            let runtime = if work_stealing {
                Runtime::new_steal(threads, service.name())
            } else {
                Runtime::new_no_steal(threads, service.name())
            };

            runtime.get_handle().spawn(async move {
                service.start_service(None, rx, 1).await;
                info!("service exited.")
            });

            // set runtime lifecycle with ProxyUpstream
            self.runtime = Some(runtime);
        }
    }

    /// Selects a backend server for a given session.
    pub fn select_backend<'a>(&'a self, session: &'a mut Session) -> Option<Backend> {
        let key = request_selector_key(session, &self.inner.hash_on, self.inner.key.as_str());
        log::debug!("proxy lb key: {}", &key);

        let mut backend = match &self.lb {
            SelectionLB::RoundRobin(lb) => lb.upstreams.select(key.as_bytes(), 256),
            SelectionLB::Random(lb) => lb.upstreams.select(key.as_bytes(), 256),
            SelectionLB::Fnv(lb) => lb.upstreams.select(key.as_bytes(), 256),
            SelectionLB::Ketama(lb) => lb.upstreams.select(key.as_bytes(), 256),
        };

        if let Some(ref mut b) = backend {
            if let Some(p) = b.ext.get_mut::<HttpPeer>() {
                // set timeout from upstream
                self.set_timeout(p);
            };
        }

        backend
    }

    /// Rewrites the upstream host in the request header if needed.
    pub fn upstream_host_rewrite(&self, upstream_request: &mut RequestHeader) {
        if self.inner.pass_host == UpstreamPassHost::REWRITE {
            if let Some(host) = &self.inner.upstream_host {
                upstream_request
                    .insert_header(http::header::HOST, host)
                    .unwrap();
            }
        }
    }

    /// Stops the health check service.
    fn stop_health_check(&mut self) {
        if let Some(tx) = self.watch.take() {
            let _ = tx.send(true);
        }
    }

    /// Takes the background service if it exists.
    fn take_background_service(&mut self) -> Option<Box<dyn Service + 'static>> {
        match self.lb {
            SelectionLB::RoundRobin(ref mut lb) => lb.service.take(),
            SelectionLB::Random(ref mut lb) => lb.service.take(),
            SelectionLB::Fnv(ref mut lb) => lb.service.take(),
            SelectionLB::Ketama(ref mut lb) => lb.service.take(),
        }
    }

    /// Records the outcome of a request against `backend` for passive health
    /// checking, flipping it unhealthy/healthy once its consecutive
    /// success/failure count crosses the configured threshold. A no-op when
    /// no `passive` check is configured for this upstream.
    pub fn report_outcome(&self, backend: &Backend, status: Option<u16>, tcp_error: bool) {
        let Some(passive) = self.inner.checks.as_ref().and_then(|c| c.passive.as_ref()) else {
            return;
        };

        let healthy_statuses: HashSet<u32> = passive
            .healthy
            .as_ref()
            .map(|h| h.http_statuses.iter().copied().collect())
            .unwrap_or_default();
        let unhealthy_statuses: HashSet<u32> = passive
            .unhealthy
            .as_ref()
            .map(|u| u.http_statuses.iter().copied().collect())
            .unwrap_or_default();

        let is_success =
            !tcp_error && status.is_some_and(|s| healthy_statuses.contains(&(s as u32)));
        let is_failure =
            tcp_error || status.is_some_and(|s| unhealthy_statuses.contains(&(s as u32)));

        if !is_success && !is_failure {
            return;
        }

        let addr = backend.addr.to_string();
        let mut counters = self.passive_counters.entry(addr).or_default();

        if is_success {
            counters.success += 1;
            counters.failure = 0;

            let threshold = passive.healthy.as_ref().map_or(2, |h| h.successes);
            if counters.success >= threshold {
                self.set_backend_health(backend, true);
            }
        } else {
            counters.failure += 1;
            counters.success = 0;

            let threshold = if tcp_error {
                passive.unhealthy.as_ref().map_or(2, |u| u.tcp_failures)
            } else {
                passive.unhealthy.as_ref().map_or(5, |u| u.http_failures)
            };
            if counters.failure >= threshold {
                self.set_backend_health(backend, false);
            }
        }
    }

    fn set_backend_health(&self, backend: &Backend, healthy: bool) {
        log::info!(
            "passive health check: marking backend {} {}",
            backend.addr,
            if healthy { "healthy" } else { "unhealthy" }
        );

        match &self.lb {
            SelectionLB::RoundRobin(lb) => lb.upstreams.backends().set_health(backend, healthy),
            SelectionLB::Random(lb) => lb.upstreams.backends().set_health(backend, healthy),
            SelectionLB::Fnv(lb) => lb.upstreams.backends().set_health(backend, healthy),
            SelectionLB::Ketama(lb) => lb.upstreams.backends().set_health(backend, healthy),
        }
    }

    /// Assembles this upstream's contribution to a route's `conf_version`:
    /// its own config revision, suffixed with the DNS resolution generation
    /// if it has changed since that revision was loaded.
    pub fn conf_version(&self) -> String {
        let generation = super::discovery::resolved_generation(&self.inner.id, self.inner.version);
        if generation == 0 {
            self.inner.version.to_string()
        } else {
            format!("{}#{}", self.inner.version, generation)
        }
    }

    /// Gets the number of retries from the upstream configuration.
    pub fn get_retries(&self) -> Option<usize> {
        self.inner.retries.map(|r| r as usize)
    }

    /// Gets the retry timeout from the upstream configuration.
    pub fn get_retry_timeout(&self) -> Option<u64> {
        self.inner.retry_timeout
    }

    /// Sets the timeout for an `HttpPeer`.
    fn set_timeout(&self, p: &mut HttpPeer) {
        if let Some(Timeout {
            connect,
            read,
            send,
        }) = self.inner.timeout
        {
            p.options.connection_timeout = Some(time::Duration::from_secs(connect));
            p.options.read_timeout = Some(time::Duration::from_secs(read));
            p.options.write_timeout = Some(time::Duration::from_secs(send));
        }
    }
}

impl Drop for ProxyUpstream {
    /// Stops the health check service if it exists.
    fn drop(&mut self) {
        self.stop_health_check();
    }
}

enum SelectionLB {
    RoundRobin(LB<RoundRobin>),
    Random(LB<Random>),
    Fnv(LB<FVNHash>),
    Ketama(LB<KetamaHashing>),
}

impl TryFrom<Upstream> for SelectionLB {
    type Error = Box<Error>;

    fn try_from(value: Upstream) -> Result<Self> {
        match value.r#type {
            SelectionType::RoundRobin => {
                Ok(SelectionLB::RoundRobin(LB::<RoundRobin>::try_from(value)?))
            }
            SelectionType::Random => Ok(SelectionLB::Random(LB::<Random>::try_from(value)?)),
            SelectionType::Fnv => Ok(SelectionLB::Fnv(LB::<FVNHash>::try_from(value)?)),
            SelectionType::Ketama => Ok(SelectionLB::Ketama(LB::<KetamaHashing>::try_from(value)?)),
        }
    }
}

struct LB<BS: BackendSelection> {
    upstreams: Arc<LoadBalancer<BS>>,
    service: Option<Box<dyn Service + 'static>>,
}

impl<BS> TryFrom<Upstream> for LB<BS>
where
    BS: BackendSelection + Send + Sync + 'static,
    BS::Iter: BackendIter,
{
    type Error = Box<Error>;

    fn try_from(upstream: Upstream) -> Result<Self> {
        let discovery: HybridDiscovery = upstream.clone().try_into()?;
        let mut upstreams = LoadBalancer::<BS>::from_backends(Backends::new(Box::new(discovery)));

        if let Some(check) = upstream.checks {
            let health_check: Box<(dyn HealthCheckTrait + Send + Sync + 'static)> =
                check.clone().into();
            upstreams.set_health_check(health_check);

            let mut health_check_frequency = Duration::from_secs(1);
            if let Some(healthy) = check.active.healthy {
                health_check_frequency = Duration::from_secs(healthy.interval as u64);
            }
            upstreams.health_check_frequency = Some(health_check_frequency);
        }

        let background = background_service("health check", upstreams);
        let upstreams = background.task();

        let this = Self {
            upstreams,
            service: Some(Box::new(background)),
        };

        Ok(this)
    }
}

impl From<HealthCheck> for Box<(dyn HealthCheckTrait + Send + Sync + 'static)> {
    fn from(value: HealthCheck) -> Self {
        match value.active.r#type {
            ActiveCheckType::TCP => {
                let health_check: Box<TcpHealthCheck> = value.into();
                health_check
            }
            ActiveCheckType::HTTP | ActiveCheckType::HTTPS => {
                let health_check: Box<HttpHealthCheck> = value.into();
                health_check
            }
        }
    }
}

impl From<HealthCheck> for Box<TcpHealthCheck> {
    fn from(value: HealthCheck) -> Self {
        let mut health_check = TcpHealthCheck::new();
        health_check.peer_template.options.total_connection_timeout =
            Some(Duration::from_secs(value.active.timeout as u64));

        if let Some(healthy) = value.active.healthy {
            health_check.consecutive_success = healthy.successes as usize;
        }

        if let Some(unhealthy) = value.active.unhealthy {
            health_check.consecutive_failure = unhealthy.tcp_failures as usize;
        }

        health_check
    }
}

impl From<HealthCheck> for Box<HttpHealthCheck> {
    fn from(value: HealthCheck) -> Self {
        let host = value.active.host.unwrap_or_default();
        let tls = value.active.r#type == ActiveCheckType::HTTPS;
        let mut health_check = HttpHealthCheck::new(host.as_str(), tls);

        health_check.peer_template.options.total_connection_timeout =
            Some(Duration::from_secs(value.active.timeout as u64));
        if tls {
            health_check.peer_template.options.verify_cert = value.active.https_verify_certificate;
        }

        if let Ok(uri) = Uri::builder()
            .path_and_query(value.active.http_path)
            .build()
        {
            health_check.req.set_uri(uri);
        }

        for header in value.active.req_headers.iter() {
            let mut parts = header.splitn(2, ":");
            if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
                let key = key.trim().to_string();
                let value = value.trim().to_string();
                let _ = health_check.req.insert_header(key, value);
            }
        }

        if let Some(port) = value.active.port {
            health_check.port_override = Some(port as u16);
        }

        if let Some(healthy) = value.active.healthy {
            health_check.consecutive_success = healthy.successes as usize;

            if !healthy.http_statuses.is_empty() {
                let http_statuses = healthy.http_statuses;

                health_check.validator = Some(Box::new(move |header: &ResponseHeader| {
                    if http_statuses.contains(&(header.status.as_u16() as u32)) {
                        Ok(())
                    } else {
                        Err(Error::new_str("Invalid response"))
                    }
                }));
            }
        }

        if let Some(unhealthy) = value.active.unhealthy {
            health_check.consecutive_failure = unhealthy.http_failures as usize;
        }

        Box::new(health_check)
    }
}

