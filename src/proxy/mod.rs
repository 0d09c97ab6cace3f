//! The stream-level orchestrator.
//!
//! For every downstream request: run receive filters, resolve a route,
//! choose a cluster and host, borrow an upstream stream from the pool, relay
//! the request and push the response back through the send filters. The
//! retry loop re-routes on retryable failures; per-try and overall timers
//! bound each attempt; every terminal outcome sets a response flag.

pub mod access_log;
pub mod request_info;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::buffer::IoBuffer;
use crate::cluster::lb::LbContext;
use crate::cluster::{Cluster, ClusterManager};
use crate::config::{ProtocolConfig, ProxyFilterConfig, StreamFilterConfig};
use crate::error::{ProxyError, Result};
use crate::filter::{ChainResult, FilterPhase, StreamFilterChain, build_chain};
use crate::metrics::{DownstreamStats, Scope};
use crate::network::connection::{CloseType, Connection, ConnectionEvent, ConnectionEventListener};
use crate::network::filter::{FilterStatus, ReadContext, ReadFilter};
use crate::pool::{PoolOptions, PoolRegistry, UpstreamStream};
use crate::protocol::detect::{DetectResult, ProtocolDetector};
use crate::protocol::{self, Codec, Frame, Headers, Protocol, names};
use crate::router::{RetryOn, Route, RouteAction, RouterManager};
use crate::stream::{ServerStreamConnection, StreamHandler};
use request_info::{RequestInfo, ResponseFlag};

const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PER_TRY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Proxy {
    name: String,
    router_config_name: String,
    downstream_protocol: ProtocolConfig,
    upstream_protocol: ProtocolConfig,
    routers: Arc<RouterManager>,
    clusters: Arc<ClusterManager>,
    pools: Arc<PoolRegistry>,
    stream_filters: Vec<StreamFilterConfig>,
    stats: DownstreamStats,
}

impl Proxy {
    pub fn new(
        config: &ProxyFilterConfig,
        stream_filters: Vec<StreamFilterConfig>,
        routers: Arc<RouterManager>,
        clusters: Arc<ClusterManager>,
        pools: Arc<PoolRegistry>,
    ) -> Arc<Self> {
        let name = if config.name.is_empty() {
            config.router_config_name.clone()
        } else {
            config.name.clone()
        };
        let stats = DownstreamStats::new(Scope::Proxy, &name);
        Arc::new(Self {
            name,
            router_config_name: config.router_config_name.clone(),
            downstream_protocol: config.downstream_protocol.clone(),
            upstream_protocol: config.upstream_protocol.clone(),
            routers,
            clusters,
            pools,
            stream_filters,
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn detector(&self) -> ProtocolDetector {
        let codecs: Vec<Arc<dyn Codec>> = match &self.downstream_protocol {
            ProtocolConfig::Auto => {
                let mut codecs: Vec<Arc<dyn Codec>> = Vec::new();
                for p in [Protocol::Http2, Protocol::Http1, Protocol::Rpc] {
                    if let Ok(codec) = protocol::lookup(p) {
                        codecs.push(codec);
                    }
                }
                codecs.extend(protocol::xprotocol::all());
                codecs
            }
            other => resolve_codec(other).into_iter().collect(),
        };
        ProtocolDetector::new(codecs)
    }

    /// Upstream codec for a request decoded with `downstream`. `auto`
    /// upstream means "same protocol as downstream".
    fn upstream_codec(&self, downstream: &Arc<dyn Codec>) -> Arc<dyn Codec> {
        match &self.upstream_protocol {
            ProtocolConfig::Auto => downstream.clone(),
            other => resolve_codec(other).unwrap_or_else(|| downstream.clone()),
        }
    }

    fn pool_options(&self, cluster: &Arc<Cluster>) -> PoolOptions {
        let config = cluster.config();
        PoolOptions {
            connect_timeout: config.connect_timeout.unwrap_or(Duration::from_secs(3)),
            idle_timeout: config.idle_timeout.unwrap_or(Duration::from_secs(60)),
            conn_buffer_limit: config.conn_buffer_limit_bytes,
            enable_keepalive: true,
        }
    }

    fn synthesize(request: &Frame, status: u16, body: Option<&str>) -> Frame {
        let mut response = Frame::response(request.protocol, request.stream_id, status);
        response
            .headers
            .insert(names::STATUS.into(), status.to_string());
        if let Some(body) = body {
            response.body = Bytes::copy_from_slice(body.as_bytes());
        }
        response
    }
}

fn resolve_codec(config: &ProtocolConfig) -> Option<Arc<dyn Codec>> {
    match config {
        ProtocolConfig::Auto => None,
        ProtocolConfig::Http1 => protocol::lookup(Protocol::Http1).ok(),
        ProtocolConfig::Http2 => protocol::lookup(Protocol::Http2).ok(),
        ProtocolConfig::Rpc => protocol::lookup(Protocol::Rpc).ok(),
        ProtocolConfig::X { sub_protocol } => protocol::xprotocol::codec(sub_protocol).ok(),
    }
}

#[async_trait]
impl StreamHandler for Proxy {
    async fn handle(&self, streams: Arc<ServerStreamConnection>, frame: Frame) {
        ActiveRequest::new(self, streams).run(frame).await;
    }
}

/// Outcome of one upstream attempt.
enum Attempt {
    Response(Frame),
    Retry(RetryReason),
    Fail(Frame),
    Abort,
}

/// What sent an attempt back into the retry loop.
#[derive(Debug, Clone, Copy)]
enum RetryReason {
    On(RetryOn),
    PerTryTimeout,
}

/// State for one downstream request while it lives in the proxy.
struct ActiveRequest<'a> {
    proxy: &'a Proxy,
    streams: Arc<ServerStreamConnection>,
    chain: StreamFilterChain,
    info: RequestInfo,
}

impl<'a> ActiveRequest<'a> {
    fn new(proxy: &'a Proxy, streams: Arc<ServerStreamConnection>) -> Self {
        let chain = build_chain(&proxy.stream_filters);
        Self {
            proxy,
            streams,
            chain,
            info: RequestInfo::new(),
        }
    }

    async fn run(mut self, mut request: Frame) {
        self.proxy.stats.request_total();
        let downstream_id = request.stream_id;

        let response = self.process(&mut request).await;
        match response {
            Some(mut response) => {
                self.chain.run_send(&mut response, &mut self.info);
                response.stream_id = downstream_id;
                self.info.response_status = response.status;
                if let Err(e) = self.streams.send_response(&response).await {
                    debug!(stream_id = downstream_id, error = %e, "response write failed");
                    self.proxy.stats.request_reset();
                }
            }
            None => {
                // downstream went away; nothing to write
                self.proxy.stats.request_reset();
            }
        }

        self.proxy.stats.request_done();
        self.proxy.stats.request_time(self.info.request_time());
        self.proxy.stats.process_time(self.info.process_time());
        if self.info.is_request_failed() {
            self.proxy.stats.request_failed();
        }
        access_log::log(&self.proxy.name, &request, &self.info);
    }

    /// Produce the downstream response, or `None` when the downstream
    /// connection terminated mid-flight.
    async fn process(&mut self, request: &mut Frame) -> Option<Frame> {
        match self
            .chain
            .run_receive(FilterPhase::BeforeRoute, request, &mut self.info)
            .await
        {
            ChainResult::Hijacked(response) => return Some(response),
            ChainResult::Continue => {}
        }

        // un-intercepted heartbeats are answered in place, never proxied
        if request.heartbeat {
            return self.streams.codec().build_heartbeat_response(request);
        }

        let router = match self.proxy.routers.get(&self.proxy.router_config_name) {
            Ok(router) => router,
            Err(e) => {
                warn!(error = %e, "router configuration missing");
                self.info.set_flag(ResponseFlag::NoRouteFound);
                return Some(Proxy::synthesize(request, 500, None));
            }
        };
        let route = match router.route(&request.headers) {
            Some(route) => route,
            None => {
                trace!("no route matched");
                self.info.set_flag(ResponseFlag::NoRouteFound);
                return Some(Proxy::synthesize(request, 404, None));
            }
        };

        match &route.action {
            RouteAction::DirectResponse { status, body } => {
                return Some(Proxy::synthesize(request, *status, body.as_deref()));
            }
            RouteAction::Redirect { location, status } => {
                let mut response = Proxy::synthesize(request, *status, None);
                response.headers.insert("location".into(), location.clone());
                return Some(response);
            }
            _ => {}
        }

        match self
            .chain
            .run_receive(FilterPhase::AfterRoute, request, &mut self.info)
            .await
        {
            ChainResult::Hijacked(response) => return Some(response),
            ChainResult::Continue => {}
        }

        let cluster_name = match route.choose_cluster() {
            Some(name) => name,
            None => {
                self.info.set_flag(ResponseFlag::NoRouteFound);
                return Some(Proxy::synthesize(request, 500, None));
            }
        };

        self.info.process_started();
        self.forward(request, &route, &cluster_name).await
    }

    /// The routed request loop: choose host, acquire a pool slot, send, wait,
    /// retry per policy.
    async fn forward(
        &mut self,
        request: &mut Frame,
        route: &Arc<Route>,
        cluster_name: &str,
    ) -> Option<Frame> {
        let cluster = match self.proxy.clusters.get(cluster_name) {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!(cluster = cluster_name, error = %e, "cluster not found");
                self.info.set_flag(ResponseFlag::NoHealthyUpstream);
                return Some(Proxy::synthesize(request, 503, None));
            }
        };

        if !cluster.breakers().try_acquire_request() {
            self.info.set_flag(ResponseFlag::RateLimited);
            return Some(Proxy::synthesize(request, 503, None));
        }

        let max_retries = route
            .retry_policy
            .as_ref()
            .map(|p| p.num_retries)
            .unwrap_or(0);
        let overall = route.timeout.unwrap_or(DEFAULT_ROUTE_TIMEOUT);
        let deadline = Instant::now() + overall;
        let mut retries_held = 0u32;
        let mut chose_host_phase_ran = false;

        let mut outcome = None;
        while outcome.is_none() {
            let attempt = self
                .attempt(request, route, &cluster, deadline, &mut chose_host_phase_ran)
                .await;
            outcome = match attempt {
                Attempt::Response(response) => Some(Some(response)),
                Attempt::Fail(response) => Some(Some(response)),
                Attempt::Abort => Some(None),
                Attempt::Retry(reason) => {
                    let policy_allows = match reason {
                        // a per-try timeout re-enters the loop whenever a
                        // retry policy is present at all
                        RetryReason::PerTryTimeout => route.retry_policy.is_some(),
                        RetryReason::On(RetryOn::Reset) => route
                            .retry_policy
                            .as_ref()
                            .map(|p| {
                                p.retries_on(RetryOn::Reset)
                                    || p.retries_on(RetryOn::GatewayError)
                            })
                            .unwrap_or(false),
                        // 502-504 qualify under either gateway-error or 5xx
                        RetryReason::On(RetryOn::GatewayError) => route
                            .retry_policy
                            .as_ref()
                            .map(|p| {
                                p.retries_on(RetryOn::GatewayError)
                                    || p.retries_on(RetryOn::Status5xx)
                            })
                            .unwrap_or(false),
                        RetryReason::On(other) => route
                            .retry_policy
                            .as_ref()
                            .map(|p| p.retries_on(other))
                            .unwrap_or(false),
                    };
                    let allowed = self.info.retry_count < max_retries
                        && policy_allows
                        && cluster.breakers().try_acquire_retry();
                    if allowed {
                        retries_held += 1;
                        self.info.retry_count += 1;
                        debug!(
                            retry = self.info.retry_count,
                            reason = ?reason,
                            "retrying upstream request"
                        );
                        None
                    } else {
                        Some(Some(self.retry_exhausted_response(request, reason)))
                    }
                }
            };
        }

        for _ in 0..retries_held {
            cluster.breakers().release_retry();
        }
        cluster.breakers().release_request();
        outcome.unwrap_or(None)
    }

    fn retry_exhausted_response(&mut self, request: &Frame, reason: RetryReason) -> Frame {
        match reason {
            RetryReason::PerTryTimeout => {
                self.info.set_flag(ResponseFlag::UpstreamRequestTimeout);
                Proxy::synthesize(request, 504, None)
            }
            RetryReason::On(RetryOn::ConnectFailure) => {
                self.info.set_flag(ResponseFlag::UpstreamConnectionFailure);
                Proxy::synthesize(request, 503, None)
            }
            RetryReason::On(RetryOn::Reset) => {
                self.info.set_flag(ResponseFlag::UpstreamRemoteReset);
                Proxy::synthesize(request, 502, None)
            }
            RetryReason::On(RetryOn::Status5xx) | RetryReason::On(RetryOn::GatewayError) => {
                // last upstream answer was a 5xx; the failure flows through
                Proxy::synthesize(request, 502, None)
            }
        }
    }

    async fn attempt(
        &mut self,
        request: &mut Frame,
        route: &Arc<Route>,
        cluster: &Arc<Cluster>,
        deadline: Instant,
        chose_host_phase_ran: &mut bool,
    ) -> Attempt {
        let host = match cluster.choose_host(&LbContext::default()) {
            Some(host) => host,
            None => {
                self.info.set_flag(ResponseFlag::NoHealthyUpstream);
                return Attempt::Fail(Proxy::synthesize(request, 503, None));
            }
        };
        trace!(host = %host.address(), "host chosen");
        self.info.upstream_host = Some(host.address());

        if !*chose_host_phase_ran {
            *chose_host_phase_ran = true;
            if let ChainResult::Hijacked(response) = self
                .chain
                .run_receive(FilterPhase::AfterChooseHost, request, &mut self.info)
                .await
            {
                return Attempt::Response(response);
            }
        }

        let codec = self.proxy.upstream_codec(self.streams.codec());
        let pool = self
            .proxy
            .pools
            .pool(&host, &codec, &self.proxy.pool_options(cluster));

        host.request_started();
        let mut upstream = match pool.new_stream().await {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!(host = %host.address(), error = %e, "pool acquisition failed");
                host.request_finished();
                cluster.report_connect_failure(&host);
                return Attempt::Retry(RetryReason::On(RetryOn::ConnectFailure));
            }
        };

        let mut upstream_request = request.clone();
        upstream_request.stream_id = upstream.stream_id;
        if let Err(e) = upstream.send_request(&upstream_request).await {
            debug!(host = %host.address(), error = %e, "upstream send failed");
            upstream.abandon();
            host.request_finished();
            cluster.report_connect_failure(&host);
            return Attempt::Retry(RetryReason::On(RetryOn::ConnectFailure));
        }
        self.info.bytes_sent += upstream_request.body.len() as u64;

        let per_try = route
            .retry_policy
            .as_ref()
            .and_then(|p| p.per_try_timeout)
            .unwrap_or(DEFAULT_PER_TRY_TIMEOUT);
        let result = self.await_response(&mut upstream, per_try, deadline).await;

        host.request_finished();
        match result {
            AwaitResult::Response(response) => {
                cluster.report_response(&host, response.is_5xx());
                self.info.bytes_received += response.body.len() as u64;
                self.info.response_received = Some(Instant::now());
                if response.is_5xx() {
                    let gateway = matches!(response.status, Some(502..=504));
                    let reason = if gateway {
                        RetryOn::GatewayError
                    } else {
                        RetryOn::Status5xx
                    };
                    if self.retry_would_be_allowed(route, reason) {
                        return Attempt::Retry(RetryReason::On(reason));
                    }
                }
                Attempt::Response(response)
            }
            AwaitResult::Reset => {
                cluster.report_response(&host, true);
                Attempt::Retry(RetryReason::On(RetryOn::Reset))
            }
            AwaitResult::PerTryTimeout => {
                upstream.abandon();
                cluster.report_response(&host, true);
                Attempt::Retry(RetryReason::PerTryTimeout)
            }
            AwaitResult::OverallTimeout => {
                upstream.abandon();
                self.info.set_flag(ResponseFlag::UpstreamRequestTimeout);
                Attempt::Fail(Proxy::synthesize(request, 504, None))
            }
            AwaitResult::DownstreamClosed => {
                upstream.abandon();
                self.info
                    .set_flag(ResponseFlag::DownstreamConnectionTermination);
                Attempt::Abort
            }
        }
    }

    /// Whether the policy would admit a retry for `reason`, ignoring the
    /// retry circuit breaker (checked at commit time).
    fn retry_would_be_allowed(&self, route: &Arc<Route>, reason: RetryOn) -> bool {
        let policy = match &route.retry_policy {
            Some(policy) => policy,
            None => return false,
        };
        if self.info.retry_count >= policy.num_retries {
            return false;
        }
        match reason {
            RetryOn::GatewayError => {
                policy.retries_on(RetryOn::GatewayError) || policy.retries_on(RetryOn::Status5xx)
            }
            other => policy.retries_on(other),
        }
    }

    async fn await_response(
        &self,
        upstream: &mut UpstreamStream,
        per_try: Duration,
        deadline: Instant,
    ) -> AwaitResult {
        let mut downstream_closed = self.streams.connection().map(|c| c.closed_watch());
        let downstream_wait = async {
            match &mut downstream_closed {
                Some(watch) => {
                    if *watch.borrow() {
                        return;
                    }
                    let _ = watch.changed().await;
                }
                // connection already dropped entirely
                None => {}
            }
        };

        tokio::select! {
            resp = &mut upstream.response => match resp {
                Ok(frame) => AwaitResult::Response(frame),
                Err(_) => AwaitResult::Reset,
            },
            _ = tokio::time::sleep(per_try) => AwaitResult::PerTryTimeout,
            _ = tokio::time::sleep_until(deadline.into()) => AwaitResult::OverallTimeout,
            _ = downstream_wait => AwaitResult::DownstreamClosed,
        }
    }
}

enum AwaitResult {
    Response(Frame),
    Reset,
    PerTryTimeout,
    OverallTimeout,
    DownstreamClosed,
}

/// The terminal network filter: detects the protocol on the first bytes,
/// then either dispatches decoded streams into the proxy or, for
/// frame-relay protocols, pipes bytes to a routed upstream connection.
pub struct ProxyReadFilter {
    proxy: Arc<Proxy>,
    mode: tokio::sync::Mutex<Mode>,
}

enum Mode {
    Detecting(ProtocolDetector),
    Streams(Arc<ServerStreamConnection>),
    Relay(Arc<Connection>),
    Failed,
}

impl ProxyReadFilter {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        let detector = proxy.detector();
        Self {
            proxy,
            mode: tokio::sync::Mutex::new(Mode::Detecting(detector)),
        }
    }

    /// Route once with synthesized headers and open the upstream pipe for a
    /// frame-relay connection.
    async fn start_relay(&self, downstream: &Arc<Connection>) -> Result<Arc<Connection>> {
        let mut headers = Headers::new();
        headers.insert(
            names::AUTHORITY.into(),
            downstream.remote_addr().to_string(),
        );
        headers.insert(names::PATH.into(), "/".into());

        let router = self.proxy.routers.get(&self.proxy.router_config_name)?;
        let route = router.route(&headers).ok_or(ProxyError::RouterNotFound(
            self.proxy.router_config_name.clone(),
        ))?;
        let cluster_name = route
            .choose_cluster()
            .ok_or_else(|| ProxyError::ClusterNotFound("relay route".into()))?;
        let cluster = self.proxy.clusters.get(&cluster_name)?;
        let host = cluster
            .choose_host(&LbContext::default())
            .ok_or_else(|| ProxyError::NoHealthyUpstream(cluster_name.clone()))?;

        let options = self.proxy.pool_options(&cluster);
        let stream =
            crate::network::connection::connect(host.address(), options.connect_timeout).await?;
        let upstream = Connection::new(stream, None);
        upstream.add_read_filter(Arc::new(RelayBackFilter {
            downstream: Arc::downgrade(downstream),
        }));

        // tie lifetimes together: either side closing closes the other
        upstream.add_event_listener(Arc::new(CloseOther {
            other: Arc::downgrade(downstream),
        }));
        downstream.add_event_listener(Arc::new(CloseOther {
            other: Arc::downgrade(&upstream),
        }));
        upstream.start();
        debug!(
            downstream = downstream.id(),
            upstream = upstream.id(),
            host = %host.address(),
            "relay established"
        );
        Ok(upstream)
    }
}

#[async_trait]
impl ReadFilter for ProxyReadFilter {
    async fn on_data(&self, buf: &mut IoBuffer, ctx: &ReadContext) -> FilterStatus {
        let mut mode = self.mode.lock().await;
        loop {
            // detection phase resolves to a successor mode, then the loop
            // re-enters to dispatch the already-buffered bytes
            let detected = match &*mode {
                Mode::Detecting(detector) => Some(detector.detect(buf.bytes())),
                _ => None,
            };
            if let Some(result) = detected {
                match result {
                    DetectResult::NeedMore => return FilterStatus::Continue,
                    DetectResult::Failed => {
                        warn!(conn_id = ctx.connection().id(), "protocol detection failed");
                        ctx.connection()
                            .close(CloseType::NoFlush, ConnectionEvent::LocalClose)
                            .await;
                        *mode = Mode::Failed;
                        return FilterStatus::Stop;
                    }
                    DetectResult::Matched(codec) => {
                        debug!(
                            conn_id = ctx.connection().id(),
                            protocol = %codec.protocol(),
                            "protocol selected"
                        );
                        if codec.protocol() == Protocol::Http2 {
                            match self.start_relay(ctx.connection()).await {
                                Ok(upstream) => *mode = Mode::Relay(upstream),
                                Err(e) => {
                                    warn!(error = %e, "relay setup failed");
                                    ctx.connection()
                                        .close(CloseType::NoFlush, ConnectionEvent::LocalClose)
                                        .await;
                                    *mode = Mode::Failed;
                                    return FilterStatus::Stop;
                                }
                            }
                        } else {
                            let streams = ServerStreamConnection::new(
                                ctx.connection(),
                                codec,
                                self.proxy.clone(),
                            );
                            *mode = Mode::Streams(streams);
                        }
                        continue;
                    }
                }
            }
            match &*mode {
                Mode::Streams(streams) => {
                    if let Err(e) = streams.dispatch(buf).await {
                        warn!(conn_id = ctx.connection().id(), error = %e, "decode failed");
                        ctx.connection()
                            .close(CloseType::NoFlush, ConnectionEvent::OnReadErrClose)
                            .await;
                        return FilterStatus::Stop;
                    }
                    return FilterStatus::Continue;
                }
                Mode::Relay(upstream) => {
                    let bytes = buf.take();
                    if !bytes.is_empty() && upstream.write(bytes).await.is_err() {
                        ctx.connection()
                            .close(CloseType::FlushWrite, ConnectionEvent::LocalClose)
                            .await;
                        return FilterStatus::Stop;
                    }
                    return FilterStatus::Continue;
                }
                Mode::Failed => return FilterStatus::Stop,
                // handled above; a NeedMore already returned
                Mode::Detecting(_) => return FilterStatus::Continue,
            }
        }
    }
}

/// Upstream-to-downstream half of a relay pipe.
struct RelayBackFilter {
    downstream: std::sync::Weak<Connection>,
}

#[async_trait]
impl ReadFilter for RelayBackFilter {
    async fn on_data(&self, buf: &mut IoBuffer, _ctx: &ReadContext) -> FilterStatus {
        let downstream = match self.downstream.upgrade() {
            Some(downstream) => downstream,
            None => return FilterStatus::Stop,
        };
        let bytes = buf.take();
        if !bytes.is_empty() && downstream.write(bytes).await.is_err() {
            return FilterStatus::Stop;
        }
        FilterStatus::Continue
    }
}

struct CloseOther {
    other: std::sync::Weak<Connection>,
}

impl ConnectionEventListener for CloseOther {
    fn on_event(&self, event: ConnectionEvent) {
        if event.is_close() {
            if let Some(other) = self.other.upgrade() {
                tokio::spawn(async move {
                    other
                        .close(CloseType::FlushWrite, ConnectionEvent::LocalClose)
                        .await;
                });
            }
        }
    }
}
