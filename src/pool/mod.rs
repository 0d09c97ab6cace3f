//! Upstream connection pools, keyed by `(host address, protocol)`.
//!
//! Pools dial lazily: the first stream acquisition triggers the connect.
//! A connection lends stream slots up to the protocol's concurrency limit
//! (HTTP/1 is one; multiplexed protocols many); when every slot is busy a
//! new connection is dialed. Idle connections are reaped after a timeout,
//! and connect failures surface to the caller and the host's stats.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::cluster::host::Host;
use crate::error::{ProxyError, Result};
use crate::network::connection::{self, CloseType, Connection, ConnectionEvent};
use crate::protocol::{Codec, Frame};
use crate::stream::keepalive::KeepAlive;
use crate::stream::ClientStreamConnection;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_THRESHOLD: u32 = 3;
/// Heartbeat ticks with no traffic before a pooled connection is released.
const KEEPALIVE_IDLE_FREE: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    address: String,
    protocol: String,
}

/// Pool settings derived from the owning cluster's config.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub conn_buffer_limit: u32,
    pub enable_keepalive: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            conn_buffer_limit: 1 << 20,
            enable_keepalive: true,
        }
    }
}

/// A leased upstream stream slot. Dropping it releases the slot.
pub struct UpstreamStream {
    pooled: Arc<PooledConn>,
    pub stream_id: u64,
    pub response: oneshot::Receiver<Frame>,
}

impl UpstreamStream {
    pub fn client(&self) -> &Arc<ClientStreamConnection> {
        &self.pooled.client
    }

    /// Encode and send the request frame on the pooled connection.
    pub async fn send_request(&self, frame: &Frame) -> Result<()> {
        self.pooled.client.send_request(frame).await
    }

    /// Abandon the stream without waiting for a response (reset, retry).
    pub fn abandon(&self) {
        self.pooled.client.abandon_stream(self.stream_id);
    }
}

impl Drop for UpstreamStream {
    fn drop(&mut self) {
        self.pooled.active_streams.fetch_sub(1, Ordering::AcqRel);
        *self.pooled.last_used.lock() = Instant::now();
    }
}

struct PooledConn {
    client: Arc<ClientStreamConnection>,
    active_streams: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl PooledConn {
    fn alive(&self) -> bool {
        !self.client.connection().is_closed()
    }
}

/// Pool for one `(host, protocol)` pair.
pub struct ConnPool {
    host: Arc<Host>,
    codec: Arc<dyn Codec>,
    options: PoolOptions,
    conns: tokio::sync::Mutex<Vec<Arc<PooledConn>>>,
    max_streams: usize,
}

impl ConnPool {
    fn new(host: Arc<Host>, codec: Arc<dyn Codec>, options: PoolOptions) -> Arc<Self> {
        let max_streams = codec.max_concurrent_streams().max(1);
        Arc::new(Self {
            host,
            codec,
            options,
            conns: tokio::sync::Mutex::new(Vec::new()),
            max_streams,
        })
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Acquire a stream slot, dialing a new connection when none is free.
    pub async fn new_stream(&self) -> Result<UpstreamStream> {
        let mut conns = self.conns.lock().await;
        conns.retain(|c| c.alive());

        let pooled = match conns
            .iter()
            .find(|c| c.active_streams.load(Ordering::Acquire) < self.max_streams)
        {
            Some(pooled) => pooled.clone(),
            None => {
                let pooled = self.dial().await?;
                conns.push(pooled.clone());
                pooled
            }
        };
        drop(conns);

        pooled.active_streams.fetch_add(1, Ordering::AcqRel);
        *pooled.last_used.lock() = Instant::now();
        let (stream_id, response) = pooled.client.new_stream();
        Ok(UpstreamStream {
            pooled,
            stream_id,
            response,
        })
    }

    async fn dial(&self) -> Result<Arc<PooledConn>> {
        let addr = self.host.address();
        trace!(host = %addr, protocol = %self.codec.pool_tag(), "dialing upstream");
        let stream = connection::connect(addr, self.options.connect_timeout)
            .await
            .map_err(|e| {
                self.host.record_connect_failure();
                e
            })?;

        let conn = Connection::new(stream, None);
        conn.set_buffer_limit(self.options.conn_buffer_limit);
        let client = ClientStreamConnection::new(conn.clone(), self.codec.clone());
        if self.options.enable_keepalive && self.codec.build_heartbeat_request(0).is_some() {
            let keepalive = KeepAlive::new(client.clone(), KEEPALIVE_TIMEOUT, KEEPALIVE_THRESHOLD);
            keepalive.start_idle_free(KEEPALIVE_IDLE_FREE);
            Self::drive_keepalive(keepalive, self.options.idle_timeout);
        }
        conn.start();

        debug!(host = %addr, conn_id = conn.id(), "upstream connection established");
        Ok(Arc::new(PooledConn {
            client,
            active_streams: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }))
    }

    /// Heartbeat ticker: sends a probe every half idle-window while the
    /// connection lives.
    fn drive_keepalive(keepalive: Arc<KeepAlive>, idle: Duration) {
        let interval = (idle / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if keepalive.is_stopped() {
                    return;
                }
                keepalive.send_heartbeat().await;
            }
        });
    }

    /// Close connections idle past the pool's window; returns survivors.
    pub async fn reap_idle(&self) -> usize {
        let mut conns = self.conns.lock().await;
        let idle = self.options.idle_timeout;
        let mut keep = Vec::with_capacity(conns.len());
        for pooled in conns.drain(..) {
            let expired = pooled.active_streams.load(Ordering::Acquire) == 0
                && pooled.last_used.lock().elapsed() > idle;
            if expired || !pooled.alive() {
                let conn = pooled.client.connection().clone();
                tokio::spawn(async move {
                    conn.close(CloseType::NoFlush, ConnectionEvent::LocalClose).await;
                });
            } else {
                keep.push(pooled);
            }
        }
        *conns = keep;
        conns.len()
    }

    pub async fn active_connections(&self) -> usize {
        let conns = self.conns.lock().await;
        conns.iter().filter(|c| c.alive()).count()
    }
}

/// All pools, keyed by host address and codec pool tag.
pub struct PoolRegistry {
    pools: DashMap<PoolKey, Arc<ConnPool>>,
}

impl PoolRegistry {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self {
            pools: DashMap::new(),
        });
        registry.clone().start_reaper();
        registry
    }

    fn start_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                for entry in self.pools.iter() {
                    entry.value().reap_idle().await;
                }
            }
        });
    }

    /// Get or create the pool for a host/codec pair.
    pub fn pool(
        &self,
        host: &Arc<Host>,
        codec: &Arc<dyn Codec>,
        options: &PoolOptions,
    ) -> Arc<ConnPool> {
        let key = PoolKey {
            address: host.address().to_string(),
            protocol: codec.pool_tag(),
        };
        self.pools
            .entry(key)
            .or_insert_with(|| ConnPool::new(host.clone(), codec.clone(), options.clone()))
            .clone()
    }

    /// Drop pools whose host vanished from every cluster; their connections
    /// close as they go idle.
    pub fn drop_host(&self, address: &str) {
        self.pools.retain(|key, _| key.address != address);
    }
}
