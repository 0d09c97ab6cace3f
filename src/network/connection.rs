//! Connection: owns a transport socket, a read task and a write task.
//!
//! The read task pulls bytes into the connection's read buffer and walks the
//! read-filter chain. The write task drains a bounded command channel to the
//! socket, so any task may write without touching the socket directly.
//! Lifecycle: `Init` on creation, `Active` after `start()`, `Closed` after
//! `close()` or peer close; once closed, no filter callbacks fire and event
//! listeners are invoked exactly once.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, trace};

use super::filter::{FilterStatus, ReadContext, ReadFilter, WriteFilter};
use crate::buffer::{BufferPool, IoBuffer};
use crate::error::{ProxyError, Result};
use crate::metrics::DownstreamStats;

/// Read chunk pulled from the socket per loop turn.
const READ_CHUNK: usize = 16 * 1024;
/// Depth of the write command channel.
const WRITE_CHANNEL_DEPTH: usize = 512;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> u64 {
    CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Init = 0,
    Active = 1,
    Closed = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Drain the write channel to the socket, then close.
    FlushWrite,
    /// Close immediately, dropping queued writes.
    NoFlush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    RemoteClose,
    LocalClose,
    OnReadErrClose,
    OnWriteErrClose,
    OnConnect,
    Connected,
    ConnectTimeout,
    ConnectFailed,
    OnReadTimeout,
    OnWriteTimeout,
}

impl ConnectionEvent {
    /// Whether the event is a connection close.
    pub fn is_close(self) -> bool {
        matches!(
            self,
            ConnectionEvent::RemoteClose
                | ConnectionEvent::LocalClose
                | ConnectionEvent::OnReadErrClose
                | ConnectionEvent::OnWriteErrClose
                | ConnectionEvent::OnWriteTimeout
        )
    }

    /// Whether the event is a connect failure.
    pub fn is_connect_failure(self) -> bool {
        matches!(
            self,
            ConnectionEvent::ConnectFailed | ConnectionEvent::ConnectTimeout
        )
    }
}

pub trait ConnectionEventListener: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);
}

enum WriteCmd {
    Data(Bytes),
    Close,
}

pub struct Connection {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: AtomicU8,
    socket: Mutex<Option<TcpStream>>,
    write_tx: mpsc::Sender<WriteCmd>,
    write_rx: Mutex<Option<mpsc::Receiver<WriteCmd>>>,
    read_filters: Mutex<Vec<Arc<dyn ReadFilter>>>,
    write_filters: Mutex<Vec<Arc<dyn WriteFilter>>>,
    event_listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
    read_buffer: Arc<tokio::sync::Mutex<IoBuffer>>,
    resume_read: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    no_flush: AtomicBool,
    closed: AtomicBool,
    read_disabled_tx: watch::Sender<bool>,
    buffer_limit: AtomicU32,
    idle_timeout: Mutex<Option<Duration>>,
    last_activity: Mutex<Instant>,
    write_buffered: AtomicU64,
    stats: Mutex<Option<DownstreamStats>>,
    buffer_pool: Mutex<Option<Arc<BufferPool>>>,
}

impl Connection {
    /// Wrap an established socket. The connection stays `Init` until
    /// `start()` spawns its tasks.
    pub fn new(stream: TcpStream, stats: Option<DownstreamStats>) -> Arc<Self> {
        let fallback: SocketAddr = ([0, 0, 0, 0], 0).into();
        let local_addr = stream.local_addr().unwrap_or(fallback);
        let remote_addr = stream.peer_addr().unwrap_or(fallback);
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_DEPTH);
        let (shutdown_tx, _) = watch::channel(false);
        let (read_disabled_tx, _) = watch::channel(false);

        if let Some(stats) = &stats {
            stats.connection_total();
        }

        Arc::new(Self {
            id: next_connection_id(),
            local_addr,
            remote_addr,
            state: AtomicU8::new(ConnState::Init as u8),
            socket: Mutex::new(Some(stream)),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            read_filters: Mutex::new(Vec::new()),
            write_filters: Mutex::new(Vec::new()),
            event_listeners: Mutex::new(Vec::new()),
            read_buffer: Arc::new(tokio::sync::Mutex::new(IoBuffer::new())),
            resume_read: Arc::new(Notify::new()),
            shutdown_tx,
            no_flush: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_disabled_tx,
            buffer_limit: AtomicU32::new(1 << 20),
            idle_timeout: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            write_buffered: AtomicU64::new(0),
            stats: Mutex::new(stats),
            buffer_pool: Mutex::new(None),
        })
    }

    /// Borrow the read buffer from a free-list pool; it is returned when the
    /// connection closes. Must be called before `start()`.
    pub fn use_buffer_pool(&self, pool: Arc<BufferPool>) {
        if let Ok(mut buf) = self.read_buffer.try_lock() {
            *buf = pool.acquire();
        }
        *self.buffer_pool.lock() = Some(pool);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Init,
            1 => ConnState::Active,
            _ => ConnState::Closed,
        }
    }

    pub fn add_read_filter(&self, filter: Arc<dyn ReadFilter>) {
        self.read_filters.lock().push(filter);
    }

    pub fn add_write_filter(&self, filter: Arc<dyn WriteFilter>) {
        self.write_filters.lock().push(filter);
    }

    pub fn add_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.event_listeners.lock().push(listener);
    }

    pub fn set_buffer_limit(&self, limit: u32) {
        self.buffer_limit.store(limit, Ordering::Relaxed);
    }

    pub fn buffer_limit(&self) -> u32 {
        self.buffer_limit.load(Ordering::Relaxed)
    }

    pub fn set_idle_timeout(&self, d: Option<Duration>) {
        *self.idle_timeout.lock() = d;
    }

    pub fn set_read_disable(&self, disable: bool) {
        let _ = self.read_disabled_tx.send(disable);
    }

    pub fn read_enabled(&self) -> bool {
        !*self.read_disabled_tx.borrow()
    }

    /// Read buffer handle, used by the contract surface. The read task holds
    /// the lock while the filter chain runs.
    pub fn get_read_buffer(&self) -> Arc<tokio::sync::Mutex<IoBuffer>> {
        self.read_buffer.clone()
    }

    /// Bytes accepted for write but not yet on the socket.
    pub fn get_write_buffered(&self) -> u64 {
        self.write_buffered.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A watch receiver that flips to `true` on close; used by tasks that
    /// must abort when the connection dies.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start the read and write tasks. No-op if already started or closed.
    pub fn start(self: &Arc<Self>) {
        let stream = match self.socket.lock().take() {
            Some(stream) => stream,
            None => return,
        };
        let _ = stream.set_nodelay(true);
        self.state.store(ConnState::Active as u8, Ordering::Release);

        for filter in self.read_filters.lock().iter() {
            // status is advisory here; a Stop at connect time parks nothing
            let _ = filter.on_new_connection();
        }

        let (rh, wh) = stream.into_split();
        let conn = self.clone();
        tokio::spawn(async move { conn.read_task(rh).await });
        let conn = self.clone();
        let rx = conn.write_rx.lock().take();
        if let Some(rx) = rx {
            tokio::spawn(async move { conn.write_task(rx, wh).await });
        }
    }

    /// Queue bytes for the write task.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ProxyError::ConnectionClosed);
        }
        let len = data.len() as u64;
        self.write_buffered.fetch_add(len, Ordering::Relaxed);
        if let Some(stats) = self.stats.lock().as_ref() {
            stats.bytes_write_buffered(self.write_buffered.load(Ordering::Relaxed) as f64);
        }
        self.write_tx
            .send(WriteCmd::Data(data))
            .await
            .map_err(|_| {
                self.write_buffered.fetch_sub(len, Ordering::Relaxed);
                ProxyError::ConnectionClosed
            })
    }

    /// Close the connection. Exactly one close wins; the rest are no-ops.
    pub async fn close(&self, how: CloseType, event: ConnectionEvent) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        debug!(conn_id = self.id, ?event, "connection closed");

        match how {
            CloseType::FlushWrite => {
                // write task drains queued data, then shuts the socket down
                let _ = self.write_tx.send(WriteCmd::Close).await;
            }
            CloseType::NoFlush => {
                self.no_flush.store(true, Ordering::Release);
            }
        }
        let _ = self.shutdown_tx.send(true);
        self.fire_event(event);

        if let Some(stats) = self.stats.lock().as_ref() {
            stats.connection_destroy();
        }

        if let Some(pool) = self.buffer_pool.lock().take() {
            let read_buffer = self.read_buffer.clone();
            tokio::spawn(async move {
                let mut buf = read_buffer.lock().await;
                pool.release(std::mem::take(&mut *buf));
            });
        }
    }

    fn fire_event(&self, event: ConnectionEvent) {
        let listeners: Vec<_> = self.event_listeners.lock().clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    async fn read_task(self: Arc<Self>, mut rh: OwnedReadHalf) {
        let ctx = ReadContext::new(self.clone(), self.resume_read.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut read_disabled_rx = self.read_disabled_tx.subscribe();
        let mut chunk = vec![0u8; READ_CHUNK];

        'outer: loop {
            if *read_disabled_rx.borrow() {
                tokio::select! {
                    _ = read_disabled_rx.changed() => continue,
                    _ = shutdown_rx.changed() => break,
                }
            }

            let idle = *self.idle_timeout.lock();
            let idle_deadline = idle.map(|d| *self.last_activity.lock() + d);

            let n = tokio::select! {
                res = rh.read(&mut chunk) => match res {
                    Ok(0) => {
                        self.close(CloseType::NoFlush, ConnectionEvent::RemoteClose).await;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        trace!(conn_id = self.id, error = %e, "read error");
                        self.close(CloseType::NoFlush, ConnectionEvent::OnReadErrClose).await;
                        break;
                    }
                },
                _ = shutdown_rx.changed() => break,
                _ = async {
                    match idle_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                        None => std::future::pending().await,
                    }
                } => {
                    // no bytes moved for the idle window
                    self.close(CloseType::FlushWrite, ConnectionEvent::LocalClose).await;
                    break;
                }
            };

            self.touch();
            if let Some(stats) = self.stats.lock().as_ref() {
                stats.bytes_read(n as u64);
            }

            let mut buf = self.read_buffer.lock().await;
            buf.write(&chunk[..n]);
            if let Some(stats) = self.stats.lock().as_ref() {
                stats.bytes_read_buffered(buf.len() as f64);
            }

            // walk the read filter chain; a Stop parks here until resumed
            let filters: Vec<_> = self.read_filters.lock().clone();
            let mut idx = 0;
            while idx < filters.len() {
                if self.is_closed() {
                    break 'outer;
                }
                match filters[idx].on_data(&mut buf, &ctx).await {
                    FilterStatus::Continue => idx += 1,
                    FilterStatus::Stop => {
                        tokio::select! {
                            _ = self.resume_read.notified() => {}
                            _ = shutdown_rx.changed() => break 'outer,
                        }
                    }
                }
            }

            // a filter chain that cannot drain the buffer past the limit is
            // a protocol violation (e.g. one frame exceeding the limit)
            if buf.len() > self.buffer_limit.load(Ordering::Relaxed) as usize {
                debug!(
                    conn_id = self.id,
                    buffered = buf.len(),
                    "per-connection buffer limit exceeded"
                );
                drop(buf);
                self.close(CloseType::NoFlush, ConnectionEvent::LocalClose)
                    .await;
                break;
            }
        }
        trace!(conn_id = self.id, "read task finished");
    }

    async fn write_task(self: Arc<Self>, mut rx: mpsc::Receiver<WriteCmd>, mut wh: OwnedWriteHalf) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut shutting = false;
        loop {
            let cmd = tokio::select! {
                biased;
                _ = shutdown_rx.changed(), if !shutting => {
                    shutting = true;
                    if self.no_flush.load(Ordering::Acquire) {
                        break;
                    }
                    // flush close: keep draining until the Close command
                    continue;
                }
                cmd = rx.recv() => cmd,
            };
            match cmd {
                Some(WriteCmd::Data(data)) => {
                    let mut out = BytesMut::from(&data[..]);
                    let filters: Vec<_> = self.write_filters.lock().clone();
                    for filter in filters {
                        let _ = filter.on_write(&mut out);
                    }
                    let len = data.len() as u64;
                    if let Err(e) = wh.write_all(&out).await {
                        trace!(conn_id = self.id, error = %e, "write error");
                        self.write_buffered.fetch_sub(len, Ordering::Relaxed);
                        self.close(CloseType::NoFlush, ConnectionEvent::OnWriteErrClose)
                            .await;
                        break;
                    }
                    self.touch();
                    self.write_buffered.fetch_sub(len, Ordering::Relaxed);
                    if let Some(stats) = self.stats.lock().as_ref() {
                        stats.bytes_write(out.len() as u64);
                        stats.bytes_write_buffered(
                            self.write_buffered.load(Ordering::Relaxed) as f64
                        );
                    }
                }
                Some(WriteCmd::Close) | None => {
                    let _ = wh.shutdown().await;
                    break;
                }
            }
        }
        trace!(conn_id = self.id, "write task finished");
    }
}

/// Dial an upstream address with a bounded connect timeout.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::ConnectFailed(format!("{}: {}", addr, e))),
        Err(_) => Err(ProxyError::ConnectTimeout(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Collector {
        data: Arc<Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl ReadFilter for Collector {
        async fn on_data(&self, buf: &mut IoBuffer, _ctx: &ReadContext) -> FilterStatus {
            self.data.lock().extend_from_slice(buf.bytes());
            let n = buf.len();
            buf.drain(n);
            FilterStatus::Continue
        }
    }

    struct EventCounter {
        closes: Arc<AtomicUsize>,
    }

    impl ConnectionEventListener for EventCounter {
        fn on_event(&self, event: ConnectionEvent) {
            if event.is_close() {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_read_filters_see_bytes() {
        let (client, server) = socket_pair().await;
        let conn = Connection::new(server, None);
        let data = Arc::new(Mutex::new(Vec::new()));
        conn.add_read_filter(Arc::new(Collector { data: data.clone() }));
        conn.start();

        let mut client = client;
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(&data.lock()[..], b"hello");
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (client, server) = socket_pair().await;
        let conn = Connection::new(server, None);
        conn.start();

        conn.write(Bytes::from_static(b"pong")).await.unwrap();

        let mut client = client;
        let mut out = [0u8; 4];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"pong");
    }

    #[tokio::test]
    async fn test_close_fires_event_once() {
        let (_client, server) = socket_pair().await;
        let conn = Connection::new(server, None);
        let closes = Arc::new(AtomicUsize::new(0));
        conn.add_event_listener(Arc::new(EventCounter { closes: closes.clone() }));
        conn.start();

        conn.close(CloseType::NoFlush, ConnectionEvent::LocalClose).await;
        conn.close(CloseType::NoFlush, ConnectionEvent::LocalClose).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_detected() {
        let (client, server) = socket_pair().await;
        let conn = Connection::new(server, None);
        let closes = Arc::new(AtomicUsize::new(0));
        conn.add_event_listener(Arc::new(EventCounter { closes: closes.clone() }));
        conn.start();

        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(conn.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes() {
        let (_client, server) = socket_pair().await;
        let conn = Connection::new(server, None);
        conn.set_idle_timeout(Some(Duration::from_millis(50)));
        conn.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_flush_write_drains_before_close() {
        let (client, server) = socket_pair().await;
        let conn = Connection::new(server, None);
        conn.start();

        conn.write(Bytes::from_static(b"last words")).await.unwrap();
        conn.close(CloseType::FlushWrite, ConnectionEvent::LocalClose).await;

        let mut client = client;
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out[..], b"last words");
    }
}
