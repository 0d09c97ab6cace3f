//! Listener: a bound accept socket plus its filter-chain factory.
//!
//! `stop()` halts the accept loop but keeps open connections and the bound
//! socket; `close()` additionally drops connections. A replacement listener
//! for the same address inherits the bound socket through `take_socket()`,
//! so updates never drop the bind.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connection::{CloseType, Connection, ConnectionEvent, ConnectionEventListener};
use crate::buffer::BufferPool;
use crate::error::{ProxyError, Result};
use crate::metrics::{DownstreamStats, Scope};

/// Installs the per-connection filter chain when a connection is accepted.
pub trait FilterChainFactory: Send + Sync {
    fn create_filter_chain(&self, conn: &Arc<Connection>);
}

/// Listener lifecycle callbacks.
pub trait ListenerEventListener: Send + Sync {
    fn on_accept(&self, remote: SocketAddr) {
        let _ = remote;
    }
    fn on_new_connection(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }
    fn on_close(&self) {}
}

pub struct Listener {
    name: String,
    addr: SocketAddr,
    /// The bound socket parks here whenever the accept loop is not running,
    /// so a successor listener can inherit it.
    socket: Mutex<Option<TokioTcpListener>>,
    /// Actual address after bind; survives the socket moving into the
    /// accept loop.
    bound_addr: Mutex<Option<SocketAddr>>,
    conns: DashMap<u64, Arc<Connection>>,
    factory: Mutex<Arc<dyn FilterChainFactory>>,
    event_listener: Mutex<Option<Arc<dyn ListenerEventListener>>>,
    stop_tx: watch::Sender<bool>,
    running: AtomicBool,
    per_conn_buffer_limit: u32,
    buffers: Arc<BufferPool>,
    stats: DownstreamStats,
}

impl Listener {
    pub fn new(
        name: &str,
        addr: SocketAddr,
        factory: Arc<dyn FilterChainFactory>,
        per_conn_buffer_limit: u32,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.to_string(),
            addr,
            socket: Mutex::new(None),
            bound_addr: Mutex::new(None),
            conns: DashMap::new(),
            factory: Mutex::new(factory),
            event_listener: Mutex::new(None),
            stop_tx,
            running: AtomicBool::new(false),
            per_conn_buffer_limit,
            buffers: BufferPool::new(),
            stats: DownstreamStats::new(Scope::Listener, name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Local address after bind; differs from the configured address when
    /// port zero was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub fn set_event_listener(&self, listener: Arc<dyn ListenerEventListener>) {
        *self.event_listener.lock() = Some(listener);
    }

    /// Swap the filter-chain factory; applies to newly accepted connections.
    pub fn set_filter_chain_factory(&self, factory: Arc<dyn FilterChainFactory>) {
        *self.factory.lock() = factory;
    }

    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Bind the socket without accepting yet. Used for startup validation
    /// and for tests that need the bound port before traffic flows.
    pub async fn bind(&self) -> Result<()> {
        if self.socket.lock().is_some() {
            return Ok(());
        }
        let socket = TokioTcpListener::bind(self.addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.addr,
                source,
            })?;
        *self.bound_addr.lock() = socket.local_addr().ok();
        *self.socket.lock() = Some(socket);
        Ok(())
    }

    /// Inherit the bound socket from a predecessor listening on the same
    /// address, instead of re-binding.
    pub fn inherit_socket(&self, prior: &Listener) -> bool {
        if prior.addr != self.addr {
            return false;
        }
        match prior.take_socket() {
            Some(socket) => {
                *self.bound_addr.lock() = socket.local_addr().ok();
                *self.socket.lock() = Some(socket);
                true
            }
            None => false,
        }
    }

    fn take_socket(&self) -> Option<TokioTcpListener> {
        self.socket.lock().take()
    }

    /// Start accepting. Binds first if no socket was inherited.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.bind().await?;
        let socket = match self.take_socket() {
            Some(socket) => socket,
            None => {
                self.running.store(false, Ordering::Release);
                return Err(ProxyError::Listener(format!(
                    "listener {} has no bound socket",
                    self.name
                )));
            }
        };
        let _ = self.stop_tx.send(false);
        info!(listener = %self.name, addr = %self.addr, "listener started");

        let this = self.clone();
        tokio::spawn(async move { this.accept_loop(socket).await });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, socket: TokioTcpListener) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                res = socket.accept() => match res {
                    Ok((stream, remote)) => self.on_accept(stream, remote),
                    Err(e) => {
                        warn!(listener = %self.name, error = %e, "accept failed");
                    }
                },
                _ = stop_rx.changed() => break,
            }
        }
        // park the socket for a potential successor
        *self.socket.lock() = Some(socket);
        debug!(listener = %self.name, "accept loop stopped");
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        if let Some(cb) = self.event_listener.lock().clone() {
            cb.on_accept(remote);
        }

        let conn = Connection::new(stream, Some(self.stats.clone()));
        conn.set_buffer_limit(self.per_conn_buffer_limit);
        conn.use_buffer_pool(self.buffers.clone());
        self.conns.insert(conn.id(), conn.clone());

        // drop table entry once the connection dies
        let this = self.clone();
        let conn_id = conn.id();
        conn.add_event_listener(Arc::new(ConnReaper {
            listener: this,
            conn_id,
        }));

        self.factory.lock().create_filter_chain(&conn);
        conn.start();

        if let Some(cb) = self.event_listener.lock().clone() {
            cb.on_new_connection(&conn);
        }
        debug!(listener = %self.name, conn_id, remote = %remote, "connection accepted");
    }

    /// Stop accepting; retain open connections and the bound socket.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.stop_tx.send(true);
        }
    }

    /// Stop accepting and drop every open connection.
    pub async fn close(&self) {
        self.stop();
        let conns: Vec<_> = self.conns.iter().map(|e| e.value().clone()).collect();
        self.conns.clear();
        for conn in conns {
            conn.close(CloseType::FlushWrite, ConnectionEvent::LocalClose)
                .await;
        }
        if let Some(cb) = self.event_listener.lock().clone() {
            cb.on_close();
        }
        info!(listener = %self.name, "listener closed");
    }
}

struct ConnReaper {
    listener: Arc<Listener>,
    conn_id: u64,
}

impl ConnectionEventListener for ConnReaper {
    fn on_event(&self, event: ConnectionEvent) {
        if event.is_close() {
            self.listener.conns.remove(&self.conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    struct NoopFactory;
    impl FilterChainFactory for NoopFactory {
        fn create_filter_chain(&self, _conn: &Arc<Connection>) {}
    }

    fn test_listener() -> Arc<Listener> {
        Listener::new(
            "t",
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(NoopFactory),
            1 << 20,
        )
    }

    #[tokio::test]
    async fn test_accept_tracks_connections() {
        let listener = test_listener();
        listener.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        listener.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(listener.active_connections(), 1);

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(listener.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_stop_keeps_connections_close_drops() {
        let listener = test_listener();
        listener.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        listener.start().await.unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(listener.active_connections(), 1);

        listener.stop();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(listener.active_connections(), 1);

        listener.close().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(listener.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_socket_inheritance() {
        let old = test_listener();
        old.bind().await.unwrap();
        let addr = old.local_addr().unwrap();
        old.start().await.unwrap();
        old.stop();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // successor takes over the same bound socket; no rebind race
        let new = Listener::new("t2", addr, Arc::new(NoopFactory), 1 << 20);
        assert!(new.inherit_socket(&old));
        new.start().await.unwrap();

        let client = TcpStream::connect(addr).await;
        assert!(client.is_ok());
    }
}
