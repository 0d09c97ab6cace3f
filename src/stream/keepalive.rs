//! Protocol-native keep-alive for pooled upstream connections.
//!
//! On each idle tick a heartbeat request goes out on a fresh client stream
//! with a timer. A matching response cancels the timer and resets the
//! failure counter; a timeout increments it, and once the counter reaches
//! the threshold the connection is closed. Connection close stops all
//! outstanding timers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::ClientStreamConnection;
use crate::network::connection::{CloseType, ConnectionEvent, ConnectionEventListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveStatus {
    Success,
    Timeout,
}

pub type KeepAliveCallback = Arc<dyn Fn(KeepAliveStatus) + Send + Sync>;

pub struct KeepAlive {
    client: Arc<ClientStreamConnection>,
    timeout: Duration,
    threshold: u32,
    timeout_count: AtomicU32,
    requests: Mutex<HashMap<u64, JoinHandle<()>>>,
    stopped: AtomicBool,
    callbacks: Mutex<Vec<KeepAliveCallback>>,
    /// Consecutive heartbeat ticks with no real traffic before the
    /// connection is released as idle. `None` disables idle-free.
    idle_free_max: Mutex<Option<u32>>,
    idle_ticks: AtomicU32,
}

impl KeepAlive {
    /// Create a keep-alive bound to a client stream connection. Registers
    /// itself for connection events so close stops every timer.
    pub fn new(client: Arc<ClientStreamConnection>, timeout: Duration, threshold: u32) -> Arc<Self> {
        let this = Arc::new(Self {
            client: client.clone(),
            timeout,
            threshold,
            timeout_count: AtomicU32::new(0),
            requests: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            idle_free_max: Mutex::new(None),
            idle_ticks: AtomicU32::new(0),
        });
        client.connection().add_event_listener(Arc::new(StopOnClose {
            keepalive: Arc::downgrade(&this),
        }));
        this
    }

    pub fn add_callback(&self, cb: KeepAliveCallback) {
        self.callbacks.lock().push(cb);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count.load(Ordering::Acquire)
    }

    fn run_callbacks(&self, status: KeepAliveStatus) {
        let callbacks: Vec<_> = self.callbacks.lock().clone();
        for cb in callbacks {
            cb(status);
        }
    }

    /// Free the connection after `max_idle` heartbeat ticks that saw no
    /// application traffic in flight.
    pub fn start_idle_free(&self, max_idle: u32) {
        *self.idle_free_max.lock() = Some(max_idle.max(1));
    }

    /// Send one heartbeat. Called by the pool on idle ticks.
    pub async fn send_heartbeat(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }

        let idle_free_max = *self.idle_free_max.lock();
        if let Some(max_idle) = idle_free_max {
            if self.client.active_streams() == 0 {
                let ticks = self.idle_ticks.fetch_add(1, Ordering::AcqRel) + 1;
                if ticks >= max_idle {
                    debug!(
                        conn_id = self.client.connection().id(),
                        ticks, "connection idle-freed"
                    );
                    self.client
                        .connection()
                        .close(CloseType::NoFlush, ConnectionEvent::LocalClose)
                        .await;
                    return;
                }
            } else {
                self.idle_ticks.store(0, Ordering::Release);
            }
        }

        let (id, rx) = self.client.new_stream();
        let heartbeat = match self.client.codec().build_heartbeat_request(id) {
            Some(frame) => frame,
            None => {
                // protocol has no native heartbeat; nothing to track
                self.client.abandon_stream(id);
                return;
            }
        };
        if self.client.send_request(&heartbeat).await.is_err() {
            self.client.abandon_stream(id);
            return;
        }

        let this = self.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(_resp)) => this.handle_success(id),
                // channel error means the connection reset the stream
                Ok(Err(_)) | Err(_) => this.handle_timeout(id).await,
            }
        });
        self.requests.lock().insert(id, handle);
    }

    fn handle_success(&self, id: u64) {
        if self.is_stopped() {
            return;
        }
        if self.requests.lock().remove(&id).is_some() {
            self.timeout_count.store(0, Ordering::Release);
            self.run_callbacks(KeepAliveStatus::Success);
        }
    }

    async fn handle_timeout(&self, id: u64) {
        if self.is_stopped() {
            return;
        }
        if self.requests.lock().remove(&id).is_none() {
            return;
        }
        self.client.abandon_stream(id);
        let count = self.timeout_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            conn_id = self.client.connection().id(),
            count, "keep-alive timeout"
        );
        if count >= self.threshold {
            self.client
                .connection()
                .close(CloseType::NoFlush, ConnectionEvent::LocalClose)
                .await;
        }
        self.run_callbacks(KeepAliveStatus::Timeout);
    }

    /// Stop keep-alive and cancel every outstanding timer. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            conn_id = self.client.connection().id(),
            "connection stopped keepalive"
        );
        let mut requests = self.requests.lock();
        for (_, handle) in requests.drain() {
            handle.abort();
        }
    }
}

struct StopOnClose {
    keepalive: std::sync::Weak<KeepAlive>,
}

impl ConnectionEventListener for StopOnClose {
    fn on_event(&self, event: ConnectionEvent) {
        if event.is_close() || event.is_connect_failure() {
            if let Some(keepalive) = self.keepalive.upgrade() {
                keepalive.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::Connection;
    use crate::protocol::{self, Protocol};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn client_streams(sock: TcpStream) -> Arc<ClientStreamConnection> {
        let codec = protocol::lookup(Protocol::Rpc).unwrap();
        let conn = Connection::new(sock, None);
        let streams = ClientStreamConnection::new(conn.clone(), codec);
        conn.start();
        streams
    }

    #[tokio::test]
    async fn test_heartbeat_ack_resets_counter() {
        let (peer, sock) = socket_pair().await;
        let streams = client_streams(sock);
        let keepalive = KeepAlive::new(streams.clone(), Duration::from_secs(2), 2);

        // peer answers heartbeats
        let codec = protocol::lookup(Protocol::Rpc).unwrap();
        tokio::spawn(async move {
            let mut sock = peer;
            let mut buf = Vec::new();
            loop {
                let mut chunk = [0u8; 1024];
                let n = match sock.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                let frames: Vec<Vec<u8>> =
                    codec.split_frames(&buf).into_iter().map(|f| f.to_vec()).collect();
                let consumed: usize = frames.iter().map(Vec::len).sum();
                buf.drain(..consumed);
                for frame in frames {
                    let id = codec.stream_id(&frame).unwrap();
                    let mut req = crate::protocol::Frame::request(Protocol::Rpc, id);
                    req.heartbeat = true;
                    let ack = codec.build_heartbeat_response(&req).unwrap();
                    let wire = codec.encode(&ack).unwrap();
                    let _ = sock.write_all(&wire).await;
                }
            }
        });

        keepalive.send_heartbeat().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(keepalive.timeout_count(), 0);
        assert!(!keepalive.is_stopped());
    }

    #[tokio::test]
    async fn test_idle_free_closes_quiet_connection() {
        let (_peer, sock) = socket_pair().await;
        let streams = client_streams(sock);
        let keepalive = KeepAlive::new(streams.clone(), Duration::from_secs(5), 10);
        keepalive.start_idle_free(2);

        keepalive.send_heartbeat().await;
        assert!(!streams.connection().is_closed());

        // the heartbeat above is still pending in the stream table; abandon
        // it to simulate a fully quiet connection
        streams.abandon_stream(1);
        keepalive.send_heartbeat().await;
        assert!(streams.connection().is_closed());
    }

    #[tokio::test]
    async fn test_consecutive_timeouts_close_connection() {
        let (_peer, sock) = socket_pair().await;
        let streams = client_streams(sock);
        // silent peer: every heartbeat times out
        let keepalive = KeepAlive::new(streams.clone(), Duration::from_millis(50), 2);

        keepalive.send_heartbeat().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(keepalive.timeout_count(), 1);
        assert!(!streams.connection().is_closed());

        keepalive.send_heartbeat().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(streams.connection().is_closed());
        assert!(keepalive.is_stopped());
    }
}
