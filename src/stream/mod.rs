//! Stream layer: multiplexes request/response exchanges over one connection.
//!
//! The server side decodes request frames and hands each to a
//! [`StreamHandler`] (the proxy) on its own task. The client side assigns
//! monotonic stream ids, keeps a table of in-flight streams and routes
//! decoded responses back to their waiters. Stream ids are unique per
//! connection; client streams leave the table on response receipt, server
//! streams end when their response is written.

pub mod keepalive;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::buffer::IoBuffer;
use crate::error::{DecodeError, ProxyError, Result};
use crate::network::connection::{CloseType, Connection, ConnectionEvent, ConnectionEventListener};
use crate::network::filter::{FilterStatus, ReadContext, ReadFilter};
use crate::protocol::{Codec, Frame, FrameDecoder, Side};

/// Receives decoded server-side request frames, one task per stream.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, streams: Arc<ServerStreamConnection>, frame: Frame);
}

/// Server half of the stream layer for one downstream connection.
///
/// The connection owns this table through its dispatch filter; the table
/// keeps only a weak edge back, so closing the connection tears the whole
/// structure down without reference cycles.
pub struct ServerStreamConnection {
    conn: std::sync::Weak<Connection>,
    conn_id: u64,
    codec: Arc<dyn Codec>,
    decoder: Mutex<Box<dyn FrameDecoder>>,
    handler: Arc<dyn StreamHandler>,
    /// Stream ids currently being handled. Ids must be pairwise distinct on
    /// a connection; a duplicate while the first is still live is a
    /// protocol violation.
    active: Mutex<std::collections::HashSet<u64>>,
}

impl ServerStreamConnection {
    pub fn new(
        conn: &Arc<Connection>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn StreamHandler>,
    ) -> Arc<Self> {
        let decoder = codec.new_decoder(Side::Server);
        Arc::new(Self {
            conn: Arc::downgrade(conn),
            conn_id: conn.id(),
            codec,
            decoder: Mutex::new(decoder),
            handler,
            active: Mutex::new(std::collections::HashSet::new()),
        })
    }

    pub fn active_streams(&self) -> usize {
        self.active.lock().len()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Decode whatever complete frames the buffer holds and dispatch each on
    /// its own task. Frames dispatch in wire order; handling is concurrent.
    pub async fn dispatch(self: &Arc<Self>, buf: &mut IoBuffer) -> Result<()> {
        loop {
            let frame = {
                let mut decoder = self.decoder.lock();
                decoder.decode(buf)?
            };
            let frame = match frame {
                Some(frame) => frame,
                None => return Ok(()),
            };
            trace!(
                conn_id = self.conn_id,
                stream_id = frame.stream_id,
                heartbeat = frame.heartbeat,
                "request frame decoded"
            );
            if !self.active.lock().insert(frame.stream_id) {
                return Err(DecodeError::MalformedFrame(format!(
                    "stream id {} reused while in flight",
                    frame.stream_id
                ))
                .into());
            }

            let this = self.clone();
            let span = tracing::debug_span!(
                "stream",
                conn_id = this.conn_id,
                stream_id = frame.stream_id
            );
            tokio::spawn(tracing::Instrument::instrument(
                async move {
                    let stream_id = frame.stream_id;
                    let handler = this.handler.clone();
                    handler.handle(this.clone(), frame).await;
                    // the server stream ends once its response was written
                    this.active.lock().remove(&stream_id);
                },
                span,
            ));
        }
    }

    /// Encode a response frame back onto the downstream connection. The
    /// server stream ends here.
    pub async fn send_response(&self, frame: &Frame) -> Result<()> {
        let conn = self.conn.upgrade().ok_or(ProxyError::ConnectionClosed)?;
        let bytes = self.codec.encode(frame)?;
        conn.write(bytes).await
    }
}

/// Client half of the stream layer for one upstream connection.
pub struct ClientStreamConnection {
    conn: Arc<Connection>,
    codec: Arc<dyn Codec>,
    decoder: Mutex<Box<dyn FrameDecoder>>,
    streams: Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
    next_stream_id: AtomicU64,
}

impl ClientStreamConnection {
    pub fn new(conn: Arc<Connection>, codec: Arc<dyn Codec>) -> Arc<Self> {
        let decoder = codec.new_decoder(Side::Client);
        let this = Arc::new(Self {
            conn: conn.clone(),
            codec,
            decoder: Mutex::new(decoder),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
        });

        conn.add_read_filter(Arc::new(ClientDispatchFilter {
            streams: Arc::downgrade(&this),
        }));
        conn.add_event_listener(Arc::new(ClientCloseListener {
            streams: Arc::downgrade(&this),
        }));
        this
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// Allocate a stream id and register a receiver for its response.
    /// Dropping the returned receiver abandons the stream.
    pub fn new_stream(&self) -> (u64, oneshot::Receiver<Frame>) {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.streams.lock().insert(id, tx);
        (id, rx)
    }

    /// Drop a stream from the table without a response (reset, retry).
    pub fn abandon_stream(&self, id: u64) {
        self.streams.lock().remove(&id);
    }

    /// Encode a request frame onto the upstream connection.
    pub async fn send_request(&self, frame: &Frame) -> Result<()> {
        let bytes = self.codec.encode(frame)?;
        self.conn.write(bytes).await
    }

    fn dispatch_response(&self, frame: Frame) {
        let sender = self.streams.lock().remove(&frame.stream_id);
        match sender {
            Some(sender) => {
                let stream_id = frame.stream_id;
                if sender.send(frame).is_err() {
                    trace!(stream_id, "response receiver gone");
                }
            }
            None => {
                debug!(
                    conn_id = self.conn.id(),
                    stream_id = frame.stream_id,
                    "response for unknown stream"
                );
            }
        }
    }

    fn on_data(&self, buf: &mut IoBuffer) -> std::result::Result<(), DecodeError> {
        loop {
            let frame = {
                let mut decoder = self.decoder.lock();
                decoder.decode(buf)?
            };
            match frame {
                Some(frame) => self.dispatch_response(frame),
                None => return Ok(()),
            }
        }
    }

    /// Fail every in-flight stream; used on connection close. Receivers see
    /// a channel error, which the proxy maps to a reset.
    fn reset_all(&self) {
        let mut streams = self.streams.lock();
        if !streams.is_empty() {
            warn!(
                conn_id = self.conn.id(),
                streams = streams.len(),
                "resetting in-flight streams on connection close"
            );
        }
        streams.clear();
    }
}

struct ClientDispatchFilter {
    streams: std::sync::Weak<ClientStreamConnection>,
}

#[async_trait]
impl ReadFilter for ClientDispatchFilter {
    async fn on_data(&self, buf: &mut IoBuffer, ctx: &ReadContext) -> FilterStatus {
        let streams = match self.streams.upgrade() {
            Some(streams) => streams,
            None => return FilterStatus::Stop,
        };
        if let Err(e) = streams.on_data(buf) {
            warn!(conn_id = ctx.connection().id(), error = %e, "upstream decode failed");
            ctx.connection()
                .close(CloseType::NoFlush, ConnectionEvent::OnReadErrClose)
                .await;
            return FilterStatus::Stop;
        }
        FilterStatus::Continue
    }
}

struct ClientCloseListener {
    streams: std::sync::Weak<ClientStreamConnection>,
}

impl ConnectionEventListener for ClientCloseListener {
    fn on_event(&self, event: ConnectionEvent) {
        if event.is_close() || event.is_connect_failure() {
            if let Some(streams) = self.streams.upgrade() {
                streams.reset_all();
            }
        }
    }
}

/// Read filter gluing a downstream connection to its server stream layer.
/// The connection owns the stream table through this filter.
pub struct ServerDispatchFilter {
    streams: Arc<ServerStreamConnection>,
}

impl ServerDispatchFilter {
    pub fn new(streams: Arc<ServerStreamConnection>) -> Self {
        Self { streams }
    }
}

#[async_trait]
impl ReadFilter for ServerDispatchFilter {
    async fn on_data(&self, buf: &mut IoBuffer, ctx: &ReadContext) -> FilterStatus {
        let streams = &self.streams;
        if let Err(e) = streams.dispatch(buf).await {
            warn!(conn_id = ctx.connection().id(), error = %e, "downstream decode failed");
            ctx.connection()
                .close(CloseType::NoFlush, ConnectionEvent::OnReadErrClose)
                .await;
            return FilterStatus::Stop;
        }
        FilterStatus::Continue
    }
}

/// Validation helper shared by tests: stream ids in a client table are
/// pairwise distinct by construction; this asserts the invariant cheaply.
pub fn assert_unique_ids(ids: &[u64]) -> bool {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().all(|id| seen.insert(*id))
}
