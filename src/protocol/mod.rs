//! Protocol codecs.
//!
//! Every wire protocol the proxy speaks implements [`Codec`]: magic-byte
//! recognition for auto-detection, frame splitting, incremental decoding into
//! protocol-independent [`Frame`]s, re-encoding, stream-id plumbing and
//! heartbeat construction. Implementations register once at startup into an
//! immutable registry keyed by [`Protocol`].

pub mod detect;
pub mod http1;
pub mod http2;
pub mod rpc;
pub mod xprotocol;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::buffer::IoBuffer;
use crate::error::{DecodeError, ProxyError, Result};

/// Protocol tag. `Xprotocol` covers the pluggable binary family; the
/// sub-protocol is carried by the codec instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
    Rpc,
    Xprotocol,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
            Protocol::Rpc => "rpc",
            Protocol::Xprotocol => "x",
        };
        f.write_str(s)
    }
}

/// Result of magic-byte recognition over the first bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The bytes belong to this protocol.
    Match,
    /// Not enough bytes yet to decide.
    Again,
    /// The bytes can never belong to this protocol.
    Fail,
}

/// Which side of a connection a decoder sits on. Servers decode requests,
/// clients decode responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

/// Header map attached to decoded frames. Keys are lower-case.
pub type Headers = HashMap<String, String>;

/// Well-known header names used across codecs, routing and filters.
pub mod names {
    /// Request method (HTTP verbs; synthesized for binary protocols).
    pub const METHOD: &str = ":method";
    /// Request path.
    pub const PATH: &str = ":path";
    /// Request authority / host.
    pub const AUTHORITY: &str = ":authority";
    /// Response status.
    pub const STATUS: &str = ":status";
    /// RPC service name, extracted from binary payloads.
    pub const SERVICE: &str = "service";
    /// RPC method name.
    pub const RPC_METHOD: &str = "method";
    /// Sub-protocol tag attached by the x-protocol dispatcher.
    pub const SUB_PROTOCOL: &str = "x-protocol-sub";
    /// Heartbeat marker; value is the protocol tag that produced it.
    pub const HEARTBEAT: &str = "x-protocol-heartbeat";
    /// Set by the health-check filter when it intercepts a heartbeat.
    pub const HEARTBEAT_HIJACK: &str = "x-protocol-heartbeat-hijack";
}

/// A decoded protocol frame: one request or response (or one relay unit for
/// frame-relay protocols), with routing-relevant headers pulled out.
#[derive(Debug, Clone)]
pub struct Frame {
    pub protocol: Protocol,
    pub stream_id: u64,
    pub kind: FrameKind,
    pub headers: Headers,
    pub body: Bytes,
    pub trailers: Headers,
    pub heartbeat: bool,
    /// Response status, mapped onto HTTP-style codes for uniform retry and
    /// outlier predicates.
    pub status: Option<u16>,
}

impl Frame {
    pub fn request(protocol: Protocol, stream_id: u64) -> Self {
        Self {
            protocol,
            stream_id,
            kind: FrameKind::Request,
            headers: Headers::new(),
            body: Bytes::new(),
            trailers: Headers::new(),
            heartbeat: false,
            status: None,
        }
    }

    pub fn response(protocol: Protocol, stream_id: u64, status: u16) -> Self {
        Self {
            protocol,
            stream_id,
            kind: FrameKind::Response,
            headers: Headers::new(),
            body: Bytes::new(),
            trailers: Headers::new(),
            heartbeat: false,
            status: Some(status),
        }
    }

    /// True when the status is a server-side failure (5xx equivalent).
    pub fn is_5xx(&self) -> bool {
        matches!(self.status, Some(s) if (500..600).contains(&s))
    }
}

/// Incremental frame decoder. Stateful, one per connection side.
///
/// `Ok(None)` means "need more bytes" and leaves the buffer untouched past
/// the already-consumed frames. An `Err` is unrecoverable and closes the
/// connection.
pub trait FrameDecoder: Send {
    fn decode(&mut self, buf: &mut IoBuffer) -> std::result::Result<Option<Frame>, DecodeError>;
}

/// One wire protocol: recognition, framing, codec and heartbeat support.
pub trait Codec: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Magic-byte recognition over the first bytes of a connection.
    fn match_protocol(&self, bytes: &[u8]) -> MatchResult;

    /// Shortest prefix that can hold a complete frame header.
    fn min_frame_len(&self) -> usize;

    /// Split out every complete frame; a trailing partial frame is left alone.
    fn split_frames<'a>(&self, bytes: &'a [u8]) -> Vec<&'a [u8]>;

    /// Extract the stream id of a raw frame, if the protocol carries one.
    fn stream_id(&self, frame: &[u8]) -> Option<u64>;

    /// Rewrite the stream id in place. Returns false when the protocol does
    /// not carry an id in its framing.
    fn set_stream_id(&self, frame: &mut [u8], id: u64) -> bool;

    /// Routing-relevant headers extracted from a raw frame.
    fn meta(&self, frame: &[u8]) -> Headers;

    fn new_decoder(&self, side: Side) -> Box<dyn FrameDecoder>;

    /// Encode a frame model back to wire bytes.
    fn encode(&self, frame: &Frame) -> Result<Bytes>;

    fn build_heartbeat_request(&self, stream_id: u64) -> Option<Frame>;

    fn build_heartbeat_response(&self, request: &Frame) -> Option<Frame>;

    /// How many streams one upstream connection of this protocol can carry.
    fn max_concurrent_streams(&self) -> usize;

    /// Distinct key for connection pooling. X-protocol codecs refine this
    /// with their sub-protocol tag.
    fn pool_tag(&self) -> String {
        self.protocol().to_string()
    }
}

/// Codec registry. Installed once during startup; immutable afterwards.
pub struct CodecRegistry {
    codecs: HashMap<Protocol, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Register a codec. Double registration is a wiring bug and panics.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        let protocol = codec.protocol();
        if self.codecs.insert(protocol, codec).is_some() {
            panic!("codec for {} registered twice", protocol);
        }
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&protocol).cloned()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(http1::Http1Codec::new()));
        registry.register(Arc::new(http2::Http2Codec::new()));
        registry.register(Arc::new(rpc::RpcCodec::new()));
        registry
    }
}

static REGISTRY: OnceCell<CodecRegistry> = OnceCell::new();

/// Install the global registry. Must happen exactly once, before any
/// listener starts; a second call is a startup-ordering bug.
pub fn install(registry: CodecRegistry) {
    if REGISTRY.set(registry).is_err() {
        panic!("codec registry installed twice");
    }
}

/// Look up a codec, installing the defaults on first use (tests and embedded
/// callers skip explicit installation).
pub fn lookup(protocol: Protocol) -> Result<Arc<dyn Codec>> {
    REGISTRY
        .get_or_init(CodecRegistry::default)
        .get(protocol)
        .ok_or_else(|| ProxyError::Codec(format!("no codec registered for {}", protocol)))
}
