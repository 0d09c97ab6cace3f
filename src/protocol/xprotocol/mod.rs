//! Pluggable binary protocol family ("x-protocol").
//!
//! Frames are opaque to the proxy except for what the sub-protocol plugin
//! extracts: frame boundaries, stream id, heartbeat flag and routing
//! metadata. Plugins register by tag into an immutable-after-start registry;
//! the codec instance for a listener is built from the configured tag.

pub mod dubbo;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Codec, Frame, FrameDecoder, FrameKind, Headers, MatchResult, Protocol, Side, names};
use crate::buffer::IoBuffer;
use crate::error::{DecodeError, ProxyError, Result};

/// One binary sub-protocol: everything the relay needs to know about the
/// wire format, nothing more.
pub trait SubProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn match_protocol(&self, bytes: &[u8]) -> MatchResult;

    fn min_frame_len(&self) -> usize;

    /// Length of the first complete frame, if the buffer holds one.
    fn frame_len(&self, bytes: &[u8]) -> Option<usize>;

    fn stream_id(&self, frame: &[u8]) -> Option<u64>;

    fn set_stream_id(&self, frame: &mut [u8], id: u64);

    /// Routing metadata (service, method) extracted from the frame.
    fn metas(&self, frame: &[u8]) -> Headers;

    fn is_heartbeat(&self, frame: &[u8]) -> bool;

    fn is_response(&self, frame: &[u8]) -> bool;

    fn status(&self, frame: &[u8]) -> Option<u16>;

    fn build_heartbeat_request(&self, stream_id: u64) -> Option<Bytes>;

    fn build_heartbeat_response(&self, request: &[u8]) -> Option<Bytes>;
}

struct SubProtocolRegistry {
    plugins: RwLock<HashMap<&'static str, Arc<dyn SubProtocol>>>,
    sealed: AtomicBool,
}

static REGISTRY: Lazy<SubProtocolRegistry> = Lazy::new(|| {
    let registry = SubProtocolRegistry {
        plugins: RwLock::new(HashMap::new()),
        sealed: AtomicBool::new(false),
    };
    registry
        .plugins
        .write()
        .insert(dubbo::NAME, Arc::new(dubbo::DubboProtocol::new()));
    registry
});

/// Register a sub-protocol plugin. Must happen during startup, before the
/// registry is sealed by the first listener start; late registration panics.
pub fn register(plugin: Arc<dyn SubProtocol>) {
    if REGISTRY.sealed.load(Ordering::Acquire) {
        panic!(
            "sub-protocol '{}' registered after startup sealed the registry",
            plugin.name()
        );
    }
    let mut plugins = REGISTRY.plugins.write();
    if plugins.insert(plugin.name(), plugin.clone()).is_some() {
        panic!("sub-protocol '{}' registered twice", plugin.name());
    }
}

/// Seal the registry; called once listeners begin accepting.
pub fn seal() {
    REGISTRY.sealed.store(true, Ordering::Release);
}

pub fn plugin(tag: &str) -> Result<Arc<dyn SubProtocol>> {
    REGISTRY
        .plugins
        .read()
        .get(tag)
        .cloned()
        .ok_or_else(|| ProxyError::Codec(format!("unknown sub-protocol: {}", tag)))
}

/// Build an x-protocol codec for the configured sub-protocol tag.
pub fn codec(tag: &str) -> Result<Arc<dyn Codec>> {
    Ok(Arc::new(XCodec {
        plugin: plugin(tag)?,
    }))
}

/// Every registered sub-protocol wrapped as a codec, in tag order. Used by
/// auto-detection listeners.
pub fn all() -> Vec<Arc<dyn Codec>> {
    let plugins = REGISTRY.plugins.read();
    let mut tags: Vec<&'static str> = plugins.keys().copied().collect();
    tags.sort_unstable();
    tags.into_iter()
        .filter_map(|tag| plugins.get(tag).cloned())
        .map(|plugin| Arc::new(XCodec { plugin }) as Arc<dyn Codec>)
        .collect()
}

/// Codec adapter wrapping a sub-protocol plugin. Frames carry their wire
/// bytes in `body`; headers are synthesized from plugin metadata.
pub struct XCodec {
    plugin: Arc<dyn SubProtocol>,
}

impl XCodec {
    fn frame_from_wire(&self, wire: Bytes) -> Frame {
        let plugin = &self.plugin;
        let id = plugin.stream_id(&wire).unwrap_or(0);
        let heartbeat = plugin.is_heartbeat(&wire);
        let mut frame = if plugin.is_response(&wire) {
            Frame::response(
                Protocol::Xprotocol,
                id,
                plugin.status(&wire).unwrap_or(200),
            )
        } else {
            Frame::request(Protocol::Xprotocol, id)
        };
        frame.heartbeat = heartbeat;
        frame.headers = plugin.metas(&wire);
        frame
            .headers
            .insert(names::SUB_PROTOCOL.into(), plugin.name().into());
        if heartbeat {
            frame
                .headers
                .insert(names::HEARTBEAT.into(), plugin.name().into());
        }
        if frame.kind == FrameKind::Request {
            // dynamic-route keys, as the stream layer synthesizes them
            frame
                .headers
                .entry(names::PATH.to_string())
                .or_insert_with(|| "/".into());
        }
        frame.body = wire;
        frame
    }
}

impl Codec for XCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Xprotocol
    }

    fn match_protocol(&self, bytes: &[u8]) -> MatchResult {
        self.plugin.match_protocol(bytes)
    }

    fn min_frame_len(&self) -> usize {
        self.plugin.min_frame_len()
    }

    fn split_frames<'a>(&self, bytes: &'a [u8]) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        let mut offset = 0;
        while let Some(len) = self.plugin.frame_len(&bytes[offset..]) {
            if bytes.len() - offset < len {
                break;
            }
            out.push(&bytes[offset..offset + len]);
            offset += len;
        }
        out
    }

    fn stream_id(&self, frame: &[u8]) -> Option<u64> {
        self.plugin.stream_id(frame)
    }

    fn set_stream_id(&self, frame: &mut [u8], id: u64) -> bool {
        if frame.len() < self.plugin.min_frame_len() {
            return false;
        }
        self.plugin.set_stream_id(frame, id);
        true
    }

    fn meta(&self, frame: &[u8]) -> Headers {
        self.plugin.metas(frame)
    }

    fn new_decoder(&self, _side: Side) -> Box<dyn FrameDecoder> {
        Box::new(XDecoder {
            codec: XCodec {
                plugin: self.plugin.clone(),
            },
        })
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes> {
        if frame.heartbeat && frame.body.is_empty() {
            let wire = match frame.kind {
                FrameKind::Request => self.plugin.build_heartbeat_request(frame.stream_id),
                FrameKind::Response => {
                    // a bare heartbeat ack needs the original frame; absent
                    // that, rebuild a request-shaped probe and ack it
                    self.plugin
                        .build_heartbeat_request(frame.stream_id)
                        .and_then(|req| self.plugin.build_heartbeat_response(&req))
                }
            };
            return wire.ok_or_else(|| {
                ProxyError::Codec(format!(
                    "sub-protocol {} cannot build heartbeats",
                    self.plugin.name()
                ))
            });
        }
        if frame.body.is_empty() {
            return Err(ProxyError::Codec(
                "x-protocol frame without wire bytes".into(),
            ));
        }
        Ok(frame.body.clone())
    }

    fn build_heartbeat_request(&self, stream_id: u64) -> Option<Frame> {
        let wire = self.plugin.build_heartbeat_request(stream_id)?;
        let mut frame = self.frame_from_wire(wire);
        frame.stream_id = stream_id;
        Some(frame)
    }

    fn build_heartbeat_response(&self, request: &Frame) -> Option<Frame> {
        let wire = self.plugin.build_heartbeat_response(&request.body)?;
        let mut frame = self.frame_from_wire(wire);
        frame.stream_id = request.stream_id;
        Some(frame)
    }

    fn max_concurrent_streams(&self) -> usize {
        1024
    }

    fn pool_tag(&self) -> String {
        format!("x/{}", self.plugin.name())
    }
}

struct XDecoder {
    codec: XCodec,
}

impl FrameDecoder for XDecoder {
    fn decode(&mut self, buf: &mut IoBuffer) -> std::result::Result<Option<Frame>, DecodeError> {
        let plugin = &self.codec.plugin;
        if buf.len() >= plugin.min_frame_len()
            && plugin.match_protocol(buf.bytes()) == MatchResult::Fail
        {
            return Err(DecodeError::BadMagic);
        }
        let total = match plugin.frame_len(buf.bytes()) {
            Some(total) => total,
            None => return Ok(None),
        };
        if buf.len() < total {
            return Ok(None);
        }
        let wire = buf.split_to(total);
        Ok(Some(self.codec.frame_from_wire(wire)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_lookup() {
        assert!(plugin("dubbo").is_ok());
        assert!(plugin("nope").is_err());
    }

    #[test]
    fn test_codec_pool_tag() {
        let c = codec("dubbo").unwrap();
        assert_eq!(c.pool_tag(), "x/dubbo");
    }
}
