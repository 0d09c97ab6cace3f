//! HTTP/2 framing codec.
//!
//! The proxy relays HTTP/2 at frame level: after the 24-byte client preface,
//! each frame is `len(3) | type(1) | flags(1) | stream(4) | payload` and is
//! carried through opaque. Recognition is the preface; frame payloads are
//! never inspected.

use bytes::{Bytes, BytesMut};

use super::{Codec, Frame, FrameDecoder, FrameKind, Headers, MatchResult, Protocol, Side, names};
use crate::buffer::IoBuffer;
use crate::error::{DecodeError, ProxyError, Result};

pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const FRAME_HEADER_LEN: usize = 9;

const FRAME_TYPE_PING: u8 = 0x6;
const FLAG_ACK: u8 = 0x1;

pub struct Http2Codec;

impl Http2Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Http2Codec {
    fn default() -> Self {
        Self::new()
    }
}

fn payload_len(header: &[u8]) -> usize {
    ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize
}

fn frame_stream_id(header: &[u8]) -> u64 {
    (u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff) as u64
}

impl Codec for Http2Codec {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn match_protocol(&self, bytes: &[u8]) -> MatchResult {
        let n = bytes.len().min(CLIENT_PREFACE.len());
        if bytes[..n] != CLIENT_PREFACE[..n] {
            return MatchResult::Fail;
        }
        if bytes.len() < CLIENT_PREFACE.len() {
            MatchResult::Again
        } else {
            MatchResult::Match
        }
    }

    fn min_frame_len(&self) -> usize {
        FRAME_HEADER_LEN
    }

    fn split_frames<'a>(&self, bytes: &'a [u8]) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        let mut offset = 0;
        if bytes.starts_with(CLIENT_PREFACE) {
            out.push(&bytes[..CLIENT_PREFACE.len()]);
            offset = CLIENT_PREFACE.len();
        }
        while bytes.len() - offset >= FRAME_HEADER_LEN {
            let len = FRAME_HEADER_LEN + payload_len(&bytes[offset..]);
            if bytes.len() - offset < len {
                break;
            }
            out.push(&bytes[offset..offset + len]);
            offset += len;
        }
        out
    }

    fn stream_id(&self, frame: &[u8]) -> Option<u64> {
        if frame.len() < FRAME_HEADER_LEN || frame.starts_with(CLIENT_PREFACE) {
            return None;
        }
        Some(frame_stream_id(frame))
    }

    fn set_stream_id(&self, frame: &mut [u8], id: u64) -> bool {
        if frame.len() < FRAME_HEADER_LEN || frame.starts_with(CLIENT_PREFACE) {
            return false;
        }
        frame[5..9].copy_from_slice(&((id as u32) & 0x7fff_ffff).to_be_bytes());
        true
    }

    fn meta(&self, frame: &[u8]) -> Headers {
        // Payloads are opaque at relay level; synthesize the routing keys.
        let mut out = Headers::new();
        out.insert(names::PATH.into(), "/".into());
        if frame.len() >= FRAME_HEADER_LEN && !frame.starts_with(CLIENT_PREFACE) {
            out.insert("x-http2-frame-type".into(), frame[3].to_string());
        }
        out
    }

    fn new_decoder(&self, side: Side) -> Box<dyn FrameDecoder> {
        Box::new(Http2Decoder {
            side,
            preface_seen: side == Side::Client,
        })
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes> {
        // Relay frames carry their own wire bytes in the body.
        if frame.body.is_empty() {
            return Err(ProxyError::Codec(
                "HTTP/2 relay frame without wire bytes".into(),
            ));
        }
        Ok(frame.body.clone())
    }

    fn build_heartbeat_request(&self, _stream_id: u64) -> Option<Frame> {
        // PING frame with an 8-byte opaque payload.
        let mut wire = BytesMut::with_capacity(FRAME_HEADER_LEN + 8);
        wire.extend_from_slice(&[0, 0, 8, FRAME_TYPE_PING, 0, 0, 0, 0, 0]);
        wire.extend_from_slice(&[0u8; 8]);
        let mut frame = Frame::request(Protocol::Http2, 0);
        frame.heartbeat = true;
        frame.body = wire.freeze();
        Some(frame)
    }

    fn build_heartbeat_response(&self, request: &Frame) -> Option<Frame> {
        if request.body.len() < FRAME_HEADER_LEN {
            return None;
        }
        let mut wire = BytesMut::from(&request.body[..]);
        wire[4] = FLAG_ACK;
        let mut frame = Frame::response(Protocol::Http2, 0, 200);
        frame.heartbeat = true;
        frame.body = wire.freeze();
        Some(frame)
    }

    fn max_concurrent_streams(&self) -> usize {
        128
    }
}

struct Http2Decoder {
    side: Side,
    preface_seen: bool,
}

impl FrameDecoder for Http2Decoder {
    fn decode(&mut self, buf: &mut IoBuffer) -> std::result::Result<Option<Frame>, DecodeError> {
        if !self.preface_seen {
            if buf.len() < CLIENT_PREFACE.len() {
                return Ok(None);
            }
            if buf.bytes()[..CLIENT_PREFACE.len()] != *CLIENT_PREFACE {
                return Err(DecodeError::BadMagic);
            }
            self.preface_seen = true;
            let mut frame = Frame::request(Protocol::Http2, 0);
            frame.body = buf.split_to(CLIENT_PREFACE.len());
            frame.headers.insert("x-http2-preface".into(), "true".into());
            return Ok(Some(frame));
        }

        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let header = &buf.bytes()[..FRAME_HEADER_LEN];
        let total = FRAME_HEADER_LEN + payload_len(header);
        if buf.len() < total {
            return Ok(None);
        }

        let stream_id = frame_stream_id(header);
        let frame_type = header[3];
        let wire = buf.split_to(total);
        let mut frame = match self.side {
            Side::Server => Frame::request(Protocol::Http2, stream_id),
            Side::Client => Frame::response(Protocol::Http2, stream_id, 200),
        };
        frame.heartbeat = frame_type == FRAME_TYPE_PING;
        frame.body = wire;
        frame.kind = match self.side {
            Side::Server => FrameKind::Request,
            Side::Client => FrameKind::Response,
        };
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Http2Codec {
        Http2Codec::new()
    }

    fn settings_frame(extra: &[u8]) -> Vec<u8> {
        // SETTINGS frame: type 0x4, one 6-byte setting
        let mut f = vec![0, 0, 6, 0x4, 0, 0, 0, 0, 0];
        f.extend_from_slice(&[0, 3, 0, 0, 0, 100]);
        f.extend_from_slice(extra);
        f
    }

    #[test]
    fn test_match_preface() {
        assert_eq!(codec().match_protocol(CLIENT_PREFACE), MatchResult::Match);
        assert_eq!(codec().match_protocol(&CLIENT_PREFACE[..10]), MatchResult::Again);
        assert_eq!(codec().match_protocol(b"GET / HTTP/1.1\r\n"), MatchResult::Fail);
    }

    #[test]
    fn test_decode_preface_then_frames() {
        let mut bytes = CLIENT_PREFACE.to_vec();
        bytes.extend_from_slice(&settings_frame(&[]));
        let mut buf = IoBuffer::from_bytes(&bytes);
        let mut decoder = codec().new_decoder(Side::Server);

        let preface = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(preface.headers.get("x-http2-preface").map(String::as_str), Some("true"));

        let settings = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(settings.stream_id, 0);
        assert_eq!(settings.body.len(), 15);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_leaves_partial() {
        let mut bytes = settings_frame(&[]);
        bytes.extend_from_slice(&[0, 0, 10, 0x0, 0]); // truncated second frame
        let frames = codec().split_frames(&bytes);
        assert_eq!(frames.len(), 1);
        let joined: Vec<u8> = frames.concat();
        assert!(bytes.starts_with(&joined));
        assert!(bytes.len() - joined.len() < 10 + FRAME_HEADER_LEN);
    }

    #[test]
    fn test_stream_id_round_trip() {
        let mut frame = vec![0, 0, 0, 0x0, 0, 0, 0, 0, 5];
        assert_eq!(codec().stream_id(&frame), Some(5));
        assert!(codec().set_stream_id(&mut frame, 7));
        assert_eq!(codec().stream_id(&frame), Some(7));
    }

    #[test]
    fn test_ping_heartbeat() {
        let hb = codec().build_heartbeat_request(0).unwrap();
        assert!(hb.heartbeat);
        let mut buf = IoBuffer::from_bytes(&hb.body);
        let mut decoder = codec().new_decoder(Side::Client);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.heartbeat);

        let ack = codec().build_heartbeat_response(&hb).unwrap();
        assert_eq!(ack.body[4], FLAG_ACK);
    }
}
