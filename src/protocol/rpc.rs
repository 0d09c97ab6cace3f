//! Binary request/response RPC codec.
//!
//! Frame layout is a fixed 16-byte header followed by the payload:
//!
//! ```text
//! 0      1      2      3      4                          12         16
//! | magic (2)  | flag | stat |        request id (8, BE)  | len (4, BE)
//! ```
//!
//! The payload opens with a header table (u16 count, then u16-length-prefixed
//! key/value pairs) so routing metadata such as the service name travels
//! in-band, followed by the opaque body.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Codec, Frame, FrameDecoder, FrameKind, Headers, MatchResult, Protocol, Side, names};
use crate::buffer::IoBuffer;
use crate::error::{DecodeError, ProxyError, Result};

pub const MAGIC: [u8; 2] = [0xaf, 0x05];
pub const HEADER_LEN: usize = 16;

const IDX_FLAG: usize = 2;
const IDX_STATUS: usize = 3;
const IDX_ID: usize = 4;
const IDX_LEN: usize = 12;

/// Flag bits.
pub const FLAG_RESPONSE: u8 = 0x01;
pub const FLAG_HEARTBEAT: u8 = 0x20;

/// Status byte values on responses.
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_ERROR: u8 = 0x01;
pub const STATUS_SERVER_ERROR: u8 = 0x02;
pub const STATUS_TIMEOUT: u8 = 0x03;

pub struct RpcCodec;

impl RpcCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Map the wire status byte onto an HTTP-style code so retry and outlier
/// predicates stay protocol-independent.
pub fn status_to_http(status: u8) -> u16 {
    match status {
        STATUS_SUCCESS => 200,
        STATUS_ERROR => 500,
        STATUS_SERVER_ERROR => 502,
        STATUS_TIMEOUT => 504,
        _ => 500,
    }
}

pub fn http_to_status(code: u16) -> u8 {
    match code {
        200..=299 => STATUS_SUCCESS,
        502 => STATUS_SERVER_ERROR,
        504 => STATUS_TIMEOUT,
        _ => STATUS_ERROR,
    }
}

fn frame_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let payload = u32::from_be_bytes([
        bytes[IDX_LEN],
        bytes[IDX_LEN + 1],
        bytes[IDX_LEN + 2],
        bytes[IDX_LEN + 3],
    ]) as usize;
    Some(HEADER_LEN + payload)
}

fn request_id(bytes: &[u8]) -> u64 {
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[IDX_ID..IDX_ID + 8]);
    u64::from_be_bytes(id)
}

fn encode_payload(headers: &Headers, body: &[u8]) -> BytesMut {
    let mut wire_headers: Vec<(&str, &str)> = headers
        .iter()
        .filter(|(k, _)| !k.starts_with(':'))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    // deterministic layout keeps encoded frames reproducible
    wire_headers.sort_unstable();

    let mut out = BytesMut::new();
    out.put_u16(wire_headers.len() as u16);
    for (k, v) in wire_headers {
        out.put_u16(k.len() as u16);
        out.put_slice(k.as_bytes());
        out.put_u16(v.len() as u16);
        out.put_slice(v.as_bytes());
    }
    out.put_slice(body);
    out
}

fn decode_payload(payload: &[u8]) -> std::result::Result<(Headers, Bytes), DecodeError> {
    if payload.len() < 2 {
        return Err(DecodeError::MalformedFrame("payload shorter than header table".into()));
    }
    let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut offset = 2;
    let mut headers = Headers::with_capacity(count);
    for _ in 0..count {
        let key = read_chunk(payload, &mut offset)?;
        let value = read_chunk(payload, &mut offset)?;
        headers.insert(key, value);
    }
    Ok((headers, Bytes::copy_from_slice(&payload[offset..])))
}

fn read_chunk(payload: &[u8], offset: &mut usize) -> std::result::Result<String, DecodeError> {
    if payload.len() < *offset + 2 {
        return Err(DecodeError::MalformedFrame("truncated header table".into()));
    }
    let len = u16::from_be_bytes([payload[*offset], payload[*offset + 1]]) as usize;
    *offset += 2;
    if payload.len() < *offset + len {
        return Err(DecodeError::MalformedFrame("truncated header entry".into()));
    }
    let s = std::str::from_utf8(&payload[*offset..*offset + len])
        .map_err(|_| DecodeError::MalformedFrame("non-UTF8 header entry".into()))?
        .to_string();
    *offset += len;
    Ok(s)
}

fn parse_frame(wire: &[u8]) -> std::result::Result<Frame, DecodeError> {
    if wire[..2] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let flag = wire[IDX_FLAG];
    let id = request_id(wire);
    let is_response = flag & FLAG_RESPONSE != 0;
    let heartbeat = flag & FLAG_HEARTBEAT != 0;

    let mut frame = if is_response {
        Frame::response(Protocol::Rpc, id, status_to_http(wire[IDX_STATUS]))
    } else {
        Frame::request(Protocol::Rpc, id)
    };
    frame.heartbeat = heartbeat;

    if heartbeat {
        frame.headers.insert(names::HEARTBEAT.into(), "rpc".into());
        return Ok(frame);
    }

    let (headers, body) = decode_payload(&wire[HEADER_LEN..])?;
    frame.headers = headers;
    frame.body = body;
    if !is_response {
        // synthesized routing keys; service-aware routes use `service`
        frame
            .headers
            .entry(names::PATH.to_string())
            .or_insert_with(|| "/".into());
    }
    Ok(frame)
}

impl Codec for RpcCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Rpc
    }

    fn match_protocol(&self, bytes: &[u8]) -> MatchResult {
        let n = bytes.len().min(2);
        if bytes[..n] != MAGIC[..n] {
            return MatchResult::Fail;
        }
        if bytes.len() < 2 {
            MatchResult::Again
        } else {
            MatchResult::Match
        }
    }

    fn min_frame_len(&self) -> usize {
        HEADER_LEN
    }

    fn split_frames<'a>(&self, bytes: &'a [u8]) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        let mut offset = 0;
        while let Some(len) = frame_len(&bytes[offset..]) {
            if bytes.len() - offset < len {
                break;
            }
            out.push(&bytes[offset..offset + len]);
            offset += len;
        }
        out
    }

    fn stream_id(&self, frame: &[u8]) -> Option<u64> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        Some(request_id(frame))
    }

    fn set_stream_id(&self, frame: &mut [u8], id: u64) -> bool {
        if frame.len() < HEADER_LEN {
            return false;
        }
        frame[IDX_ID..IDX_ID + 8].copy_from_slice(&id.to_be_bytes());
        true
    }

    fn meta(&self, frame: &[u8]) -> Headers {
        match parse_frame(frame) {
            Ok(f) => f.headers,
            Err(_) => Headers::new(),
        }
    }

    fn new_decoder(&self, _side: Side) -> Box<dyn FrameDecoder> {
        Box::new(RpcDecoder)
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let mut flag = 0u8;
        let mut status = STATUS_SUCCESS;
        match frame.kind {
            FrameKind::Request => {}
            FrameKind::Response => {
                flag |= FLAG_RESPONSE;
                status = http_to_status(frame.status.ok_or_else(|| {
                    ProxyError::Codec("RPC response frame without status".into())
                })?);
            }
        }
        if frame.heartbeat {
            flag |= FLAG_HEARTBEAT;
        }

        let payload = if frame.heartbeat {
            BytesMut::new()
        } else {
            encode_payload(&frame.headers, &frame.body)
        };

        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
        out.put_slice(&MAGIC);
        out.put_u8(flag);
        out.put_u8(status);
        out.put_u64(frame.stream_id);
        out.put_u32(payload.len() as u32);
        out.put_slice(&payload);
        Ok(out.freeze())
    }

    fn build_heartbeat_request(&self, stream_id: u64) -> Option<Frame> {
        let mut frame = Frame::request(Protocol::Rpc, stream_id);
        frame.heartbeat = true;
        frame.headers.insert(names::HEARTBEAT.into(), "rpc".into());
        Some(frame)
    }

    fn build_heartbeat_response(&self, request: &Frame) -> Option<Frame> {
        let mut frame = Frame::response(Protocol::Rpc, request.stream_id, 200);
        frame.heartbeat = true;
        Some(frame)
    }

    fn max_concurrent_streams(&self) -> usize {
        1024
    }
}

struct RpcDecoder;

impl FrameDecoder for RpcDecoder {
    fn decode(&mut self, buf: &mut IoBuffer) -> std::result::Result<Option<Frame>, DecodeError> {
        let total = match frame_len(buf.bytes()) {
            Some(total) => total,
            None => return Ok(None),
        };
        if buf.len() < total {
            return Ok(None);
        }
        let wire = buf.split_to(total);
        parse_frame(&wire).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> RpcCodec {
        RpcCodec::new()
    }

    fn sample_request(id: u64) -> Frame {
        let mut frame = Frame::request(Protocol::Rpc, id);
        frame.headers.insert(names::SERVICE.into(), "testSofa".into());
        frame.headers.insert(names::RPC_METHOD.into(), "echo".into());
        frame.body = Bytes::from_static(b"body-bytes");
        frame
    }

    #[test]
    fn test_match_protocol() {
        assert_eq!(codec().match_protocol(&[0xaf, 0x05, 0, 0]), MatchResult::Match);
        assert_eq!(codec().match_protocol(&[0xaf]), MatchResult::Again);
        assert_eq!(codec().match_protocol(b"GET "), MatchResult::Fail);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = sample_request(42);
        let wire = codec().encode(&frame).unwrap();

        let mut buf = IoBuffer::from_bytes(&wire);
        let mut decoder = codec().new_decoder(Side::Server);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.kind, FrameKind::Request);
        assert_eq!(decoded.headers[names::SERVICE], "testSofa");
        assert_eq!(decoded.headers[names::RPC_METHOD], "echo");
        assert_eq!(decoded.body, frame.body);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_request_id_big_endian() {
        let frame = sample_request(0x0102_0304_0506_0708);
        let wire = codec().encode(&frame).unwrap();
        assert_eq!(&wire[IDX_ID..IDX_ID + 8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_split_frames_leaves_partial() {
        let one = codec().encode(&sample_request(1)).unwrap();
        let two = codec().encode(&sample_request(2)).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&one);
        bytes.extend_from_slice(&two);
        bytes.extend_from_slice(&two[..HEADER_LEN - 3]); // trailing partial

        let frames = codec().split_frames(&bytes);
        assert_eq!(frames.len(), 2);
        let joined: Vec<u8> = frames.concat();
        assert!(bytes.starts_with(&joined));
        assert!(bytes.len() - joined.len() < HEADER_LEN);
    }

    #[test]
    fn test_stream_id_rewrite() {
        let mut wire = codec().encode(&sample_request(9)).unwrap().to_vec();
        assert_eq!(codec().stream_id(&wire), Some(9));
        assert!(codec().set_stream_id(&mut wire, 77));
        assert_eq!(codec().stream_id(&wire), Some(77));

        // payload untouched by the rewrite
        let mut buf = IoBuffer::from_bytes(&wire);
        let decoded = codec().new_decoder(Side::Server).decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.headers[names::SERVICE], "testSofa");
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let hb = codec().build_heartbeat_request(5).unwrap();
        let wire = codec().encode(&hb).unwrap();
        assert_eq!(wire[IDX_FLAG] & FLAG_HEARTBEAT, FLAG_HEARTBEAT);

        let mut buf = IoBuffer::from_bytes(&wire);
        let decoded = codec().new_decoder(Side::Client).decode(&mut buf).unwrap().unwrap();
        assert!(decoded.heartbeat);
        assert_eq!(decoded.stream_id, 5);

        let ack = codec().build_heartbeat_response(&decoded).unwrap();
        assert_eq!(ack.stream_id, 5);
        assert_eq!(ack.status, Some(200));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut wire = codec().encode(&sample_request(1)).unwrap().to_vec();
        wire[0] = 0x00;
        let mut buf = IoBuffer::from_bytes(&wire);
        assert!(codec().new_decoder(Side::Server).decode(&mut buf).is_err());
    }

    #[test]
    fn test_status_mapping() {
        let mut resp = Frame::response(Protocol::Rpc, 3, 502);
        resp.headers.insert("k".into(), "v".into());
        let wire = codec().encode(&resp).unwrap();
        assert_eq!(wire[IDX_STATUS], STATUS_SERVER_ERROR);

        let mut buf = IoBuffer::from_bytes(&wire);
        let decoded = codec().new_decoder(Side::Client).decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.status, Some(502));
        assert!(decoded.is_5xx());
    }
}
