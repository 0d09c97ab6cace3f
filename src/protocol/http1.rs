//! HTTP/1.1 text codec.
//!
//! Bodies are delimited by `Content-Length`; transfer encodings the data
//! path does not speak are rejected at decode time rather than silently
//! corrupted. HTTP/1 multiplexes nothing, so stream ids are synthesized
//! sequentially per connection side.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::{Codec, Frame, FrameDecoder, FrameKind, Headers, MatchResult, Protocol, Side, names};
use crate::buffer::IoBuffer;
use crate::error::{DecodeError, ProxyError, Result};

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 64 * 1024;

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

pub struct Http1Codec;

impl Http1Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Http1Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for Http1Codec {
    fn protocol(&self) -> Protocol {
        Protocol::Http1
    }

    fn match_protocol(&self, bytes: &[u8]) -> MatchResult {
        if bytes.is_empty() {
            return MatchResult::Again;
        }
        for method in METHODS {
            let m = method.as_bytes();
            let n = bytes.len().min(m.len());
            if bytes[..n] == m[..n] {
                return if bytes.len() > m.len() {
                    // method must be followed by a space
                    if bytes[m.len()] == b' ' {
                        MatchResult::Match
                    } else {
                        continue_match(bytes, method)
                    }
                } else {
                    MatchResult::Again
                };
            }
        }
        MatchResult::Fail
    }

    fn min_frame_len(&self) -> usize {
        // shortest possible request head: "GET / HTTP/1.1\r\n\r\n"
        18
    }

    fn split_frames<'a>(&self, bytes: &'a [u8]) -> Vec<&'a [u8]> {
        // One frame per complete head+body; scan with a throwaway decoder.
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            match request_frame_len(&bytes[offset..]) {
                Some(len) => {
                    out.push(&bytes[offset..offset + len]);
                    offset += len;
                }
                None => break,
            }
        }
        out
    }

    fn stream_id(&self, _frame: &[u8]) -> Option<u64> {
        None
    }

    fn set_stream_id(&self, _frame: &mut [u8], _id: u64) -> bool {
        false
    }

    fn meta(&self, frame: &[u8]) -> Headers {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let mut out = Headers::new();
        if let Ok(httparse::Status::Complete(_)) = req.parse(frame) {
            if let Some(method) = req.method {
                out.insert(names::METHOD.into(), method.into());
            }
            if let Some(path) = req.path {
                out.insert(names::PATH.into(), path.into());
            }
            for h in req.headers.iter() {
                if h.name.eq_ignore_ascii_case("host") {
                    if let Ok(v) = std::str::from_utf8(h.value) {
                        out.insert(names::AUTHORITY.into(), v.into());
                    }
                }
            }
        }
        out
    }

    fn new_decoder(&self, side: Side) -> Box<dyn FrameDecoder> {
        Box::new(Http1Decoder { side, next_id: 0 })
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(256 + frame.body.len());
        match frame.kind {
            FrameKind::Request => {
                let method = frame
                    .headers
                    .get(names::METHOD)
                    .map(String::as_str)
                    .unwrap_or("GET");
                let path = frame
                    .headers
                    .get(names::PATH)
                    .map(String::as_str)
                    .unwrap_or("/");
                out.put_slice(method.as_bytes());
                out.put_u8(b' ');
                out.put_slice(path.as_bytes());
                out.put_slice(b" HTTP/1.1\r\n");
                if let Some(host) = frame.headers.get(names::AUTHORITY) {
                    out.put_slice(b"Host: ");
                    out.put_slice(host.as_bytes());
                    out.put_slice(b"\r\n");
                }
            }
            FrameKind::Response => {
                let status = frame.status.ok_or_else(|| {
                    ProxyError::Codec("HTTP/1 response frame without status".into())
                })?;
                out.put_slice(
                    format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes(),
                );
            }
        }
        for (name, value) in &frame.headers {
            if name.starts_with(':') || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(format!("Content-Length: {}\r\n", frame.body.len()).as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(&frame.body);
        Ok(out.freeze())
    }

    fn build_heartbeat_request(&self, _stream_id: u64) -> Option<Frame> {
        // HTTP/1 has no protocol-native heartbeat.
        None
    }

    fn build_heartbeat_response(&self, _request: &Frame) -> Option<Frame> {
        None
    }

    fn max_concurrent_streams(&self) -> usize {
        1
    }
}

fn continue_match(bytes: &[u8], _method: &str) -> MatchResult {
    // a longer method may still match (e.g. "P" -> POST/PUT/PATCH)
    for method in METHODS {
        let m = method.as_bytes();
        let n = bytes.len().min(m.len());
        if bytes[..n] == m[..n] && (bytes.len() <= m.len() || bytes[m.len()] == b' ') {
            return if bytes.len() <= m.len() {
                MatchResult::Again
            } else {
                MatchResult::Match
            };
        }
    }
    MatchResult::Fail
}

struct Http1Decoder {
    side: Side,
    next_id: u64,
}

impl FrameDecoder for Http1Decoder {
    fn decode(&mut self, buf: &mut IoBuffer) -> std::result::Result<Option<Frame>, DecodeError> {
        let frame = match self.side {
            Side::Server => decode_request(buf)?,
            Side::Client => decode_response(buf)?,
        };
        Ok(frame.map(|mut f| {
            self.next_id += 1;
            f.stream_id = self.next_id;
            f
        }))
    }
}

fn header_map(headers: &[httparse::Header<'_>]) -> std::result::Result<Headers, DecodeError> {
    let mut out = HashMap::with_capacity(headers.len());
    for h in headers {
        let value = std::str::from_utf8(h.value)
            .map_err(|_| DecodeError::MalformedFrame("non-UTF8 header value".into()))?;
        out.insert(h.name.to_ascii_lowercase(), value.to_string());
    }
    Ok(out)
}

fn content_length(headers: &Headers) -> std::result::Result<usize, DecodeError> {
    if let Some(te) = headers.get("transfer-encoding") {
        return Err(DecodeError::Unsupported(format!(
            "transfer-encoding: {}",
            te
        )));
    }
    match headers.get("content-length") {
        Some(v) => v
            .parse()
            .map_err(|_| DecodeError::MalformedFrame("bad content-length".into())),
        None => Ok(0),
    }
}

fn decode_request(buf: &mut IoBuffer) -> std::result::Result<Option<Frame>, DecodeError> {
    let bytes = buf.bytes();
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(bytes) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if bytes.len() > MAX_HEAD_BYTES {
                return Err(DecodeError::HeadersTooLarge(bytes.len()));
            }
            return Ok(None);
        }
        Err(e) => return Err(DecodeError::MalformedFrame(e.to_string())),
    };

    let mut header_map = header_map(req.headers)?;
    let body_len = content_length(&header_map)?;
    if bytes.len() < head_len + body_len {
        return Ok(None);
    }

    let mut frame = Frame::request(Protocol::Http1, 0);
    frame
        .headers
        .insert(names::METHOD.into(), req.method.unwrap_or("GET").into());
    frame
        .headers
        .insert(names::PATH.into(), req.path.unwrap_or("/").into());
    if let Some(host) = header_map.remove("host") {
        frame.headers.insert(names::AUTHORITY.into(), host);
    }
    frame.headers.extend(header_map);

    buf.drain(head_len);
    frame.body = buf.split_to(body_len);
    Ok(Some(frame))
}

fn decode_response(buf: &mut IoBuffer) -> std::result::Result<Option<Frame>, DecodeError> {
    let bytes = buf.bytes();
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let head_len = match resp.parse(bytes) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if bytes.len() > MAX_HEAD_BYTES {
                return Err(DecodeError::HeadersTooLarge(bytes.len()));
            }
            return Ok(None);
        }
        Err(e) => return Err(DecodeError::MalformedFrame(e.to_string())),
    };

    let status = resp
        .code
        .ok_or_else(|| DecodeError::MalformedFrame("response without status".into()))?;
    let header_map = header_map(resp.headers)?;
    let body_len = if (100..200).contains(&status) || status == 204 || status == 304 {
        0
    } else {
        content_length(&header_map)?
    };
    if bytes.len() < head_len + body_len {
        return Ok(None);
    }

    let mut frame = Frame::response(Protocol::Http1, 0, status);
    frame.headers.extend(header_map);
    frame
        .headers
        .insert(names::STATUS.into(), status.to_string());

    buf.drain(head_len);
    frame.body = buf.split_to(body_len);
    Ok(Some(frame))
}

/// Total byte length of the first complete request in `bytes`, if any.
fn request_frame_len(bytes: &[u8]) -> Option<usize> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(bytes) {
        Ok(httparse::Status::Complete(head_len)) => {
            let map = header_map(req.headers).ok()?;
            let body_len = content_length(&map).ok()?;
            if bytes.len() >= head_len + body_len {
                Some(head_len + body_len)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Http1Codec {
        Http1Codec::new()
    }

    #[test]
    fn test_match_protocol() {
        assert_eq!(codec().match_protocol(b"GET /ping HTTP/1.1\r\n"), MatchResult::Match);
        assert_eq!(codec().match_protocol(b"GE"), MatchResult::Again);
        assert_eq!(codec().match_protocol(b"P"), MatchResult::Again);
        assert_eq!(codec().match_protocol(b"PATCH /x HTTP/1.1\r\n"), MatchResult::Match);
        assert_eq!(codec().match_protocol(&[0xaf, 0x05, 0x00]), MatchResult::Fail);
        assert_eq!(codec().match_protocol(b"PRI * HTTP/2.0"), MatchResult::Fail);
    }

    #[test]
    fn test_decode_request() {
        let mut buf =
            IoBuffer::from_bytes(b"GET /ping HTTP/1.1\r\nHost: x\r\nUser-Agent: t\r\n\r\n");
        let mut decoder = codec().new_decoder(Side::Server);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.headers[names::METHOD], "GET");
        assert_eq!(frame.headers[names::PATH], "/ping");
        assert_eq!(frame.headers[names::AUTHORITY], "x");
        assert_eq!(frame.stream_id, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_leaves_buffer() {
        let mut buf = IoBuffer::from_bytes(b"GET /ping HTTP/1.1\r\nHos");
        let mut decoder = codec().new_decoder(Side::Server);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 23);
    }

    #[test]
    fn test_decode_request_with_body() {
        let mut buf = IoBuffer::from_bytes(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
        );
        let mut decoder = codec().new_decoder(Side::Server);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"hello");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut frame = Frame::request(Protocol::Http1, 0);
        frame.headers.insert(names::METHOD.into(), "POST".into());
        frame.headers.insert(names::PATH.into(), "/svc".into());
        frame.headers.insert(names::AUTHORITY.into(), "example".into());
        frame.headers.insert("x-tag".into(), "42".into());
        frame.body = Bytes::from_static(b"payload");

        let wire = codec().encode(&frame).unwrap();
        let mut buf = IoBuffer::from_bytes(&wire);
        let mut decoder = codec().new_decoder(Side::Server);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.headers[names::METHOD], "POST");
        assert_eq!(decoded.headers[names::PATH], "/svc");
        assert_eq!(decoded.headers[names::AUTHORITY], "example");
        assert_eq!(decoded.headers["x-tag"], "42");
        assert_eq!(decoded.body, frame.body);
    }

    #[test]
    fn test_decode_response() {
        let mut buf =
            IoBuffer::from_bytes(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        let mut decoder = codec().new_decoder(Side::Client);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.status, Some(200));
        assert_eq!(&frame.body[..], b"ok");
    }

    #[test]
    fn test_chunked_rejected() {
        let mut buf = IoBuffer::from_bytes(
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        );
        let mut decoder = codec().new_decoder(Side::Server);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_split_frames_boundary() {
        let one = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let two = b"GET /b HTTP/1.1\r\nHost: x\r\n\r\nGET /c HT";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(one);
        bytes.extend_from_slice(two);
        let frames = codec().split_frames(&bytes);
        assert_eq!(frames.len(), 2);
        let joined: Vec<u8> = frames.concat();
        assert!(bytes.starts_with(&joined));
    }
}
