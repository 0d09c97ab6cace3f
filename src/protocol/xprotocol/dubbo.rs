//! Dubbo sub-protocol plugin.
//!
//! Frame header (16 bytes):
//!
//! ```text
//! | magic high | magic low | flag | status |        id (8, BE)       | payload len (4, BE) |
//! ```
//!
//! magic is `0xda 0xbb`; the flag byte carries the request bit (0x80) and
//! the event bit (0x20) used for heartbeats. Body payloads are hessian-
//! encoded and stay opaque to the proxy.

use bytes::{BufMut, Bytes, BytesMut};

use super::SubProtocol;
use crate::protocol::{Headers, MatchResult};

pub const NAME: &str = "dubbo";

pub const MAGIC: [u8; 2] = [0xda, 0xbb];
pub const HEADER_LEN: usize = 16;

const IDX_FLAG: usize = 2;
const IDX_STATUS: usize = 3;
const IDX_ID: usize = 4;
const IDX_LEN: usize = 12;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWO_WAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;

/// Dubbo OK status.
const STATUS_OK: u8 = 20;

pub struct DubboProtocol;

impl DubboProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DubboProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl SubProtocol for DubboProtocol {
    fn name(&self) -> &'static str {
        NAME
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

    fn frame_len(&self, bytes: &[u8]) -> Option<usize> {
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

    fn stream_id(&self, frame: &[u8]) -> Option<u64> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&frame[IDX_ID..IDX_ID + 8]);
        Some(u64::from_be_bytes(id))
    }

    fn set_stream_id(&self, frame: &mut [u8], id: u64) {
        if frame.len() >= HEADER_LEN {
            frame[IDX_ID..IDX_ID + 8].copy_from_slice(&id.to_be_bytes());
        }
    }

    fn metas(&self, _frame: &[u8]) -> Headers {
        // service/method live inside the hessian body, which stays opaque;
        // routing falls back to the synthesized keys
        Headers::new()
    }

    fn is_heartbeat(&self, frame: &[u8]) -> bool {
        frame.len() >= HEADER_LEN && frame[IDX_FLAG] & FLAG_EVENT != 0
    }

    fn is_response(&self, frame: &[u8]) -> bool {
        frame.len() >= HEADER_LEN && frame[IDX_FLAG] & FLAG_REQUEST == 0
    }

    fn status(&self, frame: &[u8]) -> Option<u16> {
        if frame.len() < HEADER_LEN || !self.is_response(frame) {
            return None;
        }
        Some(if frame[IDX_STATUS] == STATUS_OK { 200 } else { 500 })
    }

    fn build_heartbeat_request(&self, stream_id: u64) -> Option<Bytes> {
        let mut out = BytesMut::with_capacity(HEADER_LEN);
        out.put_slice(&MAGIC);
        out.put_u8(FLAG_REQUEST | FLAG_TWO_WAY | FLAG_EVENT);
        out.put_u8(0);
        out.put_u64(stream_id);
        out.put_u32(0);
        Some(out.freeze())
    }

    fn build_heartbeat_response(&self, request: &[u8]) -> Option<Bytes> {
        let id = self.stream_id(request)?;
        let mut out = BytesMut::with_capacity(HEADER_LEN);
        out.put_slice(&MAGIC);
        out.put_u8(FLAG_EVENT);
        out.put_u8(STATUS_OK);
        out.put_u64(id);
        out.put_u32(0);
        Some(out.freeze())
    }
}
