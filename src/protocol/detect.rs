//! Protocol auto-detection over the first bytes of a connection.
//!
//! Codecs are consulted in configured order; the first `Match` wins. A mix
//! of `Fail` and `Again` waits for more bytes; all-`Fail` is terminal and
//! the connection is closed.

use std::sync::Arc;

use super::{Codec, MatchResult};

pub struct ProtocolDetector {
    codecs: Vec<Arc<dyn Codec>>,
}

pub enum DetectResult {
    Matched(Arc<dyn Codec>),
    NeedMore,
    Failed,
}

impl ProtocolDetector {
    pub fn new(codecs: Vec<Arc<dyn Codec>>) -> Self {
        Self { codecs }
    }

    pub fn detect(&self, bytes: &[u8]) -> DetectResult {
        let mut need_more = false;
        for codec in &self.codecs {
            match codec.match_protocol(bytes) {
                MatchResult::Match => return DetectResult::Matched(codec.clone()),
                MatchResult::Again => need_more = true,
                MatchResult::Fail => {}
            }
        }
        if need_more {
            DetectResult::NeedMore
        } else {
            DetectResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{http1::Http1Codec, http2::{CLIENT_PREFACE, Http2Codec}, rpc::RpcCodec, Protocol};

    fn detector() -> ProtocolDetector {
        ProtocolDetector::new(vec![
            Arc::new(Http2Codec::new()),
            Arc::new(Http1Codec::new()),
            Arc::new(RpcCodec::new()),
        ])
    }

    #[test]
    fn test_h2_preface_selects_h2() {
        let mut bytes = CLIENT_PREFACE.to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0x4, 0, 0, 0, 0, 0]); // SETTINGS
        match detector().detect(&bytes) {
            DetectResult::Matched(codec) => assert_eq!(codec.protocol(), Protocol::Http2),
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_h1_request_selects_h1() {
        match detector().detect(b"GET /ping HTTP/1.1\r\n") {
            DetectResult::Matched(codec) => assert_eq!(codec.protocol(), Protocol::Http1),
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_partial_preface_waits() {
        // "PRI" is a preface prefix and no HTTP/1 method, rpc magic fails
        assert!(matches!(detector().detect(b"PRI"), DetectResult::NeedMore));
    }

    #[test]
    fn test_unknown_bytes_fail() {
        assert!(matches!(
            detector().detect(&[0x00, 0x01, 0x02, 0x03]),
            DetectResult::Failed
        ));
    }

    #[test]
    fn test_rpc_magic_selects_rpc() {
        match detector().detect(&[0xaf, 0x05, 0, 0, 0, 0]) {
            DetectResult::Matched(codec) => assert_eq!(codec.protocol(), Protocol::Rpc),
            _ => panic!("expected match"),
        }
    }
}
