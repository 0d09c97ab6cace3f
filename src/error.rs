use std::net::SocketAddr;

use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("connection has closed")]
    ConnectionClosed,

    #[error("unknown cluster: {0}")]
    ClusterNotFound(String),

    #[error("no healthy upstream in cluster {0}")]
    NoHealthyUpstream(String),

    #[error("unknown router configuration: {0}")]
    RouterNotFound(String),

    #[error("upstream connect failed: {0}")]
    ConnectFailed(String),

    #[error("upstream connect timed out: {0}")]
    ConnectTimeout(String),

    #[error("circuit breaker open for cluster {0}")]
    Overload(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream stream reset")]
    UpstreamReset,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("listener error: {0}")]
    Listener(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Unrecoverable protocol violations found while decoding a byte stream.
///
/// "Need more bytes" is not an error: decoders return `Ok(None)` and leave
/// the buffer intact. A `DecodeError` closes the connection.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("bad magic bytes")]
    BadMagic,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("header block exceeds limit ({0} bytes)")]
    HeadersTooLarge(usize),

    #[error("unsupported construct: {0}")]
    Unsupported(String),
}
