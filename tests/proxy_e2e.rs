//! End-to-end scenarios driving a full server over real sockets.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use switchyard::config::Config;
use switchyard::protocol::{self, Frame, FrameKind, Protocol};
use switchyard::server::Server;

/// Start a minimal HTTP/1 upstream answering every request with `pong`.
async fn spawn_http_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                loop {
                    let mut chunk = [0u8; 4096];
                    let n = match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    // serve one response per complete request head
                    while let Some(pos) = find_head_end(&buf) {
                        buf.drain(..pos);
                        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong";
                        if sock.write_all(resp).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    addr
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// RPC upstream answering every request with the given wire status.
async fn spawn_rpc_upstream(status_is_error: bool) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_out = hits.clone();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let hits = hits.clone();
            tokio::spawn(async move {
                let codec = protocol::lookup(Protocol::Rpc).unwrap();
                let mut buf = Vec::new();
                loop {
                    let mut chunk = [0u8; 4096];
                    let n = match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    let frames: Vec<Vec<u8>> = codec
                        .split_frames(&buf)
                        .into_iter()
                        .map(|f| f.to_vec())
                        .collect();
                    let consumed: usize = frames.iter().map(Vec::len).sum();
                    buf.drain(..consumed);
                    for frame in frames {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let id = codec.stream_id(&frame).unwrap();
                        let status = if status_is_error { 500 } else { 200 };
                        let mut resp = Frame::response(Protocol::Rpc, id, status);
                        resp.body = Bytes::from_static(b"resp");
                        let wire = codec.encode(&resp).unwrap();
                        if sock.write_all(&wire).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    (addr, hits_out)
}

async fn read_rpc_frame(sock: &mut TcpStream) -> Vec<u8> {
    let codec = protocol::lookup(Protocol::Rpc).unwrap();
    let mut buf = Vec::new();
    loop {
        let mut chunk = [0u8; 4096];
        let n = sock.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a full frame arrived");
        buf.extend_from_slice(&chunk[..n]);
        let frames = codec.split_frames(&buf);
        if let Some(frame) = frames.first() {
            return frame.to_vec();
        }
    }
}

#[tokio::test]
async fn test_http1_proxy_happy_path() {
    let upstream = spawn_http_upstream().await;
    let yaml = format!(
        r#"
servers:
  - name: e2e
    listeners:
      - name: ingress
        address: 127.0.0.1:0
        filter_chains:
          - filters:
              - type: proxy
                downstream_protocol: auto
                upstream_protocol: auto
                router_config_name: main
    routers:
      - router_config_name: main
        virtual_hosts:
          - name: all
            domains: ["*"]
            routes:
              - match: {{ prefix: / }}
                action:
                  cluster: {{ name: svc }}
cluster_manager:
  clusters:
    - name: svc
      hosts:
        - address: {upstream}
"#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.validate().unwrap();
    let server = Server::start(&config).await.unwrap();
    let addr = server.listener_addr("ingress").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut response = vec![0u8; 1024];
    let mut total = 0;
    loop {
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut response[total..]))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "proxy closed before responding");
        total += n;
        if response[..total].windows(4).any(|w| w == b"pong") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&response[..total]);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {}", text);
    server.shutdown().await;
}

#[tokio::test]
async fn test_direct_response_skips_upstream() {
    // cluster points at a dead port; a proxied request would fail
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = parked.local_addr().unwrap();
    drop(parked);

    let yaml = format!(
        r#"
servers:
  - name: e2e
    listeners:
      - name: ingress
        address: 127.0.0.1:0
        filter_chains:
          - filters:
              - type: proxy
                downstream_protocol: rpc
                upstream_protocol: rpc
                router_config_name: main
    routers:
      - router_config_name: main
        virtual_hosts:
          - name: all
            domains: ["*"]
            routes:
              - match:
                  prefix: /
                  headers:
                    - {{ name: service, value: ".*", regex: true }}
                action:
                  direct_response: {{ status: 200 }}
cluster_manager:
  clusters:
    - name: svc
      hosts:
        - address: {dead}
"#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    let server = Server::start(&config).await.unwrap();
    let addr = server.listener_addr("ingress").unwrap();

    let codec = protocol::lookup(Protocol::Rpc).unwrap();
    let mut request = Frame::request(Protocol::Rpc, 42);
    request.headers.insert("service".into(), "testSofa".into());
    request.body = Bytes::from_static(b"payload");
    let wire = codec.encode(&request).unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&wire).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), read_rpc_frame(&mut client))
        .await
        .unwrap();
    // response carries the caller's request id and a success status
    assert_eq!(codec.stream_id(&frame), Some(42));
    let mut buf = switchyard::buffer::IoBuffer::from_bytes(&frame);
    let decoded = codec
        .new_decoder(protocol::Side::Client)
        .decode(&mut buf)
        .unwrap()
        .unwrap();
    assert_eq!(decoded.kind, FrameKind::Response);
    assert_eq!(decoded.status, Some(200));
    server.shutdown().await;
}

#[tokio::test]
async fn test_retry_on_5xx_reaches_good_host() {
    let (bad, bad_hits) = spawn_rpc_upstream(true).await;
    let (good, _good_hits) = spawn_rpc_upstream(false).await;

    let yaml = format!(
        r#"
servers:
  - name: e2e
    listeners:
      - name: ingress
        address: 127.0.0.1:0
        filter_chains:
          - filters:
              - type: proxy
                downstream_protocol: rpc
                upstream_protocol: rpc
                router_config_name: main
    routers:
      - router_config_name: main
        virtual_hosts:
          - name: all
            domains: ["*"]
            routes:
              - match: {{ prefix: / }}
                action:
                  cluster:
                    name: svc
                    timeout: 10s
                    retry_policy:
                      retry_on: ["5xx"]
                      num_retries: 2
                      per_try_timeout: 2s
cluster_manager:
  clusters:
    - name: svc
      lb_type: round_robin
      hosts:
        - address: {bad}
        - address: {good}
"#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    let server = Server::start(&config).await.unwrap();
    let addr = server.listener_addr("ingress").unwrap();

    let codec = protocol::lookup(Protocol::Rpc).unwrap();

    // several requests: wherever round-robin starts, every caller must end
    // up with a success
    for id in 1..=4u64 {
        let mut request = Frame::request(Protocol::Rpc, id);
        request.headers.insert("service".into(), "svc".into());
        let wire = codec.encode(&request).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&wire).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), read_rpc_frame(&mut client))
            .await
            .unwrap();

        assert_eq!(codec.stream_id(&frame), Some(id));
        let mut buf = switchyard::buffer::IoBuffer::from_bytes(&frame);
        let decoded = codec
            .new_decoder(protocol::Side::Client)
            .decode(&mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.status, Some(200), "request {} saw a failure", id);
    }
    // the bad host was actually exercised, so retries happened
    assert!(bad_hits.load(Ordering::SeqCst) >= 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_h2_preface_relays_bytes() {
    // relay target records everything it receives
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut chunk = [0u8; 1024];
        while seen.len() < 24 + 9 {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&chunk[..n]);
        }
        let _ = seen_tx.send(seen);
    });

    let yaml = format!(
        r#"
servers:
  - name: e2e
    listeners:
      - name: ingress
        address: 127.0.0.1:0
        filter_chains:
          - filters:
              - type: proxy
                downstream_protocol: auto
                upstream_protocol: auto
                router_config_name: main
    routers:
      - router_config_name: main
        virtual_hosts:
          - name: all
            domains: ["*"]
            routes:
              - match: {{ prefix: / }}
                action:
                  cluster: {{ name: svc }}
cluster_manager:
  clusters:
    - name: svc
      hosts:
        - address: {upstream}
"#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    let server = Server::start(&config).await.unwrap();
    let addr = server.listener_addr("ingress").unwrap();

    let mut wire = switchyard::protocol::http2::CLIENT_PREFACE.to_vec();
    wire.extend_from_slice(&[0, 0, 0, 0x4, 0, 0, 0, 0, 0]); // empty SETTINGS

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&wire).await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx)
        .await
        .unwrap()
        .unwrap();
    // the upstream received the preface and frame byte-identical
    assert_eq!(seen, wire);
    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_answered_without_upstream() {
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = parked.local_addr().unwrap();
    drop(parked);

    let yaml = format!(
        r#"
servers:
  - name: e2e
    listeners:
      - name: ingress
        address: 127.0.0.1:0
        filter_chains:
          - filters:
              - type: proxy
                downstream_protocol: rpc
                upstream_protocol: rpc
                router_config_name: main
        stream_filters:
          - type: health_check
            pass_through: false
    routers:
      - router_config_name: main
        virtual_hosts:
          - name: all
            domains: ["*"]
            routes:
              - match: {{ prefix: / }}
                action:
                  cluster: {{ name: svc }}
cluster_manager:
  clusters:
    - name: svc
      hosts:
        - address: {dead}
"#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    let server = Server::start(&config).await.unwrap();
    let addr = server.listener_addr("ingress").unwrap();

    let codec = protocol::lookup(Protocol::Rpc).unwrap();
    let heartbeat = codec.build_heartbeat_request(7).unwrap();
    let wire = codec.encode(&heartbeat).unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&wire).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), read_rpc_frame(&mut client))
        .await
        .unwrap();
    assert_eq!(codec.stream_id(&frame), Some(7));
    let mut buf = switchyard::buffer::IoBuffer::from_bytes(&frame);
    let decoded = codec
        .new_decoder(protocol::Side::Client)
        .decode(&mut buf)
        .unwrap()
        .unwrap();
    assert!(decoded.heartbeat);
    assert_eq!(decoded.kind, FrameKind::Response);
    server.shutdown().await;
}
