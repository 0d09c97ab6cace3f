//! Active health checking.
//!
//! A per-cluster driver probes every host on an interval (with jitter), and
//! flips the host health bit after the configured number of consecutive
//! successes or failures. The default probe is a TCP connect; RPC-style
//! clusters additionally exchange a protocol heartbeat so a wedged process
//! behind an open port still fails.

use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info};

use super::host::{Host, HostSet};
use crate::config::HealthCheckConfig;
use crate::protocol::{Codec, FrameKind, Protocol};

pub struct HealthChecker {
    cluster: String,
    config: HealthCheckConfig,
    probe_codec: Option<Arc<dyn Codec>>,
    stop_tx: watch::Sender<bool>,
}

struct Streaks {
    healthy: u32,
    unhealthy: u32,
}

impl HealthChecker {
    pub fn new(
        cluster: &str,
        config: HealthCheckConfig,
        probe_codec: Option<Arc<dyn Codec>>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            cluster: cluster.to_string(),
            config,
            probe_codec,
            stop_tx,
        })
    }

    /// Spawn the driver for a host-set snapshot provider. The provider is a
    /// closure so host-set swaps take effect on the next sweep.
    pub fn start<F>(self: &Arc<Self>, snapshot: F)
    where
        F: Fn() -> Arc<HostSet> + Send + Sync + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let mut stop_rx = this.stop_tx.subscribe();
            let mut streaks: HashMap<SocketAddr, Streaks> = HashMap::new();
            loop {
                let jitter = this
                    .config
                    .interval_jitter
                    .map(|j| {
                        let j = j.as_millis().max(1) as u64;
                        Duration::from_millis(rand::thread_rng().gen_range(0..j))
                    })
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(this.config.interval + jitter) => {}
                    _ = stop_rx.changed() => return,
                }

                let hosts = snapshot();
                streaks.retain(|addr, _| hosts.find(*addr).is_some());
                for host in hosts.hosts() {
                    let ok = this.probe(host.address()).await;
                    let entry = streaks
                        .entry(host.address())
                        .or_insert(Streaks { healthy: 0, unhealthy: 0 });
                    this.apply_result(host, entry, ok);
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn apply_result(&self, host: &Arc<Host>, streaks: &mut Streaks, ok: bool) {
        if ok {
            streaks.healthy += 1;
            streaks.unhealthy = 0;
            if !host.healthy() && streaks.healthy >= self.config.healthy_threshold {
                info!(
                    cluster = %self.cluster,
                    host = %host.address(),
                    "host back to healthy"
                );
                host.set_healthy(true);
            }
        } else {
            streaks.unhealthy += 1;
            streaks.healthy = 0;
            if host.healthy() && streaks.unhealthy >= self.config.unhealthy_threshold {
                info!(
                    cluster = %self.cluster,
                    host = %host.address(),
                    "host marked unhealthy"
                );
                host.set_healthy(false);
            }
        }
    }

    async fn probe(&self, addr: SocketAddr) -> bool {
        let attempt = async {
            let mut stream = tokio::net::TcpStream::connect(addr).await.ok()?;
            let codec = match &self.probe_codec {
                None => return Some(()),
                Some(codec) => codec,
            };
            let heartbeat = match codec.build_heartbeat_request(1) {
                Some(frame) => frame,
                None => return Some(()),
            };
            let wire = codec.encode(&heartbeat).ok()?;
            stream.write_all(&wire).await.ok()?;

            let mut buf = Vec::with_capacity(256);
            let mut chunk = [0u8; 256];
            loop {
                let n = stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                buf.extend_from_slice(&chunk[..n]);
                let mut io = crate::buffer::IoBuffer::from_bytes(&buf);
                let mut decoder = codec.new_decoder(crate::protocol::Side::Client);
                match decoder.decode(&mut io) {
                    Ok(Some(frame)) if frame.kind == FrameKind::Response => {
                        return frame.status.filter(|s| (200..300).contains(s)).map(|_| ());
                    }
                    Ok(Some(_)) | Ok(None) => continue,
                    Err(_) => return None,
                }
            }
        };
        let ok = tokio::time::timeout(self.config.timeout, attempt)
            .await
            .ok()
            .flatten()
            .is_some();
        debug!(cluster = %self.cluster, host = %addr, ok, "health probe");
        ok
    }
}

/// RPC-style protocols carry a native heartbeat worth probing with.
pub fn probe_codec_for(protocol: Option<Protocol>) -> Option<Arc<dyn Codec>> {
    match protocol {
        Some(Protocol::Rpc) => crate::protocol::lookup(Protocol::Rpc).ok(),
        _ => None,
    }
}
