//! Upstream host: identity is the network address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::config::{HostConfig, MAX_HOST_WEIGHT, MIN_HOST_WEIGHT};

/// A single upstream endpoint. Health and counters are mutated by the health
/// checker, outlier detector and the proxy; everything else is immutable.
pub struct Host {
    address: SocketAddr,
    weight: u32,
    metadata: HashMap<String, String>,
    healthy: AtomicBool,
    active_requests: AtomicI64,
    total_requests: AtomicU64,
    consecutive_5xx: AtomicU32,
    connect_failures: AtomicU64,
}

impl Host {
    pub fn new(config: &HostConfig) -> Arc<Self> {
        Arc::new(Self {
            address: config.address,
            weight: config.weight.clamp(MIN_HOST_WEIGHT, MAX_HOST_WEIGHT),
            metadata: config.metadata.clone(),
            healthy: AtomicBool::new(true),
            active_requests: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            consecutive_5xx: AtomicU32::new(0),
            connect_failures: AtomicU64::new(0),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Track consecutive 5xx responses for outlier detection. Returns the
    /// new streak length.
    pub fn record_response(&self, is_5xx: bool) -> u32 {
        if is_5xx {
            self.consecutive_5xx.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.consecutive_5xx.store(0, Ordering::Release);
            0
        }
    }

    pub fn consecutive_5xx(&self) -> u32 {
        self.consecutive_5xx.load(Ordering::Acquire)
    }

    pub fn reset_5xx_streak(&self) {
        self.consecutive_5xx.store(0, Ordering::Release);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("weight", &self.weight)
            .field("healthy", &self.healthy())
            .field("active_requests", &self.active_requests())
            .finish()
    }
}

/// Immutable snapshot of a cluster's hosts. Updates build a new set and
/// publish it atomically; readers never see a partially mutated set.
#[derive(Clone, Default)]
pub struct HostSet {
    hosts: Vec<Arc<Host>>,
}

impl HostSet {
    pub fn new(hosts: Vec<Arc<Host>>) -> Arc<Self> {
        Arc::new(Self { hosts })
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.hosts.iter().filter(|h| h.healthy()).count()
    }

    pub fn find(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts
            .iter()
            .find(|h| h.address() == address)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str, weight: u32) -> Arc<Host> {
        Host::new(&HostConfig {
            address: addr.parse().unwrap(),
            weight,
            metadata: HashMap::new(),
        })
    }

    #[test]
    fn test_weight_clamped() {
        assert_eq!(host("127.0.0.1:1", 0).weight(), 1);
        assert_eq!(host("127.0.0.1:1", 300).weight(), 128);
        assert_eq!(host("127.0.0.1:1", 64).weight(), 64);
    }

    #[test]
    fn test_5xx_streak() {
        let h = host("127.0.0.1:1", 1);
        assert_eq!(h.record_response(true), 1);
        assert_eq!(h.record_response(true), 2);
        assert_eq!(h.record_response(false), 0);
        assert_eq!(h.consecutive_5xx(), 0);
    }

    #[test]
    fn test_active_request_counter() {
        let h = host("127.0.0.1:1", 1);
        h.request_started();
        h.request_started();
        assert_eq!(h.active_requests(), 2);
        h.request_finished();
        assert_eq!(h.active_requests(), 1);
        assert_eq!(h.total_requests(), 2);
    }
}
