//! Cluster management: named host groups with load balancing, health
//! checking, outlier detection and circuit breaking.
//!
//! Host sets are immutable snapshots behind an atomic swap: readers always
//! observe a fully constructed set, and an update rebuilds the cluster's
//! load balancer against the new snapshot. In-flight requests keep whatever
//! snapshot they resolved.

pub mod edf;
pub mod health;
pub mod host;
pub mod lb;
pub mod outlier;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

use crate::config::{CircuitBreakerConfig, ClusterConfig, HostConfig, LbType};
use crate::error::{ProxyError, Result};
use health::HealthChecker;
use host::{Host, HostSet};
use lb::{LbContext, LoadBalancer};
use outlier::OutlierDetector;

/// Per-cluster resource limits with live counters. `try_acquire_*` fails
/// with `Overload` once a counter meets its threshold.
pub struct CircuitBreakers {
    max_connections: u32,
    max_pending_requests: u32,
    max_requests: u32,
    max_retries: u32,
    active_connections: AtomicU32,
    pending_requests: AtomicU32,
    active_requests: AtomicU32,
    active_retries: AtomicU32,
}

impl CircuitBreakers {
    fn new(config: Option<&CircuitBreakerConfig>) -> Self {
        let defaults = CircuitBreakerConfig {
            priority: Default::default(),
            max_connections: 1024,
            max_pending_requests: 1024,
            max_requests: 1024,
            max_retries: 3,
        };
        let config = config.unwrap_or(&defaults);
        Self {
            max_connections: config.max_connections,
            max_pending_requests: config.max_pending_requests,
            max_requests: config.max_requests,
            max_retries: config.max_retries,
            active_connections: AtomicU32::new(0),
            pending_requests: AtomicU32::new(0),
            active_requests: AtomicU32::new(0),
            active_retries: AtomicU32::new(0),
        }
    }

    fn try_acquire(counter: &AtomicU32, limit: u32) -> bool {
        loop {
            let current = counter.load(Ordering::Acquire);
            if current >= limit {
                return false;
            }
            if counter
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn try_acquire_request(&self) -> bool {
        Self::try_acquire(&self.active_requests, self.max_requests)
    }

    pub fn release_request(&self) {
        self.active_requests.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn try_acquire_pending(&self) -> bool {
        Self::try_acquire(&self.pending_requests, self.max_pending_requests)
    }

    pub fn release_pending(&self) {
        self.pending_requests.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn try_acquire_connection(&self) -> bool {
        Self::try_acquire(&self.active_connections, self.max_connections)
    }

    pub fn release_connection(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn try_acquire_retry(&self) -> bool {
        Self::try_acquire(&self.active_retries, self.max_retries)
    }

    pub fn release_retry(&self) {
        self.active_retries.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Cluster {
    config: ClusterConfig,
    hosts: ArcSwap<HostSet>,
    load_balancer: Mutex<Arc<dyn LoadBalancer>>,
    breakers: CircuitBreakers,
    outlier: Option<Arc<OutlierDetector>>,
    health_checker: Mutex<Option<Arc<HealthChecker>>>,
}

impl Cluster {
    fn new(config: ClusterConfig) -> Arc<Self> {
        let hosts = HostSet::new(config.hosts.iter().map(Host::new).collect());
        let load_balancer = lb::new_load_balancer(config.lb_type, hosts.clone());
        let breakers = CircuitBreakers::new(config.circuit_breakers.first());
        let outlier = config
            .outlier_detection
            .clone()
            .map(|od| OutlierDetector::new(&config.name, od));

        let cluster = Arc::new(Self {
            config,
            hosts: ArcSwap::new(hosts),
            load_balancer: Mutex::new(load_balancer),
            breakers,
            outlier,
            health_checker: Mutex::new(None),
        });
        cluster.start_health_checking();
        cluster
    }

    fn start_health_checking(self: &Arc<Self>) {
        let hc_config = match &self.config.health_check {
            Some(hc) => hc.clone(),
            None => return,
        };
        let probe_protocol = hc_config.protocol.as_ref().map(|p| match p {
            crate::config::ProtocolConfig::Rpc => crate::protocol::Protocol::Rpc,
            crate::config::ProtocolConfig::Http2 => crate::protocol::Protocol::Http2,
            crate::config::ProtocolConfig::X { .. } => crate::protocol::Protocol::Xprotocol,
            _ => crate::protocol::Protocol::Http1,
        });
        let checker = HealthChecker::new(
            &self.config.name,
            hc_config,
            health::probe_codec_for(probe_protocol),
        );
        let this = Arc::downgrade(self);
        checker.start(move || {
            this.upgrade()
                .map(|c| c.host_set())
                .unwrap_or_else(|| HostSet::new(Vec::new()))
        });
        *self.health_checker.lock() = Some(checker);
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Current host-set snapshot.
    pub fn host_set(&self) -> Arc<HostSet> {
        self.hosts.load_full()
    }

    pub fn load_balancer(&self) -> Arc<dyn LoadBalancer> {
        self.load_balancer.lock().clone()
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Health-aware host choice via the cluster's balancer.
    pub fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        self.load_balancer().choose_host(ctx)
    }

    /// Swap in a new host list: build the snapshot, publish it atomically,
    /// rebuild the balancer. Removed hosts simply drop out of new picks and
    /// quiesce as their in-flight requests finish.
    pub fn update_hosts(&self, host_configs: &[HostConfig]) {
        let old = self.host_set();
        let new_hosts: Vec<Arc<Host>> = host_configs
            .iter()
            .map(|hc| {
                // carry health state across updates for surviving hosts
                let host = Host::new(hc);
                if let Some(existing) = old.find(hc.address) {
                    host.set_healthy(existing.healthy());
                }
                host
            })
            .collect();
        let added = new_hosts
            .iter()
            .filter(|h| old.find(h.address()).is_none())
            .count();
        let removed = old
            .hosts()
            .iter()
            .filter(|h| !new_hosts.iter().any(|n| n.address() == h.address()))
            .count();

        let snapshot = HostSet::new(new_hosts);
        self.hosts.store(snapshot.clone());
        *self.load_balancer.lock() = lb::new_load_balancer(self.config.lb_type, snapshot);
        info!(
            cluster = %self.config.name,
            added, removed,
            "host set updated"
        );
    }

    /// Feed an upstream response into passive health tracking.
    pub fn report_response(&self, host: &Arc<Host>, is_5xx: bool) {
        match &self.outlier {
            Some(outlier) => outlier.report(host, is_5xx, &self.host_set()),
            None => {
                let _ = host.record_response(is_5xx);
            }
        }
    }

    pub fn report_connect_failure(&self, host: &Arc<Host>) {
        host.record_connect_failure();
        // a connect failure counts as a server error for ejection purposes
        self.report_response(host, true);
    }

    fn shutdown(&self) {
        if let Some(checker) = self.health_checker.lock().take() {
            checker.stop();
        }
    }
}

/// All clusters, keyed by name.
pub struct ClusterManager {
    clusters: DashMap<String, Arc<Cluster>>,
}

impl ClusterManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clusters: DashMap::new(),
        })
    }

    /// Create or replace a cluster from config. Replacement preserves the
    /// health bits of surviving hosts.
    pub fn add_or_update(&self, config: ClusterConfig) -> Result<()> {
        let name = config.name.clone();
        if let Some(existing) = self.clusters.get(&name) {
            // same topology object: refresh hosts in place
            if existing.config.lb_type == config.lb_type {
                existing.update_hosts(&config.hosts);
                return Ok(());
            }
        }
        let cluster = Cluster::new(config);
        if let Some(old) = self.clusters.insert(name.clone(), cluster) {
            old.shutdown();
        }
        debug!(cluster = %name, "cluster added or replaced");
        Ok(())
    }

    pub fn update_hosts(&self, name: &str, hosts: &[HostConfig]) -> Result<()> {
        let cluster = self.get(name)?;
        cluster.update_hosts(hosts);
        Ok(())
    }

    pub fn remove(&self, name: &str) {
        if let Some((_, cluster)) = self.clusters.remove(name) {
            cluster.shutdown();
            info!(cluster = %name, "cluster removed");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Cluster>> {
        self.clusters
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ProxyError::ClusterNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.clusters.iter().map(|e| e.key().clone()).collect()
    }

    /// Summary for the admin config-dump surface.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.clusters
            .iter()
            .map(|e| {
                let hosts = e.value().host_set();
                let value = serde_json::json!({
                    "lb_type": format!("{:?}", e.value().config.lb_type),
                    "hosts": hosts
                        .hosts()
                        .iter()
                        .map(|h| {
                            serde_json::json!({
                                "address": h.address().to_string(),
                                "weight": h.weight(),
                                "healthy": h.healthy(),
                                "active_requests": h.active_requests(),
                            })
                        })
                        .collect::<Vec<_>>(),
                });
                (e.key().clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_config(name: &str, ports: &[u16]) -> ClusterConfig {
        let hosts = ports
            .iter()
            .map(|p| HostConfig {
                address: format!("127.0.0.1:{}", p).parse().unwrap(),
                weight: 1,
                metadata: HashMap::new(),
            })
            .collect();
        ClusterConfig {
            name: name.into(),
            cluster_type: Default::default(),
            lb_type: LbType::RoundRobin,
            max_requests_per_connection: 1024,
            conn_buffer_limit_bytes: 1 << 20,
            connect_timeout: None,
            idle_timeout: None,
            hosts,
            health_check: None,
            circuit_breakers: vec![],
            outlier_detection: None,
            tls: None,
        }
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let manager = ClusterManager::new();
        manager.add_or_update(cluster_config("svc", &[8080])).unwrap();
        assert!(manager.get("svc").is_ok());
        assert!(manager.get("other").is_err());
        manager.remove("svc");
        assert!(manager.get("svc").is_err());
    }

    #[tokio::test]
    async fn test_host_update_swaps_snapshot_atomically() {
        let manager = ClusterManager::new();
        manager
            .add_or_update(cluster_config("svc", &[8080, 8081]))
            .unwrap();
        let cluster = manager.get("svc").unwrap();

        let before = cluster.host_set();
        assert_eq!(before.len(), 2);

        cluster.update_hosts(&cluster_config("svc", &[8081, 8082]).hosts);

        // the old snapshot is untouched; readers holding it are unaffected
        assert_eq!(before.len(), 2);
        assert!(before.find("127.0.0.1:8080".parse().unwrap()).is_some());

        let after = cluster.host_set();
        assert_eq!(after.len(), 2);
        assert!(after.find("127.0.0.1:8080".parse().unwrap()).is_none());
        assert!(after.find("127.0.0.1:8082".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_update_preserves_health_of_survivors() {
        let manager = ClusterManager::new();
        manager
            .add_or_update(cluster_config("svc", &[8080, 8081]))
            .unwrap();
        let cluster = manager.get("svc").unwrap();

        let sick: std::net::SocketAddr = "127.0.0.1:8081".parse().unwrap();
        cluster.host_set().find(sick).unwrap().set_healthy(false);

        cluster.update_hosts(&cluster_config("svc", &[8081, 8082]).hosts);
        assert!(!cluster.host_set().find(sick).unwrap().healthy());
    }

    #[tokio::test]
    async fn test_circuit_breaker_overflow() {
        let breakers = CircuitBreakers::new(Some(&CircuitBreakerConfig {
            priority: Default::default(),
            max_connections: 1024,
            max_pending_requests: 1024,
            max_requests: 2,
            max_retries: 1,
        }));

        assert!(breakers.try_acquire_request());
        assert!(breakers.try_acquire_request());
        assert!(!breakers.try_acquire_request());
        breakers.release_request();
        assert!(breakers.try_acquire_request());

        assert!(breakers.try_acquire_retry());
        assert!(!breakers.try_acquire_retry());
    }

    #[tokio::test]
    async fn test_choose_host_skips_unhealthy() {
        let manager = ClusterManager::new();
        manager
            .add_or_update(cluster_config("svc", &[8080, 8081]))
            .unwrap();
        let cluster = manager.get("svc").unwrap();
        cluster
            .host_set()
            .find("127.0.0.1:8080".parse().unwrap())
            .unwrap()
            .set_healthy(false);

        for _ in 0..10 {
            let host = cluster.choose_host(&LbContext::default()).unwrap();
            assert_eq!(host.address().port(), 8081);
        }
    }
}
