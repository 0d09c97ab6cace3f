//! Outlier detection: passive ejection on consecutive 5xx responses.
//!
//! Hosts that return `consecutive_5xx` server errors in a row are ejected
//! (health bit cleared) for `base_ejection_time * ejection_count`, capped by
//! `max_ejection_percent` of the cluster. Ejection is enforced with the
//! configured probability so operators can dry-run the detector.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

use super::host::{Host, HostSet};
use crate::config::OutlierDetectionConfig;

pub struct OutlierDetector {
    cluster: String,
    config: OutlierDetectionConfig,
    ejected: AtomicU32,
    ejection_counts: Mutex<HashMap<SocketAddr, u32>>,
}

impl OutlierDetector {
    pub fn new(cluster: &str, config: OutlierDetectionConfig) -> Arc<Self> {
        Arc::new(Self {
            cluster: cluster.to_string(),
            config,
            ejected: AtomicU32::new(0),
            ejection_counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn ejected(&self) -> u32 {
        self.ejected.load(Ordering::Acquire)
    }

    /// Feed one upstream response result. `hosts` is the current snapshot,
    /// used only for the ejection-percent cap.
    pub fn report(self: &Arc<Self>, host: &Arc<Host>, is_5xx: bool, hosts: &HostSet) {
        let streak = host.record_response(is_5xx);
        if streak < self.config.consecutive_5xx {
            return;
        }
        host.reset_5xx_streak();

        if !host.healthy() {
            return;
        }
        // enforcing percentage: a failed roll only logs
        if rand::thread_rng().gen_range(0..100) >= self.config.enforcing_consecutive_5xx {
            info!(
                cluster = %self.cluster,
                host = %host.address(),
                "outlier detected but not enforced"
            );
            return;
        }
        let total = hosts.len().max(1) as u32;
        let ejected = self.ejected.load(Ordering::Acquire);
        if (ejected + 1) * 100 / total > self.config.max_ejection_percent {
            info!(
                cluster = %self.cluster,
                host = %host.address(),
                "ejection skipped: max ejection percent reached"
            );
            return;
        }

        self.eject(host.clone());
    }

    fn eject(self: &Arc<Self>, host: Arc<Host>) {
        let count = {
            let mut counts = self.ejection_counts.lock();
            let count = counts.entry(host.address()).or_insert(0);
            *count += 1;
            *count
        };
        host.set_healthy(false);
        self.ejected.fetch_add(1, Ordering::AcqRel);
        let ejection_time = self.config.base_ejection_time * count;
        info!(
            cluster = %self.cluster,
            host = %host.address(),
            ejections = count,
            time = ?ejection_time,
            "host ejected"
        );

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ejection_time).await;
            host.set_healthy(true);
            this.ejected.fetch_sub(1, Ordering::AcqRel);
            info!(cluster = %this.cluster, host = %host.address(), "host unejected");
        });
    }
}
