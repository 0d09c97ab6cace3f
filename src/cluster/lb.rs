//! Load balancers. All implementations are health-aware and operate on an
//! immutable host-set snapshot taken when the balancer was (re)built.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use super::edf::EdfScheduler;
use super::host::{Host, HostSet};
use crate::config::LbType;

/// Per-pick context. Carried for subset/metadata-aware balancers; the
/// built-in set only needs it as an extension point.
#[derive(Default)]
pub struct LbContext {
    pub metadata: HashMap<String, String>,
}

pub trait LoadBalancer: Send + Sync {
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>>;

    fn host_num(&self) -> usize;
}

type LbFactory = fn(Arc<HostSet>) -> Arc<dyn LoadBalancer>;

static LB_FACTORIES: Lazy<HashMap<LbType, LbFactory>> = Lazy::new(|| {
    let mut m: HashMap<LbType, LbFactory> = HashMap::new();
    m.insert(LbType::RoundRobin, RoundRobinLb::build);
    m.insert(LbType::Random, RandomLb::build);
    m.insert(LbType::WeightedRr, SmoothWeightedRrLb::build);
    m.insert(LbType::LeastActive, LeastActiveLb::build);
    m
});

/// Build a balancer for the given type; unknown types fall back to
/// round-robin, matching the registry contract.
pub fn new_load_balancer(lb_type: LbType, hosts: Arc<HostSet>) -> Arc<dyn LoadBalancer> {
    match LB_FACTORIES.get(&lb_type) {
        Some(factory) => factory(hosts),
        None => RoundRobinLb::build(hosts),
    }
}

/// Round-robin: atomically advance an index, skip unhealthy hosts, give up
/// after one full scan. Starts at a random offset so restarts do not
/// synchronize across instances.
pub struct RoundRobinLb {
    hosts: Arc<HostSet>,
    index: AtomicU32,
}

impl RoundRobinLb {
    pub fn build(hosts: Arc<HostSet>) -> Arc<dyn LoadBalancer> {
        let offset = if hosts.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..hosts.len() as u32)
        };
        Arc::new(Self {
            hosts,
            index: AtomicU32::new(offset),
        })
    }
}

impl LoadBalancer for RoundRobinLb {
    fn choose_host(&self, _ctx: &LbContext) -> Option<Arc<Host>> {
        let targets = self.hosts.hosts();
        let total = targets.len();
        if total == 0 {
            return None;
        }
        for _ in 0..total {
            let index = self.index.fetch_add(1, Ordering::Relaxed) as usize % total;
            let host = &targets[index];
            if host.healthy() {
                return Some(host.clone());
            }
        }
        None
    }

    fn host_num(&self) -> usize {
        self.hosts.len()
    }
}

/// Random: uniform pick; an unhealthy draw degrades to round-robin so the
/// selection stays balanced instead of rerolling.
pub struct RandomLb {
    hosts: Arc<HostSet>,
    rr: Arc<dyn LoadBalancer>,
}

impl RandomLb {
    pub fn build(hosts: Arc<HostSet>) -> Arc<dyn LoadBalancer> {
        let rr = RoundRobinLb::build(hosts.clone());
        Arc::new(Self { hosts, rr })
    }
}

impl LoadBalancer for RandomLb {
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>> {
        let targets = self.hosts.hosts();
        if targets.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..targets.len());
        let host = &targets[idx];
        if host.healthy() {
            return Some(host.clone());
        }
        self.rr.choose_host(ctx)
    }

    fn host_num(&self) -> usize {
        self.hosts.len()
    }
}

struct SmoothWeight {
    weight: i64,
    current_weight: AtomicI64,
    effective_weight: AtomicI64,
}

/// Nginx's smooth weighted round-robin: add `effective_weight` to each
/// eligible host's `current_weight`, pick the maximum, subtract the weight
/// total from the winner. `effective_weight` decays on failure elsewhere and
/// recovers by one per pick until it reaches the configured weight.
pub struct SmoothWeightedRrLb {
    hosts: Arc<HostSet>,
    weighted: Vec<SmoothWeight>,
}

impl SmoothWeightedRrLb {
    pub fn build(hosts: Arc<HostSet>) -> Arc<dyn LoadBalancer> {
        let weighted = hosts
            .hosts()
            .iter()
            .map(|h| SmoothWeight {
                weight: h.weight() as i64,
                current_weight: AtomicI64::new(0),
                effective_weight: AtomicI64::new(h.weight() as i64),
            })
            .collect();
        Arc::new(Self { hosts, weighted })
    }
}

impl LoadBalancer for SmoothWeightedRrLb {
    fn choose_host(&self, _ctx: &LbContext) -> Option<Arc<Host>> {
        let targets = self.hosts.hosts();
        let mut total_weight = 0i64;
        let mut selected: Option<(usize, i64)> = None;

        for (idx, host) in targets.iter().enumerate() {
            if !host.healthy() {
                continue;
            }
            let hw = &self.weighted[idx];
            let effective = hw.effective_weight.load(Ordering::Relaxed);
            let current = hw.current_weight.fetch_add(effective, Ordering::Relaxed) + effective;
            total_weight += effective;

            if effective < hw.weight {
                hw.effective_weight.fetch_add(1, Ordering::Relaxed);
            }

            match selected {
                Some((_, best)) if best >= current => {}
                _ => selected = Some((idx, current)),
            }
        }

        let (idx, _) = selected?;
        self.weighted[idx]
            .current_weight
            .fetch_sub(total_weight, Ordering::Relaxed);
        Some(targets[idx].clone())
    }

    fn host_num(&self) -> usize {
        self.hosts.len()
    }
}

const DEFAULT_CHOICE: u32 = 2;

/// Least-active-request: power-of-k-choices over active request counters,
/// with an EDF scheduler when host weights differ. If every candidate is
/// unhealthy a random host is returned rather than nothing, since a request
/// already committed to this cluster.
pub struct LeastActiveLb {
    hosts: Arc<HostSet>,
    choice: u32,
    edf: Option<Mutex<EdfScheduler<usize>>>,
}

impl LeastActiveLb {
    pub fn build(hosts: Arc<HostSet>) -> Arc<dyn LoadBalancer> {
        Self::with_choice(hosts, DEFAULT_CHOICE)
    }

    pub fn with_choice(hosts: Arc<HostSet>, choice: u32) -> Arc<dyn LoadBalancer> {
        let weights_equal = {
            let hs = hosts.hosts();
            hs.len() <= 1 || hs.iter().all(|h| h.weight() == hs[0].weight())
        };
        let edf = if weights_equal {
            None
        } else {
            let mut scheduler = EdfScheduler::with_capacity(hosts.len());
            for (idx, host) in hosts.hosts().iter().enumerate() {
                scheduler.add(idx, Self::host_weight(host));
            }
            Some(Mutex::new(scheduler))
        };
        Arc::new(Self {
            hosts,
            choice: choice.max(1),
            edf,
        })
    }

    fn host_weight(host: &Arc<Host>) -> f64 {
        host.weight() as f64 / (host.active_requests().max(0) as f64 + 1.0)
    }

    fn unweighted_pick(&self) -> Option<Arc<Host>> {
        let targets = self.hosts.hosts();
        let total = targets.len();
        if total == 0 {
            return None;
        }
        let mut rng = rand::thread_rng();
        let mut candidate: Option<Arc<Host>> = None;
        for _ in 0..self.choice {
            let host = &targets[rng.gen_range(0..total)];
            match &candidate {
                Some(best) if best.active_requests() <= host.active_requests() => {}
                _ => candidate = Some(host.clone()),
            }
        }
        candidate
    }
}

impl LoadBalancer for LeastActiveLb {
    fn choose_host(&self, _ctx: &LbContext) -> Option<Arc<Host>> {
        let targets = self.hosts.hosts();
        let total = targets.len();
        if total == 0 {
            return None;
        }
        if total == 1 {
            return Some(targets[0].clone());
        }

        for _ in 0..total {
            let candidate = match &self.edf {
                Some(edf) => {
                    let hosts = &self.hosts;
                    let idx = edf
                        .lock()
                        .next_and_push(|idx| Self::host_weight(&hosts.hosts()[*idx]))?;
                    targets[idx].clone()
                }
                None => self.unweighted_pick()?,
            };
            if candidate.healthy() {
                return Some(candidate);
            }
        }

        // all sampled unhealthy: random fallback
        let idx = rand::thread_rng().gen_range(0..total);
        Some(targets[idx].clone())
    }

    fn host_num(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    fn host_set(specs: &[(&str, u32)]) -> Arc<HostSet> {
        let hosts = specs
            .iter()
            .map(|(addr, weight)| {
                Host::new(&HostConfig {
                    address: addr.parse().unwrap(),
                    weight: *weight,
                    metadata: HashMap::new(),
                })
            })
            .collect();
        HostSet::new(hosts)
    }

    #[test]
    fn test_round_robin_cycles_and_skips_unhealthy() {
        let hosts = host_set(&[("127.0.0.1:1", 1), ("127.0.0.1:2", 1), ("127.0.0.1:3", 1)]);
        hosts.hosts()[1].set_healthy(false);
        let lb = RoundRobinLb::build(hosts.clone());
        let ctx = LbContext::default();

        let picks: Vec<_> = (0..6)
            .map(|_| lb.choose_host(&ctx).unwrap().address().port())
            .collect();
        assert!(!picks.contains(&2));
        assert!(picks.contains(&1));
        assert!(picks.contains(&3));
    }

    #[test]
    fn test_round_robin_none_when_all_unhealthy() {
        let hosts = host_set(&[("127.0.0.1:1", 1), ("127.0.0.1:2", 1)]);
        for h in hosts.hosts() {
            h.set_healthy(false);
        }
        let lb = RoundRobinLb::build(hosts);
        assert!(lb.choose_host(&LbContext::default()).is_none());
    }

    #[test]
    fn test_random_degrades_to_rr_on_unhealthy() {
        let hosts = host_set(&[("127.0.0.1:1", 1), ("127.0.0.1:2", 1)]);
        hosts.hosts()[0].set_healthy(false);
        let lb = RandomLb::build(hosts);
        for _ in 0..50 {
            let pick = lb.choose_host(&LbContext::default()).unwrap();
            assert_eq!(pick.address().port(), 2);
        }
    }

    #[test]
    fn test_smooth_wrr_sequence() {
        // classic nginx example: weights 5,1,1 give a,a,b,a,c,a,a per cycle
        let hosts = host_set(&[("127.0.0.1:1", 5), ("127.0.0.1:2", 1), ("127.0.0.1:3", 1)]);
        let lb = SmoothWeightedRrLb::build(hosts);
        let ctx = LbContext::default();

        let picks: Vec<u16> = (0..7)
            .map(|_| lb.choose_host(&ctx).unwrap().address().port())
            .collect();
        assert_eq!(picks.iter().filter(|p| **p == 1).count(), 5);
        assert_eq!(picks.iter().filter(|p| **p == 2).count(), 1);
        assert_eq!(picks.iter().filter(|p| **p == 3).count(), 1);
        // smoothness: the heavy host never runs more than twice in a row
        // before a light host appears
        assert_ne!(picks[..3], [1, 1, 1]);
    }

    #[test]
    fn test_smooth_wrr_respects_weights_over_many_picks() {
        let hosts = host_set(&[("127.0.0.1:1", 4), ("127.0.0.1:2", 2), ("127.0.0.1:3", 1)]);
        let lb = SmoothWeightedRrLb::build(hosts);
        let ctx = LbContext::default();

        let n = 700;
        let mut counts = HashMap::new();
        for _ in 0..n {
            let port = lb.choose_host(&ctx).unwrap().address().port();
            *counts.entry(port).or_insert(0usize) += 1;
        }
        // weight respect within drift <= max weight
        assert!((counts[&1] as i64 - 400).unsigned_abs() <= 4);
        assert!((counts[&2] as i64 - 200).unsigned_abs() <= 4);
        assert!((counts[&3] as i64 - 100).unsigned_abs() <= 4);
    }

    #[test]
    fn test_least_active_prefers_idle_host() {
        let hosts = host_set(&[("127.0.0.1:1", 1), ("127.0.0.1:2", 1)]);
        for _ in 0..10 {
            hosts.hosts()[0].request_started();
        }
        let lb = LeastActiveLb::with_choice(hosts, 2);
        let ctx = LbContext::default();

        let mut busy_picks = 0;
        for _ in 0..100 {
            if lb.choose_host(&ctx).unwrap().address().port() == 1 {
                busy_picks += 1;
            }
        }
        // p2c with a 10-vs-0 backlog should almost never pick the busy host;
        // it is only chosen when both samples land on it (~25% of draws)
        assert!(busy_picks < 50, "busy host picked {} times", busy_picks);
    }

    #[test]
    fn test_least_active_random_when_all_unhealthy() {
        let hosts = host_set(&[("127.0.0.1:1", 1), ("127.0.0.1:2", 1)]);
        for h in hosts.hosts() {
            h.set_healthy(false);
        }
        let lb = LeastActiveLb::build(hosts);
        assert!(lb.choose_host(&LbContext::default()).is_some());
    }

    #[test]
    fn test_factory_dispatch() {
        let hosts = host_set(&[("127.0.0.1:1", 1)]);
        for lb_type in [
            LbType::RoundRobin,
            LbType::Random,
            LbType::WeightedRr,
            LbType::LeastActive,
        ] {
            let lb = new_load_balancer(lb_type, hosts.clone());
            assert_eq!(lb.host_num(), 1);
            assert!(lb.choose_host(&LbContext::default()).is_some());
        }
    }
}
