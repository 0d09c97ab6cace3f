//! Routing: virtual-host selection and route matching.
//!
//! A named `Router` holds virtual hosts; the authority header picks the
//! virtual host (exact domain over wildcard suffix over `*`), then routes
//! are tried in declaration order and the first match wins. Router
//! configurations swap atomically on update; streams that already resolved
//! a route keep the snapshot they started with.

use dashmap::DashMap;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    HeaderMatcherConfig, RetryPolicyConfig, RouteActionConfig, RouteConfig, RouterConfig,
    VirtualHostConfig,
};
use crate::error::{ProxyError, Result};
use crate::protocol::{Headers, names};

/// Reasons a failed upstream attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryOn {
    Status5xx,
    ConnectFailure,
    Reset,
    GatewayError,
}

impl RetryOn {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "5xx" => Some(RetryOn::Status5xx),
            "connect-failure" => Some(RetryOn::ConnectFailure),
            "reset" => Some(RetryOn::Reset),
            "gateway-error" => Some(RetryOn::GatewayError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_on: Vec<RetryOn>,
    pub num_retries: u32,
    pub per_try_timeout: Option<Duration>,
}

impl RetryPolicy {
    fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            retry_on: config
                .retry_on
                .iter()
                .filter_map(|s| RetryOn::parse(s))
                .collect(),
            num_retries: config.num_retries,
            per_try_timeout: config.per_try_timeout,
        }
    }

    pub fn retries_on(&self, reason: RetryOn) -> bool {
        self.retry_on.contains(&reason)
    }
}

#[derive(Debug, Clone)]
pub enum PathMatch {
    Prefix(String),
    Exact(String),
    Regex(Regex),
}

impl PathMatch {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatch::Exact(exact) => path == exact,
            PathMatch::Regex(regex) => regex.is_match(path),
        }
    }
}

#[derive(Debug)]
struct HeaderMatcher {
    name: String,
    exact: Option<String>,
    regex: Option<Regex>,
}

impl HeaderMatcher {
    fn from_config(config: &HeaderMatcherConfig) -> Result<Self> {
        let (exact, regex) = if config.regex {
            let re = Regex::new(&config.value)
                .map_err(|e| ProxyError::Config(format!("bad header matcher regex: {}", e)))?;
            (None, Some(re))
        } else {
            (Some(config.value.clone()), None)
        };
        Ok(Self {
            name: config.name.to_ascii_lowercase(),
            exact,
            regex,
        })
    }

    fn matches(&self, headers: &Headers) -> bool {
        let value = match headers.get(&self.name) {
            Some(value) => value,
            None => return false,
        };
        if let Some(exact) = &self.exact {
            return value == exact;
        }
        if let Some(regex) = &self.regex {
            return regex.is_match(value);
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub enum RouteAction {
    Cluster(String),
    WeightedClusters(Vec<WeightedCluster>),
    Redirect { location: String, status: u16 },
    DirectResponse { status: u16, body: Option<String> },
}

/// One compiled route: predicate plus action plus policies.
pub struct Route {
    path_match: PathMatch,
    header_matchers: Vec<HeaderMatcher>,
    runtime_fraction: Option<u32>,
    pub action: RouteAction,
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub metadata: HashMap<String, String>,
}

impl Route {
    fn from_config(config: &RouteConfig) -> Result<Self> {
        let m = &config.route_match;
        let path_match = if let Some(exact) = &m.path {
            PathMatch::Exact(exact.clone())
        } else if let Some(prefix) = &m.prefix {
            PathMatch::Prefix(prefix.clone())
        } else if let Some(pattern) = &m.regex {
            PathMatch::Regex(
                Regex::new(pattern)
                    .map_err(|e| ProxyError::Config(format!("bad route regex: {}", e)))?,
            )
        } else {
            return Err(ProxyError::Config(
                "route match must set one of prefix, path, regex".into(),
            ));
        };

        let header_matchers = m
            .headers
            .iter()
            .map(HeaderMatcher::from_config)
            .collect::<Result<Vec<_>>>()?;

        let (action, timeout, retry_policy) = match &config.action {
            RouteActionConfig::Cluster {
                name,
                timeout,
                retry_policy,
            } => (
                RouteAction::Cluster(name.clone()),
                *timeout,
                retry_policy.as_ref().map(RetryPolicy::from_config),
            ),
            RouteActionConfig::WeightedClusters {
                clusters,
                timeout,
                retry_policy,
            } => (
                RouteAction::WeightedClusters(
                    clusters
                        .iter()
                        .map(|c| WeightedCluster {
                            name: c.name.clone(),
                            weight: c.weight,
                        })
                        .collect(),
                ),
                *timeout,
                retry_policy.as_ref().map(RetryPolicy::from_config),
            ),
            RouteActionConfig::Redirect { location, status } => (
                RouteAction::Redirect {
                    location: location.clone(),
                    status: *status,
                },
                None,
                None,
            ),
            RouteActionConfig::DirectResponse { status, body } => (
                RouteAction::DirectResponse {
                    status: *status,
                    body: body.clone(),
                },
                None,
                None,
            ),
        };

        Ok(Self {
            path_match,
            header_matchers,
            runtime_fraction: m.runtime_fraction,
            action,
            timeout,
            retry_policy,
            metadata: config.metadata.clone(),
        })
    }

    fn matches(&self, headers: &Headers) -> bool {
        let path = headers.get(names::PATH).map(String::as_str).unwrap_or("/");
        if !self.path_match.matches(path) {
            return false;
        }
        if !self.header_matchers.iter().all(|m| m.matches(headers)) {
            return false;
        }
        if let Some(fraction) = self.runtime_fraction {
            // canary gate; rolls per request
            if rand::thread_rng().gen_range(0..100) >= fraction {
                return false;
            }
        }
        true
    }

    /// Resolve the target cluster. Weighted sets sample by cumulative
    /// weight; the draw happens once per request.
    pub fn choose_cluster(&self) -> Option<String> {
        match &self.action {
            RouteAction::Cluster(name) => Some(name.clone()),
            RouteAction::WeightedClusters(clusters) => {
                let total: u64 = clusters.iter().map(|c| c.weight as u64).sum();
                if total == 0 {
                    return None;
                }
                let mut draw = rand::thread_rng().gen_range(0..total);
                for cluster in clusters {
                    let w = cluster.weight as u64;
                    if draw < w {
                        return Some(cluster.name.clone());
                    }
                    draw -= w;
                }
                None
            }
            _ => None,
        }
    }
}

struct VirtualHost {
    name: String,
    routes: Vec<Arc<Route>>,
}

impl VirtualHost {
    fn from_config(config: &VirtualHostConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            routes: config
                .routes
                .iter()
                .map(|r| Route::from_config(r).map(Arc::new))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    fn route(&self, headers: &Headers) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.matches(headers)).cloned()
    }
}

/// A compiled, immutable routing table.
pub struct Router {
    name: String,
    exact_domains: HashMap<String, usize>,
    /// `(suffix, vhost index)`, longest suffix first.
    wildcard_domains: Vec<(String, usize)>,
    default_vhost: Option<usize>,
    virtual_hosts: Vec<VirtualHost>,
}

impl Router {
    pub fn from_config(config: &RouterConfig) -> Result<Arc<Self>> {
        let mut virtual_hosts = Vec::with_capacity(config.virtual_hosts.len());
        let mut exact_domains = HashMap::new();
        let mut wildcard_domains = Vec::new();
        let mut default_vhost = None;

        for (idx, vh_config) in config.virtual_hosts.iter().enumerate() {
            virtual_hosts.push(VirtualHost::from_config(vh_config)?);
            for domain in &vh_config.domains {
                if domain == "*" {
                    default_vhost.get_or_insert(idx);
                } else if let Some(suffix) = domain.strip_prefix('*') {
                    wildcard_domains.push((suffix.to_string(), idx));
                } else {
                    exact_domains.insert(domain.to_ascii_lowercase(), idx);
                }
            }
        }
        wildcard_domains.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Ok(Arc::new(Self {
            name: config.router_config_name.clone(),
            exact_domains,
            wildcard_domains,
            default_vhost,
            virtual_hosts,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn select_vhost(&self, authority: &str) -> Option<&VirtualHost> {
        let authority = authority.to_ascii_lowercase();
        if let Some(idx) = self.exact_domains.get(&authority) {
            return self.virtual_hosts.get(*idx);
        }
        for (suffix, idx) in &self.wildcard_domains {
            if authority.ends_with(suffix.as_str()) {
                return self.virtual_hosts.get(*idx);
            }
        }
        self.default_vhost.and_then(|idx| self.virtual_hosts.get(idx))
    }

    /// Match a request's headers to a route.
    pub fn route(&self, headers: &Headers) -> Option<Arc<Route>> {
        let authority = headers
            .get(names::AUTHORITY)
            .map(String::as_str)
            .unwrap_or("");
        let vhost = self.select_vhost(authority)?;
        tracing::trace!(router = %self.name, vhost = %vhost.name, "virtual host selected");
        vhost.route(headers)
    }
}

/// Named router configurations; lookups get an immutable snapshot, updates
/// replace the entry atomically.
pub struct RouterManager {
    routers: DashMap<String, Arc<Router>>,
}

impl RouterManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routers: DashMap::new(),
        })
    }

    pub fn add_or_update(&self, config: &RouterConfig) -> Result<()> {
        let router = Router::from_config(config)?;
        self.routers
            .insert(config.router_config_name.clone(), router);
        Ok(())
    }

    pub fn remove(&self, name: &str) {
        self.routers.remove(name);
    }

    pub fn get(&self, name: &str) -> Result<Arc<Router>> {
        self.routers
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ProxyError::RouterNotFound(name.to_string()))
    }
}
