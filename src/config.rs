use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure.
///
/// This is the validated object the file loader hands to the runtime; every
/// admin update re-enters through the same types.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    pub cluster_manager: ClusterManagerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub name: String,
    pub address: SocketAddr,
    #[serde(default = "default_conn_buffer_limit")]
    pub per_connection_buffer_limit_bytes: u32,
    #[serde(default)]
    pub use_original_dst: bool,
    #[serde(default)]
    pub inherit_listener_fd: bool,
    pub filter_chains: Vec<FilterChainConfig>,
    #[serde(default)]
    pub stream_filters: Vec<StreamFilterConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterChainConfig {
    pub filters: Vec<NetworkFilterConfig>,
    #[serde(default)]
    pub tls_contexts: Vec<TlsConfig>,
}

/// Network-level filters installed on every accepted connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkFilterConfig {
    Proxy(ProxyFilterConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyFilterConfig {
    #[serde(default)]
    pub name: String,
    pub downstream_protocol: ProtocolConfig,
    pub upstream_protocol: ProtocolConfig,
    pub router_config_name: String,
}

/// Wire protocol selection for a listener or cluster side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolConfig {
    Auto,
    Http1,
    Http2,
    Rpc,
    X {
        sub_protocol: String,
    },
}

/// Stream-level filters, run against decoded requests per stream.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFilterConfig {
    HealthCheck(HealthCheckFilterConfig),
    FaultInject(FaultInjectConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckFilterConfig {
    #[serde(default)]
    pub pass_through: bool,
    #[serde(default, with = "opt_duration_serde")]
    pub cache_time: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FaultInjectConfig {
    /// 0..=100; chance that a request is delayed.
    #[serde(default)]
    pub delay_percent: u32,
    #[serde(default, with = "opt_duration_serde")]
    pub delay_duration: Option<Duration>,
    /// 0..=100; chance that a request is aborted with `abort_status`.
    #[serde(default)]
    pub abort_percent: u32,
    #[serde(default = "default_abort_status")]
    pub abort_status: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterManagerConfig {
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub cluster_type: ClusterType,
    #[serde(default)]
    pub lb_type: LbType,
    #[serde(default = "default_max_requests_per_conn")]
    pub max_requests_per_connection: u32,
    #[serde(default = "default_conn_buffer_limit")]
    pub conn_buffer_limit_bytes: u32,
    #[serde(default, with = "opt_duration_serde")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "opt_duration_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerConfig>,
    #[serde(default)]
    pub outlier_detection: Option<OutlierDetectionConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    #[default]
    Static,
    StrictDns,
    LogicalDns,
    Eds,
    OriginalDst,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LbType {
    #[default]
    RoundRobin,
    Random,
    WeightedRr,
    LeastActive,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub address: SocketAddr,
    #[serde(default = "default_host_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub protocol: Option<ProtocolConfig>,
    #[serde(default = "default_hc_timeout", with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_hc_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default, with = "opt_duration_serde")]
    pub interval_jitter: Option<Duration>,
    #[serde(default = "default_hc_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_hc_threshold")]
    pub unhealthy_threshold: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub priority: RoutingPriority,
    #[serde(default = "default_cb_max")]
    pub max_connections: u32,
    #[serde(default = "default_cb_max")]
    pub max_pending_requests: u32,
    #[serde(default = "default_cb_max")]
    pub max_requests: u32,
    #[serde(default = "default_cb_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPriority {
    #[default]
    Default,
    High,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutlierDetectionConfig {
    #[serde(default = "default_consecutive_5xx")]
    pub consecutive_5xx: u32,
    #[serde(default = "default_outlier_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default = "default_base_ejection", with = "duration_serde")]
    pub base_ejection_time: Duration,
    #[serde(default = "default_max_ejection_percent")]
    pub max_ejection_percent: u32,
    /// 0..=100; chance that a qualifying host is actually ejected.
    #[serde(default = "default_enforcing")]
    pub enforcing_consecutive_5xx: u32,
}

/// TLS hook surface. Termination itself is delegated to an external engine;
/// the proxy only parses and carries the configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub cert_chain: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub server_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    pub router_config_name: String,
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VirtualHostConfig {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    #[serde(rename = "match")]
    pub route_match: RouteMatchConfig,
    pub action: RouteActionConfig,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteMatchConfig {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderMatcherConfig>,
    /// 0..=100; fraction of matching traffic this route applies to.
    #[serde(default)]
    pub runtime_fraction: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderMatcherConfig {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteActionConfig {
    Cluster {
        name: String,
        #[serde(default, with = "opt_duration_serde")]
        timeout: Option<Duration>,
        #[serde(default)]
        retry_policy: Option<RetryPolicyConfig>,
    },
    WeightedClusters {
        clusters: Vec<WeightedClusterConfig>,
        #[serde(default, with = "opt_duration_serde")]
        timeout: Option<Duration>,
        #[serde(default)]
        retry_policy: Option<RetryPolicyConfig>,
    },
    Redirect {
        location: String,
        #[serde(default = "default_redirect_status")]
        status: u16,
    },
    DirectResponse {
        status: u16,
        #[serde(default)]
        body: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeightedClusterConfig {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicyConfig {
    /// Set of retry reasons: `5xx`, `connect-failure`, `reset`, `gateway-error`.
    pub retry_on: Vec<String>,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default, with = "opt_duration_serde")]
    pub per_try_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 34901,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_conn_buffer_limit() -> u32 {
    1 << 20
}

fn default_host_weight() -> u32 {
    1
}

fn default_max_requests_per_conn() -> u32 {
    1024
}

fn default_hc_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_hc_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_hc_threshold() -> u32 {
    2
}

fn default_cb_max() -> u32 {
    1024
}

fn default_cb_retries() -> u32 {
    3
}

fn default_consecutive_5xx() -> u32 {
    5
}

fn default_outlier_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_base_ejection() -> Duration {
    Duration::from_secs(30)
}

fn default_max_ejection_percent() -> u32 {
    10
}

fn default_enforcing() -> u32 {
    100
}

fn default_abort_status() -> u16 {
    503
}

fn default_redirect_status() -> u16 {
    301
}

fn default_num_retries() -> u32 {
    1
}

/// Weight bounds carried by every host.
pub const MIN_HOST_WEIGHT: u32 = 1;
pub const MAX_HOST_WEIGHT: u32 = 128;

impl Config {
    /// Load configuration from file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. A failed validation refuses startup; on a
    /// live update the caller keeps the previous configuration.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("At least one server must be configured");
        }

        let mut listener_addrs = std::collections::HashSet::new();
        let mut router_names = std::collections::HashSet::new();
        for server in &self.servers {
            for router in &server.routers {
                router_names.insert(router.router_config_name.clone());
            }
        }

        for server in &self.servers {
            for listener in &server.listeners {
                listener.validate()?;
                if !listener_addrs.insert(listener.address) {
                    anyhow::bail!(
                        "Duplicate listener address: {} ({})",
                        listener.address,
                        listener.name
                    );
                }
                for chain in &listener.filter_chains {
                    for filter in &chain.filters {
                        let NetworkFilterConfig::Proxy(proxy) = filter;
                        if !router_names.contains(&proxy.router_config_name) {
                            anyhow::bail!(
                                "Listener '{}' references unknown router configuration: {}",
                                listener.name,
                                proxy.router_config_name
                            );
                        }
                    }
                }
            }
            for router in &server.routers {
                router.validate()?;
            }
        }

        let mut cluster_names = std::collections::HashSet::new();
        for cluster in &self.cluster_manager.clusters {
            cluster.validate()?;
            if !cluster_names.insert(cluster.name.clone()) {
                anyhow::bail!("Duplicate cluster name: {}", cluster.name);
            }
        }

        Ok(())
    }
}

impl ListenerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Listener name cannot be empty");
        }
        if self.filter_chains.is_empty() {
            anyhow::bail!("Listener '{}' must have at least one filter chain", self.name);
        }
        for filter in &self.stream_filters {
            if let StreamFilterConfig::FaultInject(fault) = filter {
                if fault.delay_percent > 100 || fault.abort_percent > 100 {
                    anyhow::bail!(
                        "Listener '{}': fault injection percentages must be within 0..=100",
                        self.name
                    );
                }
            }
        }
        Ok(())
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Cluster name cannot be empty");
        }
        for host in &self.hosts {
            if !(MIN_HOST_WEIGHT..=MAX_HOST_WEIGHT).contains(&host.weight) {
                anyhow::bail!(
                    "Cluster '{}': host {} weight {} outside {}..={}",
                    self.name,
                    host.address,
                    host.weight,
                    MIN_HOST_WEIGHT,
                    MAX_HOST_WEIGHT
                );
            }
        }
        if let Some(outlier) = &self.outlier_detection {
            if outlier.max_ejection_percent > 100 || outlier.enforcing_consecutive_5xx > 100 {
                anyhow::bail!(
                    "Cluster '{}': outlier detection percentages must be within 0..=100",
                    self.name
                );
            }
        }
        Ok(())
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.router_config_name.is_empty() {
            anyhow::bail!("Router configuration name cannot be empty");
        }
        for vh in &self.virtual_hosts {
            if vh.domains.is_empty() {
                anyhow::bail!("Virtual host '{}' must declare at least one domain", vh.name);
            }
            for route in &vh.routes {
                let m = &route.route_match;
                if m.prefix.is_none() && m.path.is_none() && m.regex.is_none() {
                    anyhow::bail!(
                        "Virtual host '{}': route must set one of prefix, path, regex",
                        vh.name
                    );
                }
                if let Some(pattern) = &m.regex {
                    regex::Regex::new(pattern).with_context(|| {
                        format!("Virtual host '{}': invalid route regex", vh.name)
                    })?;
                }
                if let Some(fraction) = m.runtime_fraction {
                    if fraction > 100 {
                        anyhow::bail!(
                            "Virtual host '{}': runtime_fraction must be within 0..=100",
                            vh.name
                        );
                    }
                }
                if let RouteActionConfig::WeightedClusters { clusters, .. } = &route.action {
                    if clusters.is_empty() || clusters.iter().all(|c| c.weight == 0) {
                        anyhow::bail!(
                            "Virtual host '{}': weighted clusters need a positive total weight",
                            vh.name
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(num.parse::<u64>()? * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(num.parse::<u64>()? * 3600))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}

pub(crate) mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => super::duration_serde::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
servers:
  - name: proxy
    listeners:
      - name: ingress
        address: 127.0.0.1:20000
        filter_chains:
          - filters:
              - type: proxy
                downstream_protocol: auto
                upstream_protocol: http1
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
              - match:
                  prefix: /
                action:
                  cluster:
                    name: svc
                    timeout: 30s
                    retry_policy:
                      retry_on: ["5xx", "connect-failure"]
                      num_retries: 2
                      per_try_timeout: 500ms
cluster_manager:
  clusters:
    - name: svc
      lb_type: round_robin
      hosts:
        - address: 127.0.0.1:8080
          weight: 100
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        let listener = &config.servers[0].listeners[0];
        assert_eq!(listener.name, "ingress");
        let NetworkFilterConfig::Proxy(proxy) = &listener.filter_chains[0].filters[0];
        assert_eq!(proxy.downstream_protocol, ProtocolConfig::Auto);
        assert_eq!(proxy.router_config_name, "main");

        let route = &config.servers[0].routers[0].virtual_hosts[0].routes[0];
        match &route.action {
            RouteActionConfig::Cluster {
                name,
                timeout,
                retry_policy,
            } => {
                assert_eq!(name, "svc");
                assert_eq!(*timeout, Some(Duration::from_secs(30)));
                let retry = retry_policy.as_ref().unwrap();
                assert_eq!(retry.num_retries, 2);
                assert_eq!(retry.per_try_timeout, Some(Duration::from_millis(500)));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_weight_out_of_range_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.cluster_manager.clusters[0].hosts[0].weight = 129;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_listener_address_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let dup = config.servers[0].listeners[0].clone();
        config.servers[0].listeners.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_router_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let NetworkFilterConfig::Proxy(proxy) =
            &mut config.servers[0].listeners[0].filter_chains[0].filters[0];
        proxy.router_config_name = "missing".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_units() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }
}
