//! Server runtime: owns listeners and applies configuration updates.
//!
//! Updates diff by name: new entries are created and started, changed
//! entries are updated in place (a listener on the same address inherits the
//! bound socket from its predecessor), removed entries stop and drain.
//! A rejected update leaves the previous configuration running.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::cluster::ClusterManager;
use crate::config::{
    Config, ListenerConfig, NetworkFilterConfig, RouterConfig, StreamFilterConfig,
};
use crate::error::{ProxyError, Result};
use crate::network::connection::Connection;
use crate::network::listener::{FilterChainFactory, Listener};
use crate::pool::PoolRegistry;
use crate::proxy::{Proxy, ProxyReadFilter};
use crate::router::RouterManager;

struct ListenerEntry {
    listener: Arc<Listener>,
    config: ListenerConfig,
}

pub struct Server {
    name: String,
    listeners: DashMap<String, ListenerEntry>,
    clusters: Arc<ClusterManager>,
    routers: Arc<RouterManager>,
    pools: Arc<PoolRegistry>,
}

impl Server {
    /// Build the full runtime from a validated configuration and start every
    /// listener. Fatal errors here refuse startup.
    pub async fn start(config: &Config) -> Result<Arc<Self>> {
        let clusters = ClusterManager::new();
        let routers = RouterManager::new();
        let pools = PoolRegistry::new();

        let name = config
            .servers
            .first()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "server".to_string());
        let server = Arc::new(Self {
            name,
            listeners: DashMap::new(),
            clusters,
            routers,
            pools,
        });

        for cluster in &config.cluster_manager.clusters {
            server.clusters.add_or_update(cluster.clone())?;
        }
        for server_config in &config.servers {
            for router in &server_config.routers {
                server.routers.add_or_update(router)?;
            }
        }
        for server_config in &config.servers {
            for listener in &server_config.listeners {
                server.apply_listener(listener.clone()).await?;
            }
        }

        crate::protocol::xprotocol::seal();
        info!(server = %server.name, "server started");
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clusters(&self) -> &Arc<ClusterManager> {
        &self.clusters
    }

    pub fn routers(&self) -> &Arc<RouterManager> {
        &self.routers
    }

    /// Bound address of a listener, once started. Tests and the admin
    /// surface use this to find ephemeral ports.
    pub fn listener_addr(&self, name: &str) -> Option<std::net::SocketAddr> {
        self.listeners.get(name).and_then(|e| {
            e.listener
                .local_addr()
                .or_else(|| Some(e.listener.addr()))
        })
    }

    fn build_factory(&self, config: &ListenerConfig) -> Result<Arc<dyn FilterChainFactory>> {
        let chain = config
            .filter_chains
            .first()
            .ok_or_else(|| ProxyError::Config("listener without filter chain".into()))?;
        let proxy_config = chain
            .filters
            .iter()
            .map(|f| {
                let NetworkFilterConfig::Proxy(proxy) = f;
                proxy
            })
            .next()
            .ok_or_else(|| ProxyError::Config("filter chain without proxy filter".into()))?;

        let proxy = Proxy::new(
            proxy_config,
            config.stream_filters.clone(),
            self.routers.clone(),
            self.clusters.clone(),
            self.pools.clone(),
        );
        Ok(Arc::new(ProxyChainFactory { proxy }))
    }

    /// Create or update one listener. An address change restarts the
    /// listener; a same-address update swaps the filter-chain factory and
    /// keeps the bound socket and live connections.
    pub async fn apply_listener(&self, config: ListenerConfig) -> Result<()> {
        let factory = self.build_factory(&config)?;

        if let Some(existing) = self.listeners.get(&config.name) {
            if existing.listener.addr() == config.address {
                existing.listener.set_filter_chain_factory(factory);
                info!(listener = %config.name, "listener updated in place");
                return Ok(());
            }

            // address changed: bring up the replacement, inherit nothing
            let old = existing.listener.clone();
            drop(existing);
            let listener = Listener::new(
                &config.name,
                config.address,
                factory,
                config.per_connection_buffer_limit_bytes,
            );
            listener.start().await?;
            old.stop();
            self.listeners.insert(
                config.name.clone(),
                ListenerEntry {
                    listener,
                    config: config.clone(),
                },
            );
            info!(listener = %config.name, addr = %config.address, "listener rebound");
            return Ok(());
        }

        let listener = Listener::new(
            &config.name,
            config.address,
            factory,
            config.per_connection_buffer_limit_bytes,
        );
        listener.start().await?;
        self.listeners.insert(
            config.name.clone(),
            ListenerEntry {
                listener,
                config,
            },
        );
        Ok(())
    }

    /// Apply a full listener list: add, update, then stop removed ones with
    /// drain semantics (open connections live on).
    pub async fn apply_listeners(&self, configs: Vec<ListenerConfig>) -> Result<()> {
        for config in &configs {
            config
                .validate()
                .map_err(|e| ProxyError::Config(e.to_string()))?;
        }
        for config in configs.iter() {
            self.apply_listener(config.clone()).await?;
        }

        let keep: std::collections::HashSet<&str> =
            configs.iter().map(|c| c.name.as_str()).collect();
        let removed: Vec<String> = self
            .listeners
            .iter()
            .filter(|e| !keep.contains(e.key().as_str()))
            .map(|e| e.key().clone())
            .collect();
        for name in removed {
            if let Some((_, entry)) = self.listeners.remove(&name) {
                entry.listener.stop();
                info!(listener = %name, "listener stopped (drain)");
            }
        }
        Ok(())
    }

    pub fn apply_clusters(&self, configs: Vec<crate::config::ClusterConfig>) -> Result<()> {
        for config in &configs {
            config
                .validate()
                .map_err(|e| ProxyError::Config(e.to_string()))?;
        }
        let keep: std::collections::HashSet<String> =
            configs.iter().map(|c| c.name.clone()).collect();
        for config in configs {
            self.clusters.add_or_update(config)?;
        }
        for name in self.clusters.names() {
            if !keep.contains(&name) {
                self.clusters.remove(&name);
            }
        }
        Ok(())
    }

    /// Route updates apply to new streams immediately; in-flight streams
    /// keep the router snapshot they resolved.
    pub fn apply_routes(&self, configs: Vec<RouterConfig>) -> Result<()> {
        for config in &configs {
            config
                .validate()
                .map_err(|e| ProxyError::Config(e.to_string()))?;
        }
        for config in &configs {
            self.routers.add_or_update(config)?;
        }
        Ok(())
    }

    /// The live admin surface: replace one listener's config and filters.
    pub async fn update_listener(
        &self,
        config: ListenerConfig,
        stream_filters: Option<Vec<StreamFilterConfig>>,
    ) -> Result<()> {
        let mut config = config;
        if let Some(filters) = stream_filters {
            config.stream_filters = filters;
        }
        config
            .validate()
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        self.apply_listener(config).await
    }

    pub fn config_dump(&self) -> serde_json::Value {
        let listeners: Vec<_> = self
            .listeners
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.key(),
                    "address": e.value().config.address.to_string(),
                    "active_connections": e.value().listener.active_connections(),
                })
            })
            .collect();
        serde_json::json!({
            "server": self.name,
            "listeners": listeners,
            "clusters": self.clusters.snapshot(),
        })
    }

    /// Stop accepting everywhere and close all listeners.
    pub async fn shutdown(&self) {
        for entry in self.listeners.iter() {
            entry.value().listener.close().await;
        }
        self.listeners.clear();
        info!(server = %self.name, "server shut down");
    }
}

struct ProxyChainFactory {
    proxy: Arc<Proxy>,
}

impl FilterChainFactory for ProxyChainFactory {
    fn create_filter_chain(&self, conn: &Arc<Connection>) {
        conn.add_read_filter(Arc::new(ProxyReadFilter::new(self.proxy.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        serde_yaml::from_str(
            r#"
servers:
  - name: test
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
              - match: { prefix: / }
                action:
                  cluster: { name: svc }
cluster_manager:
  clusters:
    - name: svc
      hosts:
        - address: 127.0.0.1:18080
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_dump() {
        let config = base_config();
        config.validate().unwrap();
        let server = Server::start(&config).await.unwrap();

        assert!(server.listener_addr("ingress").is_some());
        let dump = server.config_dump();
        assert_eq!(dump["server"], "test");
        assert!(dump["clusters"]["svc"].is_object());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_listeners_removes_missing() {
        let config = base_config();
        let server = Server::start(&config).await.unwrap();
        assert!(server.listener_addr("ingress").is_some());

        server.apply_listeners(Vec::new()).await.unwrap();
        assert!(server.listener_addr("ingress").is_none());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_cluster_update_keeps_old() {
        let config = base_config();
        let server = Server::start(&config).await.unwrap();

        let mut bad = config.cluster_manager.clusters[0].clone();
        bad.hosts[0].weight = 0; // out of range
        assert!(server.apply_clusters(vec![bad]).is_err());

        // old cluster still resolvable
        assert!(server.clusters().get("svc").is_ok());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_update_immediate_for_new_streams() {
        let config = base_config();
        let server = Server::start(&config).await.unwrap();
        let before = server.routers().get("main").unwrap();

        let mut routers = config.servers[0].routers.clone();
        routers[0].virtual_hosts[0].name = "renamed".into();
        server.apply_routes(routers).unwrap();

        let after = server.routers().get("main").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        server.shutdown().await;
    }
}
