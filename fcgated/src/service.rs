use crate::balancer::{Balancer, CanaryHeaderStrategy, NamedHandler, StickyCookie, StrategyChain};
use crate::fastcgi::UpstreamAddr;
use crate::handler::{ConnInfo, Handler, SharedHandler};
use crate::transport::{ClientCache, FastCgiTransport};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fcgate_core::config::{Config, FastCgiServiceConfig, ServiceConfig, WeightedServiceConfig};
use hyper::{Body, Request, Response};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// One FastCGI application address behind a shared transport.
pub struct FastCgiServer {
    addr: UpstreamAddr,
    transport: Arc<FastCgiTransport>,
}

impl FastCgiServer {
    pub fn new(addr: UpstreamAddr, transport: Arc<FastCgiTransport>) -> Self {
        Self { addr, transport }
    }
}

#[async_trait]
impl Handler for FastCgiServer {
    async fn serve(&self, req: Request<Body>, conn: ConnInfo) -> Result<Response<Body>> {
        self.transport.round_trip(&self.addr, req, conn).await
    }
}

/// Handlers built from one configuration snapshot.
pub struct ServiceGraph {
    root: SharedHandler,
    root_name: String,
    services: HashMap<String, SharedHandler>,
    addresses: HashSet<UpstreamAddr>,
}

impl ServiceGraph {
    /// Handler for `server.service`.
    pub fn root(&self) -> &SharedHandler {
        &self.root
    }

    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    pub fn service(&self, name: &str) -> Option<&SharedHandler> {
        self.services.get(name)
    }

    /// Every FastCGI address reachable from this graph.
    pub fn addresses(&self) -> &HashSet<UpstreamAddr> {
        &self.addresses
    }
}

/// Builds every service reachable from `server.service`. Services referenced
/// more than once are built once and shared.
pub fn build_services(config: &Config, cache: Arc<ClientCache>) -> Result<ServiceGraph> {
    let mut builder = GraphBuilder {
        config,
        cache,
        built: HashMap::new(),
        visiting: Vec::new(),
        addresses: HashSet::new(),
    };
    let root_name = config.server.service.clone();
    let root = builder.build(root_name.as_str())?;
    Ok(ServiceGraph {
        root,
        root_name,
        services: builder.built,
        addresses: builder.addresses,
    })
}

struct GraphBuilder<'c> {
    config: &'c Config,
    cache: Arc<ClientCache>,
    built: HashMap<String, SharedHandler>,
    visiting: Vec<String>,
    addresses: HashSet<UpstreamAddr>,
}

impl GraphBuilder<'_> {
    fn build(&mut self, name: &str) -> Result<SharedHandler> {
        if let Some(handler) = self.built.get(name) {
            return Ok(handler.clone());
        }
        if self.visiting.iter().any(|v| v == name) {
            return Err(anyhow!(
                "service reference cycle: {} -> {}",
                self.visiting.join(" -> "),
                name
            ));
        }
        let service: &ServiceConfig = self
            .config
            .service(name)
            .ok_or_else(|| anyhow!("unknown service: {}", name))?;

        self.visiting.push(name.to_string());
        let built = match (service.fastcgi.as_ref(), service.weighted.as_ref()) {
            (Some(fastcgi), None) => self.build_fastcgi(name, fastcgi),
            (None, Some(weighted)) => self.build_weighted(name, weighted),
            _ => Err(anyhow!(
                "service {} must define exactly one of fastcgi or weighted",
                name
            )),
        };
        self.visiting.pop();

        let handler = built.with_context(|| format!("failed to build service {}", name))?;
        self.built.insert(name.to_string(), handler.clone());
        Ok(handler)
    }

    fn build_fastcgi(&mut self, name: &str, cfg: &FastCgiServiceConfig) -> Result<SharedHandler> {
        let transport = Arc::new(FastCgiTransport::from_config(self.cache.clone(), cfg)?);
        let mut handlers = Vec::with_capacity(cfg.servers.len());
        for server in &cfg.servers {
            let addr = UpstreamAddr::parse(server.address.as_str())?;
            self.addresses.insert(addr.clone());
            handlers.push(NamedHandler::new(
                server.address.clone(),
                server.weight,
                Arc::new(FastCgiServer::new(addr, transport.clone())),
            ));
        }
        debug!(service = name, servers = handlers.len(), "built fastcgi service");
        Ok(Arc::new(Balancer::new(
            name,
            handlers,
            cfg.sticky.as_ref().map(StickyCookie::from_config),
            StrategyChain::default(),
        )))
    }

    fn build_weighted(&mut self, name: &str, cfg: &WeightedServiceConfig) -> Result<SharedHandler> {
        let mut handlers = Vec::with_capacity(cfg.services.len());
        for child in &cfg.services {
            let handler = self.build(child.name.as_str())?;
            handlers.push(NamedHandler::new(child.name.clone(), child.weight, handler));
        }
        let mut strategies = StrategyChain::default();
        if let Some(canary) = cfg.canary.as_ref() {
            strategies.push(Arc::new(CanaryHeaderStrategy::from_config(canary)?));
        }
        debug!(
            service = name,
            children = handlers.len(),
            strategies = ?strategies.names(),
            "built weighted service"
        );
        Ok(Arc::new(Balancer::new(
            name,
            handlers,
            cfg.sticky.as_ref().map(StickyCookie::from_config),
            strategies,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).expect("config")
    }

    #[test]
    fn builds_shared_children_once_and_collects_addresses() {
        let cfg = config(
            r#"
version: 1
server: { listen: "127.0.0.1:0", service: front }
services:
  - name: php
    fastcgi:
      servers:
        - { address: "127.0.0.1:9000", weight: 2 }
        - { address: "127.0.0.1:9001" }
      root: /srv
  - name: legacy
    fastcgi:
      servers: [ { address: "127.0.0.1:9100" } ]
  - name: mixed
    weighted:
      services: [ { name: php }, { name: legacy } ]
  - name: front
    weighted:
      services: [ { name: php, weight: 3 }, { name: mixed } ]
      canary: { header: x-canary, value: "1", services: [mixed] }
"#,
        );
        let graph = build_services(&cfg, Arc::new(ClientCache::new())).expect("graph");
        assert_eq!(graph.root_name(), "front");
        assert_eq!(graph.addresses().len(), 3);

        let via_front = graph.service("php").expect("php");
        let mixed = graph.service("mixed").expect("mixed");
        assert!(graph.service("legacy").is_some());
        assert!(Arc::strong_count(via_front) >= 3);
        assert!(Arc::strong_count(mixed) >= 2);
    }

    #[test]
    fn unreachable_services_are_not_built() {
        let cfg = config(
            r#"
version: 1
server: { listen: "127.0.0.1:0", service: php }
services:
  - name: php
    fastcgi: { servers: [ { address: "127.0.0.1:9000" } ] }
  - name: idle
    fastcgi: { servers: [ { address: "127.0.0.1:9999" } ] }
"#,
        );
        let graph = build_services(&cfg, Arc::new(ClientCache::new())).expect("graph");
        assert!(graph.service("idle").is_none());
        assert_eq!(graph.addresses().len(), 1);
    }

    #[test]
    fn cycles_and_unknown_references_fail_to_build() {
        let cfg = config(
            r#"
version: 1
server: { listen: "127.0.0.1:0", service: a }
services:
  - name: a
    weighted: { services: [ { name: b } ] }
  - name: b
    weighted: { services: [ { name: a } ] }
"#,
        );
        let err = build_services(&cfg, Arc::new(ClientCache::new()))
            .err()
            .expect("cycle");
        assert!(format!("{err:#}").contains("cycle"));

        let cfg = config(
            r#"
version: 1
server: { listen: "127.0.0.1:0", service: a }
services:
  - name: a
    weighted: { services: [ { name: missing } ] }
"#,
        );
        assert!(build_services(&cfg, Arc::new(ClientCache::new())).is_err());
    }
}
