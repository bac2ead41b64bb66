use crate::service::{build_services, ServiceGraph};
use crate::transport::ClientCache;
use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use fcgate_core::config::Config;
use std::sync::Arc;
use tracing::info;

/// Hot-swappable daemon state. Clones share the same state and client cache.
#[derive(Clone)]
pub struct Runtime {
    state: Arc<ArcSwap<RuntimeState>>,
    clients: Arc<ClientCache>,
}

pub struct RuntimeState {
    pub config: Arc<Config>,
    pub services: ServiceGraph,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        let clients = Arc::new(ClientCache::new());
        let state = Arc::new(RuntimeState::build(config, clients.clone())?);
        Ok(Self {
            state: Arc::new(ArcSwap::from(state)),
            clients,
        })
    }

    pub fn state(&self) -> Arc<RuntimeState> {
        self.state.load_full()
    }

    pub fn clients(&self) -> &Arc<ClientCache> {
        &self.clients
    }

    /// Builds a fresh service graph from `config` and swaps it in. Clients for
    /// addresses that are still referenced keep their pools; the rest are
    /// evicted once the swap is done.
    pub fn reload(&self, config: Config) -> Result<()> {
        ensure_hot_reload_compatible(&self.state().config, &config)?;
        let next = RuntimeState::build(config, self.clients.clone())?;
        let keep = next.services.addresses().clone();
        self.state.store(Arc::new(next));
        let evicted = self.clients.retain(&keep);
        info!(
            upstreams = keep.len(),
            evicted, "service graph swapped"
        );
        Ok(())
    }
}

impl RuntimeState {
    pub fn build(config: Config, clients: Arc<ClientCache>) -> Result<Self> {
        let services = build_services(&config, clients)?;
        Ok(Self {
            config: Arc::new(config),
            services,
        })
    }
}

/// Settings that only take effect at startup.
pub fn ensure_hot_reload_compatible(old: &Config, new: &Config) -> Result<()> {
    if old.server.listen != new.server.listen {
        return Err(anyhow!("server.listen changed; restart required"));
    }
    if old.server.max_connections != new.server.max_connections {
        return Err(anyhow!("server.max_connections changed; restart required"));
    }
    if old.logging != new.logging {
        return Err(anyhow!("logging changed; restart required"));
    }
    if old.metrics != new.metrics {
        return Err(anyhow!("metrics listener config changed; restart required"));
    }
    if old.runtime != new.runtime {
        return Err(anyhow!("runtime startup tuning changed; restart required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastcgi::UpstreamAddr;

    fn config(root_service: &str, addresses: &[&str]) -> Config {
        let servers: Vec<String> = addresses
            .iter()
            .map(|a| format!("{{ address: \"{a}\" }}"))
            .collect();
        serde_yaml::from_str(&format!(
            r#"
version: 1
server: {{ listen: "127.0.0.1:8080", service: {root_service} }}
services:
  - name: {root_service}
    fastcgi:
      servers: [ {} ]
"#,
            servers.join(", ")
        ))
        .expect("config")
    }

    #[test]
    fn reload_keeps_surviving_clients_and_evicts_the_rest() {
        let runtime = Runtime::new(config("php", &["127.0.0.1:9000", "127.0.0.1:9001"]))
            .expect("runtime");
        let settings = crate::transport::client_settings(
            runtime
                .state()
                .config
                .service("php")
                .and_then(|s| s.fastcgi.as_ref())
                .expect("fastcgi"),
        );
        let kept = UpstreamAddr::parse("127.0.0.1:9000").expect("addr");
        let gone = UpstreamAddr::parse("127.0.0.1:9001").expect("addr");
        let before = runtime.clients().get_or_create(&kept, settings);
        runtime.clients().get_or_create(&gone, settings);
        assert_eq!(runtime.clients().len(), 2);

        runtime
            .reload(config("php", &["127.0.0.1:9000", "127.0.0.1:9002"]))
            .expect("reload");
        assert_eq!(runtime.clients().len(), 1);
        let after = runtime.clients().get_or_create(&kept, settings);
        assert!(Arc::ptr_eq(before.pool(), after.pool()));
        assert_eq!(runtime.state().services.addresses().len(), 2);
    }

    #[test]
    fn reload_rejects_startup_only_changes() {
        let runtime = Runtime::new(config("php", &["127.0.0.1:9000"])).expect("runtime");
        let mut next = config("php", &["127.0.0.1:9000"]);
        next.server.listen = "127.0.0.1:9090".to_string();
        assert!(runtime.reload(next).is_err());
        assert_eq!(runtime.state().config.server.listen, "127.0.0.1:8080");
    }
}
