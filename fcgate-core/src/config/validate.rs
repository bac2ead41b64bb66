use anyhow::{anyhow, Result};
use cidr::IpCidr;
use regex::Regex;
use std::collections::{HashMap, HashSet};

use super::types::*;

pub(super) fn validate_config(config: &Config) -> Result<()> {
    if config.version != 1 {
        return Err(anyhow!(
            "unsupported config.version {} (expected 1)",
            config.version
        ));
    }
    validate_logging_config(&config.logging)?;
    if let Some(metrics) = config.metrics.as_ref() {
        validate_metrics_config(metrics)?;
    }
    validate_runtime_config(&config.runtime)?;
    validate_server_config(&config.server)?;
    let services = validate_service_configs(&config.services)?;
    if !services.contains_key(config.server.service.as_str()) {
        return Err(anyhow!(
            "server.service references unknown service: {}",
            config.server.service
        ));
    }
    validate_service_graph(&services)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> Result<()> {
    let format = logging.format.trim().to_ascii_lowercase();
    if !matches!(format.as_str(), "json" | "text" | "pretty") {
        return Err(anyhow!(
            "logging.format must be one of json, text, pretty (got {})",
            logging.format
        ));
    }
    if logging.level.trim().is_empty() {
        return Err(anyhow!("logging.level must not be empty"));
    }
    Ok(())
}

fn validate_metrics_config(metrics: &MetricsConfig) -> Result<()> {
    let listen: std::net::SocketAddr = metrics
        .listen
        .parse()
        .map_err(|e| anyhow!("metrics.listen is invalid: {}", e))?;
    if metrics.max_concurrent_connections == 0 {
        return Err(anyhow!("metrics.max_concurrent_connections must be >= 1"));
    }
    if metrics.allow.is_empty() {
        if !listen.ip().is_loopback() {
            return Err(anyhow!(
                "metrics.listen must be loopback unless metrics.allow is configured"
            ));
        }
        return Ok(());
    }
    for cidr in &metrics.allow {
        if cidr.trim().is_empty() {
            return Err(anyhow!("metrics.allow entries must not be empty"));
        }
        let _: IpCidr = cidr
            .parse()
            .map_err(|_| anyhow!("metrics.allow has invalid CIDR: {}", cidr))?;
    }
    Ok(())
}

fn validate_runtime_config(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.worker_threads == Some(0) {
        return Err(anyhow!("runtime.worker_threads must be >= 1"));
    }
    if runtime.max_blocking_threads == Some(0) {
        return Err(anyhow!("runtime.max_blocking_threads must be >= 1"));
    }
    Ok(())
}

fn validate_server_config(server: &ServerConfig) -> Result<()> {
    let _: std::net::SocketAddr = server
        .listen
        .parse()
        .map_err(|e| anyhow!("server.listen is invalid: {}", e))?;
    if server.service.trim().is_empty() {
        return Err(anyhow!("server.service must not be empty"));
    }
    if server.header_read_timeout_ms == 0 {
        return Err(anyhow!("server.header_read_timeout_ms must be >= 1"));
    }
    if server.max_connections == 0 {
        return Err(anyhow!("server.max_connections must be >= 1"));
    }
    Ok(())
}

fn validate_service_configs(services: &[ServiceConfig]) -> Result<HashMap<&str, &ServiceConfig>> {
    if services.is_empty() {
        return Err(anyhow!("no services configured"));
    }
    let mut by_name = HashMap::with_capacity(services.len());
    for service in services {
        let name = service.name.trim();
        if name.is_empty() {
            return Err(anyhow!("services[].name must not be empty"));
        }
        if by_name.insert(service.name.as_str(), service).is_some() {
            return Err(anyhow!("duplicate service name: {}", service.name));
        }
        match (&service.fastcgi, &service.weighted) {
            (Some(fastcgi), None) => validate_fastcgi_config(name, fastcgi)?,
            (None, Some(weighted)) => validate_weighted_config(name, weighted)?,
            _ => {
                return Err(anyhow!(
                    "service {} must define exactly one of fastcgi or weighted",
                    name
                ))
            }
        }
    }
    Ok(by_name)
}

fn validate_fastcgi_config(service: &str, fastcgi: &FastCgiServiceConfig) -> Result<()> {
    if fastcgi.servers.is_empty() {
        return Err(anyhow!(
            "service {} fastcgi.servers must not be empty",
            service
        ));
    }
    let mut seen = HashSet::new();
    for server in &fastcgi.servers {
        validate_fastcgi_address(service, server.address.as_str())?;
        if !seen.insert(server.address.as_str()) {
            return Err(anyhow!(
                "service {} lists fastcgi server {} twice",
                service,
                server.address
            ));
        }
    }
    if fastcgi.max_conns == 0 {
        return Err(anyhow!("service {} fastcgi.max_conns must be >= 1", service));
    }
    Regex::new(fastcgi.split_path_regex()).map_err(|e| {
        anyhow!(
            "service {} fastcgi.split_path_regex is invalid: {}",
            service,
            e
        )
    })?;
    for key in fastcgi.env.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(anyhow!(
                "service {} fastcgi.env has invalid key: {:?}",
                service,
                key
            ));
        }
    }
    if let Some(sticky) = fastcgi.sticky.as_ref() {
        validate_sticky_config(service, sticky)?;
    }
    Ok(())
}

fn validate_fastcgi_address(service: &str, raw: &str) -> Result<()> {
    if let Some(path) = raw.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(anyhow!(
                "service {} fastcgi server has empty unix socket path",
                service
            ));
        }
        return Ok(());
    }
    let authority: http::uri::Authority = raw.parse().map_err(|_| {
        anyhow!(
            "service {} fastcgi server address is invalid (expected host:port or unix://path): {}",
            service,
            raw
        )
    })?;
    if authority.port_u16().is_none() {
        return Err(anyhow!(
            "service {} fastcgi server address is missing a port: {}",
            service,
            raw
        ));
    }
    Ok(())
}

fn validate_weighted_config(service: &str, weighted: &WeightedServiceConfig) -> Result<()> {
    if weighted.services.is_empty() {
        return Err(anyhow!(
            "service {} weighted.services must not be empty",
            service
        ));
    }
    let mut seen = HashSet::new();
    for child in &weighted.services {
        if !seen.insert(child.name.as_str()) {
            return Err(anyhow!(
                "service {} lists weighted child {} twice",
                service,
                child.name
            ));
        }
    }
    if let Some(sticky) = weighted.sticky.as_ref() {
        validate_sticky_config(service, sticky)?;
    }
    if let Some(canary) = weighted.canary.as_ref() {
        http::header::HeaderName::from_bytes(canary.header.as_bytes()).map_err(|_| {
            anyhow!(
                "service {} weighted.canary.header is not a valid header name",
                service
            )
        })?;
        if canary.services.is_empty() {
            return Err(anyhow!(
                "service {} weighted.canary.services must not be empty",
                service
            ));
        }
        for name in &canary.services {
            if !seen.contains(name.as_str()) {
                return Err(anyhow!(
                    "service {} canary references {} which is not a weighted child",
                    service,
                    name
                ));
            }
        }
    }
    Ok(())
}

fn validate_sticky_config(service: &str, sticky: &StickyConfig) -> Result<()> {
    if !is_http_token(sticky.cookie.name.as_str()) {
        return Err(anyhow!(
            "service {} sticky.cookie.name must be a valid HTTP token",
            service
        ));
    }
    Ok(())
}

fn validate_service_graph(services: &HashMap<&str, &ServiceConfig>) -> Result<()> {
    for (name, service) in services {
        if let Some(weighted) = service.weighted.as_ref() {
            for child in &weighted.services {
                if !services.contains_key(child.name.as_str()) {
                    return Err(anyhow!(
                        "service {} references unknown service: {}",
                        name,
                        child.name
                    ));
                }
            }
        }
    }

    // Depth-first walk; `visiting` holds the current path.
    fn visit<'a>(
        name: &'a str,
        services: &HashMap<&'a str, &'a ServiceConfig>,
        visiting: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if visiting.contains(&name) {
            visiting.push(name);
            return Err(anyhow!("service reference cycle: {}", visiting.join(" -> ")));
        }
        visiting.push(name);
        if let Some(weighted) = services.get(name).copied().and_then(|s| s.weighted.as_ref()) {
            for child in &weighted.services {
                visit(child.name.as_str(), services, visiting, done)?;
            }
        }
        visiting.pop();
        done.insert(name);
        Ok(())
    }

    let mut done = HashSet::new();
    let mut names = services.keys().copied().collect::<Vec<_>>();
    names.sort_unstable();
    for name in names {
        visit(name, services, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

fn is_http_token(value: &str) -> bool {
    !value.is_empty()
        && value.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}
