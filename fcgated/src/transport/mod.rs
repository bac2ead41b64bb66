//! HTTP to FastCGI adaptation: CGI environment, request dispatch through a
//! cached per-address [`Client`], and CGI response synthesis.

mod env;
mod response;

pub use env::{build_env, decoded_path, split_path, CgiEnv, EnvSettings};
pub use response::{find_header_boundary, into_http_response, parse_cgi_headers};

use crate::fastcgi::{Client, ClientSettings, FastCgiRequest, UpstreamAddr};
use crate::handler::ConnInfo;
use crate::http::local_response::build_local_response;
use anyhow::Result;
use fcgate_core::config::FastCgiServiceConfig;
use hyper::{Body, Request, Response, StatusCode};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// One [`Client`] per upstream address, shared by every service that points
/// at it. Survives configuration reloads; `retain` drops the ones no longer
/// referenced.
#[derive(Default)]
pub struct ClientCache {
    clients: Mutex<HashMap<UpstreamAddr, Client>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached client for `addr`, created with `settings` on first use. A
    /// cached client keeps the settings it was created with.
    pub fn get_or_create(&self, addr: &UpstreamAddr, settings: ClientSettings) -> Client {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(addr) {
            return client.clone();
        }
        debug!(upstream = %addr, max_conns = settings.max_conns, "creating FastCGI client");
        let client = Client::new(addr.clone(), settings);
        clients.insert(addr.clone(), client.clone());
        client
    }

    /// Drops clients whose address is not in `keep`. Returns how many went.
    pub fn retain(&self, keep: &HashSet<UpstreamAddr>) -> usize {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = clients.len();
        clients.retain(|addr, _| {
            let kept = keep.contains(addr);
            if !kept {
                info!(upstream = %addr, "evicting FastCGI client");
            }
            kept
        });
        before - clients.len()
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn client_settings(cfg: &FastCgiServiceConfig) -> ClientSettings {
    ClientSettings {
        dial_timeout: Duration::from_millis(cfg.dial_timeout_ms()),
        write_timeout: Duration::from_millis(cfg.write_timeout_ms()),
        read_timeout: Duration::from_millis(cfg.read_timeout_ms()),
        acquire_timeout: Duration::from_millis(cfg.acquire_conn_timeout_ms()),
        max_conns: cfg.max_conns,
        log_stderr: cfg.log_stderr,
    }
}

/// Turns HTTP requests into FastCGI calls for one service definition.
pub struct FastCgiTransport {
    cache: Arc<ClientCache>,
    settings: ClientSettings,
    env: EnvSettings,
}

impl FastCgiTransport {
    pub fn new(cache: Arc<ClientCache>, settings: ClientSettings, env: EnvSettings) -> Self {
        Self {
            cache,
            settings,
            env,
        }
    }

    pub fn from_config(cache: Arc<ClientCache>, cfg: &FastCgiServiceConfig) -> Result<Self> {
        let env = EnvSettings::new(
            cfg.root.as_str(),
            cfg.resolve_symlink,
            cfg.split_path_regex(),
            &cfg.env,
        )?;
        Ok(Self::new(cache, client_settings(cfg), env))
    }

    pub fn env_settings(&self) -> &EnvSettings {
        &self.env
    }

    /// Serves `req` from the FastCGI application at `addr`. A path carrying
    /// NUL is answered with 400 before any connection is made.
    pub async fn round_trip(
        &self,
        addr: &UpstreamAddr,
        req: Request<Body>,
        conn: ConnInfo,
    ) -> Result<Response<Body>> {
        let Some(path) = decoded_path(req.uri().path()) else {
            warn!(upstream = %addr, "rejecting request path containing NUL");
            return Ok(build_local_response(
                StatusCode::BAD_REQUEST,
                "invalid request path\n",
            ));
        };
        let params = build_env(&req, path.as_str(), &conn, &self.env).into_params();
        let method = req.method().clone();
        let request = FastCgiRequest::responder(method, params, req.into_body());

        let client = self.cache.get_or_create(addr, self.settings);
        let stdout = client.execute(request).await?;
        into_http_response(stdout).await
    }
}
