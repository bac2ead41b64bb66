use anyhow::Result;
use async_trait::async_trait;
use hyper::{Body, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;

/// Facts about the downstream connection a request arrived on.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnInfo {
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub tls: bool,
}

/// Anything that can answer an HTTP request: a FastCGI server or a balancer
/// over other handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, req: Request<Body>, conn: ConnInfo) -> Result<Response<Body>>;
}

pub type SharedHandler = Arc<dyn Handler>;
