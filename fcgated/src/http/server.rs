use fcgate_core::config::ServerConfig;
use hyper::server::conn::Http;
use hyper::service::Service;
use hyper::{Body, Request, Response};
use std::error::Error as StdError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;

/// Connection options for downstream clients. Only HTTP/1.1 is spoken.
pub fn http1_connection(server: &ServerConfig) -> Http {
    let mut http = Http::new();
    http.http1_only(true)
        .http1_keep_alive(true)
        .http1_header_read_timeout(Duration::from_millis(server.header_read_timeout_ms));
    http
}

/// Drives one downstream connection until the client goes away.
pub async fn serve_http1<I, S>(io: I, service: S, http: Http) -> Result<(), hyper::Error>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Body>, Response = Response<Body>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    http.serve_connection(io, service).await
}
