use crate::balancer::BalancerError;
use crate::fastcgi::FastCgiError;
use crate::handler::ConnInfo;
use crate::http::local_response::status_response;
use crate::http::server::{http1_connection, serve_http1};
use crate::runtime::Runtime;
use anyhow::{Context, Result};
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use metrics::counter;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const REQUESTS_METRIC: &str = "fcgate_requests_total";

pub async fn bind(listen: &str) -> Result<TcpListener> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid server.listen: {}", listen))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))
}

/// Accepts downstream connections until the listener fails, serving each on
/// its own task. At most `server.max_connections` are served at once.
pub async fn run(listener: TcpListener, runtime: Runtime) -> Result<()> {
    let max_connections = runtime.state().config.server.max_connections.max(1);
    let permits = Arc::new(Semaphore::new(max_connections));
    info!(
        listen = %listener.local_addr()?,
        max_connections,
        "http listener ready"
    );
    loop {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .context("connection semaphore closed")?;
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = ?err, "accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let conn = ConnInfo {
            remote_addr: Some(remote_addr),
            local_addr: stream.local_addr().ok(),
            tls: false,
        };
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let http = http1_connection(&runtime.state().config.server);
            let service = service_fn(move |req| handle_request(req, runtime.clone(), conn));
            if let Err(err) = serve_http1(stream, service, http).await {
                debug!(error = ?err, remote = %remote_addr, "connection ended with error");
            }
        });
    }
}

/// Dispatches one request to the root service of the current state.
pub async fn handle_request(
    req: Request<Body>,
    runtime: Runtime,
    conn: ConnInfo,
) -> Result<Response<Body>, Infallible> {
    let state = runtime.state();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match state.services.root().serve(req, conn).await {
        Ok(response) => response,
        Err(err) => {
            let status = status_for_error(&err);
            warn!(
                error = %format!("{err:#}"),
                status = status.as_u16(),
                method = %method,
                path = %path,
                service = state.services.root_name(),
                "request failed"
            );
            status_response(status)
        }
    };
    counter!(REQUESTS_METRIC, "status" => response.status().as_u16().to_string()).increment(1);
    Ok(response)
}

/// Status code for a failed dispatch.
pub fn status_for_error(err: &anyhow::Error) -> StatusCode {
    for cause in err.chain() {
        if cause.downcast_ref::<BalancerError>().is_some() {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        if let Some(fcgi) = cause.downcast_ref::<FastCgiError>() {
            return match fcgi {
                FastCgiError::AcquireTimeout(..) => StatusCode::SERVICE_UNAVAILABLE,
                err if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
        }
    }
    StatusCode::BAD_GATEWAY
}
