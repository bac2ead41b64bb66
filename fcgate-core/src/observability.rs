use crate::config::{LoggingConfig, MetricsConfig};
use anyhow::{anyhow, Context, Result};
use cidr::IpCidr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};

const MAX_METRICS_REQUEST_BYTES: usize = 16 * 1024;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence over
/// `logging.level`.
pub fn init_logging(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let layer = if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_filter(filter)
            .boxed()
    } else if logging.format.eq_ignore_ascii_case("pretty") {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_file(false)
            .with_line_number(false)
            .pretty()
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .compact()
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(())
}

/// Where a scrape request ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Health,
    Metrics,
    NotFound,
}

/// Access rules and routing of the scrape endpoint.
#[derive(Debug, Clone)]
struct MetricsEndpoint {
    path: String,
    allow: Vec<IpCidr>,
}

impl MetricsEndpoint {
    fn from_config(config: &MetricsConfig) -> Result<Self> {
        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };
        let mut allow = Vec::with_capacity(config.allow.len());
        for raw in &config.allow {
            let cidr: IpCidr = raw
                .parse()
                .map_err(|_| anyhow!("invalid metrics.allow CIDR: {}", raw))?;
            allow.push(cidr);
        }
        Ok(Self { path, allow })
    }

    /// Loopback peers are always allowed.
    fn permits(&self, peer: IpAddr) -> bool {
        peer.is_loopback() || self.allow.iter().any(|cidr| cidr.contains(&peer))
    }

    fn route(&self, target: &str) -> Route {
        let path = target.split_once('?').map_or(target, |(p, _)| p);
        if path == "/health" {
            Route::Health
        } else if path == self.path {
            Route::Metrics
        } else {
            Route::NotFound
        }
    }
}

/// Installs the Prometheus recorder and serves it on `config.listen`.
/// `/health` always answers `OK`.
pub fn start_metrics(config: &MetricsConfig) -> Result<()> {
    let listen: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid metrics.listen: {}", config.listen))?;
    let endpoint = Arc::new(MetricsEndpoint::from_config(config)?);
    let permits = Arc::new(Semaphore::new(config.max_concurrent_connections.max(1)));

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow!("metrics recorder install failed: {}", e))?;

    let runtime = tokio::runtime::Handle::try_current()
        .context("metrics endpoint requires running Tokio runtime")?;
    runtime.spawn(async move {
        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(error = ?err, listen = %listen, "failed to bind metrics listener");
                return;
            }
        };
        tracing::info!(listen = %listen, path = %endpoint.path, "metrics endpoint ready");
        while let Ok((mut stream, peer)) = listener.accept().await {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                let _ = timeout(
                    Duration::from_secs(1),
                    reply(&mut stream, "503 Service Unavailable", "text/plain", "busy"),
                )
                .await;
                continue;
            };
            let endpoint = endpoint.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let _permit = permit;
                scrape(stream, peer, &endpoint, &handle).await;
            });
        }
        tracing::warn!(listen = %listen, "metrics listener stopped");
    });
    Ok(())
}

async fn scrape(
    mut stream: TcpStream,
    peer: SocketAddr,
    endpoint: &MetricsEndpoint,
    handle: &PrometheusHandle,
) {
    if !endpoint.permits(peer.ip()) {
        reply(&mut stream, "403 Forbidden", "text/plain", "forbidden").await;
        return;
    }
    let target = match timeout(METRICS_READ_TIMEOUT, read_request_target(&mut stream)).await {
        Ok(Ok(Some(target))) => target,
        Ok(Ok(None)) => return,
        Ok(Err(_)) | Err(_) => {
            reply(&mut stream, "400 Bad Request", "text/plain", "bad request").await;
            return;
        }
    };
    match endpoint.route(&target) {
        Route::Health => reply(&mut stream, "200 OK", "text/plain; charset=utf-8", "OK").await,
        Route::Metrics => {
            let body = handle.render();
            reply(
                &mut stream,
                "200 OK",
                "text/plain; version=0.0.4; charset=utf-8",
                &body,
            )
            .await
        }
        Route::NotFound => reply(&mut stream, "404 Not Found", "text/plain", "not found").await,
    }
}

async fn reply(stream: &mut TcpStream, status: &str, content_type: &str, body: &str) {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if stream.write_all(head.as_bytes()).await.is_ok() {
        let _ = stream.write_all(body.as_bytes()).await;
    }
    let _ = stream.shutdown().await;
}

/// Reads the request head and returns its target. `None` when the peer
/// closed before sending anything.
async fn read_request_target(stream: &mut TcpStream) -> Result<Option<String>> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(anyhow!("metrics request truncated"))
            };
        }
        if head.len() + n > MAX_METRICS_REQUEST_BYTES {
            return Err(anyhow!("metrics request header too large"));
        }
        head.extend_from_slice(&buf[..n]);
    }
    request_target(&head).map(Some)
}

fn request_target(head: &[u8]) -> Result<String> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| anyhow!("metrics request line is not utf-8"))?;
    match line.split_whitespace().collect::<Vec<_>>().as_slice() {
        ["GET", target, version] if version.starts_with("HTTP/1.") => Ok(target.to_string()),
        [_, _, version] if version.starts_with("HTTP/1.") => Err(anyhow!("unsupported method")),
        [_, _, _] => Err(anyhow!("unsupported http version")),
        _ => Err(anyhow!("malformed request line")),
    }
}
