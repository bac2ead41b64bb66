use super::error::FastCgiError;
use anyhow::{anyhow, Result};
use metrics::{counter, gauge};
use std::fmt;
use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{timeout, Duration, Instant};
use tracing::debug;

pub const LIVE_CONNECTIONS_METRIC: &str = "fcgate_fastcgi_live_connections";
pub const ACQUIRE_TIMEOUTS_METRIC: &str = "fcgate_fastcgi_acquire_timeouts_total";

/// Where a FastCGI application listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamAddr {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: PathBuf },
}

impl UpstreamAddr {
    /// Accepts `host:port`, `[v6]:port` or `unix:///path`.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(path) = raw.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(anyhow!("empty unix socket path in FastCGI address"));
                }
                return Ok(Self::Unix {
                    path: PathBuf::from(path),
                });
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(anyhow!("unix FastCGI backends are not supported"));
            }
        }
        let Some((host, port)) = raw.rsplit_once(':') else {
            return Err(anyhow!(
                "invalid FastCGI address (expected host:port or unix://path): {}",
                raw
            ));
        };
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow!("invalid FastCGI port in address: {}", raw))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(anyhow!("missing FastCGI host in address: {}", raw));
        }
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    pub fn network(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            #[cfg(unix)]
            Self::Unix { .. } => "unix",
        }
    }

    async fn connect(&self) -> io::Result<FastCgiStream> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                let _ = stream.set_nodelay(true);
                Ok(FastCgiStream::Tcp(stream))
            }
            #[cfg(unix)]
            Self::Unix { path } => Ok(FastCgiStream::Unix(UnixStream::connect(path).await?)),
        }
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            #[cfg(unix)]
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

pub(crate) enum FastCgiStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for FastCgiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FastCgiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Live-connection accounting shared by a pool and every connection it
/// opened. Lives apart from the pool so idle connections do not keep the
/// pool itself alive.
struct Slots {
    label: String,
    max: usize,
    live: AtomicUsize,
    freed: Notify,
}

impl Slots {
    fn try_reserve(&self) -> bool {
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max).then_some(live + 1)
            })
            .is_ok();
        if reserved {
            self.publish();
        }
        reserved
    }

    fn give_back(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_sub(1)
            });
        self.publish();
        self.freed.notify_waiters();
    }

    fn has_capacity(&self) -> bool {
        self.live.load(Ordering::Acquire) < self.max
    }

    fn publish(&self) {
        gauge!(LIVE_CONNECTIONS_METRIC, "upstream" => self.label.clone())
            .set(self.live.load(Ordering::Relaxed) as f64);
    }
}

/// A slot reserved before dialing; handed back if the dial fails or the
/// acquiring future is dropped.
struct Reservation {
    slots: Option<Arc<Slots>>,
}

impl Reservation {
    fn into_conn(mut self, stream: FastCgiStream, request_id: u16) -> Option<PoolConn> {
        let slots = self.slots.take()?;
        Some(PoolConn {
            stream,
            request_id,
            slots,
            read_timeout: None,
            write_timeout: None,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.take() {
            slots.give_back();
        }
    }
}

/// One physical connection. Carries exactly one FastCGI request at a time;
/// its request id is fixed when the connection is opened. Dropping it closes
/// the socket and frees its slot.
pub struct PoolConn {
    stream: FastCgiStream,
    request_id: u16,
    slots: Arc<Slots>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl PoolConn {
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub(crate) fn set_timeouts(&mut self, read: Option<Duration>, write: Option<Duration>) {
        self.read_timeout = read;
        self.write_timeout = write;
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> Result<(), FastCgiError> {
        match self.write_timeout {
            Some(limit) => timeout(limit, self.stream.write_all(buf))
                .await
                .map_err(|_| FastCgiError::WriteTimeout)??,
            None => self.stream.write_all(buf).await?,
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), FastCgiError> {
        match self.write_timeout {
            Some(limit) => timeout(limit, self.stream.flush())
                .await
                .map_err(|_| FastCgiError::WriteTimeout)??,
            None => self.stream.flush().await?,
        }
        Ok(())
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FastCgiError> {
        match self.read_timeout {
            Some(limit) => timeout(limit, self.stream.read_exact(buf))
                .await
                .map_err(|_| FastCgiError::ReadTimeout)??,
            None => self.stream.read_exact(buf).await?,
        };
        Ok(())
    }

    /// Reads at most `buf.len()` bytes; end of stream is an error because a
    /// FastCGI conversation always ends with an END_REQUEST record.
    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, FastCgiError> {
        let n = match self.read_timeout {
            Some(limit) => timeout(limit, self.stream.read(buf))
                .await
                .map_err(|_| FastCgiError::ReadTimeout)??,
            None => self.stream.read(buf).await?,
        };
        if n == 0 && !buf.is_empty() {
            return Err(FastCgiError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "FastCGI peer closed the connection mid-record",
            )));
        }
        Ok(n)
    }

    /// Consumes and discards `len` bytes.
    pub(crate) async fn discard(&mut self, len: usize) -> Result<(), FastCgiError> {
        let mut scratch = [0u8; 256];
        let mut left = len;
        while left > 0 {
            let take = left.min(scratch.len());
            self.read_exact(&mut scratch[..take]).await?;
            left -= take;
        }
        Ok(())
    }
}

impl Drop for PoolConn {
    fn drop(&mut self) {
        self.slots.give_back();
    }
}

impl fmt::Debug for PoolConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConn")
            .field("upstream", &self.slots.label)
            .field("request_id", &self.request_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_conns: usize,
    pub dial_timeout: Duration,
    pub acquire_timeout: Duration,
}

/// Bounded set of connections to one upstream: at most `max_conns` live at
/// once, idle ones parked on a free list.
pub struct Pool {
    addr: UpstreamAddr,
    settings: PoolSettings,
    slots: Arc<Slots>,
    idle_tx: mpsc::Sender<PoolConn>,
    idle_rx: Mutex<mpsc::Receiver<PoolConn>>,
    next_request_id: AtomicU16,
}

impl Pool {
    pub fn new(addr: UpstreamAddr, settings: PoolSettings) -> Self {
        let max = settings.max_conns.max(1);
        let (idle_tx, idle_rx) = mpsc::channel(max);
        let slots = Arc::new(Slots {
            label: addr.to_string(),
            max,
            live: AtomicUsize::new(0),
            freed: Notify::new(),
        });
        Self {
            addr,
            settings: PoolSettings {
                max_conns: max,
                ..settings
            },
            slots,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            next_request_id: AtomicU16::new(1),
        }
    }

    pub fn addr(&self) -> &UpstreamAddr {
        &self.addr
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    /// Connections currently open, idle or busy.
    pub fn live(&self) -> usize {
        self.slots.live.load(Ordering::Acquire)
    }

    /// Connections parked on the free list.
    pub fn idle(&self) -> usize {
        self.idle_tx.max_capacity() - self.idle_tx.capacity()
    }

    /// Idle connection if one is parked, else a new one while under
    /// `max_conns`, else wait up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PoolConn, FastCgiError> {
        let deadline = Instant::now() + self.settings.acquire_timeout;
        loop {
            if let Some(conn) = self.take_idle() {
                return Ok(conn);
            }
            if self.slots.try_reserve() {
                let reservation = Reservation {
                    slots: Some(self.slots.clone()),
                };
                return self.dial(reservation).await;
            }

            let freed = self.slots.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if self.slots.has_capacity() {
                continue;
            }

            let parked = async {
                let mut rx = self.idle_rx.lock().await;
                rx.recv().await
            };
            tokio::select! {
                conn = parked => match conn {
                    Some(conn) => return Ok(conn),
                    None => {
                        return Err(FastCgiError::Io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "FastCGI pool closed",
                        )))
                    }
                },
                _ = &mut freed => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    counter!(ACQUIRE_TIMEOUTS_METRIC, "upstream" => self.slots.label.clone())
                        .increment(1);
                    return Err(FastCgiError::AcquireTimeout(
                        self.settings.acquire_timeout,
                        self.slots.label.clone(),
                    ));
                }
            }
        }
    }

    fn take_idle(&self) -> Option<PoolConn> {
        let mut rx = self.idle_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    async fn dial(&self, reservation: Reservation) -> Result<PoolConn, FastCgiError> {
        let stream = timeout(self.settings.dial_timeout, self.addr.connect())
            .await
            .map_err(|_| FastCgiError::DialTimeout(self.slots.label.clone()))??;
        let request_id = self.allocate_request_id();
        debug!(upstream = %self.addr, request_id, "FastCGI connection opened");
        reservation.into_conn(stream, request_id).ok_or_else(|| {
            FastCgiError::Io(io::Error::new(
                io::ErrorKind::Other,
                "FastCGI slot reservation already consumed",
            ))
        })
    }

    fn allocate_request_id(&self) -> u16 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Parks a cleanly drained connection for reuse. Falls back to closing it
    /// when the free list cannot take it.
    pub fn release(&self, mut conn: PoolConn) {
        conn.set_timeouts(None, None);
        if let Err(err) = self.idle_tx.try_send(conn) {
            debug!(upstream = %self.addr, error = %err, "FastCGI connection not parked; closing");
        }
    }

    /// Closes a connection whose conversation state is unknown.
    pub fn close(&self, conn: PoolConn) {
        debug!(upstream = %self.addr, request_id = conn.request_id, "FastCGI connection closed");
        drop(conn);
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.addr)
            .field("live", &self.live())
            .field("idle", &self.idle())
            .finish()
    }
}
