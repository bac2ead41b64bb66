use super::error::FastCgiError;
use super::pool::{Pool, PoolConn, PoolSettings, UpstreamAddr};
use super::proto::{
    encode_param, encoded_param_len, put_record, BeginRequestBody, RecordType, Role,
    MAX_CONTENT_LEN,
};
use super::reader::FastCgiResponse;
use bytes::{Buf, BytesMut};
use hyper::body::HttpBody as _;
use hyper::{Body, Method};
use std::io;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

/// Ordered CGI environment as raw name/value bytes.
pub type Params = Vec<(Vec<u8>, Vec<u8>)>;

#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub dial_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_conns: usize,
    pub log_stderr: bool,
}

pub struct FastCgiRequest {
    pub method: Method,
    pub role: Role,
    pub params: Params,
    pub body: Body,
}

impl FastCgiRequest {
    pub fn responder(method: Method, params: Params, body: Body) -> Self {
        Self {
            method,
            role: Role::Responder,
            params,
            body,
        }
    }
}

/// FastCGI client for one upstream address. Cheap to clone; clones share the
/// connection pool.
#[derive(Clone)]
pub struct Client {
    pool: Arc<Pool>,
    settings: ClientSettings,
}

impl Client {
    pub fn new(addr: UpstreamAddr, settings: ClientSettings) -> Self {
        let pool = Pool::new(
            addr,
            PoolSettings {
                max_conns: settings.max_conns,
                dial_timeout: settings.dial_timeout,
                acquire_timeout: settings.acquire_timeout,
            },
        );
        Self {
            pool: Arc::new(pool),
            settings,
        }
    }

    pub fn addr(&self) -> &UpstreamAddr {
        self.pool.addr()
    }

    pub fn settings(&self) -> ClientSettings {
        self.settings
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Sends one request and returns the demultiplexed response stream. Any
    /// failure while writing closes the connection instead of pooling it.
    pub async fn execute(&self, request: FastCgiRequest) -> Result<FastCgiResponse, FastCgiError> {
        let mut conn = self.pool.acquire().await?;
        conn.set_timeouts(
            Some(self.settings.read_timeout),
            Some(self.settings.write_timeout),
        );
        debug!(
            upstream = %self.pool.addr(),
            request_id = conn.request_id(),
            method = %request.method,
            "FastCGI request"
        );
        if let Err(err) = write_request(&mut conn, request).await {
            self.pool.close(conn);
            return Err(err);
        }
        Ok(FastCgiResponse::new(
            conn,
            self.pool.clone(),
            self.settings.log_stderr,
        ))
    }
}

async fn write_request(conn: &mut PoolConn, request: FastCgiRequest) -> Result<(), FastCgiError> {
    let request_id = conn.request_id();
    let FastCgiRequest {
        role,
        params,
        mut body,
        ..
    } = request;

    let mut head = BytesMut::new();
    let begin = BeginRequestBody {
        role,
        keep_conn: true,
    };
    put_record(&mut head, RecordType::BeginRequest, request_id, &begin.encode())?;
    put_params(&mut head, request_id, &params)?;
    conn.write_all(&head).await?;

    let mut pending = BytesMut::new();
    let mut out = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk =
            chunk.map_err(|err| FastCgiError::Io(io::Error::new(io::ErrorKind::Other, err)))?;
        pending.extend_from_slice(&chunk);
        out.clear();
        put_stdin_full_records(&mut out, request_id, &mut pending)?;
        if !out.is_empty() {
            conn.write_all(&out).await?;
        }
    }
    out.clear();
    finish_stdin(&mut out, request_id, &mut pending)?;
    conn.write_all(&out).await?;
    conn.flush().await
}

/// Encodes params as PARAMS records followed by the empty terminator. Pairs
/// are never split across records unless a single pair exceeds one record.
pub(crate) fn put_params(
    out: &mut BytesMut,
    request_id: u16,
    params: &[(Vec<u8>, Vec<u8>)],
) -> Result<(), FastCgiError> {
    let mut record = BytesMut::with_capacity(MAX_CONTENT_LEN.min(4096));
    for (name, value) in params {
        let pair_len = encoded_param_len(name, value);
        if record.len() + pair_len > MAX_CONTENT_LEN && !record.is_empty() {
            put_record(out, RecordType::Params, request_id, &record)?;
            record.clear();
        }
        encode_param(&mut record, name, value);
        while record.len() > MAX_CONTENT_LEN {
            let head = record.split_to(MAX_CONTENT_LEN);
            put_record(out, RecordType::Params, request_id, &head)?;
        }
    }
    if !record.is_empty() {
        put_record(out, RecordType::Params, request_id, &record)?;
    }
    put_record(out, RecordType::Params, request_id, &[])
}

/// Moves every full 65535-byte slice of `pending` into STDIN records.
pub(crate) fn put_stdin_full_records(
    out: &mut BytesMut,
    request_id: u16,
    pending: &mut BytesMut,
) -> Result<(), FastCgiError> {
    while pending.len() >= MAX_CONTENT_LEN {
        put_record(
            out,
            RecordType::Stdin,
            request_id,
            &pending[..MAX_CONTENT_LEN],
        )?;
        pending.advance(MAX_CONTENT_LEN);
    }
    Ok(())
}

/// Flushes the tail of the body and writes the empty STDIN terminator.
pub(crate) fn finish_stdin(
    out: &mut BytesMut,
    request_id: u16,
    pending: &mut BytesMut,
) -> Result<(), FastCgiError> {
    put_stdin_full_records(out, request_id, pending)?;
    if !pending.is_empty() {
        put_record(out, RecordType::Stdin, request_id, pending)?;
        pending.clear();
    }
    put_record(out, RecordType::Stdin, request_id, &[])
}
