use super::error::FastCgiError;
use super::pool::{Pool, PoolConn};
use super::proto::{EndRequestBody, RecordHeader, RecordType, FCGI_NULL_REQUEST_ID, HEADER_LEN};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tracing::warn;

const MAX_STDERR_BYTES: usize = 1024 * 1024;
const READ_CHUNK_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Next bytes on the wire are a record header.
    Header,
    /// Inside a STDOUT record: `remaining` content bytes, then `padding`.
    Content { remaining: usize, padding: u8 },
}

/// STDOUT of one FastCGI request as a pull stream. STDERR is collected on the
/// side. The connection goes back to the pool only when END_REQUEST was read
/// in full; any other way of finishing closes it.
pub struct FastCgiResponse {
    conn: Option<PoolConn>,
    pool: Arc<Pool>,
    state: ReadState,
    stderr: BytesMut,
    drained: bool,
    log_stderr: bool,
    failed: bool,
}

impl FastCgiResponse {
    pub(crate) fn new(conn: PoolConn, pool: Arc<Pool>, log_stderr: bool) -> Self {
        Self {
            conn: Some(conn),
            pool,
            state: ReadState::Header,
            stderr: BytesMut::new(),
            drained: false,
            log_stderr,
            failed: false,
        }
    }

    /// Next piece of STDOUT, or `None` once END_REQUEST arrived.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, FastCgiError> {
        if self.drained {
            return Ok(None);
        }
        if self.failed || self.conn.is_none() {
            return Err(FastCgiError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "FastCGI response already closed",
            )));
        }
        match self.advance().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.drained = true;
                self.finish();
                Ok(None)
            }
            Err(err) => {
                self.failed = true;
                self.finish();
                Err(err)
            }
        }
    }

    /// Reads the whole remaining STDOUT.
    pub async fn read_to_end(&mut self) -> Result<Bytes, FastCgiError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// STDERR captured so far, at most 1 MiB.
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Releases the connection when drained, closes it otherwise. Dropping the
    /// response has the same effect.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.log_stderr && !self.stderr.is_empty() {
            warn!(
                upstream = %self.pool.addr(),
                request_id = conn.request_id(),
                fastcgi_stderr = %String::from_utf8_lossy(&self.stderr),
                "FastCGI backend stderr"
            );
        }
        if self.drained {
            self.pool.release(conn);
        } else {
            self.pool.close(conn);
        }
    }

    async fn advance(&mut self) -> Result<Option<Bytes>, FastCgiError> {
        let conn = self.conn.as_mut().ok_or(FastCgiError::Truncated("response stream"))?;
        loop {
            match self.state {
                ReadState::Content {
                    remaining: 0,
                    padding,
                } => {
                    conn.discard(padding as usize).await?;
                    self.state = ReadState::Header;
                }
                ReadState::Content { remaining, padding } => {
                    let mut buf = BytesMut::zeroed(remaining.min(READ_CHUNK_BYTES));
                    let n = conn.read_some(&mut buf).await?;
                    buf.truncate(n);
                    self.state = ReadState::Content {
                        remaining: remaining - n,
                        padding,
                    };
                    return Ok(Some(buf.freeze()));
                }
                ReadState::Header => {
                    let mut raw = [0u8; HEADER_LEN];
                    conn.read_exact(&mut raw).await?;
                    let header = RecordHeader::decode(&raw)?;
                    let expected = conn.request_id();
                    if header.request_id != expected
                        && header.request_id != FCGI_NULL_REQUEST_ID
                    {
                        return Err(FastCgiError::UnexpectedRequestId {
                            expected,
                            got: header.request_id,
                        });
                    }
                    let len = header.content_length as usize;
                    match header.kind() {
                        Some(RecordType::Stdout) => {
                            self.state = ReadState::Content {
                                remaining: len,
                                padding: header.padding_length,
                            };
                        }
                        Some(RecordType::Stderr) => {
                            let mut content = vec![0u8; len];
                            conn.read_exact(&mut content).await?;
                            conn.discard(header.padding_length as usize).await?;
                            let room = MAX_STDERR_BYTES.saturating_sub(self.stderr.len());
                            let take = room.min(content.len());
                            self.stderr.extend_from_slice(&content[..take]);
                        }
                        Some(RecordType::EndRequest) => {
                            if len < EndRequestBody::LEN {
                                return Err(FastCgiError::Truncated("end-request body"));
                            }
                            let mut content = vec![0u8; len];
                            conn.read_exact(&mut content).await?;
                            let end = EndRequestBody::decode(&content)?;
                            if !end.is_complete() {
                                return Err(FastCgiError::EndRequestNotComplete {
                                    app_status: end.app_status,
                                    protocol_status: end.protocol_status,
                                });
                            }
                            conn.discard(header.padding_length as usize).await?;
                            return Ok(None);
                        }
                        _ => return Err(FastCgiError::UnexpectedRecordType(header.record_type)),
                    }
                }
            }
        }
    }
}

impl Drop for FastCgiResponse {
    fn drop(&mut self) {
        self.finish();
    }
}
