use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FastCgiError {
    #[error("FastCGI record header too short: {0} bytes")]
    HeaderTooShort(usize),
    #[error("unsupported FastCGI version: {0} (expected 1)")]
    UnsupportedVersion(u8),
    #[error("unexpected FastCGI record type: {0}")]
    UnexpectedRecordType(u8),
    #[error("unexpected FastCGI request id {got} (expected {expected})")]
    UnexpectedRequestId { expected: u16, got: u16 },
    #[error("FastCGI request not complete: app_status={app_status} protocol_status={protocol_status}")]
    EndRequestNotComplete { app_status: u32, protocol_status: u8 },
    #[error("truncated FastCGI {0}")]
    Truncated(&'static str),
    #[error("FastCGI record too large: {0} bytes")]
    RecordTooLarge(usize),
    #[error("FastCGI acquire timeout after {0:?} waiting for {1}")]
    AcquireTimeout(Duration, String),
    #[error("FastCGI dial timeout: {0}")]
    DialTimeout(String),
    #[error("FastCGI write timeout")]
    WriteTimeout,
    #[error("FastCGI read timeout")]
    ReadTimeout,
    #[error("FastCGI i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FastCgiError {
    /// Errors that leave the peer's framing state unknown.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::HeaderTooShort(_)
                | Self::UnsupportedVersion(_)
                | Self::UnexpectedRecordType(_)
                | Self::UnexpectedRequestId { .. }
                | Self::EndRequestNotComplete { .. }
                | Self::Truncated(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::DialTimeout(_) | Self::WriteTimeout | Self::ReadTimeout
        )
    }
}
