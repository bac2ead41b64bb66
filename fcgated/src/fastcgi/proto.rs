//! FastCGI record framing: headers, begin/end bodies and name-value pairs.
//! Pure byte manipulation, no I/O.

use super::error::FastCgiError;
use bytes::{BufMut, BytesMut};

pub const FCGI_VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 65535;
/// Request id used by management records (GET_VALUES and friends).
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMultiplexConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

impl ProtocolStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::RequestComplete,
            1 => Self::CantMultiplexConn,
            2 => Self::Overloaded,
            3 => Self::UnknownRole,
            _ => return None,
        })
    }
}

/// Fixed 8-byte record header. `record_type` stays a raw byte so that
/// unknown types survive decoding and can be reported by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
    pub reserved: u8,
}

impl RecordHeader {
    /// Header for a version-1 record carrying `content_length` bytes, with the
    /// padding that rounds the record to a multiple of 8.
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: FCGI_VERSION_1,
            record_type: record_type as u8,
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
            reserved: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            self.reserved,
        ]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FastCgiError> {
        if buf.len() < HEADER_LEN {
            return Err(FastCgiError::HeaderTooShort(buf.len()));
        }
        if buf[0] != FCGI_VERSION_1 {
            return Err(FastCgiError::UnsupportedVersion(buf[0]));
        }
        Ok(Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
            reserved: buf[7],
        })
    }

    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }
}

pub fn padding_for(content_length: usize) -> u8 {
    ((8 - (content_length % 8)) % 8) as u8
}

/// Appends a complete record (header, content, zero padding) to `buf`.
pub fn put_record(
    buf: &mut BytesMut,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<(), FastCgiError> {
    if content.len() > MAX_CONTENT_LEN {
        return Err(FastCgiError::RecordTooLarge(content.len()));
    }
    let header = RecordHeader::new(record_type, request_id, content.len() as u16);
    buf.reserve(HEADER_LEN + content.len() + header.padding_length as usize);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(content);
    buf.put_bytes(0, header.padding_length as usize);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: Role,
    pub keep_conn: bool,
}

impl BeginRequestBody {
    const FLAG_KEEP_CONN: u8 = 1;

    pub fn encode(&self) -> [u8; 8] {
        let role = (self.role as u16).to_be_bytes();
        let flags = if self.keep_conn {
            Self::FLAG_KEEP_CONN
        } else {
            0
        };
        [role[0], role[1], flags, 0, 0, 0, 0, 0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    /// Raw byte; values outside the known set are preserved for reporting.
    pub protocol_status: u8,
}

impl EndRequestBody {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; 8] {
        let app = self.app_status.to_be_bytes();
        [app[0], app[1], app[2], app[3], self.protocol_status, 0, 0, 0]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FastCgiError> {
        if buf.len() < Self::LEN {
            return Err(FastCgiError::Truncated("end-request body"));
        }
        Ok(Self {
            app_status: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            protocol_status: buf[4],
        })
    }

    pub fn is_complete(&self) -> bool {
        self.protocol_status == ProtocolStatus::RequestComplete as u8
    }
}

fn put_param_len(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32((len as u32) | 0x8000_0000);
    }
}

pub fn encoded_param_len(name: &[u8], value: &[u8]) -> usize {
    let prefix = |len: usize| if len < 128 { 1 } else { 4 };
    prefix(name.len()) + prefix(value.len()) + name.len() + value.len()
}

pub fn encode_param(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_param_len(buf, name.len());
    put_param_len(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

fn take_param_len(data: &mut &[u8]) -> Result<usize, FastCgiError> {
    let Some(&first) = data.first() else {
        return Err(FastCgiError::Truncated("name-value length"));
    };
    if first < 128 {
        *data = &data[1..];
        return Ok(first as usize);
    }
    if data.len() < 4 {
        return Err(FastCgiError::Truncated("4-byte name-value length"));
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
    *data = &data[4..];
    Ok(len as usize)
}

/// Decodes one pair from the front of `data`, advancing it.
pub fn decode_param(data: &mut &[u8]) -> Result<(Vec<u8>, Vec<u8>), FastCgiError> {
    let name_len = take_param_len(data)?;
    let value_len = take_param_len(data)?;
    let total = name_len
        .checked_add(value_len)
        .ok_or(FastCgiError::Truncated("name-value pair"))?;
    if data.len() < total {
        return Err(FastCgiError::Truncated("name-value pair"));
    }
    let name = data[..name_len].to_vec();
    let value = data[name_len..total].to_vec();
    *data = &data[total..];
    Ok((name, value))
}

pub fn decode_params(mut data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, FastCgiError> {
    let mut out = Vec::new();
    while !data.is_empty() {
        out.push(decode_param(&mut data)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        for (rtype, id, len) in [
            (RecordType::BeginRequest, 1u16, 8u16),
            (RecordType::Params, 0xbeef, 0),
            (RecordType::Stdout, 65535, 65535),
            (RecordType::UnknownType, 7, 13),
        ] {
            let header = RecordHeader::new(rtype, id, len);
            let decoded = RecordHeader::decode(&header.encode()).expect("decode");
            assert_eq!(decoded, header);
            assert_eq!(decoded.kind(), Some(rtype));
            assert_eq!(
                (HEADER_LEN + len as usize + decoded.padding_length as usize) % 8,
                0
            );
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let header = RecordHeader::new(RecordType::Stdin, 0x0102, 0x0304);
        assert_eq!(header.encode(), [1, 5, 0x01, 0x02, 0x03, 0x04, 4, 0]);
    }

    #[test]
    fn header_decode_rejects_short_input_and_bad_version() {
        assert!(matches!(
            RecordHeader::decode(&[1, 6, 0, 1]),
            Err(FastCgiError::HeaderTooShort(4))
        ));
        assert!(matches!(
            RecordHeader::decode(&[2, 6, 0, 1, 0, 0, 0, 0]),
            Err(FastCgiError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn padding_rounds_to_eight() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 7);
        assert_eq!(padding_for(8), 0);
        assert_eq!(padding_for(65535), 1);
        assert_eq!(padding_for(18930), 6);
    }

    #[test]
    fn param_length_prefix_widths() {
        for len in [0usize, 127, 128, 65535] {
            let name = vec![b'k'; len];
            let value = vec![b'v'; len];
            let mut buf = BytesMut::new();
            encode_param(&mut buf, &name, &value);
            let prefix = if len < 128 { 1 } else { 4 };
            assert_eq!(buf.len(), 2 * prefix + 2 * len);
            assert_eq!(buf.len(), encoded_param_len(&name, &value));
            if len >= 128 {
                assert_eq!(buf[0] & 0x80, 0x80);
            }
            let mut slice = &buf[..];
            let (k, v) = decode_param(&mut slice).expect("decode");
            assert!(slice.is_empty());
            assert_eq!(k, name);
            assert_eq!(v, value);
        }
    }

    #[test]
    fn mixed_width_params_decode_in_order() {
        let long = vec![b'x'; 300];
        let mut buf = BytesMut::new();
        encode_param(&mut buf, b"SCRIPT_NAME", b"/index.php");
        encode_param(&mut buf, b"HTTP_COOKIE", &long);
        encode_param(&mut buf, b"QUERY_STRING", b"");
        let pairs = decode_params(&buf).expect("decode");
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[1].0, b"HTTP_COOKIE".to_vec());
        assert_eq!(pairs[1].1.len(), 300);
        assert!(pairs[2].1.is_empty());
    }

    #[test]
    fn truncated_params_are_rejected() {
        let mut buf = BytesMut::new();
        encode_param(&mut buf, b"REQUEST_METHOD", b"GET");
        assert!(decode_params(&buf[..buf.len() - 1]).is_err());
        assert!(decode_params(&[0x80, 0, 1]).is_err());
    }

    #[test]
    fn begin_and_end_bodies() {
        let begin = BeginRequestBody {
            role: Role::Responder,
            keep_conn: true,
        };
        assert_eq!(begin.encode(), [0, 1, 1, 0, 0, 0, 0, 0]);

        let end = EndRequestBody {
            app_status: 0x0a0b0c0d,
            protocol_status: ProtocolStatus::Overloaded as u8,
        };
        let decoded = EndRequestBody::decode(&end.encode()).expect("decode");
        assert_eq!(decoded, end);
        assert!(!decoded.is_complete());
        assert_eq!(
            ProtocolStatus::from_u8(decoded.protocol_status),
            Some(ProtocolStatus::Overloaded)
        );
    }

    #[test]
    fn put_record_pads_and_bounds_content() {
        let mut buf = BytesMut::new();
        put_record(&mut buf, RecordType::Stdout, 1, b"hello").expect("record");
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[8..13], b"hello");
        assert!(buf[13..].iter().all(|b| *b == 0));

        let too_big = vec![0u8; MAX_CONTENT_LEN + 1];
        assert!(matches!(
            put_record(&mut buf, RecordType::Stdin, 1, &too_big),
            Err(FastCgiError::RecordTooLarge(_))
        ));
    }
}
