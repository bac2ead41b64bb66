use super::env::is_hop_by_hop_header;
use crate::fastcgi::FastCgiResponse;
use anyhow::{anyhow, Result};
use bytes::BytesMut;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::{Body, HeaderMap, Response, StatusCode};
use tracing::{debug, warn};

const MAX_CGI_HEADER_BYTES: usize = 64 * 1024;
const MAX_CGI_HEADER_LINES: usize = 200;

/// Reads the CGI header block off `stdout`, then streams the rest of the body
/// from a background task. A dropped downstream body is noticed on the next
/// send, which closes the undrained connection; while the backend stalls
/// between chunks the connection is held until the read timeout fires.
pub async fn into_http_response(mut stdout: FastCgiResponse) -> Result<Response<Body>> {
    let mut head = BytesMut::new();
    let (status, headers, rest) = loop {
        let Some(chunk) = stdout.next_chunk().await? else {
            return Err(anyhow!("missing CGI header boundary"));
        };
        head.extend_from_slice(&chunk);
        if let Some((pos, sep_len)) = find_header_boundary(&head) {
            let (status, headers) = parse_cgi_headers(&head[..pos])?;
            let rest = head.split_off(pos + sep_len).freeze();
            break (status, headers, rest);
        }
        if head.len() > MAX_CGI_HEADER_BYTES {
            return Err(anyhow!("CGI headers too large"));
        }
    };

    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        if !rest.is_empty() && sender.send_data(rest).await.is_err() {
            return;
        }
        loop {
            match stdout.next_chunk().await {
                Ok(Some(chunk)) => {
                    if sender.send_data(chunk).await.is_err() {
                        debug!("downstream body dropped; abandoning FastCGI response");
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "FastCGI response read failed");
                    sender.abort();
                    return;
                }
            }
        }
    });

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Parses a CGI header block. `Status` sets the response code; a
/// `Content-Length` that does not parse is dropped so the body is chunked.
pub fn parse_cgi_headers(data: &[u8]) -> Result<(StatusCode, HeaderMap)> {
    if data.len() > MAX_CGI_HEADER_BYTES {
        return Err(anyhow!("CGI headers too large"));
    }
    let header_str = std::str::from_utf8(data)?;
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    let mut count = 0usize;

    for line in header_str.lines() {
        if count >= MAX_CGI_HEADER_LINES {
            return Err(anyhow!("too many CGI headers"));
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        count += 1;
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("Status") {
            let code = value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok());
            match code {
                Some(code) => status = code,
                None => return Err(anyhow!("invalid CGI Status header: {}", value)),
            }
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        if is_hop_by_hop_header(name.as_str()) {
            continue;
        }
        if name == CONTENT_LENGTH && value.parse::<u64>().is_err() {
            continue;
        }
        if let Ok(val) = HeaderValue::from_str(value) {
            headers.append(name, val);
        }
    }
    Ok((status, headers))
}

/// Position and length of the first blank line (CRLF or LF form). A blank
/// line at the very start means the header block is empty.
pub fn find_header_boundary(data: &[u8]) -> Option<(usize, usize)> {
    if data.starts_with(b"\r\n") {
        return Some((0, 2));
    }
    if data.starts_with(b"\n") {
        return Some((0, 1));
    }
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}
