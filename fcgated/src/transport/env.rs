use crate::fastcgi::Params;
use crate::handler::ConnInfo;
use anyhow::{anyhow, Context, Result};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Body, HeaderMap, Request};
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

const SERVER_SOFTWARE: &str = concat!("fcgated/", env!("CARGO_PKG_VERSION"));

/// Per-service inputs to the CGI environment.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    document_root: String,
    split_path: Regex,
    overrides: Vec<(String, String)>,
}

impl EnvSettings {
    pub fn new(
        root: &str,
        resolve_symlink: bool,
        split_path_regex: &str,
        overrides: &HashMap<String, String>,
    ) -> Result<Self> {
        let split_path = Regex::new(split_path_regex)
            .with_context(|| format!("invalid split_path_regex: {}", split_path_regex))?;
        let mut overrides: Vec<(String, String)> = overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        overrides.sort();
        Ok(Self {
            document_root: document_root(root, resolve_symlink)?,
            split_path,
            overrides,
        })
    }

    pub fn document_root(&self) -> &str {
        &self.document_root
    }
}

fn document_root(root: &str, resolve_symlink: bool) -> Result<String> {
    let mut path = PathBuf::from(if root.is_empty() { "." } else { root });
    if path.is_relative() {
        path = std::env::current_dir()
            .context("failed to read working directory")?
            .join(path);
    }
    if resolve_symlink {
        path = std::fs::canonicalize(&path)
            .with_context(|| format!("failed to resolve FastCGI root {}", path.display()))?;
    }
    let root = path
        .to_str()
        .ok_or_else(|| anyhow!("FastCGI root is not valid UTF-8: {}", path.display()))?;
    Ok(normalize_root(root))
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn join_root(root: &str, rel: &str) -> String {
    let root = root.trim_end_matches('/');
    format!("{}{}", root, rel)
}

/// CGI variables in insertion order. Later `set` calls overwrite, `set_default`
/// never does.
#[derive(Debug, Default, Clone)]
pub struct CgiEnv {
    entries: Vec<(String, Vec<u8>)>,
    index: HashMap<String, usize>,
}

impl CgiEnv {
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        match self.index.get(key) {
            Some(&at) => self.entries[at].1 = value,
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push((key.to_string(), value));
            }
        }
    }

    pub fn set_default(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        if !self.index.contains_key(key) {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.index
            .get(key)
            .map(|&at| self.entries[at].1.as_slice())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_params(self) -> Params {
        self.entries
            .into_iter()
            .map(|(k, v)| (k.into_bytes(), v))
            .collect()
    }
}

/// Decoded request path, or `None` when it carries a NUL byte in raw or
/// `%00` form.
pub fn decoded_path(raw: &str) -> Option<String> {
    if raw.as_bytes().contains(&0) {
        return None;
    }
    let decoded: Cow<'_, [u8]> = percent_decode_str(raw).into();
    if decoded.contains(&0) {
        return None;
    }
    Some(String::from_utf8_lossy(&decoded).into_owned())
}

/// Splits `path` into script name and path info. Both parts get a leading
/// `/` when non-empty; without a match the whole path is the script.
pub fn split_path(re: &Regex, path: &str) -> (String, String) {
    let (script, info) = match re.captures(path) {
        Some(caps) => (
            caps.get(1).map(|m| m.as_str()).unwrap_or(path),
            caps.get(2).map(|m| m.as_str()).unwrap_or(""),
        ),
        None => (path, ""),
    };
    (with_leading_slash(script), with_leading_slash(info))
}

fn with_leading_slash(part: &str) -> String {
    if part.is_empty() || part.starts_with('/') {
        part.to_string()
    } else {
        format!("/{}", part)
    }
}

/// Headers that should not be forwarded as HTTP_* to CGI/FastCGI.
pub(crate) fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    let mut out = HashSet::new();
    for value in headers.get_all("connection") {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for token in s.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                out.insert(token.to_ascii_lowercase());
            }
        }
    }
    out
}

fn server_protocol(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "HTTP/0.9",
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_11 => "HTTP/1.1",
        http::Version::HTTP_2 => "HTTP/2.0",
        http::Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Splits a Host value into name and port. Bracketed IPv6 carries an optional
/// port; a bare IPv6 literal never does.
fn split_host(host: &str, default_port: u16) -> (&str, Cow<'_, str>) {
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            let name = &host[1..end];
            return match host[end + 1..].strip_prefix(':') {
                Some(port) if !port.is_empty() => (name, Cow::Borrowed(port)),
                _ => (name, Cow::Owned(default_port.to_string())),
            };
        }
        return (host, Cow::Owned(default_port.to_string()));
    }
    match host.rsplit_once(':') {
        Some((name, _)) if name.contains(':') => (host, Cow::Owned(default_port.to_string())),
        Some((name, port)) if !port.is_empty() => (name, Cow::Borrowed(port)),
        Some((name, _)) => (name, Cow::Owned(default_port.to_string())),
        None => (host, Cow::Owned(default_port.to_string())),
    }
}

fn header_env_name(header: &str) -> String {
    let mut out = String::with_capacity(5 + header.len());
    out.push_str("HTTP_");
    for c in header.chars() {
        match c {
            '-' => out.push('_'),
            c => out.push(c.to_ascii_uppercase()),
        }
    }
    out
}

/// Builds the CGI environment for `req`. `path` is the decoded request path
/// (see [`decoded_path`]).
pub fn build_env(
    req: &Request<Body>,
    path: &str,
    conn: &ConnInfo,
    settings: &EnvSettings,
) -> CgiEnv {
    let mut env = CgiEnv::default();
    let headers = req.headers();
    let (script_name, path_info) = split_path(&settings.split_path, path);
    let root = settings.document_root.as_str();
    let default_port = if conn.tls { 443 } else { 80 };

    let host_header = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let (server_name, server_port) = split_host(host_header.as_str(), default_port);

    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|n| n.to_string())
        .unwrap_or_else(|| "0".to_string());
    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    env.set("REQUEST_METHOD", req.method().as_str());
    env.set("CONTENT_LENGTH", content_length);
    env.set(
        "CONTENT_TYPE",
        headers
            .get(CONTENT_TYPE)
            .map(|v| v.as_bytes().to_vec())
            .unwrap_or_default(),
    );
    env.set("GATEWAY_INTERFACE", "CGI/1.1");
    env.set("PATH_INFO", path_info.as_str());
    env.set("QUERY_STRING", req.uri().query().unwrap_or(""));
    if let Some(remote) = conn.remote_addr {
        let ip = remote.ip().to_canonical().to_string();
        env.set("REMOTE_ADDR", ip.as_str());
        env.set("REMOTE_HOST", ip.as_str());
        env.set("REMOTE_PORT", remote.port().to_string());
    }
    env.set("SCRIPT_NAME", script_name.as_str());
    env.set("SERVER_NAME", server_name);
    env.set("SERVER_PORT", &*server_port);
    env.set("SERVER_PROTOCOL", server_protocol(req.version()));
    env.set("SERVER_SOFTWARE", SERVER_SOFTWARE);
    env.set("DOCUMENT_ROOT", root);
    env.set("DOCUMENT_URI", format!("{}{}", script_name, path_info));
    env.set("HTTP_HOST", host_header.as_str());
    env.set("REQUEST_URI", request_uri);
    env.set("REQUEST_SCHEME", if conn.tls { "https" } else { "http" });
    if conn.tls {
        env.set("HTTPS", "on");
    }
    env.set("SCRIPT_FILENAME", join_root(root, &script_name));
    if !path_info.is_empty() {
        env.set("PATH_TRANSLATED", join_root(root, &path_info));
    }

    let skip = connection_tokens(headers);
    for name in headers.keys() {
        let name = name.as_str();
        if name == "content-type" || name == "content-length" {
            continue;
        }
        if is_hop_by_hop_header(name) || skip.contains(name) {
            continue;
        }
        let mut joined: Vec<u8> = Vec::new();
        for (i, value) in headers.get_all(name).iter().enumerate() {
            if i > 0 {
                joined.extend_from_slice(b", ");
            }
            joined.extend_from_slice(value.as_bytes());
        }
        env.set_default(&header_env_name(name), joined);
    }

    for (key, value) in &settings.overrides {
        env.set(key, value.as_str());
    }
    env
}
