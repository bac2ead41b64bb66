use fcgate_core::config::StickyConfig;
use hyper::header::{HeaderValue, COOKIE};
use hyper::HeaderMap;

/// Sticky-session cookie policy: the cookie value names the handler that
/// served the first request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyCookie {
    pub name: String,
    pub secure: bool,
    pub http_only: bool,
}

impl StickyCookie {
    pub fn from_config(cfg: &StickyConfig) -> Self {
        Self {
            name: cfg.cookie.name.clone(),
            secure: cfg.cookie.secure,
            http_only: cfg.cookie.http_only,
        }
    }

    /// Value of this cookie in the request, if present.
    pub fn lookup<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|header| extract_cookie_by_name(header, self.name.as_str()))
    }

    /// `Set-Cookie` value pinning the client to `handler`. `None` when the
    /// handler name cannot be carried in a header.
    pub fn set_cookie(&self, handler: &str) -> Option<HeaderValue> {
        let mut value = format!("{}={}; Path=/", self.name, handler);
        if self.secure {
            value.push_str("; Secure");
        }
        if self.http_only {
            value.push_str("; HttpOnly");
        }
        HeaderValue::from_str(&value).ok()
    }
}

pub fn extract_cookie_by_name<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    for cookie in header.split(';') {
        let cookie = cookie.trim();
        if let Some(rest) = cookie.strip_prefix(name) {
            if let Some(value) = rest.strip_prefix('=') {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                return Some(value);
            }
        }
    }
    None
}
