pub const DEFAULT_SPLIT_PATH_REGEX: &str = r"^(.+\.php)(/.+)$";

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> String {
    "json".to_string()
}

pub(super) fn default_metrics_path() -> String {
    "/metrics".to_string()
}

pub(super) fn default_metrics_max_concurrent_connections() -> usize {
    8
}

pub(super) fn default_header_read_timeout_ms() -> u64 {
    10_000
}

pub(super) fn default_max_connections() -> usize {
    4096
}

pub(super) fn default_fastcgi_io_timeout_ms() -> u64 {
    60_000
}

pub(super) fn default_fastcgi_acquire_timeout_ms() -> u64 {
    4_000
}

pub(super) fn default_fastcgi_max_conns() -> usize {
    32
}

pub(super) fn default_weight() -> u32 {
    1
}

pub(super) fn default_sticky_cookie_name() -> String {
    "_fcgate_sticky".to_string()
}
