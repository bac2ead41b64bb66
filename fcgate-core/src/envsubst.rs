use anyhow::{anyhow, Result};
use regex::Regex;
use std::env;
use std::sync::OnceLock;

fn placeholder_regex() -> Result<&'static Regex> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = RE.get() {
        return Ok(re);
    }
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}")?;
    Ok(RE.get_or_init(|| re))
}

/// Expands `${NAME}` and `${NAME:-fallback}` placeholders from the process
/// environment. A missing variable without a fallback is an error.
pub fn expand_env(input: &str) -> Result<String> {
    let re = placeholder_regex()?;
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            return Err(anyhow!("envsubst capture error"));
        };
        out.push_str(&input[last..whole.start()]);
        let key = key.as_str();
        let value = match env::var(key) {
            Ok(v) => v,
            Err(_) => match caps.get(2) {
                Some(fallback) => fallback.as_str().to_string(),
                None => return Err(anyhow!("missing environment variable: {}", key)),
            },
        };
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
