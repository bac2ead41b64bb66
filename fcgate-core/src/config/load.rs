use crate::envsubst::expand_env;
use anyhow::{anyhow, Context, Result};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::types::Config;
use super::validate::validate_config;

const INCLUDE_KEY: &str = "include";
const SERVICES_KEY: &str = "services";

pub fn load_config(path: &Path) -> Result<Config> {
    load_configs(&[path.to_path_buf()])
}

pub fn load_config_with_sources(path: &Path) -> Result<(Config, Vec<PathBuf>)> {
    load_configs_with_sources(&[path.to_path_buf()])
}

/// Loads and merges several config files; later files override earlier ones.
pub fn load_configs(paths: &[PathBuf]) -> Result<Config> {
    load_configs_with_sources(paths).map(|(config, _)| config)
}

/// Like [`load_configs`], also returning every file that contributed
/// (includes too) so the daemon can watch them for changes.
pub fn load_configs_with_sources(paths: &[PathBuf]) -> Result<(Config, Vec<PathBuf>)> {
    if paths.is_empty() {
        return Err(anyhow!("no config files given"));
    }
    let mut loader = ConfigLoader::default();
    let mut document = Value::Mapping(Mapping::new());
    for path in paths {
        let layer = loader.load_file(path)?;
        document = overlay(document, layer);
    }
    let label = paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let config = deserialize_strict(document, label.as_str())?;
    validate_config(&config)?;
    Ok((config, loader.sources))
}

fn deserialize_strict(document: Value, label: &str) -> Result<Config> {
    use serde::de::IntoDeserializer;

    let mut unknown = Vec::new();
    let config: Config =
        serde_ignored::deserialize(document.into_deserializer(), |path| {
            unknown.push(path.to_string())
        })
        .with_context(|| format!("failed to deserialize config: {}", label))?;
    if unknown.is_empty() {
        return Ok(config);
    }
    unknown.sort();
    unknown.dedup();
    Err(anyhow!(
        "unknown config keys (fix typos to avoid unexpected defaults): {}",
        unknown.join(", ")
    ))
}

#[derive(Default)]
struct ConfigLoader {
    /// Files currently being expanded, outermost first.
    open: Vec<PathBuf>,
    sources: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Reads one file, expands `${VAR}` placeholders, and folds its includes
    /// in before its own keys.
    fn load_file(&mut self, path: &Path) -> Result<Value> {
        let canonical = fs::canonicalize(path)
            .with_context(|| format!("config not found: {}", path.display()))?;
        if self.open.contains(&canonical) {
            return Err(anyhow!(
                "config include loop detected at {}",
                canonical.display()
            ));
        }
        if !self.sources.contains(&canonical) {
            self.sources.push(canonical.clone());
        }

        let raw = fs::read_to_string(&canonical)
            .with_context(|| format!("failed to read config: {}", canonical.display()))?;
        let expanded = expand_env(&raw)
            .with_context(|| format!("env expansion failed for {}", canonical.display()))?;
        let mut document: Value = serde_yaml::from_str(&expanded)
            .with_context(|| format!("yaml parse failed for {}", canonical.display()))?;

        let includes = match &mut document {
            Value::Mapping(map) => map.remove(INCLUDE_KEY),
            _ => None,
        };
        let Some(includes) = includes else {
            return Ok(document);
        };
        let Value::Sequence(includes) = includes else {
            return Err(anyhow!(
                "include must be a list of paths in {}",
                canonical.display()
            ));
        };

        let base_dir = canonical.parent().unwrap_or(Path::new(".")).to_path_buf();
        self.open.push(canonical);
        let mut merged = Value::Mapping(Mapping::new());
        for entry in includes {
            let Value::String(relative) = entry else {
                self.open.pop();
                return Err(anyhow!("include entries must be strings"));
            };
            let layer = match self.load_file(&base_dir.join(relative)) {
                Ok(layer) => layer,
                Err(err) => {
                    self.open.pop();
                    return Err(err);
                }
            };
            merged = overlay(merged, layer);
        }
        self.open.pop();
        Ok(overlay(merged, document))
    }
}

/// Mappings merge key by key. The top-level `services` list merges by service
/// name, so an overlay can redefine one service without restating the rest.
/// Every other value is replaced wholesale.
fn overlay(base: Value, top: Value) -> Value {
    match (base, top) {
        (Value::Mapping(mut base), Value::Mapping(top)) => {
            for (key, value) in top {
                let next = match (base.remove(&key), key.as_str()) {
                    (Some(Value::Sequence(old)), Some(SERVICES_KEY)) => match value {
                        Value::Sequence(new) => Value::Sequence(merge_services(old, new)),
                        other => other,
                    },
                    (Some(existing), _) => overlay(existing, value),
                    (None, _) => value,
                };
                base.insert(key, next);
            }
            Value::Mapping(base)
        }
        (_, top) => top,
    }
}

fn merge_services(mut services: Vec<Value>, overrides: Vec<Value>) -> Vec<Value> {
    for service in overrides {
        let name = service.get("name").and_then(Value::as_str).map(str::to_owned);
        let existing = name.as_deref().and_then(|name| {
            services
                .iter()
                .position(|s| s.get("name").and_then(Value::as_str) == Some(name))
        });
        match existing {
            Some(idx) => services[idx] = service,
            None => services.push(service),
        }
    }
    services
}
