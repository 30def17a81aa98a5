//! Controller configuration
//!
//! A JSON key-value store. The base file is merged with an optional
//! `local.json` next to it (machine-specific overrides such as the secret
//! key), and top-level keys can be overridden from the environment.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// File name of the local override file, stored next to the base config
pub const LOCAL_CONFIG_FILE: &str = "local.json";

/// Prefix of environment variables that override top-level config keys
pub const ENV_PREFIX: &str = "FIELDRELAY_";

/// Config shared between components; updated at runtime by `set_config`
pub type SharedConfig = Arc<RwLock<Config>>;

/// Errors loading or saving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("unable to load config file {path}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Config file is not valid JSON
    #[error("unable to parse config file {path}: {source}")]
    Parse {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },

    /// Config root is not an object
    #[error("config root must be a JSON object")]
    NotAnObject,

    /// Config has no file to write `local.json` next to
    #[error("config was not loaded from a file; nowhere to save local entries")]
    NoSourceFile,

    /// Local override file could not be written
    #[error("unable to write config file {path}: {source}")]
    Write {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

/// Controller configuration values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    values: Map<String, Value>,
    source: Option<PathBuf>,
}

impl Config {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from a JSON object
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(values) => Ok(Self {
                values,
                source: None,
            }),
            _ => Err(ConfigError::NotAnObject),
        }
    }

    /// Load a config file, merge `local.json` over it, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_value(read_json(path)?)?;
        config.source = Some(path.to_path_buf());

        if let Some(local_path) = config.local_path() {
            if local_path.exists() {
                if let Value::Object(local) = read_json(&local_path)? {
                    config.merge(&local);
                }
            }
        }

        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    /// Path of the file this config was loaded from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Path of the local override file
    pub fn local_path(&self) -> Option<PathBuf> {
        self.source.as_ref().map(|p| {
            p.parent()
                .unwrap_or_else(|| Path::new(""))
                .join(LOCAL_CONFIG_FILE)
        })
    }

    /// Look up a value; `serial.port` finds either a literal top-level key
    /// or the `port` entry of the `serial` object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.values.get(key) {
            return Some(v);
        }
        let mut parts = key.split('.');
        let mut current = self.values.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// String value (numbers are not converted)
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Boolean value; accepts JSON booleans, 0/1 and "true"/"false" strings
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => default,
            },
            _ => default,
        }
    }

    /// Numeric value; numeric strings are parsed
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Unsigned integer value; numeric strings are parsed
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// List of strings; a comma-separated string is split
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            Some(other) => vec![value_to_string(other)],
            None => Vec::new(),
        }
    }

    /// Set a value; dotted keys create nested objects
    pub fn set(&mut self, key: &str, value: Value) {
        let mut parts: Vec<&str> = key.split('.').collect();
        let last = parts.pop().unwrap_or(key);
        let mut current = &mut self.values;
        for part in parts {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just made an object"),
            };
        }
        current.insert(last.to_string(), value);
    }

    /// Merge entries recursively: nested objects merge key by key, other values replace
    pub fn merge(&mut self, other: &Map<String, Value>) {
        merge_maps(&mut self.values, other);
    }

    /// Apply `FIELDRELAY_<KEY>` overrides to top-level keys
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(ENV_PREFIX) {
                if !key.is_empty() {
                    self.values
                        .insert(key.to_ascii_lowercase(), Value::String(value));
                }
            }
        }
    }

    /// Merge entries into `local.json` (creating it if needed) and into this config
    pub fn save_local(&mut self, entries: &Map<String, Value>) -> Result<(), ConfigError> {
        let path = self.local_path().ok_or(ConfigError::NoSourceFile)?;
        let mut local = if path.exists() {
            match read_json(&path)? {
                Value::Object(map) => map,
                _ => Map::new(),
            }
        } else {
            Map::new()
        };
        merge_maps(&mut local, entries);

        let text = serde_json::to_string_pretty(&Value::Object(local))
            .map_err(|e| ConfigError::Parse {
                path: path.clone(),
                source: e,
            })?;
        fs::write(&path, text).map_err(|e| ConfigError::Write {
            path: path.clone(),
            source: e,
        })?;

        self.merge(entries);
        Ok(())
    }

    /// Entries for display, with secrets shortened to their first and last three characters
    pub fn display_entries(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| {
                let shown = if k.contains("secret_key") {
                    redact(&value_to_string(v))
                } else {
                    value_to_string(v)
                };
                (k.clone(), shown)
            })
            .collect()
    }

    /// All top-level entries
    pub fn entries(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Wrap into a shared handle
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn merge_maps(base: &mut Map<String, Value>, other: &Map<String, Value>) {
    for (key, new_value) in other {
        match (base.get_mut(key), new_value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_maps(existing, incoming)
            }
            _ => {
                base.insert(key.clone(), new_value.clone());
            }
        }
    }
}

/// Render a value the way it would appear in a config file
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Shorten a secret to its first and last three characters
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 6 {
        return "...".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{}...{}", head, tail)
}
