//! Parsing of the textual configuration surface.
//!
//! Components take `key=value;key=value` strings, binaries take a JSON file
//! with those same strings as overrides.

use std::{
    collections::BTreeMap,
    error::Error,
    fmt::{self, Display},
    fs, io,
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
    str::FromStr,
};

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Ordered `key=value` options.
pub type StringMap = BTreeMap<String, String>;

/// The specific result type for configuration parsing.
pub type Result<T> = std::result::Result<T, ConfigErr>;

/// Error returned whenever a configuration can't be parsed or has unknown or invalid entries.
#[derive(Debug)]
pub enum ConfigErr {
    Malformed(String),
    UnknownKey(String),
    InvalidValue { key: String, value: String },
    Json(serde_json::Error),
    Io(io::Error),
}

impl Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(entry) => write!(f, "malformed config entry {entry:?}"),
            Self::UnknownKey(key) => write!(f, "unknown config key {key:?}"),
            Self::InvalidValue { key, value } => write!(f, "invalid value {value:?} for {key:?}"),
            Self::Json(e) => write!(f, "invalid config: {e}"),
            Self::Io(e) => write!(f, "can't read config: {e}"),
        }
    }
}

impl Error for ConfigErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<io::Error> for ConfigErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ConfigErr> for io::Error {
    fn from(value: ConfigErr) -> Self {
        match value {
            ConfigErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        }
    }
}

/// Parses a `key=value;key=value` string.
///
/// Empty entries are skipped and whitespace around keys and values is trimmed.
///
/// # Arguments
/// * `text` - The configuration string.
///
/// # Returns
/// The parsed options or `ConfigErr::Malformed` if an entry has no `=` or an empty key.
pub fn parse_config(text: &str) -> Result<StringMap> {
    let mut config = StringMap::new();

    for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((k, v)) = entry.split_once('=') else {
            return Err(ConfigErr::Malformed(entry.to_string()));
        };

        let k = k.trim();
        if k.is_empty() {
            return Err(ConfigErr::Malformed(entry.to_string()));
        }

        config.insert(k.to_string(), v.trim().to_string());
    }

    Ok(config)
}

/// Parses a single option value.
///
/// # Arguments
/// * `key` - The option's key, used for the error.
/// * `value` - The textual value.
///
/// # Returns
/// The parsed value or `ConfigErr::InvalidValue`.
pub fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| ConfigErr::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parses a `;` separated list of socket addresses.
///
/// # Arguments
/// * `text` - Something like `10.0.0.1:9000;10.0.0.2:9000`.
///
/// # Returns
/// The resolved addresses in the given order.
pub fn parse_endpoints(text: &str) -> Result<Vec<SocketAddr>> {
    text.split(';')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|endpoint| {
            endpoint
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| ConfigErr::InvalidValue {
                    key: "endpoint".to_string(),
                    value: endpoint.to_string(),
                })
        })
        .collect()
}

/// Loads a JSON configuration and applies `key=value` overrides on top of it.
///
/// Override values are taken as JSON when they parse as such and as plain
/// strings otherwise, so `thread=4;listen=0.0.0.0:9000` works as expected.
///
/// # Arguments
/// * `path` - An optional JSON file, missing means every field takes its default.
/// * `overrides` - A `key=value;key=value` string.
///
/// # Returns
/// The configuration or a `ConfigErr`, unknown keys are rejected by `T`'s deserializer.
pub fn load<T: DeserializeOwned>(path: Option<&Path>, overrides: &str) -> Result<T> {
    let mut root = match path {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => Value::Object(Default::default()),
    };

    let Value::Object(fields) = &mut root else {
        return Err(ConfigErr::Malformed("the config root must be an object".to_string()));
    };

    for (k, v) in parse_config(overrides)? {
        let value = serde_json::from_str(&v).unwrap_or(Value::String(v));
        fields.insert(k, value);
    }

    Ok(serde_json::from_value(root)?)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[test]
    fn parse_config_trims_and_skips_empty() {
        let config = parse_config(" alpha = 0.1 ;; beta=2;").unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config["alpha"], "0.1");
        assert_eq!(config["beta"], "2");
    }

    #[test]
    fn parse_config_rejects_malformed_entries() {
        assert!(matches!(parse_config("alpha"), Err(ConfigErr::Malformed(_))));
        assert!(matches!(parse_config("=1"), Err(ConfigErr::Malformed(_))));
    }

    #[test]
    fn parse_value_reports_key() {
        let err = parse_value::<f32>("alpha", "fast").unwrap_err();
        assert!(matches!(err, ConfigErr::InvalidValue { key, .. } if key == "alpha"));
    }

    #[test]
    fn parse_endpoints_keeps_order() {
        let endpoints = parse_endpoints("127.0.0.1:9001; 127.0.0.1:9000").unwrap();
        assert_eq!(endpoints[0].port(), 9001);
        assert_eq!(endpoints[1].port(), 9000);
        assert!(parse_endpoints("nowhere").is_err());
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        #[serde(default)]
        thread: usize,
        #[serde(default)]
        name: String,
        #[serde(default)]
        shuffle: bool,
    }

    #[test]
    fn load_applies_overrides() {
        let sample: Sample = load(None, "thread=4;name=ps-0;shuffle=true").unwrap();
        assert_eq!(sample.thread, 4);
        assert_eq!(sample.name, "ps-0");
        assert!(sample.shuffle);
    }

    #[test]
    fn load_rejects_unknown_keys() {
        assert!(matches!(load::<Sample>(None, "threads=4"), Err(ConfigErr::Json(_))));
    }
}
