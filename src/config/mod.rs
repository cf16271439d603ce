use std::env;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::logging::LogLevel;

pub const CONFIG_FILE_NAME: &str = "gateway.toml";
pub const HOME_ENV_VAR: &str = "SESSION_LAYER_HOME";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub servers: Vec<ServerEntry>,
    pub users: Vec<UserEntry>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub human_friendly: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub spawn_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            spawn_interval_ms: 1_000,
            drain_timeout_ms: 5_000,
            connect_timeout_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    pub address: String,
    pub port: u16,
    pub retry_attempts: u32,
    pub retry_interval_seconds: u64,
    pub home_path: String,
}

#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct UserEntry {
    pub name: String,
    pub password: String,
    pub max_connections: usize,
}

impl fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserEntry")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl AppConfig {
    /// Resolves the config file and applies `--section.key value` overrides.
    ///
    /// A leading `--config <path>` pair selects the file explicitly; otherwise
    /// `$SESSION_LAYER_HOME/Conf/gateway.toml` and then `./gateway.toml` are
    /// tried.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();
        let explicit = if args.first().map(String::as_str) == Some("--config") {
            if args.len() < 2 {
                return Err(ConfigError::MissingValueForArg {
                    key: "config".to_owned(),
                });
            }
            let path = args.remove(1);
            args.remove(0);
            Some(PathBuf::from(path))
        } else {
            None
        };

        let path = match explicit {
            Some(path) => path,
            None => discover_config_path(env::var_os(HOME_ENV_VAR).map(PathBuf::from))?,
        };

        Self::load_from_toml_with_args(path, args)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let display_path = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: display_path.clone(),
            source,
        })?;

        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: display_path,
                    source,
                })?;

        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if LogLevel::from_config_value(&self.logging.level).is_none() {
            return Err(ConfigError::Invalid {
                key: "logging.level".to_owned(),
                reason: format!(
                    "unknown level '{}'; allowed values: error, warn, info, debug, verbose",
                    self.logging.level
                ),
            });
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid {
                key: "servers".to_owned(),
                reason: "at least one [[servers]] entry is required".to_owned(),
            });
        }
        for (index, server) in self.servers.iter().enumerate() {
            if server.address.parse::<IpAddr>().is_err() {
                return Err(ConfigError::Invalid {
                    key: format!("servers[{index}].address"),
                    reason: format!("'{}' is not an IP address", server.address),
                });
            }
            if server.port == 0 {
                return Err(ConfigError::Invalid {
                    key: format!("servers[{index}].port"),
                    reason: "port must be non-zero".to_owned(),
                });
            }
        }
        if self.users.is_empty() {
            return Err(ConfigError::Invalid {
                key: "users".to_owned(),
                reason: "at least one [[users]] entry is required".to_owned(),
            });
        }
        for (index, user) in self.users.iter().enumerate() {
            if user.name.is_empty() {
                return Err(ConfigError::Invalid {
                    key: format!("users[{index}].name"),
                    reason: "user name must not be empty".to_owned(),
                });
            }
            if user.max_connections == 0 {
                return Err(ConfigError::Invalid {
                    key: format!("users[{index}].max_connections"),
                    reason: "max_connections must be at least 1".to_owned(),
                });
            }
        }
        Ok(())
    }
}

fn discover_config_path(home: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    let mut candidates = Vec::with_capacity(2);
    if let Some(home) = home {
        candidates.push(home.join("Conf").join(CONFIG_FILE_NAME));
    }
    candidates.push(PathBuf::from(CONFIG_FILE_NAME));

    candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .cloned()
        .ok_or_else(|| ConfigError::NotFound {
            searched: candidates
                .iter()
                .map(|candidate| candidate.to_string_lossy().to_string())
                .collect(),
        })
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    NotFound {
        searched: Vec<String>,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    Invalid {
        key: String,
        reason: String,
    },
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::NotFound { searched } => {
                write!(f, "no config file found; searched: {}", searched.join(", "))
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::Invalid { key, reason } => write!(f, "invalid config value '{key}': {reason}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let key = match arg.strip_prefix("--") {
            Some(stripped) if !stripped.is_empty() => stripped.to_owned(),
            _ => return Err(ConfigError::InvalidArgFormat { arg }),
        };

        let value = iter
            .next()
            .ok_or_else(|| ConfigError::MissingValueForArg { key: key.clone() })?;
        parsed.push((key, value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for part in &parts {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*part)
            .ok_or_else(unknown)?;
    }

    let parsed = typed_like(key_path, raw_value, current)?;
    *current = parsed;
    Ok(())
}

fn typed_like(key_path: &str, raw_value: &str, current: &Value) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
