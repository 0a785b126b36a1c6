use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use genq_auth::{AccessKeyValidator, AccessKeys, MAX_TOLERANCE};
use genq_contracts::schema::{FieldSchema, OpennessLevel};

const MIN_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub backend_url: String,
    pub backend_timeout_ms: u64,
    pub schema_path: String,
    pub cache_enabled: bool,
    pub cache_max_entries: usize,
    pub version_poll_interval_ms: u64,
    pub access_keys_path: Option<String>,
    pub access_key_tolerance_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("GENQ_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("GENQ_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8090),
            "GENQ_BIND_ADDR",
        )?;

        let backend_url = require_nonempty(kv, "GENQ_BACKEND_URL")?;
        if !backend_url.starts_with("http://") && !backend_url.starts_with("https://") {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "GENQ_BACKEND_URL must be an http:// or https:// URL".to_string(),
            });
        }

        let backend_timeout_ms = parse_u64(
            kv.get("GENQ_BACKEND_TIMEOUT_MS"),
            60_000,
            "GENQ_BACKEND_TIMEOUT_MS",
        )?;
        if backend_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "GENQ_BACKEND_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let schema_path = require_nonempty(kv, "GENQ_SCHEMA_PATH")?;

        let cache_enabled = parse_bool(kv.get("GENQ_CACHE_ENABLED"), true, "GENQ_CACHE_ENABLED")?;
        let cache_max_entries = parse_usize(
            kv.get("GENQ_CACHE_MAX_ENTRIES"),
            50_000,
            "GENQ_CACHE_MAX_ENTRIES",
        )?;

        let version_poll_interval_ms = parse_u64(
            kv.get("GENQ_VERSION_POLL_INTERVAL_MS"),
            1000,
            "GENQ_VERSION_POLL_INTERVAL_MS",
        )?;
        if version_poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!(
                    "GENQ_VERSION_POLL_INTERVAL_MS must be >= {}",
                    MIN_POLL_INTERVAL_MS
                ),
            });
        }

        let access_keys_path = kv
            .get("GENQ_ACCESS_KEYS_PATH")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let access_key_tolerance_secs = parse_u64(
            kv.get("GENQ_ACCESS_KEY_TOLERANCE_SECS"),
            3,
            "GENQ_ACCESS_KEY_TOLERANCE_SECS",
        )?;
        if access_key_tolerance_secs > MAX_TOLERANCE.as_secs() {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!(
                    "GENQ_ACCESS_KEY_TOLERANCE_SECS must be <= {}",
                    MAX_TOLERANCE.as_secs()
                ),
            });
        }

        Ok(Self {
            bind_addr,
            backend_url,
            backend_timeout_ms,
            schema_path,
            cache_enabled,
            cache_max_entries,
            version_poll_interval_ms,
            access_keys_path,
            access_key_tolerance_secs,
        })
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn version_poll_interval(&self) -> Duration {
        Duration::from_millis(self.version_poll_interval_ms)
    }

    pub fn load_schema(&self) -> Result<FieldSchema, StartupError> {
        let raw = std::fs::read_to_string(&self.schema_path).map_err(|_| StartupError {
            code: "ERR_CONFIG_FILE_READ",
            message: format!("failed to read schema file at {}", self.schema_path),
        })?;
        FieldSchema::from_json_str(&raw).map_err(|err| StartupError {
            code: "ERR_INVALID_SCHEMA",
            message: err.to_string(),
        })
    }

    /// Builds the credential validator. Required for protected instances,
    /// ignored (with a warning) for open ones.
    pub fn load_access_validator(
        &self,
        openness: OpennessLevel,
    ) -> Result<Option<AccessKeyValidator>, StartupError> {
        let Some(path) = self.access_keys_path.as_deref() else {
            if openness == OpennessLevel::Protected {
                return Err(StartupError {
                    code: "ERR_MISSING_CONFIG",
                    message: "protected instances require GENQ_ACCESS_KEYS_PATH".to_string(),
                });
            }
            return Ok(None);
        };

        if openness == OpennessLevel::Open {
            tracing::warn!(path, "access keys configured for an open instance; ignoring");
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path).map_err(|_| StartupError {
            code: "ERR_CONFIG_FILE_READ",
            message: format!("failed to read access keys file at {}", path),
        })?;
        let keys = AccessKeys::from_json_str(&raw).map_err(|err| StartupError {
            code: err.code,
            message: err.message,
        })?;
        AccessKeyValidator::new(keys, Duration::from_secs(self.access_key_tolerance_secs))
            .map(Some)
            .map_err(|err| StartupError {
                code: err.code,
                message: err.message,
            })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;
    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &s[1..bytes.len() - 1];
        }
    }
    s
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    kv.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_bool(value: Option<&String>, default: bool, key: &'static str) -> Result<bool, StartupError> {
    let Some(value) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(default);
    };

    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be true or false", key),
        }),
    }
}
