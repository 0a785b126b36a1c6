use std::time::{Duration, SystemTime, UNIX_EPOCH};

use genq_contracts::{Granularity, fingerprint};
use serde::Deserialize;

pub const MAX_TOLERANCE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessKeysFile {
    #[serde(default)]
    full_access_keys: Vec<String>,
    #[serde(default)]
    aggregated_data_access_keys: Vec<String>,
}

/// Secret labels from which the rotating access keys are derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeys {
    full: Vec<String>,
    aggregated: Vec<String>,
}

impl AccessKeys {
    pub fn new(full: Vec<String>, aggregated: Vec<String>) -> Result<Self, AuthError> {
        let full = normalize_secrets(full, "fullAccessKeys")?;
        let aggregated = normalize_secrets(aggregated, "aggregatedDataAccessKeys")?;

        if full.is_empty() && aggregated.is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "access keys file must declare at least one key".to_string(),
            });
        }

        if let Some(shared) = full.iter().find(|k| aggregated.binary_search(*k).is_ok()) {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: format!("access key `{shared}` is declared as both full and aggregated"),
            });
        }

        Ok(Self { full, aggregated })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, AuthError> {
        let file = serde_json::from_str::<AccessKeysFile>(raw).map_err(|e| AuthError {
            code: "ERR_INVALID_CONFIG",
            message: format!("access keys file is not valid JSON: {e}"),
        })?;
        Self::new(file.full_access_keys, file.aggregated_data_access_keys)
    }
}

fn normalize_secrets(secrets: Vec<String>, key: &str) -> Result<Vec<String>, AuthError> {
    let mut out = Vec::with_capacity(secrets.len());
    for secret in secrets {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: format!("`{key}` must not contain blank entries"),
            });
        }
        out.push(secret.to_string());
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// The credential a client presents for `secret` at `epoch_second`.
pub fn derive_access_key(secret: &str, epoch_second: i64) -> String {
    fingerprint::sha256_hex(format!("{secret}:{epoch_second}").as_bytes())
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Checks presented credentials against every secret over the window
/// `[now - tolerance, now]`.
#[derive(Debug, Clone)]
pub struct AccessKeyValidator {
    keys: AccessKeys,
    tolerance_secs: i64,
}

impl AccessKeyValidator {
    pub fn new(keys: AccessKeys, tolerance: Duration) -> Result<Self, AuthError> {
        if tolerance > MAX_TOLERANCE {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: format!(
                    "access key tolerance must be at most {}s",
                    MAX_TOLERANCE.as_secs()
                ),
            });
        }
        Ok(Self {
            keys,
            tolerance_secs: tolerance.as_secs() as i64,
        })
    }

    /// Granularity unlocked by `presented`, or `None` if it matches no secret
    /// in the window. Full-access secrets are checked first.
    pub fn granularity_for(&self, presented: &str, now: i64) -> Option<Granularity> {
        let presented = presented.trim();
        if !fingerprint::is_sha256_hex(presented) {
            return None;
        }

        let matches_any = |secrets: &[String]| {
            (now - self.tolerance_secs..=now).any(|epoch| {
                secrets
                    .iter()
                    .any(|secret| derive_access_key(secret, epoch) == presented)
            })
        };

        if matches_any(&self.keys.full) {
            Some(Granularity::Full)
        } else if matches_any(&self.keys.aggregated) {
            Some(Granularity::AggregateOnly)
        } else {
            None
        }
    }
}
