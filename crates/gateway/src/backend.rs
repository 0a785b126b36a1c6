use std::time::Duration;

use genq_contracts::{BackendInfo, BackendQuery};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;

pub const DATA_VERSION_HEADER: &str = "data-version";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Rows returned by the backend for one query, tagged with the dataset
/// generation that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub data_version: String,
    pub rows: Vec<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request timed out")]
    Timeout,
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend temporarily unavailable: {message}")]
    Unavailable {
        message: String,
        retry_after: Option<u64>,
    },
    #[error("backend returned status {status} ({error}): {message}")]
    BadStatus {
        status: u16,
        error: String,
        message: String,
    },
    #[error("backend returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn outcome(&self) -> &'static str {
        match self {
            BackendError::Timeout => "timeout",
            BackendError::Unreachable(_) => "unreachable",
            BackendError::Unavailable { .. } => "unavailable",
            BackendError::BadStatus { .. } => "bad_status",
            BackendError::InvalidResponse(_) => "invalid_response",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            BackendError::Timeout
        } else if value.is_decode() || value.is_body() {
            BackendError::InvalidResponse(value.to_string())
        } else {
            BackendError::Unreachable(value.to_string())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BackendErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct InfoBody {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::Unreachable(err.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Executes one compiled query. The body is newline-delimited JSON, one
    /// row per line.
    pub async fn query(
        &self,
        query: &BackendQuery,
        request_id: &str,
    ) -> Result<QueryResult, BackendError> {
        let result = self.query_inner(query, request_id).await;
        crate::metrics::observe_backend_call(
            "query",
            result.as_ref().map(|_| "ok").unwrap_or_else(|err| err.outcome()),
        );
        result
    }

    async fn query_inner(
        &self,
        query: &BackendQuery,
        request_id: &str,
    ) -> Result<QueryResult, BackendError> {
        let resp = self
            .http
            .post(format!("{}/query", self.base_url))
            .header(REQUEST_ID_HEADER, request_id)
            .json(&query.to_json())
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let data_version = data_version(resp.headers()).ok_or_else(|| {
            BackendError::InvalidResponse(format!("missing {} header", DATA_VERSION_HEADER))
        })?;
        let body = resp.text().await?;

        let rows = body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str::<serde_json::Value>(line).map_err(|err| {
                    BackendError::InvalidResponse(format!("row {}: {}", idx + 1, err))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QueryResult { data_version, rows })
    }

    /// Reads the backend's current data version.
    pub async fn info(&self, request_id: Option<&str>) -> Result<BackendInfo, BackendError> {
        let result = self.info_inner(request_id).await;
        crate::metrics::observe_backend_call(
            "info",
            result.as_ref().map(|_| "ok").unwrap_or_else(|err| err.outcome()),
        );
        result
    }

    async fn info_inner(&self, request_id: Option<&str>) -> Result<BackendInfo, BackendError> {
        let mut req = self.http.get(format!("{}/info", self.base_url));
        if let Some(request_id) = request_id {
            req = req.header(REQUEST_ID_HEADER, request_id);
        }
        let resp = check_status(req.send().await?).await?;

        let data_version = data_version(resp.headers()).ok_or_else(|| {
            BackendError::InvalidResponse(format!("missing {} header", DATA_VERSION_HEADER))
        })?;
        // The body is optional; older backends answer with an empty one.
        let body = resp.text().await?;
        let backend_version = serde_json::from_str::<InfoBody>(&body)
            .ok()
            .and_then(|info| info.version)
            .filter(|v| !v.trim().is_empty());

        Ok(BackendInfo {
            data_version,
            backend_version,
        })
    }
}

fn data_version(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DATA_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = resp
        .json::<BackendErrorBody>()
        .await
        .unwrap_or_default();

    if status == StatusCode::SERVICE_UNAVAILABLE {
        let message = if body.message.is_empty() {
            "backend is currently unavailable".to_string()
        } else {
            body.message
        };
        return Err(BackendError::Unavailable {
            message,
            retry_after,
        });
    }

    Err(BackendError::BadStatus {
        status: status.as_u16(),
        error: body.error,
        message: body.message,
    })
}
