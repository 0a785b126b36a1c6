use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use genq_auth::{AccessKeyValidator, unix_now};
use genq_contracts::schema::FieldSchema;
use genq_contracts::{Order, OrderBy};
use genq_policy::{AccessPolicy, PolicyDecision, PolicyRequest};
use genq_query::{ActionKind, FilterCompiler, ORDER_BY_PROPERTY, QueryError, RequestFields};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::backend::{BackendClient, BackendError, REQUEST_ID_HEADER};
use crate::config::{GatewayConfig, StartupError};
use crate::query_cache::QueryCache;
use crate::version_poller::{PollerHandle, VersionPoller};

const SAMPLE_ROUTE: &str = "/sample/{action}";
const INFO_ROUTE: &str = "/sample/info";
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

#[derive(Clone)]
pub struct AppState {
    schema: Arc<FieldSchema>,
    policy: Arc<AccessPolicy>,
    backend: BackendClient,
    cache: QueryCache,
}

impl AppState {
    pub fn new(
        config: &GatewayConfig,
        schema: FieldSchema,
        validator: Option<AccessKeyValidator>,
    ) -> Result<Self, StartupError> {
        let schema = Arc::new(schema);
        let policy = AccessPolicy::new(schema.clone(), validator).map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: err.to_string(),
        })?;
        let backend = BackendClient::new(config.backend_url.clone(), config.backend_timeout())
            .map_err(|err| StartupError {
                code: "ERR_BACKEND_CLIENT",
                message: format!("failed to initialize backend client: {}", err),
            })?;

        Ok(Self {
            schema,
            policy: Arc::new(policy),
            backend,
            cache: QueryCache::new(config.cache_enabled, config.cache_max_entries),
        })
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn version_poller(&self, interval: Duration) -> VersionPoller {
        VersionPoller::new(self.backend.clone(), self.cache.clone(), interval)
    }
}

/// Loads schema and access keys, starts the data version poller and
/// returns the routes. The poller runs until its handle is shut down.
pub async fn router(config: GatewayConfig) -> Result<(Router, PollerHandle), StartupError> {
    let schema = config.load_schema()?;
    let validator = config.load_access_validator(schema.openness())?;
    tracing::info!(
        instance = schema.instance_name(),
        openness = ?schema.openness(),
        fields = schema.field_names().len(),
        "database schema loaded"
    );

    let state = AppState::new(&config, schema, validator)?;
    let poller = state
        .version_poller(config.version_poll_interval())
        .spawn();

    Ok((app(state), poller))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(INFO_ROUTE, get(sample_info))
        .route(SAMPLE_ROUTE, get(sample_get).post(sample_post))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("backend", state.backend.info(None).await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn sample_info(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = state
        .backend
        .info(Some(&request_id))
        .await
        .map_err(|err| backend_error_response(&err));

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => err.status,
    };
    crate::metrics::observe_http_request(INFO_ROUTE, "GET", status.as_u16(), started.elapsed());

    with_request_id(
        match result {
            Ok(info) => Json(info).into_response(),
            Err(err) => err.into_response(),
        },
        &request_id,
    )
}

async fn sample_get(
    State(state): State<AppState>,
    Path(action): Path<String>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Response {
    let fields = query
        .map(|Query(pairs)| RequestFields::from_pairs(pairs))
        .map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_QUERY",
                "malformed query string",
                false,
            )
        });
    execute(state, action, "GET", headers, fields).await
}

async fn sample_post(
    State(state): State<AppState>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let fields = body
        .map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_QUERY",
                "invalid JSON body",
                false,
            )
        })
        .and_then(|Json(body)| request_fields_from_json(body));
    execute(state, action, "POST", headers, fields).await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseInfo {
    data_version: String,
    request_id: String,
}

#[derive(Debug, Serialize)]
struct SampleResponse {
    data: Vec<serde_json::Value>,
    info: ResponseInfo,
}

async fn execute(
    state: AppState,
    action: String,
    method: &'static str,
    headers: HeaderMap,
    fields: Result<RequestFields, ApiError>,
) -> Response {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "query.execute",
        request_id = %request_id,
        action = %action,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
        cache = tracing::field::Empty,
    );

    let result = async {
        let kind = ActionKind::from_name(&action).ok_or_else(|| {
            json_error(
                StatusCode::NOT_FOUND,
                "ERR_UNKNOWN_ACTION",
                format!("unknown action '{}'", action),
                false,
            )
        })?;
        let fields = fields?;

        let query = FilterCompiler::new(&state.schema)
            .compile_request(kind, &fields)
            .map_err(|err| query_error_response(&err))?;

        let decision = state.policy.evaluate(
            PolicyRequest {
                action: &query.action,
                filter: &query.filter_expression,
                access_key: fields.access_key.as_deref(),
            },
            unix_now(),
        );
        crate::metrics::observe_policy_decision(decision.outcome());
        if let PolicyDecision::Denied(reason) = decision {
            return Err(json_error(
                StatusCode::FORBIDDEN,
                reason.code(),
                reason.message(),
                false,
            ));
        }

        let (result, cache_outcome) = state
            .cache
            .get_or_compute(&query.cache_key(), || {
                state.backend.query(&query, &request_id)
            })
            .await
            .map_err(|err| backend_error_response(&err))?;
        crate::metrics::observe_cache_lookup(cache_outcome.as_str());
        tracing::Span::current().record("cache", cache_outcome.as_str());

        Ok::<_, ApiError>(SampleResponse {
            data: result.rows.clone(),
            info: ResponseInfo {
                data_version: result.data_version.clone(),
                request_id: request_id.clone(),
            },
        })
    }
    .instrument(span.clone())
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => err.status,
    };
    let latency_ms = started.elapsed().as_millis() as u64;
    span.record("latency_ms", latency_ms);
    span.record(
        "outcome",
        match &result {
            Ok(_) => "ok",
            Err(err) => err.body.code.as_str(),
        },
    );
    crate::metrics::observe_http_request(SAMPLE_ROUTE, method, status.as_u16(), started.elapsed());

    let response = match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    };
    with_request_id(response, &request_id)
}

/// Flattens a JSON request body into request properties. Values may be
/// scalars or arrays of scalars; `orderBy` additionally accepts
/// `{field, type}` objects.
fn request_fields_from_json(body: serde_json::Value) -> Result<RequestFields, ApiError> {
    let serde_json::Value::Object(map) = body else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_QUERY",
            "request body must be a JSON object",
            false,
        ));
    };

    let mut fields = RequestFields::default();
    for (key, value) in map {
        if key.eq_ignore_ascii_case(ORDER_BY_PROPERTY) {
            for order_by in order_by_from_json(value)? {
                fields.push_order_by(order_by);
            }
            continue;
        }

        let values = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(|item| scalar_to_string(&key, item))
                .collect::<Result<Vec<_>, _>>()?,
            other => vec![scalar_to_string(&key, other)?],
        };
        fields.push(key, values);
    }
    Ok(fields)
}

fn scalar_to_string(key: &str, value: serde_json::Value) -> Result<String, ApiError> {
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_QUERY",
            format!("'{}' must be a string, number, boolean or a list of those", key),
            false,
        )),
    }
}

fn order_by_from_json(value: serde_json::Value) -> Result<Vec<OrderBy>, ApiError> {
    let invalid = || {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_QUERY",
            "orderBy entries must be field names or {\"field\", \"type\"} objects",
            false,
        )
    };

    let items = match value {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::String(raw) => out.extend(
                raw.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(|field| OrderBy {
                        field: field.to_string(),
                        order: Order::Ascending,
                    }),
            ),
            serde_json::Value::Object(obj) => {
                let field = obj
                    .get("field")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .ok_or_else(invalid)?;
                let order = match obj.get("type").and_then(|v| v.as_str()) {
                    None => Order::Ascending,
                    Some(t) if t.eq_ignore_ascii_case("ascending") => Order::Ascending,
                    Some(t) if t.eq_ignore_ascii_case("descending") => Order::Descending,
                    Some(_) => return Err(invalid()),
                };
                out.push(OrderBy {
                    field: field.to_string(),
                    order,
                });
            }
            _ => return Err(invalid()),
        }
    }
    Ok(out)
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
    retry_after: Option<u64>,
}

impl ApiError {
    fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.body.detail = Some(detail);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(secs) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
            detail: None,
        },
        retry_after: None,
    }
}

fn query_error_response(err: &QueryError) -> ApiError {
    if err.is_internal() {
        tracing::error!(error = %err, "query compilation invariant violated");
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "internal error while compiling the query",
            false,
        );
    }

    let error = json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_QUERY",
        err.to_string(),
        false,
    );
    match err {
        QueryError::Syntax { position, .. } => {
            error.with_detail(serde_json::json!({ "position": position }))
        }
        QueryError::Validation { field, .. } | QueryError::UnknownField { field, .. } => {
            error.with_detail(serde_json::json!({ "field": field }))
        }
        QueryError::MutationSyntax { token, .. } | QueryError::InsertionSyntax { token, .. } => {
            error.with_detail(serde_json::json!({ "token": token }))
        }
        QueryError::Internal(_) => error,
    }
}

fn backend_error_response(err: &BackendError) -> ApiError {
    tracing::warn!(error = %err, "backend call failed");
    match err {
        BackendError::Timeout => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "ERR_BACKEND_TIMEOUT",
            "backend did not answer in time",
            true,
        ),
        BackendError::Unavailable {
            message,
            retry_after,
        } => {
            let mut error = json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_BACKEND_UNAVAILABLE",
                format!("backend temporarily unavailable: {}", message),
                true,
            );
            error.retry_after = Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS));
            error
        }
        BackendError::Unreachable(_) => json_error(
            StatusCode::BAD_GATEWAY,
            "ERR_BACKEND_UNREACHABLE",
            "backend unreachable",
            false,
        ),
        BackendError::BadStatus { .. } | BackendError::InvalidResponse(_) => json_error(
            StatusCode::BAD_GATEWAY,
            "ERR_BACKEND_FAILED",
            "backend failed to process the query",
            false,
        ),
    }
}

#[cfg(test)]
mod tests {
    use genq_contracts::schema::SequenceKind;

    use super::*;

    #[test]
    fn json_body_flattens_scalars_and_lists() {
        let fields = request_fields_from_json(serde_json::json!({
            "country": ["Switzerland", "Germany"],
            "age": 42,
            "isReinfection": false,
            "division": null,
            "fields": ["date", "country"],
            "limit": 10,
            "accessKey": "abc"
        }))
        .unwrap();

        assert!(
            fields
                .filters
                .contains(&("country".to_string(), vec!["Switzerland".to_string(), "Germany".to_string()]))
        );
        assert!(fields.filters.contains(&("age".to_string(), vec!["42".to_string()])));
        assert!(
            fields
                .filters
                .contains(&("isReinfection".to_string(), vec!["false".to_string()]))
        );
        assert!(!fields.filters.iter().any(|(k, _)| k == "division"));
        assert_eq!(fields.fields, vec!["date", "country"]);
        assert_eq!(fields.limit.as_deref(), Some("10"));
        assert_eq!(fields.access_key.as_deref(), Some("abc"));
    }

    #[test]
    fn json_body_order_by_accepts_names_and_objects() {
        let fields = request_fields_from_json(serde_json::json!({
            "orderBy": ["date", {"field": "count", "type": "descending"}]
        }))
        .unwrap();
        assert_eq!(
            fields.order_by,
            vec![
                OrderBy {
                    field: "date".to_string(),
                    order: Order::Ascending
                },
                OrderBy {
                    field: "count".to_string(),
                    order: Order::Descending
                },
            ]
        );

        let err = request_fields_from_json(serde_json::json!({
            "orderBy": [{"field": "count", "type": "sideways"}]
        }))
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn json_body_rejects_nested_objects() {
        let err = request_fields_from_json(serde_json::json!({"country": {"eq": "CH"}}))
            .unwrap_err();
        assert_eq!(err.body.code, "ERR_INVALID_QUERY");

        let err = request_fields_from_json(serde_json::json!(["country"])).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn request_id_is_sanitized_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req <1>"));
        assert_eq!(extract_request_id(&headers), "req1");

        let generated = extract_request_id(&HeaderMap::new());
        assert!(generated.parse::<Ulid>().is_ok());

        let long = "a".repeat(200);
        assert_eq!(sanitize_request_id(&long).map(|s| s.len()), Some(64));
        assert_eq!(sanitize_request_id("<>"), None);
    }

    #[test]
    fn query_errors_map_to_bad_request_with_detail() {
        let err = query_error_response(&QueryError::Syntax {
            query: "300G &".to_string(),
            position: 6,
            message: "expected expression".to_string(),
        });
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.detail, Some(serde_json::json!({ "position": 6 })));

        let err = query_error_response(&QueryError::MutationSyntax {
            token: "23403Z".to_string(),
            kind: SequenceKind::Nucleotide,
        });
        assert_eq!(err.body.code, "ERR_INVALID_QUERY");
        assert!(!err.body.retryable);

        let err = query_error_response(&QueryError::Internal("stack".to_string()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body.code, "ERR_INTERNAL");
    }

    #[test]
    fn backend_errors_map_to_distinct_statuses() {
        let response = backend_error_response(&BackendError::Unavailable {
            message: "busy".to_string(),
            retry_after: Some(9),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("9"))
        );

        let response = backend_error_response(&BackendError::Unavailable {
            message: "busy".to_string(),
            retry_after: None,
        })
        .into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("5"))
        );

        assert_eq!(
            backend_error_response(&BackendError::Timeout).status,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            backend_error_response(&BackendError::Unreachable("refused".to_string())).body.code,
            "ERR_BACKEND_UNREACHABLE"
        );
        assert_eq!(
            backend_error_response(&BackendError::InvalidResponse("row 1".to_string())).status,
            StatusCode::BAD_GATEWAY
        );
    }
}
