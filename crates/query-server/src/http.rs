//! Statement result endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/v1/statement/executing/{query_id}/{slug}/{token}` | Fetch the page at `token` |
//! | `DELETE` | `/v1/statement/executing/{query_id}/{slug}/{token}` | Cancel the query |
//!
//! `GET` accepts `maxWait` (a duration such as `500ms` or `1.5s`) and
//! `targetResultSize` (a data size such as `4MB`). Session changes travel
//! in `X-Query-*` response headers next to the JSON body.

use crate::registry::QueryRegistry;
use crate::session::SessionDelta;
use axum::extract::{Path, Query as QueryParams, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use query_core::{QueryError, QueryId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

pub type AppState = Arc<QueryRegistry>;

pub const SET_CATALOG: &str = "x-query-set-catalog";
pub const SET_SCHEMA: &str = "x-query-set-schema";
pub const SET_PATH: &str = "x-query-set-path";
pub const SET_SESSION: &str = "x-query-set-session";
pub const CLEAR_SESSION: &str = "x-query-clear-session";
pub const SET_ROLE: &str = "x-query-set-role";
pub const ADDED_PREPARE: &str = "x-query-added-prepare";
pub const DEALLOCATED_PREPARE: &str = "x-query-deallocated-prepare";
pub const STARTED_TRANSACTION_ID: &str = "x-query-started-transaction-id";
pub const CLEAR_TRANSACTION_ID: &str = "x-query-clear-transaction-id";

/// Router serving the executing-statement resource
pub fn statement_router(registry: AppState) -> Router {
    Router::new()
        .route(
            "/v1/statement/executing/{query_id}/{slug}/{token}",
            get(get_results).delete(cancel_query),
        )
        .with_state(registry)
}

/// Serve `registry` on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    registry: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(address) = listener.local_addr() {
        tracing::info!("Statement resource listening on {}", address);
    }
    axum::serve(listener, statement_router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[derive(Debug, Default, Deserialize)]
struct ResultParams {
    #[serde(rename = "maxWait")]
    max_wait: Option<String>,
    #[serde(rename = "targetResultSize")]
    target_result_size: Option<String>,
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Query not found").into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn error_response(error: QueryError) -> Response {
    match error {
        QueryError::QueryNotFound(_) | QueryError::InvalidToken { .. } => not_found(),
        other => {
            tracing::warn!("Statement request failed: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

/// Query id and token from the path; `None` means the resource does not exist
fn parse_path(query_id: &str, token: &str) -> Option<(QueryId, u64)> {
    Some((query_id.parse().ok()?, token.parse().ok()?))
}

/// `GET`: wait for and return the page at `token`
async fn get_results(
    State(registry): State<AppState>,
    Path((query_id, slug, token)): Path<(String, String, String)>,
    QueryParams(params): QueryParams<ResultParams>,
    headers: HeaderMap,
) -> Response {
    let Some((query_id, token)) = parse_path(&query_id, &token) else {
        return not_found();
    };
    let max_wait = match params.max_wait.as_deref().map(parse_duration).transpose() {
        Ok(wait) => wait,
        Err(message) => return bad_request(message),
    };
    let target_size = match params
        .target_result_size
        .as_deref()
        .map(parse_data_size)
        .transpose()
    {
        Ok(size) => size,
        Err(message) => return bad_request(message),
    };
    let Some(base) = base_uri(&headers) else {
        return bad_request("invalid Host header".to_string());
    };

    match registry
        .wait_for_results(query_id, &slug, token, max_wait, target_size, &base)
        .await
    {
        Ok(page) => {
            let mut response = Json(page.results).into_response();
            add_session_headers(response.headers_mut(), &page.session);
            response
        }
        Err(error) => error_response(error),
    }
}

/// `DELETE`: cancel the query
async fn cancel_query(
    State(registry): State<AppState>,
    Path((query_id, slug, token)): Path<(String, String, String)>,
) -> Response {
    let Some((query_id, _)) = parse_path(&query_id, &token) else {
        return not_found();
    };
    match registry.cancel(query_id, &slug) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

/// Scheme and authority the client used to reach us
fn base_uri(headers: &HeaderMap) -> Option<Url> {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    Url::parse(&format!("{}://{}", scheme, host)).ok()
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn append(headers: &mut HeaderMap, name: &'static str, value: String) {
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.append(HeaderName::from_static(name), value);
        }
        Err(_) => tracing::warn!("Dropping session header {} with invalid value", name),
    }
}

/// Encode a session delta as `X-Query-*` headers
pub fn add_session_headers(headers: &mut HeaderMap, delta: &SessionDelta) {
    if let Some(catalog) = &delta.set_catalog {
        append(headers, SET_CATALOG, catalog.clone());
    }
    if let Some(schema) = &delta.set_schema {
        append(headers, SET_SCHEMA, schema.clone());
    }
    if let Some(path) = &delta.set_path {
        append(headers, SET_PATH, path.clone());
    }
    for (name, value) in &delta.set_session_properties {
        append(headers, SET_SESSION, format!("{}={}", name, urlencode(value)));
    }
    for name in &delta.reset_session_properties {
        append(headers, CLEAR_SESSION, name.clone());
    }
    for (catalog, role) in &delta.set_roles {
        append(headers, SET_ROLE, format!("{}={}", catalog, urlencode(role)));
    }
    for (name, statement) in &delta.added_prepared_statements {
        append(
            headers,
            ADDED_PREPARE,
            format!("{}={}", urlencode(name), urlencode(statement)),
        );
    }
    for name in &delta.deallocated_prepared_statements {
        append(headers, DEALLOCATED_PREPARE, urlencode(name));
    }
    if let Some(id) = &delta.started_transaction_id {
        append(headers, STARTED_TRANSACTION_ID, id.clone());
    }
    if delta.clear_transaction_id {
        append(headers, CLEAR_TRANSACTION_ID, "true".to_string());
    }
}

/// Split `"1.5s"` into `(1.5, "s")`
fn split_unit(input: &str) -> Result<(f64, &str), String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| format!("missing unit in '{}'", input))?;
    let (number, unit) = input.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid number in '{}'", input))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid value '{}'", input));
    }
    Ok((value, unit.trim()))
}

/// Parse a duration such as `250ms`, `1.5s` or `2m`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let (value, unit) = split_unit(input)?;
    let seconds = match unit {
        "ns" => 1e-9,
        "us" => 1e-6,
        "ms" => 1e-3,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3_600.0,
        "d" => 86_400.0,
        other => return Err(format!("unknown duration unit '{}'", other)),
    };
    Duration::try_from_secs_f64(value * seconds).map_err(|e| format!("invalid duration '{}': {}", input, e))
}

/// Parse a data size such as `512kB` or `1.5MB`; units are powers of 1024
pub fn parse_data_size(input: &str) -> Result<u64, String> {
    let (value, unit) = split_unit(input)?;
    let factor = match unit {
        "B" => 1u64,
        "kB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1 << 40,
        other => return Err(format!("unknown data size unit '{}'", other)),
    };
    let bytes = value * factor as f64;
    if bytes > u64::MAX as f64 {
        return Err(format!("data size '{}' is too large", input));
    }
    Ok(bytes.round() as u64)
}
