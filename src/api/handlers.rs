//! Route handlers

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info_span, Instrument};

use super::errors::ApiErrorResponse;
use super::server::AppState;
use crate::config::StreamConfig;
use crate::error::MeteringError;
use crate::logging::RequestId;
use crate::metrics;
use crate::quota::{HealthReport, HealthStatus, QuotaStats};
use crate::stream::{StreamOptions, TokenSink};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const STOP_TOKEN_HEADER: &str = "x-stop-token";
pub const SEED_HEADER: &str = "x-seed";
pub const MAX_TOKENS_HEADER: &str = "x-max-tokens";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Chunks buffered between the session and the response body
const STREAM_BUFFER: usize = 16;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, MeteringError> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(|s| Some(s.trim()))
            .map_err(|_| MeteringError::Validation(format!("{} header is not valid text", name))),
        None => Ok(None),
    }
}

/// Required, non-empty `X-User-Id`
pub fn parse_user_id(headers: &HeaderMap) -> Result<String, MeteringError> {
    match header_str(headers, USER_ID_HEADER)? {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(MeteringError::Validation(
            "X-User-Id header is required".to_string(),
        )),
    }
}

/// Signed 64-bit seeds are accepted and reinterpreted as unsigned
fn parse_seed(raw: &str) -> Result<u64, MeteringError> {
    raw.parse::<i64>()
        .map(|seed| seed as u64)
        .or_else(|_| raw.parse::<u64>())
        .map_err(|_| MeteringError::Validation(format!("X-Seed must be an integer, got {:?}", raw)))
}

/// Build stream options from request headers
pub fn parse_stream_options(
    headers: &HeaderMap,
    defaults: &StreamConfig,
) -> Result<StreamOptions, MeteringError> {
    let mut options = defaults.default_options();

    options.stop_token = header_str(headers, STOP_TOKEN_HEADER)?
        .filter(|token| !token.is_empty())
        .map(str::to_string);

    if let Some(raw) = header_str(headers, SEED_HEADER)?.filter(|s| !s.is_empty()) {
        options.seed = Some(parse_seed(raw)?);
    }

    if let Some(raw) = header_str(headers, MAX_TOKENS_HEADER)?.filter(|s| !s.is_empty()) {
        let max = raw.parse::<u64>().ok().filter(|max| *max > 0).ok_or_else(|| {
            MeteringError::Validation(format!("X-Max-Tokens must be a positive integer, got {:?}", raw))
        })?;
        options.max_tokens = Some(max);
    }

    Ok(options)
}

/// `POST /generate-data`: stream paced tokens and charge them to the caller
pub async fn generate_data(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = RequestId::new();

    let parsed = parse_user_id(&headers)
        .and_then(|user_id| Ok((user_id, parse_stream_options(&headers, &state.stream)?)));
    let (user_id, options) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => return ApiErrorResponse(e).into_response(),
    };

    let span = info_span!("generate", request_id = %request_id, user_id = %user_id);
    let admitted = match state
        .coordinator
        .begin(&user_id, options)
        .instrument(span.clone())
        .await
    {
        Ok(admitted) => admitted,
        Err(e) => return ApiErrorResponse(e).into_response(),
    };

    // Dropping the body (client disconnect) closes the sink, which ends the session
    let (sink, rx) = TokenSink::channel(STREAM_BUFFER);
    let cancel = state.shutdown.child_token();
    span.in_scope(|| admitted.spawn(sink, cancel));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));

    let mut response = Response::new(body);
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response_headers.insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// `GET /user/stats`: quota inspection
pub async fn user_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QuotaStats>, ApiErrorResponse> {
    let user_id = parse_user_id(&headers)?;
    let stats = state
        .coordinator
        .ledger()
        .stats(&user_id)
        .await
        .map_err(|e| {
            error!(user_id = %user_id, error = %e, "Failed to read user stats");
            MeteringError::from(e)
        })?;
    Ok(Json(stats))
}

/// `GET /health`: 200 unless both dependencies are down
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.coordinator.ledger().health().await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

/// `GET /metrics`: Prometheus text exposition
pub async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}
