//! Thin pass-through proxy over the upstream REST API (§6): quotes, bar
//! range queries, news, financials, etc. Responses are forwarded unchanged.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;

use super::GatewayState;

pub fn routes() -> Router<GatewayState> {
    Router::new()
        .route("/api/bars/latest", get(bars_latest))
        .route("/api/bars/:symbol", get(bars_for_symbol))
        .route("/api/bars/:symbol/range", get(bars_range))
        .route("/api/quote/:symbol", get(quote))
        .route("/api/profile/:symbol", get(profile))
        .route("/api/news/:symbol", get(news))
        .route("/api/financials/:symbol", get(financials))
        .route("/api/earnings/:symbol", get(earnings))
        .route("/api/dividends/:symbol", get(dividends))
}

async fn quote(State(state): State<GatewayState>, Path(symbol): Path<String>) -> impl IntoResponse {
    proxy_get(&state, &format!("/quote/{symbol}"), &HashMap::new()).await
}

async fn profile(State(state): State<GatewayState>, Path(symbol): Path<String>) -> impl IntoResponse {
    proxy_get(&state, &format!("/profile/{symbol}"), &HashMap::new()).await
}

async fn news(State(state): State<GatewayState>, Path(symbol): Path<String>) -> impl IntoResponse {
    proxy_get(&state, &format!("/news/{symbol}"), &HashMap::new()).await
}

async fn financials(State(state): State<GatewayState>, Path(symbol): Path<String>) -> impl IntoResponse {
    proxy_get(&state, &format!("/financials/{symbol}"), &HashMap::new()).await
}

async fn earnings(State(state): State<GatewayState>, Path(symbol): Path<String>) -> impl IntoResponse {
    proxy_get(&state, &format!("/earnings/{symbol}"), &HashMap::new()).await
}

async fn dividends(State(state): State<GatewayState>, Path(symbol): Path<String>) -> impl IntoResponse {
    proxy_get(&state, &format!("/dividends/{symbol}"), &HashMap::new()).await
}

async fn bars_latest(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    proxy_get(&state, "/bars/latest", &params).await
}

async fn bars_for_symbol(
    State(state): State<GatewayState>,
    Path(symbol): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    proxy_get(&state, &format!("/bars/{}", symbol), &params).await
}

async fn bars_range(
    State(state): State<GatewayState>,
    Path(symbol): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    proxy_get(&state, &format!("/bars/{}/range", symbol), &params).await
}

async fn proxy_get(
    state: &GatewayState,
    path: &str,
    params: &HashMap<String, String>,
) -> axum::response::Response {
    let Some(base) = &state.upstream_rest_base_url else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_REST_BASE_URL is not configured");
    };

    let url = format!("{}{}", base.trim_end_matches('/'), path);
    let response = state.http_client.get(&url).query(params).send().await;

    match response {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            match resp.json::<serde_json::Value>().await {
                Ok(body) => (status, Json(body)).into_response(),
                Err(_) => error_response(status, "upstream response was not valid JSON"),
            }
        }
        Err(e) if e.is_timeout() => error_response(StatusCode::GATEWAY_TIMEOUT, "upstream request timed out"),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, &format!("upstream request failed: {e}")),
    }
}

/// Uniform `{success:false, error}` envelope of §7 for proxy failures.
fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    let status = if matches!(
        status,
        StatusCode::BAD_REQUEST
            | StatusCode::NOT_FOUND
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    ) {
        status
    } else {
        StatusCode::BAD_GATEWAY
    };
    (
        status,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}
