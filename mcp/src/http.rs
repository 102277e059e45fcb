//! MCP over HTTP: one JSON-RPC message or batch per `POST /mcp`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use instantly_mcp_runtime::rpc::{RpcError, error_response};
use instantly_mcp_runtime::{
    HttpMcpRequestConfig, MCP_SERVER_NAME, RuntimeConfig, handle_http_jsonrpc,
};

const MCP_PATH: &str = "/mcp";
const API_KEY_HEADER: &str = "x-instantly-api-key";
const CLIENT_HEADER: &str = "x-mcp-client";

#[derive(Clone)]
struct HttpState {
    config: Arc<RuntimeConfig>,
}

pub fn router(config: RuntimeConfig) -> Router {
    Router::new()
        .route(MCP_PATH, post(mcp_post).get(mcp_get))
        .route("/health", get(health))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(HttpState {
            config: Arc::new(config),
        })
}

pub async fn serve(bind: SocketAddr, config: RuntimeConfig) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(
        event = "http_server_started",
        bind = %bind,
        api_url = %config.api_url,
        "Instantly MCP listening on http://{bind}{MCP_PATH}"
    );
    axum::serve(listener, router(config)).await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server": MCP_SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn mcp_get() -> Response {
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

async fn mcp_post(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let incoming: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::OK,
                Json(error_response(
                    Value::Null,
                    RpcError::parse_error(format!("Parse error: {err}")),
                )),
            )
                .into_response();
        }
    };
    let is_batch = incoming.is_array();

    let responses = handle_http_jsonrpc(
        &state.config,
        HttpMcpRequestConfig {
            api_key: extract_api_key(&headers),
            client_hint: client_hint(&headers),
        },
        incoming,
    )
    .await;

    if responses.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }

    if !is_batch && responses.len() == 1 {
        let response = responses.into_iter().next().unwrap_or(Value::Null);
        return (StatusCode::OK, Json(response)).into_response();
    }

    (StatusCode::OK, Json(Value::Array(responses))).into_response()
}

/// `Authorization: Bearer <key>` first, then `x-instantly-api-key`.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    let bearer = header_value(headers, AUTHORIZATION.as_str()).and_then(|raw| {
        let mut parts = raw.splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let token = parts.next().unwrap_or_default().trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
    });
    bearer.or_else(|| {
        header_value(headers, API_KEY_HEADER)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    })
}

fn client_hint(headers: &HeaderMap) -> Option<String> {
    header_value(headers, CLIENT_HEADER)
        .or_else(|| header_value(headers, USER_AGENT.as_str()))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}
