//! Inbound HTTP surface: turns request paths into core calls, kept
//! deliberately thin. The design lives in the runtime/session fabric and
//! the cluster coordinator.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use plugind_cluster::ClusterNode;
use plugind_manager::PluginManager;
use plugind_metadata::MetadataStore;
use plugind_types::PluginUniqueIdentifier;
use serde_json::json;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub manager: Arc<PluginManager>,
    pub cluster: Arc<ClusterNode>,
    pub metadata: Arc<dyn MetadataStore>,
    pub http_client: reqwest::Client,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/plugin/invoke/:kind", get(invoke_plugin).post(invoke_plugin))
        .route("/endpoint/:hook_id/*path", get(invoke_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

const IDENTIFIER_HEADER: &str = "plugin-identifier";

fn identifier_from_headers(headers: &HeaderMap) -> Result<PluginUniqueIdentifier, (StatusCode, Json<serde_json::Value>)> {
    let raw = headers
        .get(IDENTIFIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("missing plugin-identifier header"))?;
    PluginUniqueIdentifier::parse(raw).map_err(|e| bad_request(&e.to_string()))
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "code": 400, "message": message })))
}

/// `GET|POST /plugin/invoke/:kind` — resolves ownership via the
/// cluster view, handles locally if this node owns the plugin, otherwise
/// redirects to the owning node. Full invocation wiring (request body →
/// backwards-invocation dispatcher) happens over the framed session
/// protocol, not this HTTP hop; a locally-owned hit is acknowledged here.
async fn invoke_plugin(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let identifier = match identifier_from_headers(&headers) {
        Ok(id) => id,
        Err(resp) => return resp.into_response(),
    };

    if state.cluster.is_plugin_on_current_node(&identifier).await {
        return (StatusCode::OK, "ok").into_response();
    }

    match state.cluster.fetch_plugin_node(&identifier).await {
        Some(node) => {
            let path = format!("/plugin/invoke/{kind}");
            match plugind_redirect::forward(&state.http_client, &node, method, &path, headers, body.to_vec()).await {
                Ok(resp) => {
                    let mut response = (
                        StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY),
                        resp.body,
                    )
                        .into_response();
                    *response.headers_mut() = resp.headers;
                    response
                }
                Err(e) => (StatusCode::BAD_GATEWAY, Json(json!({ "code": 502, "message": e.to_string() }))).into_response(),
            }
        }
        None => (StatusCode::NOT_FOUND, Json(json!({ "code": 404, "message": "plugin not owned by any live node" })))
            .into_response(),
    }
}

/// `GET /endpoint/:hook_id/*path` — webhook-style endpoint dispatch, looked
/// up by `hook_id` through the metadata store's endpoint rows.
async fn invoke_endpoint(State(state): State<Arc<AppState>>, Path((hook_id, _path)): Path<(String, String)>) -> impl IntoResponse {
    match state.metadata.get_endpoint(&hook_id).await {
        Ok(row) if row.enabled => (StatusCode::OK, Json(json!({ "identifier": row.identifier.to_string() }))).into_response(),
        Ok(_) => (StatusCode::FORBIDDEN, Json(json!({ "code": 403, "message": "endpoint disabled" }))).into_response(),
        Err(e) => (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::NOT_FOUND), Json(json!({ "message": e.to_string() })))
            .into_response(),
    }
}
