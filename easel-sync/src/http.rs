//! Named-document REST surface.
//!
//! Tabs are snapshots with a display name. The stored payload is the
//! editor's JSON document, split into `elements` and `appState` for display.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::protocol::now_millis;
use crate::registry::RoomRegistry;
use crate::storage::{run_blocking, Gateway, GatewayError, PayloadPatch, SnapshotRecord};

#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<dyn Gateway>,
    pub registry: Arc<RoomRegistry>,
}

#[derive(Debug)]
enum ApiError {
    NotFound,
    NameRequired,
    Conflict(String),
    Internal(GatewayError),
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Conflict(id) => ApiError::Conflict(id),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Tab not found".to_string()),
            ApiError::NameRequired => (StatusCode::BAD_REQUEST, "Name is required".to_string()),
            ApiError::Conflict(id) => (StatusCode::CONFLICT, format!("Tab {id} already exists")),
            ApiError::Internal(e) => {
                log::error!("Tab request failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage failure".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(gateway: Arc<dyn Gateway>, registry: Arc<RoomRegistry>) -> Router {
    let state = ApiState { gateway, registry };

    Router::new()
        .route("/health", get(health))
        .route("/api/tabs", get(list_tabs).post(create_tab))
        .route(
            "/api/tabs/:id",
            get(get_tab).put(update_tab).delete(delete_tab),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// JSON view of a stored tab.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TabView {
    id: String,
    name: Option<String>,
    elements: Value,
    app_state: Value,
    created_at: i64,
    updated_at: i64,
}

impl From<SnapshotRecord> for TabView {
    fn from(record: SnapshotRecord) -> Self {
        let mut doc = parse_document(&record.payload);
        TabView {
            id: record.document_id,
            name: record.name,
            elements: doc.remove("elements").unwrap_or_else(|| json!([])),
            app_state: doc.remove("appState").unwrap_or_else(|| json!({})),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

// Payloads written by clients are not guaranteed to be JSON objects.
fn parse_document(payload: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn encode_document(elements: Value, app_state: Value) -> Vec<u8> {
    json!({ "elements": elements, "appState": app_state })
        .to_string()
        .into_bytes()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTabRequest {
    id: Option<String>,
    name: Option<String>,
    elements: Option<Value>,
    app_state: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTabRequest {
    name: Option<String>,
    elements: Option<Value>,
    app_state: Option<Value>,
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    log::debug!("Health check requested");
    Json(json!({
        "status": "ok",
        "timestamp": now_millis(),
        "connectedClients": state.registry.connection_count().await,
    }))
}

async fn list_tabs(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let records = run_blocking(&state.gateway, |gw| gw.list_snapshots()).await?;
    let tabs: Vec<TabView> = records.into_iter().map(TabView::from).collect();
    Ok(Json(json!({ "tabs": tabs })))
}

async fn get_tab(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = run_blocking(&state.gateway, move |gw| gw.get_snapshot(&id))
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "tab": TabView::from(record) })))
}

async fn create_tab(
    State(state): State<ApiState>,
    Json(req): Json<CreateTabRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let name = req
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or(ApiError::NameRequired)?;
    let id = req.id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let payload = encode_document(
        req.elements.unwrap_or_else(|| json!([])),
        req.app_state.unwrap_or_else(|| json!({})),
    );
    let mut record = SnapshotRecord::new(id, payload, now_millis());
    record.name = Some(name);

    let stored = record.clone();
    run_blocking(&state.gateway, move |gw| gw.create_snapshot(&stored)).await?;
    log::info!("Created tab {}", record.document_id);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "tab": TabView::from(record) })),
    ))
}

async fn update_tab(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTabRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = req.name.filter(|n| !n.trim().is_empty());
    // Merged against whatever is stored when the gateway holds the document.
    let patch: Option<PayloadPatch> = match (req.elements, req.app_state) {
        (None, None) => None,
        (elements, app_state) => Some(Box::new(move |current: &[u8]| {
            let mut doc = parse_document(current);
            let elements = elements
                .or_else(|| doc.remove("elements"))
                .unwrap_or_else(|| json!([]));
            let app_state = app_state
                .or_else(|| doc.remove("appState"))
                .unwrap_or_else(|| json!({}));
            encode_document(elements, app_state)
        })),
    };
    let updated =
        run_blocking(&state.gateway, move |gw| gw.update_snapshot(&id, name, patch)).await?;

    if !updated {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "success": true })))
}

async fn delete_tab(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = run_blocking(&state.gateway, move |gw| gw.delete_snapshot(&id)).await?;
    if !deleted {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "success": true })))
}
