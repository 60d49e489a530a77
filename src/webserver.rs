use crate::metrics_exporter;
use crate::query::{InventoryRow, QueryEngine};
use crate::state::AppState;
use crate::store::{self, InventoryError};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    namespace: Option<String>,
}

impl NamespaceQuery {
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

#[derive(Debug, Serialize)]
pub struct ImagesResponse {
    images: Vec<InventoryRow>,
    total: usize,
}

fn error_response(e: InventoryError) -> Response {
    let status = match e {
        InventoryError::NotFound(_) => StatusCode::NOT_FOUND,
        InventoryError::Persistence(_) => {
            error!("Inventory query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// Runs a store-backed query on the blocking pool.
async fn run_query<T, F>(state: AppState, query: F) -> Result<T, Response>
where
    F: FnOnce(&QueryEngine) -> store::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(move || query(&state.query)).await {
        Ok(result) => result.map_err(error_response),
        Err(e) => {
            error!("Inventory query task failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "inventory query task failed" })),
            )
                .into_response())
        }
    }
}

pub async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<NamespaceQuery>,
) -> Response {
    let namespace = params.namespace().map(str::to_string);
    match run_query(state, move |query| {
        query.list_current_inventory(namespace.as_deref())
    })
    .await
    {
        Ok(images) => Json(ImagesResponse {
            total: images.len(),
            images,
        })
        .into_response(),
        Err(response) => response,
    }
}

pub async fn image_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<NamespaceQuery>,
) -> Response {
    let namespace = params.namespace().map(str::to_string);
    match run_query(state, move |query| {
        query.get_tag_history(&name, namespace.as_deref())
    })
    .await
    {
        Ok(history) => Json(history).into_response(),
        Err(response) => response,
    }
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match run_query(state, metrics_exporter::render).await {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(response) => response,
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(query: QueryEngine) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/api/health", get(health))
        .route("/api/images", get(list_images))
        .route("/api/images/{name}/history", get(image_history))
        .route("/metrics", get(metrics))
        .with_state(AppState { query })
}
