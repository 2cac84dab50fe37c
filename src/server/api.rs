use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::Value;

use crate::auth::RequireAuth;
use crate::engine::{Context, ReadOptions};
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::ReadParams;
use crate::server::path::normalize_path;
use crate::server::response::ApiError;
use crate::types::{CANONICAL_URL, Document, doc_id, doc_str};

fn body_fields(body: Value) -> Result<Document, ApiError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::bad_request("Request body must be a JSON object")),
    }
}

/// Renders a written document the way a GET would. Falls back to the bare
/// identity when the caller cannot read what it just wrote.
fn render(state: &AppState, ctx: &Context, doc: &Document) -> Result<Value, ApiError> {
    let url = doc_str(doc, CANONICAL_URL)
        .ok_or_else(|| ApiError::internal("Internal server error"))?
        .to_string();
    match state.engine.reader(ctx).get(&url, &ReadOptions::default()) {
        Ok(view) => Ok(view),
        Err(Error::NotFound) => Ok(serde_json::json!({
            "id": doc_id(doc).map(|id| id.encode()),
            "self": url,
        })),
        Err(e) => Err(e.into()),
    }
}

pub async fn read(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(params): Query<ReadParams>,
) -> impl IntoResponse {
    let path = normalize_path(&path)?;
    let ctx = state.engine.context(auth.principal);
    let options = ReadOptions {
        page: params.page.unwrap_or(1),
        page_size: params.page_size,
        ..ReadOptions::default()
    }
    .with_expand(params.expand.as_deref());

    let view = state.engine.reader(&ctx).get(&path, &options)?;

    Ok::<_, ApiError>(Json(view))
}

pub async fn create(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let path = normalize_path(&path)?;
    let ctx = state.engine.context(auth.principal);

    let doc = state.engine.writer(&ctx).post(&path, body_fields(body)?)?;
    let view = render(&state, &ctx, &doc)?;

    Ok::<_, ApiError>((StatusCode::CREATED, Json(view)))
}

pub async fn update(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let path = normalize_path(&path)?;
    let ctx = state.engine.context(auth.principal);

    let doc = state.engine.writer(&ctx).patch(&path, body_fields(body)?)?;
    let view = render(&state, &ctx, &doc)?;

    Ok::<_, ApiError>(Json(view))
}

pub async fn move_into(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let path = normalize_path(&path)?;
    let ctx = state.engine.context(auth.principal);

    let moved = state.engine.writer(&ctx).put_move(&path, body_fields(body)?)?;
    let views = moved
        .iter()
        .map(|doc| render(&state, &ctx, doc))
        .collect::<Result<Vec<_>, _>>()?;

    Ok::<_, ApiError>(Json(views))
}

pub async fn remove(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> impl IntoResponse {
    let path = normalize_path(&path)?;
    let ctx = state.engine.context(auth.principal);

    let removed = state.engine.writer(&ctx).delete(&path)?;
    tracing::debug!(path, removed = removed.len(), "delete applied");

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
