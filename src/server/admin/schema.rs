use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::auth::RequireAdmin;
use crate::engine::Engine;
use crate::engine::mutation::{Mutation, diff};
use crate::server::AppState;
use crate::server::dto::{MutationPreview, MutationRequest};
use crate::server::response::{ApiError, ApiResponse};

#[derive(Debug, Default, Deserialize)]
pub struct UpdatesParams {
    #[serde(default)]
    pub pending: bool,
}

/// Diffs the current schema against the proposal and applies the hints.
fn plan(engine: &Engine, req: MutationRequest) -> Result<Mutation, ApiError> {
    let current = engine.schema();
    let mut mutation = diff(&current.def, &req.schema);
    for rename in &req.spec_renames {
        mutation.promote_spec_rename(&rename.from, &rename.to)?;
    }
    for rename in &req.renames {
        mutation.promote_rename(&rename.spec, &rename.from, &rename.to)?;
    }
    for mv in &req.moves {
        mutation.add_move(&mv.from_path, &mv.to_path);
    }
    Ok(mutation)
}

pub async fn get_schema(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let schema = state.engine.schema();
    Json(ApiResponse::success(schema.def.clone()))
}

pub async fn list_versions(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let versions = state
        .engine
        .store()
        .list_schemas()
        .map_err(|_| ApiError::internal("Failed to list schema versions"))?;

    Ok::<_, ApiError>(Json(ApiResponse::success(versions)))
}

pub async fn preview_mutation(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<MutationRequest>,
) -> impl IntoResponse {
    let mutation = plan(&state.engine, req)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(MutationPreview {
        from: mutation.from.id.clone(),
        steps: mutation.steps,
    })))
}

pub async fn execute_mutation(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<MutationRequest>,
) -> impl IntoResponse {
    let mutation = plan(&state.engine, req)?;
    let report = mutation.execute(&state.engine)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(report)))
}

pub async fn list_updates(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(params): Query<UpdatesParams>,
) -> impl IntoResponse {
    let updates = state
        .engine
        .store()
        .list_updates(params.pending)
        .map_err(|_| ApiError::internal("Failed to list updates"))?;

    Ok::<_, ApiError>(Json(ApiResponse::success(updates)))
}
