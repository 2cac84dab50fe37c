use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};

use crate::auth::{RequireAdmin, TokenGenerator, TokenOwner};
use crate::error::Error;
use crate::schema::USER_SPEC;
use crate::server::AppState;
use crate::server::dto::{
    CreateTokenResponse, CreateUserTokenRequest, PaginationParams, TokenResponse,
};
use crate::server::response::{
    ApiError, ApiResponse, DEFAULT_PAGE_SIZE, PaginatedResponse, paginate,
};
use crate::types::{ResourceId, TYPE, doc_str};

pub async fn list_tokens(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let cursor = params.cursor.as_deref().unwrap_or("");

    let tokens = state
        .engine
        .store()
        .list_tokens(cursor, DEFAULT_PAGE_SIZE + 1)
        .map_err(|_| ApiError::internal("Failed to list tokens"))?;

    let (tokens, next_cursor, has_more) =
        paginate(tokens, DEFAULT_PAGE_SIZE as usize, |t| t.id.clone());

    let responses: Vec<TokenResponse> = tokens.into_iter().map(TokenResponse::from).collect();

    Ok::<_, ApiError>(Json(PaginatedResponse::new(
        responses,
        next_cursor,
        has_more,
    )))
}

pub async fn get_token(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let token = state
        .engine
        .store()
        .get_token_by_id(&id)
        .map_err(|_| ApiError::internal("Failed to get token"))?
        .ok_or_else(|| ApiError::not_found("Token not found"))?;

    Ok::<_, ApiError>(Json(ApiResponse::success(TokenResponse::from(token))))
}

pub async fn delete_token(
    admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let token = state
        .engine
        .store()
        .get_token_by_id(&id)
        .map_err(|_| ApiError::internal("Failed to get token"))?
        .ok_or_else(|| ApiError::not_found("Token not found"))?;

    if token.id == admin.0.id {
        return Err(ApiError::bad_request("Cannot delete current token"));
    }

    state
        .engine
        .store()
        .delete_token(&token.id)
        .map_err(|_| ApiError::internal("Failed to delete token"))?;

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

/// Resolves an encoded id to an existing `user` resource.
fn user_id(state: &AppState, encoded: &str) -> Result<ResourceId, ApiError> {
    let id = ResourceId::decode(encoded).map_err(|_| ApiError::not_found("User not found"))?;
    state
        .engine
        .store()
        .get_resource(&id)
        .map_err(|_| ApiError::internal("Failed to get user"))?
        .filter(|doc| doc_str(doc, TYPE) == Some(USER_SPEC))
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(id)
}

pub async fn list_user_tokens(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let user_id = user_id(&state, &id)?;

    let tokens = state
        .engine
        .store()
        .list_user_tokens(user_id.as_str())
        .map_err(|_| ApiError::internal("Failed to list user tokens"))?;

    let responses: Vec<TokenResponse> = tokens.into_iter().map(TokenResponse::from).collect();

    Ok::<_, ApiError>(Json(ApiResponse::success(responses)))
}

pub async fn create_user_token(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateUserTokenRequest>,
) -> impl IntoResponse {
    let user_id = user_id(&state, &id)?;

    if let Some(seconds) = req.expires_in_seconds {
        if seconds < 0 {
            return Err(ApiError::bad_request(
                "expires_in_seconds cannot be negative",
            ));
        }
    }

    let expires_at = req
        .expires_in_seconds
        .map(|s| Utc::now() + Duration::seconds(s));

    let generator = TokenGenerator::new();
    let owner = TokenOwner::User(user_id.clone());

    const MAX_RETRIES: u32 = 3;
    for _ in 0..MAX_RETRIES {
        let (token, raw_token) = generator
            .issue(&owner, expires_at)
            .map_err(|_| ApiError::internal("Failed to generate token"))?;

        match state.engine.store().create_token(&token) {
            Ok(()) => {
                tracing::info!(user = %user_id, token = %token.id, "issued user token");
                return Ok((
                    StatusCode::CREATED,
                    Json(ApiResponse::success(CreateTokenResponse {
                        token: raw_token,
                        metadata: TokenResponse::from(token),
                    })),
                ));
            }
            Err(Error::TokenLookupCollision) => continue,
            Err(_) => return Err(ApiError::internal("Failed to create token")),
        }
    }

    Err(ApiError::internal("Failed to create token after retries"))
}
