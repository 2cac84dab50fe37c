mod schema;
mod tokens;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::server::AppState;

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        // Schema routes
        .route("/schema", get(schema::get_schema))
        .route("/schema/versions", get(schema::list_versions))
        .route("/mutations/preview", post(schema::preview_mutation))
        .route("/mutations", post(schema::execute_mutation))
        .route("/updates", get(schema::list_updates))
        // Token routes
        .route("/tokens", get(tokens::list_tokens))
        .route("/tokens/{id}", get(tokens::get_token).delete(tokens::delete_token))
        .route("/users/{id}/tokens", get(tokens::list_user_tokens).post(tokens::create_user_token))
}
