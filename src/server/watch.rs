use std::sync::Arc;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tokio::sync::mpsc;

use crate::auth::RequireAuth;
use crate::engine::grants::can_access;
use crate::engine::{Principal, WatchEvent};
use crate::server::AppState;
use crate::server::dto::WatchParams;
use crate::types::GrantKind;

pub async fn watch(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WatchParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let prefix = params.prefix.unwrap_or_else(|| "/".to_string());
    let events = state.engine.feed().subscribe(&prefix);
    tracing::info!(prefix, "watch opened");
    ws.on_upgrade(move |socket| forward(socket, events, auth.principal))
}

async fn forward(mut socket: WebSocket, mut events: mpsc::Receiver<WatchEvent>, principal: Principal) {
    while let Some(event) = events.recv().await {
        if !can_access(&principal, GrantKind::Read, &event.url) {
            continue;
        }
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode watch event");
                continue;
            }
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    tracing::debug!("watch closed");
}
