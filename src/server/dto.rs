use serde::{Deserialize, Serialize};

use crate::engine::mutation::Step;
use crate::schema::SchemaDef;
use crate::types::Token;

/// Query string of `GET /api/...`.
#[derive(Debug, Default, Deserialize)]
pub struct ReadParams {
    #[serde(default)]
    pub expand: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchParams {
    /// Only resources at or below this canonical URL.
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PaginationParams {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateUserTokenRequest {
    #[serde(default)]
    pub expires_in_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub id: String,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Token> for TokenResponse {
    fn from(token: Token) -> Self {
        Self {
            id: token.id,
            is_admin: token.is_admin,
            user_id: token.user_id,
            created_at: token.created_at,
            expires_at: token.expires_at,
            last_used_at: token.last_used_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub token: String,
    pub metadata: TokenResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameRequest {
    pub spec: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpecRenameRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveRequest {
    pub from_path: String,
    pub to_path: String,
}

/// A proposed schema plus the hints a plain diff cannot infer.
#[derive(Debug, Clone, Deserialize)]
pub struct MutationRequest {
    pub schema: SchemaDef,
    #[serde(default)]
    pub renames: Vec<RenameRequest>,
    #[serde(default)]
    pub spec_renames: Vec<SpecRenameRequest>,
    #[serde(default)]
    pub moves: Vec<MoveRequest>,
}

#[derive(Debug, Serialize)]
pub struct MutationPreview {
    pub from: String,
    pub steps: Vec<Step>,
}
