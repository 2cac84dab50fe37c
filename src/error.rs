use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("bad type for {field}: expected {expected}, got {got}")]
    BadType {
        field: String,
        expected: String,
        got: String,
    },

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("bad expression: {message} at '{token}'")]
    BadExpression { message: String, token: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("circular calc: {}", .0.join(" -> "))]
    CircularCalc(Vec<String>),

    #[error("compute error: {0}")]
    Compute(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invariant broken: {0}")]
    Invariant(String),

    #[error("invalid token format")]
    InvalidTokenFormat,

    #[error("token lookup collision")]
    TokenLookupCollision,

    #[error("token expired")]
    TokenExpired,
}

impl Error {
    pub fn bad_expression(message: impl Into<String>, token: impl Into<String>) -> Self {
        Error::BadExpression {
            message: message.into(),
            token: token.into(),
        }
    }

    pub fn bad_type(field: impl Into<String>, expected: impl Into<String>, got: impl Into<String>) -> Self {
        Error::BadType {
            field: field.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Client errors are reported verbatim; everything else is logged and hidden.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound
                | Error::BadRequest(_)
                | Error::BadType { .. }
                | Error::UnknownField(_)
                | Error::BadExpression { .. }
                | Error::Unauthorized
                | Error::Forbidden
                | Error::UniqueViolation(_)
                | Error::CircularCalc(_)
                | Error::InvalidTokenFormat
                | Error::TokenExpired
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
