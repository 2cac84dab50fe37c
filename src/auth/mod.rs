mod helpers;
mod middleware;
mod token;

pub use helpers::validate_token;
pub use middleware::{AuthError, RequireAdmin, RequireAuth};
pub use token::{TokenGenerator, TokenOwner, parse_token};
