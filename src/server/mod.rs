mod admin;
mod api;
pub mod dto;
mod path;
pub mod response;
mod router;
mod watch;

pub use admin::admin_router;
pub use router::{AppState, create_router};
