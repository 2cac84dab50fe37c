mod document;
mod grant;
mod id;
mod models;

pub use document::*;
pub use grant::GrantKind;
pub use id::{ENCODED_ID_LEN, ResourceId};
pub use models::*;
