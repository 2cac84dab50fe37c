//! # Metaphor
//!
//! A schema-driven document server. Resources live in a tree of typed
//! collections addressed by URL; calc fields are declared as expressions and
//! kept current by the engine, which plans reverse aggregations to find
//! every calc a write can affect.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! metaphor = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use metaphor::config::EngineConfig;
//! use metaphor::engine::{Engine, sweeper};
//! use metaphor::server::{AppState, create_router};
//! use metaphor::store::{SqliteStore, Store};
//!
//! let store = SqliteStore::new("./data/metaphor.db").unwrap();
//! store.initialize().unwrap();
//!
//! let engine = Arc::new(Engine::open(Arc::new(store), EngineConfig::default()).unwrap());
//! sweeper::spawn(Arc::clone(&engine));
//! let router = create_router(Arc::new(AppState::new(engine)));
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `metaphor` binary. Disable with `default-features = false`.

pub mod auth;
pub mod calc;
pub mod config;
pub mod engine;
pub mod error;
pub mod lang;
pub mod plan;
pub mod schema;
pub mod server;
pub mod store;
pub mod types;
