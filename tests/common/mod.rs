#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use metaphor::auth::{TokenGenerator, TokenOwner};
use metaphor::config::EngineConfig;
use metaphor::engine::Engine;
use metaphor::schema::SchemaDef;
use metaphor::server::{AppState, create_router};
use metaphor::store::{SqliteStore, Store};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// An in-process server over a fresh database in a temp dir.
pub struct TestServer {
    pub temp_dir: TempDir,
    pub base_url: String,
    pub admin_token: String,
    pub engine: Arc<Engine>,
    client: reqwest::Client,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let store = SqliteStore::new(temp_dir.path().join("metaphor.db")).expect("open store");
        store.initialize().expect("initialize store");
        let engine = Arc::new(Engine::open(Arc::new(store), EngineConfig::default()).expect("open engine"));

        let (token, admin_token) = TokenGenerator::new().issue(&TokenOwner::Admin, None).expect("issue token");
        engine.store().create_token(&token).expect("store token");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let app = create_router(Arc::new(AppState::new(Arc::clone(&engine))));
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            temp_dir,
            base_url: format!("http://127.0.0.1:{port}"),
            admin_token,
            engine,
            client: reqwest::Client::new(),
            handle,
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub async fn request(&self, method: Method, path: &str, token: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.expect("send request");
        let status = resp.status();
        let text = resp.text().await.expect("read body");
        let value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).expect("parse body")
        };
        (status, value)
    }

    pub async fn get(&self, path: &str) -> Value {
        let (status, body) = self.request(Method::GET, path, &self.admin_token, None).await;
        assert_eq!(status, StatusCode::OK, "GET {path}: {body}");
        body
    }

    pub async fn post(&self, path: &str, body: Value) -> Value {
        let (status, body) = self.request(Method::POST, path, &self.admin_token, Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "POST {path}: {body}");
        body
    }

    pub async fn patch(&self, path: &str, body: Value) -> Value {
        let (status, body) = self.request(Method::PATCH, path, &self.admin_token, Some(body)).await;
        assert_eq!(status, StatusCode::OK, "PATCH {path}: {body}");
        body
    }

    pub async fn delete(&self, path: &str) {
        let (status, body) = self.request(Method::DELETE, path, &self.admin_token, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT, "DELETE {path}: {body}");
    }

    /// Migrates to `schema`, edited from the current one by `edit`.
    pub async fn migrate(&self, edit: impl FnOnce(&mut SchemaDef)) -> Value {
        let mut schema = self.engine.schema().def.clone();
        edit(&mut schema);
        let (status, body) = self
            .request(
                Method::POST,
                "/admin/mutations",
                &self.admin_token,
                Some(json!({ "schema": schema })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "mutation: {body}");
        body
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Path of a resource view under `/api`.
pub fn api(view: &Value) -> String {
    format!("/api{}", view["self"].as_str().expect("self url"))
}
