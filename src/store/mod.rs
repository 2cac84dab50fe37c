pub mod eval;
pub mod exec;
mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::plan::{Filter, Pipeline};
use crate::schema::SchemaDef;
use crate::types::*;

/// Index flavours maintained for `indexed`, `unique` and `unique_global`
/// fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Plain,
    /// Unique among siblings of the same parent collection.
    UniqueInParent,
    UniqueGlobal,
}

/// Store defines the database interface.
///
/// Resource reads never return tombstoned documents.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Schema versions
    fn save_schema(&self, def: &SchemaDef) -> Result<()>;
    fn get_schema(&self, id: &str) -> Result<Option<SchemaDef>>;
    fn current_schema(&self) -> Result<Option<SchemaDef>>;
    fn promote_schema(&self, id: &str) -> Result<()>;
    fn list_schemas(&self) -> Result<Vec<SchemaVersion>>;

    // Resource operations
    fn insert_resource(&self, doc: &Document) -> Result<()>;
    fn get_resource(&self, id: &ResourceId) -> Result<Option<Document>>;
    fn find(&self, filter: &Filter, ctx: Option<&ResourceId>) -> Result<Vec<Document>>;
    fn count(&self, filter: &Filter) -> Result<usize>;
    /// Sets and unsets top-level fields and bumps `_version`.
    ///
    /// With `expected_version` the write only happens if the stored version
    /// still matches; returns whether a document was written.
    fn update_resource(
        &self,
        id: &ResourceId,
        set: &Document,
        unset: &[String],
        expected_version: Option<i64>,
    ) -> Result<bool>;
    fn tombstone(&self, ids: &[ResourceId]) -> Result<usize>;
    /// Rewrites `_canonical_url` and `_parent_canonical_url` of every live
    /// resource under `old_prefix`.
    fn rewrite_canonical_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<usize>;

    // Index operations
    fn ensure_index(&self, spec: &str, field: &str, kind: IndexKind) -> Result<()>;
    fn drop_indexes(&self, spec: &str, field: &str) -> Result<()>;

    // Update records
    fn create_update(&self, record: &UpdateRecord) -> Result<()>;
    fn finish_update(&self, id: &str, error: Option<&str>) -> Result<()>;
    fn list_updates(&self, pending_only: bool) -> Result<Vec<UpdateRecord>>;

    // Token operations
    fn create_token(&self, token: &Token) -> Result<()>;
    fn get_token_by_id(&self, id: &str) -> Result<Option<Token>>;
    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>>;
    fn list_tokens(&self, cursor: &str, limit: i32) -> Result<Vec<Token>>;
    fn list_user_tokens(&self, user_id: &str) -> Result<Vec<Token>>;
    fn delete_token(&self, id: &str) -> Result<bool>;
    fn update_token_last_used(&self, id: &str) -> Result<()>;
    fn has_admin_token(&self) -> Result<bool>;

    /// Runs an aggregation pipeline with `ctx` bound as the context id.
    fn aggregate(&self, pipeline: &Pipeline, ctx: Option<&ResourceId>) -> Result<Vec<Document>>;

    fn close(&self) -> Result<()>;
}
