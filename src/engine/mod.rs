pub mod grants;
pub mod ingest;
pub mod mutation;
mod reader;
pub mod sweeper;
mod updater;
pub mod watch;
mod writer;

use std::sync::{Arc, RwLock};
use std::time::Instant;

pub use grants::Grant;
pub use reader::{Page, ReadOptions, Reader};
pub use updater::{Change, Parent, PropagationReport, Updater};
pub use watch::{ChangeFeed, WatchEvent, WatchKind};
pub use writer::Writer;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::plan::Filter;
use crate::schema::{FieldKind, GRANT_SPEC, Schema, SchemaDef};
use crate::store::{IndexKind, Store};
use crate::types::*;

/// Who a request acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Admin tokens bypass grants.
    Admin,
    User { user_id: ResourceId, grants: Vec<Grant> },
    /// Internal work: sweeper, ingest, mutations.
    System,
}

/// Source of monotonic time for deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Per-request state, captured once at entry.
#[derive(Debug, Clone)]
pub struct Context {
    pub schema: Arc<Schema>,
    pub principal: Principal,
    pub deadline: Instant,
}

pub struct Engine {
    store: Arc<dyn Store>,
    schema: RwLock<Arc<Schema>>,
    config: EngineConfig,
    feed: ChangeFeed,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Loads the current schema, installing the built-in one on a fresh
    /// database, and makes sure its indexes exist.
    pub fn open(store: Arc<dyn Store>, config: EngineConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let def = match store.current_schema()? {
            Some(def) => def,
            None => {
                let mut def = SchemaDef::new();
                def.seal();
                store.save_schema(&def)?;
                store.promote_schema(&def.id)?;
                tracing::info!(schema = %def.id, "installed initial schema");
                def
            }
        };
        let schema = Schema::build(def)?;
        ensure_indexes(store.as_ref(), &schema)?;

        Ok(Self {
            store,
            schema: RwLock::new(schema),
            feed: ChangeFeed::new(config.watch_capacity),
            config,
            clock,
        })
    }

    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    #[must_use]
    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema.read().unwrap_or_else(|e| e.into_inner()))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    #[must_use]
    pub fn context(&self, principal: Principal) -> Context {
        Context {
            schema: self.schema(),
            principal,
            deadline: self.clock.now() + self.config.propagation_deadline(),
        }
    }

    pub fn updater<'a>(&'a self, ctx: &'a Context) -> Updater<'a> {
        Updater::new(self, ctx)
    }

    pub fn writer<'a>(&'a self, ctx: &'a Context) -> Writer<'a> {
        Writer::new(self, ctx)
    }

    pub fn reader<'a>(&'a self, ctx: &'a Context) -> Reader<'a> {
        Reader::new(self, ctx)
    }

    /// Resolves a user's grants through its groups.
    pub fn user_principal(&self, user_id: &ResourceId) -> Result<Principal> {
        let user = self
            .store
            .get_resource(user_id)?
            .filter(|d| doc_str(d, TYPE) == Some(crate::schema::USER_SPEC))
            .ok_or(Error::Unauthorized)?;
        let groups: Vec<serde_json::Value> = linked_ids(&user, "groups")
            .iter()
            .map(|id| serde_json::Value::String(id.as_str().to_string()))
            .collect();
        let docs = self.store.find(
            &Filter::And(vec![
                Filter::eq(TYPE, GRANT_SPEC),
                Filter::eq(PARENT_FIELD_NAME, "grants"),
                Filter::is_in(PARENT_ID, groups),
            ]),
            None,
        )?;
        Ok(Principal::User {
            user_id: user_id.clone(),
            grants: docs.iter().filter_map(Grant::from_doc).collect(),
        })
    }

    /// Swaps in a new schema snapshot; running requests keep the old one.
    pub(crate) fn install_schema(&self, schema: Arc<Schema>) {
        tracing::info!(schema = %schema.id(), "schema installed");
        *self.schema.write().unwrap_or_else(|e| e.into_inner()) = schema;
    }
}

/// Creates the indexes a schema's field flags ask for.
pub(crate) fn ensure_indexes(store: &dyn Store, schema: &Schema) -> Result<()> {
    for spec in schema.registry.specs() {
        for field in &spec.fields {
            if field.kind.is_reverse() || matches!(field.kind, FieldKind::Collection) {
                continue;
            }
            if field.unique_global {
                store.ensure_index(&spec.name, &field.name, IndexKind::UniqueGlobal)?;
            } else if field.unique {
                store.ensure_index(&spec.name, &field.name, IndexKind::UniqueInParent)?;
            } else if field.indexed {
                store.ensure_index(&spec.name, &field.name, IndexKind::Plain)?;
            }
        }
    }
    Ok(())
}
