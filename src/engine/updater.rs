//! The change-propagation engine.
//!
//! Every mutation is expressed as [`Change`]s: a resource plus the
//! `spec.field` / `root.name` dependencies it touched. Propagation runs an
//! explicit worklist to a fixed point:
//!
//! 1. each change is matched against the calc index and the matching
//!    reverse plans are executed with the changed resource as context,
//!    yielding `(calc, resource)` targets;
//! 2. targets are recomputed lowest topological rank first, so a target is
//!    only evaluated once everything it reads has settled;
//! 3. a recompute that changes the stored value becomes a new change.
//!
//! Reverse plans run after the write and do not re-apply filters, so a
//! resource leaving a filter still reaches the calc. Removals and moves also
//! run discovery before the write, while the old location is reachable.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::Utc;
use serde_json::{Value, json};

use super::grants;
use super::watch::{WatchEvent, WatchKind};
use super::{Context, Engine};
use crate::calc::CalcEntry;
use crate::error::{Error, Result};
use crate::plan::{Filter, VAL};
use crate::schema::{FieldKind, GRANT_SPEC, Registry, Schema};
use crate::store::Store;
use crate::types::*;

/// Frontier keys recorded under `_dirty` when a deadline expires.
pub(crate) const DIRTY_CHANGED: &str = "_changed";
pub(crate) const DIRTY_RECOMPUTE: &str = "_recompute";

/// A write to one resource, named by the dependencies it touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub spec: String,
    pub id: ResourceId,
    pub deps: BTreeSet<String>,
}

impl Change {
    pub fn new(spec: &str, id: &ResourceId, deps: impl IntoIterator<Item = String>) -> Self {
        Self {
            spec: spec.to_string(),
            id: id.clone(),
            deps: deps.into_iter().collect(),
        }
    }
}

/// The collection a resource is created in or moved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parent {
    pub id: Option<ResourceId>,
    pub spec: String,
    pub field: String,
    pub canonical_url: String,
    /// The parent's `_grants`, inherited by new children.
    pub grants: Vec<String>,
}

impl Parent {
    #[must_use]
    pub fn root(field: &str) -> Self {
        Self {
            id: None,
            spec: ROOT_SPEC.to_string(),
            field: field.to_string(),
            canonical_url: "/".to_string(),
            grants: Vec::new(),
        }
    }

    pub fn of(doc: &Document, field: &str) -> Result<Self> {
        let missing = || Error::Invariant("parent without identity".into());
        Ok(Self {
            id: Some(doc_id(doc).ok_or_else(missing)?),
            spec: doc_str(doc, TYPE).ok_or_else(missing)?.to_string(),
            field: field.to_string(),
            canonical_url: doc_str(doc, CANONICAL_URL).ok_or_else(missing)?.to_string(),
            grants: doc
                .get(GRANTS)
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_str).map(String::from).collect())
                .unwrap_or_default(),
        })
    }

    /// URL of the collection itself, e.g. `/divisions/ID…/employees`.
    #[must_use]
    pub fn collection_url(&self) -> String {
        format!("{}/{}", self.canonical_url.trim_end_matches('/'), self.field)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropagationReport {
    /// Targets produced by reverse plans, before de-duplication.
    pub discovered: usize,
    pub recomputed: usize,
    /// Recomputes whose value differed from the stored one.
    pub written: usize,
    pub failed: usize,
    /// Resources whose frontier was recorded in `_dirty`.
    pub deferred: usize,
}

/// `(rank, spec, field, id)`; ordering by rank first settles inputs before
/// the calcs reading them.
type Target = (usize, String, String, ResourceId);

/// Changes announcing that `doc` exists (or is about to stop existing):
/// every field of its own, plus its container membership.
fn existence_changes(registry: &Registry, doc: &Document) -> Vec<Change> {
    let (Some(spec), Some(id)) = (doc_str(doc, TYPE), doc_id(doc)) else {
        return Vec::new();
    };
    let mut deps: BTreeSet<String> = registry
        .spec(spec)
        .map(|s| s.fields.iter().map(|f| format!("{spec}.{}", f.name)).collect())
        .unwrap_or_default();
    let mut changes = container_changes(doc);
    if let Some(own) = changes.iter_mut().find(|c| c.id == id) {
        deps.append(&mut own.deps);
        changes.retain(|c| c.id != id);
    }
    changes.insert(0, Change::new(spec, &id, deps));
    changes
}

/// The change a resource's container sees when it joins or leaves it.
fn container_changes(doc: &Document) -> Vec<Change> {
    let Some(field) = doc_str(doc, PARENT_FIELD_NAME) else {
        return Vec::new();
    };
    match (doc_str(doc, PARENT_ID), doc_str(doc, PARENT_TYPE)) {
        (Some(parent), Some(parent_spec)) if parent_spec != ROOT_SPEC => ResourceId::from_hex(parent)
            .map(|pid| vec![Change::new(parent_spec, &pid, [format!("{parent_spec}.{field}")])])
            .unwrap_or_default(),
        _ => match (doc_str(doc, TYPE), doc_id(doc)) {
            (Some(spec), Some(id)) => vec![Change::new(spec, &id, [format!("{ROOT_SPEC}.{field}")])],
            _ => Vec::new(),
        },
    }
}

pub struct Updater<'a> {
    engine: &'a Engine,
    schema: &'a Schema,
    ctx: &'a Context,
}

impl<'a> Updater<'a> {
    pub(crate) fn new(engine: &'a Engine, ctx: &'a Context) -> Self {
        Self {
            engine,
            schema: &ctx.schema,
            ctx,
        }
    }

    fn store(&self) -> &dyn Store {
        self.engine.store()
    }

    fn load(&self, id: &ResourceId) -> Result<Document> {
        self.store().get_resource(id)?.ok_or(Error::NotFound)
    }

    fn publish(&self, kind: WatchKind, doc: &Document, fields: impl IntoIterator<Item = String>) {
        if let (Some(spec), Some(id)) = (doc_str(doc, TYPE), doc_id(doc)) {
            let url = doc_str(doc, CANONICAL_URL).unwrap_or_default();
            self.engine
                .feed()
                .publish(WatchEvent::new(kind, spec, &id, url).with_fields(fields));
        }
    }

    fn check_container(&self, parent: &Parent, spec: &str) -> Result<()> {
        let container = self.schema.registry.require_field(&parent.spec, &parent.field)?;
        if container.kind != FieldKind::Collection || container.target() != Some(spec) {
            return Err(Error::BadRequest(format!(
                "{} cannot hold {spec}",
                parent.collection_url()
            )));
        }
        Ok(())
    }

    /// Checks link targets exist with the declared type and caches their
    /// canonical URLs; nulled links get their cache queued for removal.
    fn resolve_links(&self, spec: &str, doc: &mut Document, unset: &mut Vec<String>) -> Result<()> {
        let links: Vec<(String, String)> = doc
            .keys()
            .filter_map(|key| {
                let field = self.schema.registry.field(spec, key)?;
                (field.kind == FieldKind::Link).then(|| (key.clone(), field.target().unwrap_or_default().to_string()))
            })
            .collect();

        for (field, target) in links {
            let cache = format!("{CANONICAL_URL_PREFIX}{field}");
            let Some(hex) = doc_str(doc, &field).map(str::to_string) else {
                unset.push(cache);
                continue;
            };
            let id = ResourceId::from_hex(&hex)?;
            let linked = self
                .store()
                .get_resource(&id)?
                .filter(|d| doc_str(d, TYPE) == Some(target.as_str()))
                .ok_or_else(|| Error::BadRequest(format!("{field}: no {target} {}", id.encode())))?;
            doc.insert(cache, json!(doc_str(&linked, CANONICAL_URL)));
        }
        Ok(())
    }

    /// Creates a resource in `parent`, computes its calcs and propagates.
    pub fn create_resource(&self, spec: &str, parent: &Parent, fields: Document) -> Result<Document> {
        self.check_container(parent, spec)?;
        let mut doc = self.schema.registry.validate_payload(spec, &fields, false)?;
        self.resolve_links(spec, &mut doc, &mut Vec::new())?;

        let id = ResourceId::generate();
        let url = canonical_url(&parent.canonical_url, &parent.field, &id);
        let mut inherited = parent.grants.clone();
        for grant in grants::grants_for_url(&grants::load_read_grants(self.store())?, &url) {
            if !inherited.contains(&grant) {
                inherited.push(grant);
            }
        }

        doc.insert(ID.into(), json!(id.as_str()));
        doc.insert(TYPE.into(), json!(spec));
        doc.insert(PARENT_ID.into(), json!(parent.id.as_ref().map(ResourceId::as_str)));
        doc.insert(PARENT_TYPE.into(), json!(parent.spec));
        doc.insert(PARENT_FIELD_NAME.into(), json!(parent.field));
        doc.insert(PARENT_CANONICAL_URL.into(), json!(parent.canonical_url));
        doc.insert(CANONICAL_URL.into(), json!(url));
        doc.insert(SCHEMA_ID.into(), json!(self.schema.id()));
        doc.insert(GRANTS.into(), json!(inherited));
        doc.insert(VERSION.into(), json!(0));
        self.store().insert_resource(&doc)?;
        tracing::debug!(spec, id = %id, url, "resource created");

        let seeds = self
            .schema
            .calcs
            .for_spec(spec)
            .map(|e| (e.rank, e.spec.clone(), e.field.clone(), id.clone()))
            .collect();
        self.run(existence_changes(&self.schema.registry, &doc), seeds);

        if spec == GRANT_SPEC {
            self.refresh_grant(&id);
        }
        let stored = self.load(&id)?;
        self.publish(WatchKind::Created, &stored, []);
        Ok(stored)
    }

    /// Partial update of primitive and link fields.
    pub fn update_fields(&self, id: &ResourceId, fields: Document) -> Result<Document> {
        let doc = self.load(id)?;
        let spec = doc_str(&doc, TYPE).unwrap_or_default().to_string();
        let mut set = self.schema.registry.validate_payload(&spec, &fields, true)?;
        let mut unset = Vec::new();
        self.resolve_links(&spec, &mut set, &mut unset)?;

        let changed: Vec<String> = set
            .iter()
            .filter(|(key, value)| !key.starts_with('_') && doc.get(*key).unwrap_or(&Value::Null) != *value)
            .map(|(key, _)| key.clone())
            .collect();
        if changed.is_empty() {
            return Ok(doc);
        }
        if !self.store().update_resource(id, &set, &unset, None)? {
            return Err(Error::NotFound);
        }

        let deps = changed.iter().map(|f| format!("{spec}.{f}"));
        self.run(vec![Change::new(&spec, id, deps)], BTreeSet::new());

        if spec == GRANT_SPEC {
            self.refresh_grant(id);
        }
        let stored = self.load(id)?;
        self.publish(WatchKind::Updated, &stored, changed);
        Ok(stored)
    }

    /// Tombstones a resource and its descendants and nulls inbound links.
    pub fn delete_resource(&self, id: &ResourceId) -> Result<Vec<ResourceId>> {
        let doc = self.load(id)?;
        let url = doc_str(&doc, CANONICAL_URL).unwrap_or_default().to_string();
        let mut doomed = vec![doc.clone()];
        doomed.extend(self.store().find(
            &Filter::Prefix {
                field: CANONICAL_URL.to_string(),
                prefix: format!("{url}/"),
            },
            None,
        )?);

        let mut seeds = BTreeSet::new();
        for gone in &doomed {
            for change in existence_changes(&self.schema.registry, gone) {
                self.discover_into(&change, &mut seeds);
            }
        }

        let ids: Vec<ResourceId> = doomed.iter().filter_map(doc_id).collect();
        self.store().tombstone(&ids)?;
        tracing::debug!(id = %id, cascade = ids.len(), "resource deleted");

        let mut changes: Vec<Change> = container_changes(&doc)
            .into_iter()
            .filter(|c| c.id != *id)
            .collect();
        changes.extend(self.unlink_inbound(&doomed)?);
        self.run(changes, seeds);

        for gone in doomed.iter().filter(|d| doc_str(d, TYPE) == Some(GRANT_SPEC)) {
            if let Some(grant_id) = doc_id(gone) {
                self.refresh_grant(&grant_id);
            }
        }
        self.publish(WatchKind::Deleted, &doc, []);
        Ok(ids)
    }

    /// Nulls links and drops link-collection entries pointing at `doomed`.
    fn unlink_inbound(&self, doomed: &[Document]) -> Result<Vec<Change>> {
        let mut by_spec: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for doc in doomed {
            if let (Some(spec), Some(id)) = (doc_str(doc, TYPE), doc_str(doc, ID)) {
                by_spec.entry(spec).or_default().push(json!(id));
            }
        }

        let mut changes = Vec::new();
        for (spec, ids) in by_spec {
            for view in self.schema.registry.reverse_fields(spec) {
                let Some(origin) = &view.reverse_of else { continue };
                let path = match view.kind {
                    FieldKind::ReverseLink => origin.field.clone(),
                    FieldKind::ReverseLinkCollection => format!("{}.{ID}", origin.field),
                    _ => continue,
                };
                let holders = self.store().find(
                    &Filter::And(vec![
                        Filter::eq(TYPE, origin.spec.as_str()),
                        Filter::is_in(&path, ids.clone()),
                    ]),
                    None,
                )?;
                for holder in holders {
                    let Some(holder_id) = doc_id(&holder) else { continue };
                    let mut set = Document::new();
                    let mut unset = Vec::new();
                    if view.kind == FieldKind::ReverseLink {
                        set.insert(origin.field.clone(), Value::Null);
                        unset.push(format!("{CANONICAL_URL_PREFIX}{}", origin.field));
                    } else {
                        let kept: Vec<Value> = holder
                            .get(&origin.field)
                            .and_then(Value::as_array)
                            .map(|entries| {
                                entries
                                    .iter()
                                    .filter(|e| !e.get(ID).is_some_and(|v| ids.contains(v)))
                                    .cloned()
                                    .collect()
                            })
                            .unwrap_or_default();
                        set.insert(origin.field.clone(), Value::Array(kept));
                    }
                    if self.store().update_resource(&holder_id, &set, &unset, None)? {
                        changes.push(Change::new(
                            &origin.spec,
                            &holder_id,
                            [format!("{}.{}", origin.spec, origin.field)],
                        ));
                    }
                }
            }
        }
        Ok(changes)
    }

    fn link_list_field(&self, owner: &Document, field: &str) -> Result<(String, String)> {
        let spec = doc_str(owner, TYPE).unwrap_or_default().to_string();
        let declared = self.schema.registry.require_field(&spec, field)?;
        if !declared.kind.is_link_list() {
            return Err(Error::BadRequest(format!("{spec}.{field} is not a link collection")));
        }
        Ok((spec, declared.target().unwrap_or_default().to_string()))
    }

    fn write_entries(&self, owner_id: &ResourceId, spec: &str, field: &str, entries: Vec<Value>) -> Result<Document> {
        let mut set = Document::new();
        set.insert(field.to_string(), Value::Array(entries));
        if !self.store().update_resource(owner_id, &set, &[], None)? {
            return Err(Error::NotFound);
        }
        self.run(
            vec![Change::new(spec, owner_id, [format!("{spec}.{field}")])],
            BTreeSet::new(),
        );
        let stored = self.load(owner_id)?;
        self.publish(WatchKind::Updated, &stored, [field.to_string()]);
        Ok(stored)
    }

    /// Adds `target` to a link collection; adding an existing member is a
    /// no-op. Ordered collections append.
    pub fn create_linkcollection_entry(&self, owner_id: &ResourceId, field: &str, target: &ResourceId) -> Result<Document> {
        let owner = self.load(owner_id)?;
        let (spec, target_spec) = self.link_list_field(&owner, field)?;
        self.store()
            .get_resource(target)?
            .filter(|d| doc_str(d, TYPE) == Some(target_spec.as_str()))
            .ok_or_else(|| Error::BadRequest(format!("{field}: no {target_spec} {}", target.encode())))?;

        if linked_ids(&owner, field).contains(target) {
            return Ok(owner);
        }
        let mut entries = owner
            .get(field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        entries.push(json!({ ID: target.as_str() }));
        self.write_entries(owner_id, &spec, field, entries)
    }

    pub fn delete_linkcollection_entry(&self, owner_id: &ResourceId, field: &str, target: &ResourceId) -> Result<Document> {
        let owner = self.load(owner_id)?;
        let (spec, _) = self.link_list_field(&owner, field)?;
        if !linked_ids(&owner, field).contains(target) {
            return Err(Error::NotFound);
        }
        let entries: Vec<Value> = owner
            .get(field)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.get(ID).and_then(Value::as_str) != Some(target.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.write_entries(owner_id, &spec, field, entries)
    }

    /// Re-parents a resource, rewriting canonical URLs below it.
    pub fn move_resource(&self, id: &ResourceId, to: &Parent) -> Result<Document> {
        let doc = self.load(id)?;
        let spec = doc_str(&doc, TYPE).unwrap_or_default().to_string();
        self.check_container(to, &spec)?;

        let old_url = doc_str(&doc, CANONICAL_URL).unwrap_or_default().to_string();
        if url_under(&to.canonical_url, &old_url) {
            return Err(Error::BadRequest(format!("cannot move {old_url} below itself")));
        }
        let new_url = canonical_url(&to.canonical_url, &to.field, id);
        if new_url == old_url {
            return Ok(doc);
        }

        let mut seeds = BTreeSet::new();
        for change in container_changes(&doc) {
            self.discover_into(&change, &mut seeds);
        }

        let mut set = Document::new();
        set.insert(PARENT_ID.into(), json!(to.id.as_ref().map(ResourceId::as_str)));
        set.insert(PARENT_TYPE.into(), json!(to.spec));
        set.insert(PARENT_FIELD_NAME.into(), json!(to.field));
        set.insert(PARENT_CANONICAL_URL.into(), json!(to.canonical_url));
        set.insert(CANONICAL_URL.into(), json!(new_url));
        if !self.store().update_resource(id, &set, &[], None)? {
            return Err(Error::NotFound);
        }
        let rewritten = self.store().rewrite_canonical_prefix(&old_url, &new_url)?;
        if let Err(e) = grants::recompute_subtree(self.store(), &new_url) {
            tracing::error!(error = %e, url = new_url, "grant recompute after move failed");
        }
        tracing::debug!(id = %id, from = old_url, to = new_url, rewritten, "resource moved");

        let moved = self.load(id)?;
        self.run(container_changes(&moved), seeds);
        self.publish(WatchKind::Moved, &moved, []);
        Ok(moved)
    }

    fn refresh_grant(&self, grant_id: &ResourceId) {
        if let Err(e) = grants::refresh_grant(self.store(), grant_id) {
            tracing::error!(error = %e, grant = %grant_id, "grant refresh failed");
        }
    }

    /// Runs the forward plan of a calc for one resource.
    pub fn compute(&self, entry: &CalcEntry, id: &ResourceId) -> Result<Value> {
        let docs = self.store().aggregate(&entry.forward, Some(id))?;
        if !entry.tree.is_chain() {
            return Ok(docs.first().and_then(|d| d.get(VAL)).cloned().unwrap_or(Value::Null));
        }
        let ty = entry.calc_type();
        let slot = if ty.ty.resource_spec().is_some() { ID } else { VAL };
        let mut values = docs.iter().filter_map(|d| d.get(slot).cloned());
        if ty.collection {
            Ok(Value::Array(values.collect()))
        } else {
            Ok(values.next().unwrap_or(Value::Null))
        }
    }

    /// Recomputes one calc cell and writes it back if it changed.
    ///
    /// The write is conditional on the version read before computing; a
    /// lost race recomputes. Compute errors store null and are recorded
    /// under `_dirty.<field>`. Returns whether the stored value changed.
    pub fn update_calc(&self, spec: &str, field: &str, id: &ResourceId) -> Result<bool> {
        let entry = self
            .schema
            .calcs
            .get(spec, field)
            .ok_or_else(|| Error::UnknownField(format!("{spec}.{field}")))?;
        let dirty_key = format!("{DIRTY}.{field}");

        for attempt in 0..=self.engine.config().write_retry_limit {
            let Some(doc) = self.store().get_resource(id)? else {
                return Ok(false);
            };
            if doc_str(&doc, TYPE) != Some(spec) {
                return Ok(false);
            }
            let version = doc_version(&doc);
            let (value, failure) = match self.compute(entry, id) {
                Ok(value) => (value, None),
                Err(Error::Compute(message)) => (Value::Null, Some(message)),
                Err(e) => return Err(e),
            };

            let old = doc.get(field).cloned().unwrap_or(Value::Null);
            let recorded = get_path(&doc, &dirty_key);
            let same_failure = match (&failure, &recorded) {
                (None, None) => true,
                (Some(message), Some(Value::String(previous))) => message == previous,
                _ => false,
            };
            if old == value && same_failure {
                return Ok(false);
            }

            let mut set = Document::new();
            set.insert(field.to_string(), value.clone());
            let mut unset = Vec::new();
            match &failure {
                Some(message) => {
                    tracing::warn!(spec, field, id = %id, error = message.as_str(), "calc compute error, storing null");
                    set.insert(dirty_key.clone(), Value::String(message.clone()));
                }
                None if recorded.is_some() => unset.push(dirty_key.clone()),
                None => {}
            }

            if self.store().update_resource(id, &set, &unset, Some(version))? {
                if old != value {
                    if let Some(stored) = self.store().get_resource(id)? {
                        self.publish(WatchKind::Updated, &stored, [field.to_string()]);
                    }
                }
                return Ok(old != value);
            }
            tracing::debug!(spec, field, id = %id, attempt, "calc write-back raced, retrying");
        }

        tracing::warn!(spec, field, id = %id, "calc write-back kept racing, giving up");
        Ok(false)
    }

    /// Propagates already-applied changes to every dependent calc.
    ///
    /// Never fails: individual errors are logged and counted.
    pub fn propagate(&self, changes: Vec<Change>) -> PropagationReport {
        self.run(changes, BTreeSet::new())
    }

    /// Continues a recorded frontier: pending changes plus calcs to recompute.
    pub fn resume(&self, changes: Vec<Change>, recompute: Vec<(String, String, ResourceId)>) -> PropagationReport {
        let seeds = recompute
            .into_iter()
            .filter_map(|(spec, field, id)| {
                let rank = self.schema.calcs.get(&spec, &field)?.rank;
                Some((rank, spec, field, id))
            })
            .collect();
        self.run(changes, seeds)
    }

    fn discover(&self, change: &Change) -> Result<Vec<Target>> {
        let mut found = Vec::new();
        for (entry, plan) in self.schema.calcs.calcs_touched_by(&change.spec, &change.deps) {
            for doc in self.store().aggregate(&plan.pipeline, Some(&change.id))? {
                if let Some(id) = doc_id(&doc) {
                    found.push((entry.rank, entry.spec.clone(), entry.field.clone(), id));
                }
            }
        }
        Ok(found)
    }

    fn discover_into(&self, change: &Change, targets: &mut BTreeSet<Target>) -> usize {
        match self.discover(change) {
            Ok(found) => {
                let n = found.len();
                targets.extend(found);
                n
            }
            Err(e) => {
                tracing::error!(error = %e, spec = change.spec, id = %change.id, "impact discovery failed");
                0
            }
        }
    }

    fn expired(&self) -> bool {
        self.engine.now() >= self.ctx.deadline
    }

    fn run(&self, changes: Vec<Change>, seeds: BTreeSet<Target>) -> PropagationReport {
        let mut report = PropagationReport::default();
        let mut frontier: VecDeque<Change> = changes.into();
        let mut targets = seeds;
        let mut visited: BTreeSet<(String, String, ResourceId)> = BTreeSet::new();

        loop {
            if (!frontier.is_empty() || !targets.is_empty()) && self.expired() {
                self.defer(frontier, targets, &mut report);
                break;
            }
            while let Some(change) = frontier.pop_front() {
                report.discovered += self.discover_into(&change, &mut targets);
            }
            let Some((_, spec, field, id)) = targets.pop_first() else {
                break;
            };
            if !visited.insert((spec.clone(), field.clone(), id.clone())) {
                continue;
            }

            report.recomputed += 1;
            match self.update_calc(&spec, &field, &id) {
                Ok(true) => {
                    report.written += 1;
                    frontier.push_back(Change::new(&spec, &id, [format!("{spec}.{field}")]));
                }
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(error = %e, spec, field, id = %id, "calc recompute failed");
                }
            }
        }

        tracing::debug!(?report, "propagation finished");
        report
    }

    fn defer(&self, frontier: VecDeque<Change>, targets: BTreeSet<Target>, report: &mut PropagationReport) {
        let mut pending: BTreeMap<ResourceId, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
        for change in frontier {
            pending.entry(change.id).or_default().0.extend(change.deps);
        }
        for (_, _, field, id) in targets {
            pending.entry(id).or_default().1.insert(field);
        }
        for (id, (changed, recompute)) in pending {
            match self.record_frontier(&id, changed, recompute) {
                Ok(true) => report.deferred += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, id = %id, "failed to record propagation frontier"),
            }
        }
        if report.deferred == 0 {
            return;
        }
        let record = UpdateRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind: UpdateKind::Propagation,
            payload: json!({ "resources": report.deferred }),
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        if let Err(e) = self.store().create_update(&record) {
            tracing::error!(error = %e, "failed to record deferred propagation");
        }
        tracing::warn!(deferred = report.deferred, "propagation deadline passed, frontier recorded");
    }

    fn record_frontier(&self, id: &ResourceId, changed: BTreeSet<String>, recompute: BTreeSet<String>) -> Result<bool> {
        let Some(doc) = self.store().get_resource(id)? else {
            return Ok(false);
        };
        let mut set = Document::new();
        for (key, extra) in [(DIRTY_CHANGED, changed), (DIRTY_RECOMPUTE, recompute)] {
            if extra.is_empty() {
                continue;
            }
            let path = format!("{DIRTY}.{key}");
            let mut all: BTreeSet<String> = get_path(&doc, &path)
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            all.extend(extra);
            set.insert(path, json!(all));
        }
        if set.is_empty() {
            return Ok(false);
        }
        self.store().update_resource(id, &set, &[], None)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::testing::*;
    use crate::schema::{Field, SchemaDef};

    fn with_calcs(calcs: &[(&str, &str, &str)]) -> SchemaDef {
        let mut def = company();
        for (spec, name, expr) in calcs {
            def.add_field(spec, Field::calc(name, expr)).unwrap();
        }
        def
    }

    #[test]
    fn test_aggregated_max_follows_writes() {
        let engine = engine_with(with_calcs(&[("calcs", "max_age", "max(employees.age)")]));
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));
        let a = create(&engine, "employee", &root("employees"), json!({"age": 10}));
        create(&engine, "employee", &root("employees"), json!({"age": 14}));
        let c = create(&engine, "employee", &root("employees"), json!({"age": 17}));
        assert_eq!(value(&engine, &calcs, "max_age"), json!(17));

        let ctx = admin(&engine);
        engine.updater(&ctx).update_fields(&a, fields(json!({"age": 20}))).unwrap();
        assert_eq!(value(&engine, &calcs, "max_age"), json!(20));

        engine.updater(&ctx).update_fields(&a, fields(json!({"age": 1}))).unwrap();
        assert_eq!(value(&engine, &calcs, "max_age"), json!(17));
        engine.updater(&ctx).delete_resource(&c).unwrap();
        assert_eq!(value(&engine, &calcs, "max_age"), json!(14));
    }

    #[test]
    fn test_link_traversal_recomputes_on_target_change() {
        let engine = engine_with(with_calcs(&[("employee", "sales", "self.division.yearly_sales")]));
        let d = create(&engine, "division", &root("divisions"), json!({"yearly_sales": 100}));
        let e = create(&engine, "employee", &root("employees"), json!({"division": d.encode()}));
        assert_eq!(value(&engine, &e, "sales"), json!(100));

        let ctx = admin(&engine);
        engine
            .updater(&ctx)
            .update_fields(&d, fields(json!({"yearly_sales": 250})))
            .unwrap();
        assert_eq!(value(&engine, &e, "sales"), json!(250));

        engine.updater(&ctx).delete_resource(&d).unwrap();
        assert_eq!(value(&engine, &e, "division"), json!(null));
        assert_eq!(value(&engine, &e, "sales"), json!(null));
    }

    #[test]
    fn test_filtered_collection_calc() {
        let engine = engine_with(with_calcs(&[("calcs", "older", "employees[age>30]")]));
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));
        let young = create(&engine, "employee", &root("employees"), json!({"age": 21}));
        create(&engine, "employee", &root("employees"), json!({"age": 31}));
        create(&engine, "employee", &root("employees"), json!({"age": 41}));
        assert_eq!(value(&engine, &calcs, "older").as_array().map(Vec::len), Some(2));

        let ctx = admin(&engine);
        engine.updater(&ctx).update_fields(&young, fields(json!({"age": 35}))).unwrap();
        assert_eq!(value(&engine, &calcs, "older").as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn test_resource_leaving_filter_recomputes() {
        let engine = engine_with(with_calcs(&[
            ("calcs", "older", "employees[age>30]"),
            ("calcs", "older_total", "sum(employees[age>30].age)"),
        ]));
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));
        let leaving = create(&engine, "employee", &root("employees"), json!({"age": 35}));
        create(&engine, "employee", &root("employees"), json!({"age": 41}));
        assert_eq!(value(&engine, &calcs, "older_total"), json!(76));

        let ctx = admin(&engine);
        engine.updater(&ctx).update_fields(&leaving, fields(json!({"age": 21}))).unwrap();
        assert_eq!(value(&engine, &calcs, "older").as_array().map(Vec::len), Some(1));
        assert_eq!(value(&engine, &calcs, "older_total"), json!(41));
    }

    #[test]
    fn test_date_overflow_stores_null_and_dirty() {
        let mut def = with_calcs(&[("employee", "review", "self.hired + days(self.age)")]);
        def.add_field("employee", Field::primitive("hired", FieldKind::Datetime)).unwrap();
        let engine = engine_with(def);
        let e = create(
            &engine,
            "employee",
            &root("employees"),
            json!({"hired": "2024-03-10T00:00:00.000Z", "age": 1}),
        );
        assert_eq!(value(&engine, &e, "review"), json!("2024-03-11T00:00:00.000Z"));

        let ctx = admin(&engine);
        engine
            .updater(&ctx)
            .update_fields(&e, fields(json!({"age": 1_000_000_000})))
            .unwrap();
        let doc = get(&engine, &e);
        assert_eq!(doc["review"], json!(null));
        assert!(get_path(&doc, "_dirty.review").is_some());
    }

    #[test]
    fn test_filter_on_missing_field_is_empty() {
        let mut def = with_calcs(&[("calcs", "tall", "employees[height>1]")]);
        def.add_field("employee", Field::primitive("height", FieldKind::Int)).unwrap();
        let engine = engine_with(def);
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));
        create(&engine, "employee", &root("employees"), json!({"age": 40}));
        assert_eq!(value(&engine, &calcs, "tall"), json!([]));
    }

    #[test]
    fn test_filter_on_bool_field() {
        let mut def = with_calcs(&[("calcs", "active_count", "sum(employees[active=true].age)")]);
        def.add_field("employee", Field::primitive("active", FieldKind::Bool)).unwrap();
        let engine = engine_with(def);
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));
        let e = create(&engine, "employee", &root("employees"), json!({"age": 3, "active": true}));
        create(&engine, "employee", &root("employees"), json!({"age": 5, "active": false}));
        assert_eq!(value(&engine, &calcs, "active_count"), json!(3));

        let ctx = admin(&engine);
        engine.updater(&ctx).update_fields(&e, fields(json!({"active": false}))).unwrap();
        assert_eq!(value(&engine, &calcs, "active_count"), json!(0));
    }

    #[test]
    fn test_stored_calcs_match_forward_plans() {
        let engine = engine_with(with_calcs(&[
            ("employee", "sales", "self.division.yearly_sales"),
            ("division", "headcount_age", "sum(self.link_employee_division.age)"),
            ("calcs", "older_sales", "sum(employees[age>30].sales)"),
        ]));
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));
        let east = create(&engine, "division", &root("divisions"), json!({"yearly_sales": 10}));
        let west = create(&engine, "division", &root("divisions"), json!({"yearly_sales": 20}));
        let a = create(&engine, "employee", &root("employees"), json!({"age": 40, "division": east.encode()}));
        let b = create(&engine, "employee", &root("employees"), json!({"age": 25, "division": west.encode()}));

        let ctx = admin(&engine);
        let updater = engine.updater(&ctx);
        updater.update_fields(&b, fields(json!({"age": 50}))).unwrap();
        updater.update_fields(&a, fields(json!({"division": west.encode()}))).unwrap();
        updater.update_fields(&west, fields(json!({"yearly_sales": 7}))).unwrap();
        updater.delete_resource(&east).unwrap();
        assert_eq!(value(&engine, &calcs, "older_sales"), json!(14));

        let schema = engine.schema();
        for entry in schema.calcs.entries() {
            for doc in engine.store().find(&Filter::eq(TYPE, entry.spec.as_str()), None).unwrap() {
                let id = doc_id(&doc).unwrap();
                let fresh = updater.compute(entry, &id).unwrap();
                assert_eq!(
                    doc.get(&entry.field).cloned().unwrap_or(Value::Null),
                    fresh,
                    "{}.{} of {}",
                    entry.spec,
                    entry.field,
                    id
                );
            }
        }
    }

    #[test]
    fn test_switch_on_string() {
        let engine = engine_with(with_calcs(&[("employee", "code", "self.name -> ('Bob': 22, 'Ned': 11)")]));
        let e = create(&engine, "employee", &root("employees"), json!({"name": "Bob"}));
        assert_eq!(value(&engine, &e, "code"), json!(22));

        let ctx = admin(&engine);
        let updater = engine.updater(&ctx);
        updater.update_fields(&e, fields(json!({"name": "Ned"}))).unwrap();
        assert_eq!(value(&engine, &e, "code"), json!(11));
        updater.update_fields(&e, fields(json!({"name": "Other"}))).unwrap();
        assert_eq!(value(&engine, &e, "code"), json!(null));
    }

    #[test]
    fn test_chained_calcs_settle_in_order() {
        let engine = engine_with(with_calcs(&[
            ("employee", "double", "self.age * 2"),
            ("employee", "quad", "self.double * 2"),
            ("division", "total", "sum(self.employees.quad)"),
        ]));
        let d = create(&engine, "division", &root("divisions"), json!({}));
        let parent = Parent::of(&get(&engine, &d), "employees").unwrap();
        let e = create(&engine, "employee", &parent, json!({"age": 3}));
        assert_eq!(value(&engine, &e, "quad"), json!(12));
        assert_eq!(value(&engine, &d, "total"), json!(12));

        let ctx = admin(&engine);
        engine.updater(&ctx).update_fields(&e, fields(json!({"age": 5}))).unwrap();
        assert_eq!(value(&engine, &e, "quad"), json!(20));
        assert_eq!(value(&engine, &d, "total"), json!(20));
    }

    #[test]
    fn test_propagate_is_idempotent() {
        let engine = engine_with(with_calcs(&[("employee", "double", "self.age * 2")]));
        let e = create(&engine, "employee", &root("employees"), json!({"age": 4}));
        let ctx = admin(&engine);
        let report = engine
            .updater(&ctx)
            .propagate(vec![Change::new("employee", &e, ["employee.age".to_string()])]);
        assert_eq!(report.recomputed, 1);
        assert_eq!(report.written, 0);
    }

    #[test]
    fn test_division_by_zero_recorded_in_dirty() {
        let engine = engine_with(with_calcs(&[("employee", "ratio", "self.age / 0")]));
        let e = create(&engine, "employee", &root("employees"), json!({"age": 4}));
        let doc = get(&engine, &e);
        assert_eq!(doc["ratio"], json!(null));
        assert!(get_path(&doc, "_dirty.ratio").is_some());
    }

    #[test]
    fn test_null_arithmetic() {
        let engine = engine_with(with_calcs(&[
            ("employee", "plus", "self.age + 1"),
            ("employee", "times", "self.age * 1"),
        ]));
        let e = create(&engine, "employee", &root("employees"), json!({}));
        assert_eq!(value(&engine, &e, "plus"), json!(1));
        assert_eq!(value(&engine, &e, "times"), json!(null));
    }

    #[test]
    fn test_empty_aggregates() {
        let engine = engine_with(with_calcs(&[
            ("calcs", "total", "sum(employees.age)"),
            ("calcs", "mean", "average(employees.age)"),
            ("calcs", "oldest", "max(employees.age)"),
        ]));
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));
        assert_eq!(value(&engine, &calcs, "total"), json!(0));
        assert_eq!(value(&engine, &calcs, "mean"), json!(null));
        assert_eq!(value(&engine, &calcs, "oldest"), json!(null));
    }

    #[test]
    fn test_move_between_root_collections() {
        let mut def = with_calcs(&[
            ("calcs", "current", "sum(divisions.employees.age)"),
            ("calcs", "former", "sum(former_divisions.employees.age)"),
        ]);
        def.add_field("root", Field::collection("former_divisions", "division")).unwrap();
        let engine = engine_with(def);
        let calcs = create(&engine, "calcs", &root("calcs"), json!({}));
        let d = create(&engine, "division", &root("divisions"), json!({}));
        let parent = Parent::of(&get(&engine, &d), "employees").unwrap();
        let e = create(&engine, "employee", &parent, json!({"age": 30}));
        assert_eq!(value(&engine, &calcs, "current"), json!(30));

        let ctx = admin(&engine);
        engine
            .updater(&ctx)
            .move_resource(&d, &Parent::root("former_divisions"))
            .unwrap();
        assert_eq!(value(&engine, &calcs, "current"), json!(0));
        assert_eq!(value(&engine, &calcs, "former"), json!(30));

        let moved = get(&engine, &e);
        let parent_url = doc_str(&moved, PARENT_CANONICAL_URL).unwrap();
        assert!(parent_url.starts_with("/former_divisions/"));
        assert_eq!(
            doc_str(&moved, CANONICAL_URL).unwrap(),
            canonical_url(parent_url, "employees", &e)
        );
    }

    #[test]
    fn test_delete_cascades_to_children() {
        let engine = engine_with(company());
        let d = create(&engine, "division", &root("divisions"), json!({}));
        let parent = Parent::of(&get(&engine, &d), "employees").unwrap();
        let e = create(&engine, "employee", &parent, json!({}));

        let ctx = admin(&engine);
        let gone = engine.updater(&ctx).delete_resource(&d).unwrap();
        assert_eq!(gone.len(), 2);
        assert!(engine.store().get_resource(&e).unwrap().is_none());
        assert!(matches!(engine.updater(&ctx).delete_resource(&d), Err(Error::NotFound)));
    }

    #[test]
    fn test_link_collection_entries() {
        let mut def = with_calcs(&[("employee", "team_sales", "sum(self.teams.yearly_sales)")]);
        def.add_field("employee", Field::linkcollection("teams", "division")).unwrap();
        let engine = engine_with(def);
        let d1 = create(&engine, "division", &root("divisions"), json!({"yearly_sales": 5}));
        let d2 = create(&engine, "division", &root("divisions"), json!({"yearly_sales": 7}));
        let e = create(&engine, "employee", &root("employees"), json!({}));

        let ctx = admin(&engine);
        let updater = engine.updater(&ctx);
        updater.create_linkcollection_entry(&e, "teams", &d1).unwrap();
        updater.create_linkcollection_entry(&e, "teams", &d2).unwrap();
        updater.create_linkcollection_entry(&e, "teams", &d2).unwrap();
        assert_eq!(linked_ids(&get(&engine, &e), "teams").len(), 2);
        assert_eq!(value(&engine, &e, "team_sales"), json!(12));

        updater.delete_linkcollection_entry(&e, "teams", &d1).unwrap();
        assert_eq!(value(&engine, &e, "team_sales"), json!(7));
        assert!(matches!(
            updater.delete_linkcollection_entry(&e, "teams", &d1),
            Err(Error::NotFound)
        ));

        updater.delete_resource(&d2).unwrap();
        assert!(linked_ids(&get(&engine, &e), "teams").is_empty());
        assert_eq!(value(&engine, &e, "team_sales"), json!(0));
    }

    #[test]
    fn test_expired_deadline_records_frontier() {
        let config = EngineConfig {
            propagation_deadline_ms: 0,
            ..EngineConfig::default()
        };
        let engine = engine_with_config(with_calcs(&[("employee", "double", "self.age * 2")]), config);
        let e = create(&engine, "employee", &root("employees"), json!({"age": 4}));
        let doc = get(&engine, &e);
        assert_eq!(doc.get("double"), None);
        assert_eq!(
            get_path(&doc, "_dirty._recompute"),
            Some(json!(["double"]))
        );
    }

    #[test]
    fn test_invalid_link_rejected() {
        let engine = engine_with(company());
        let ctx = admin(&engine);
        let other = create(&engine, "employee", &root("employees"), json!({}));
        let err = engine
            .updater(&ctx)
            .create_resource("employee", &root("employees"), fields(json!({"division": other.encode()})))
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_canonical_url_cache_for_links() {
        let engine = engine_with(company());
        let d = create(&engine, "division", &root("divisions"), json!({}));
        let e = create(&engine, "employee", &root("employees"), json!({"division": d.encode()}));
        let doc = get(&engine, &e);
        assert_eq!(
            doc_str(&doc, "_canonical_url_division"),
            doc_str(&get(&engine, &d), CANONICAL_URL)
        );
    }
}
