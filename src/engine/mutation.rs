use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::updater::Parent;
use super::writer::FROM_KEY;
use super::{Context, Engine, Principal, ensure_indexes};
use crate::error::{Error, Result};
use crate::plan::Filter;
use crate::schema::{Field, FieldKind, Schema, SchemaDef, normalize_datetime};
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    CreateSpec { spec: String },
    CreateField { spec: String, field: String },
    RenameSpec { from: String, to: String },
    RenameField { spec: String, from: String, to: String },
    AlterField { spec: String, field: String },
    Move { from_path: String, to_path: String },
    DeleteField { spec: String, field: String },
    DeleteSpec { spec: String },
}

impl Step {
    const fn order(&self) -> u8 {
        match self {
            Step::CreateSpec { .. } => 0,
            Step::CreateField { .. } => 1,
            Step::RenameSpec { .. } => 2,
            Step::RenameField { .. } => 3,
            Step::AlterField { .. } => 4,
            Step::Move { .. } => 5,
            Step::DeleteField { .. } => 6,
            Step::DeleteSpec { .. } => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationReport {
    pub schema_id: String,
    pub steps: usize,
    /// Calc cells recomputed after the data steps.
    pub recomputed: usize,
}

/// An ordered migration from one schema version to another.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub from: SchemaDef,
    pub to: SchemaDef,
    pub steps: Vec<Step>,
}

fn spec_names(def: &SchemaDef) -> BTreeSet<String> {
    def.specs
        .keys()
        .cloned()
        .chain(std::iter::once(ROOT_SPEC.to_string()))
        .collect()
}

/// Fields differ in a way that needs a data or index pass.
fn altered(from: &Field, to: &Field) -> bool {
    from.kind != to.kind
        || from.target_spec_name != to.target_spec_name
        || from.calc_str != to.calc_str
        || from.indexed != to.indexed
        || from.unique != to.unique
        || from.unique_global != to.unique_global
}

/// Computes the steps turning `from` into `to`. Renames show up as a
/// delete/create pair until promoted.
#[must_use]
pub fn diff(from: &SchemaDef, to: &SchemaDef) -> Mutation {
    let mut to = to.clone();
    to.ensure_builtins();
    let to = &to;
    let mut steps = Vec::new();
    let (before, after) = (spec_names(from), spec_names(to));

    for spec in after.difference(&before) {
        steps.push(Step::CreateSpec { spec: spec.clone() });
    }
    for spec in &after {
        let Some(target) = to.spec(spec) else { continue };
        let source = from.spec(spec);
        for field in &target.fields {
            match source.and_then(|s| s.field(&field.name)) {
                None => steps.push(Step::CreateField {
                    spec: spec.clone(),
                    field: field.name.clone(),
                }),
                Some(old) if altered(old, field) => steps.push(Step::AlterField {
                    spec: spec.clone(),
                    field: field.name.clone(),
                }),
                Some(_) => {}
            }
        }
        if let Some(source) = source {
            for field in &source.fields {
                if target.field(&field.name).is_none() {
                    steps.push(Step::DeleteField {
                        spec: spec.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }
    }
    for spec in before.difference(&after) {
        steps.push(Step::DeleteSpec { spec: spec.clone() });
    }

    let mut mutation = Mutation {
        from: from.clone(),
        to: to.clone(),
        steps,
    };
    mutation.sort();
    mutation
}

impl Mutation {
    fn sort(&mut self) {
        self.steps.sort_by_key(Step::order);
    }

    /// Turns `delete_field(spec, from)` + `create_field(spec, to)` into a
    /// rename that keeps stored values.
    pub fn promote_rename(&mut self, spec: &str, from: &str, to: &str) -> Result<()> {
        let delete = Step::DeleteField {
            spec: spec.to_string(),
            field: from.to_string(),
        };
        let create = Step::CreateField {
            spec: spec.to_string(),
            field: to.to_string(),
        };
        if !self.steps.contains(&delete) || !self.steps.contains(&create) {
            return Err(Error::BadRequest(format!(
                "no delete/create pair for {spec}.{from} -> {spec}.{to}"
            )));
        }
        self.steps.retain(|s| *s != delete && *s != create);
        self.steps.push(Step::RenameField {
            spec: spec.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
        self.sort();
        Ok(())
    }

    /// Turns `delete_spec(from)` + `create_spec(to)` into a spec rename.
    pub fn promote_spec_rename(&mut self, from: &str, to: &str) -> Result<()> {
        let delete = Step::DeleteSpec { spec: from.to_string() };
        let create = Step::CreateSpec { spec: to.to_string() };
        if !self.steps.contains(&delete) || !self.steps.contains(&create) {
            return Err(Error::BadRequest(format!("no delete/create pair for spec {from} -> {to}")));
        }
        self.steps.retain(|s| {
            *s != delete
                && *s != create
                && !matches!(s, Step::CreateField { spec, .. } if spec == to)
        });
        self.steps.push(Step::RenameSpec {
            from: from.to_string(),
            to: to.to_string(),
        });
        self.sort();
        Ok(())
    }

    /// Moves the resources `from_path` matches into the collection at
    /// `to_path` (both resolved against the new schema).
    pub fn add_move(&mut self, from_path: &str, to_path: &str) {
        self.steps.push(Step::Move {
            from_path: from_path.to_string(),
            to_path: to_path.to_string(),
        });
        self.sort();
    }

    /// Calcs of the old schema, kept in the new one, that read something
    /// this mutation deletes.
    fn broken_references(&self, from: &Schema) -> Vec<String> {
        let mut deleted = BTreeSet::new();
        for step in &self.steps {
            match step {
                Step::DeleteField { spec, field } => {
                    deleted.insert(format!("{spec}.{field}"));
                }
                Step::DeleteSpec { spec } => {
                    for field in from.def.spec(spec).map(|s| s.fields.as_slice()).unwrap_or_default() {
                        deleted.insert(format!("{spec}.{}", field.name));
                    }
                }
                _ => {}
            }
        }
        from.calcs
            .entries()
            .filter(|e| {
                self.to
                    .spec(&e.spec)
                    .and_then(|s| s.field(&e.field))
                    .is_some_and(|f| f.calc_str.as_deref() == Some(e.expr.as_str()))
            })
            .filter(|e| e.deps.iter().any(|d| deleted.contains(d)))
            .map(|e| format!("{} = {}", e.dep_name(), e.expr))
            .collect()
    }

    fn build_target(&self, from: &Schema) -> Result<Arc<Schema>> {
        Schema::build(self.to.clone()).map_err(|e| {
            let broken = self.broken_references(from);
            if broken.is_empty() {
                e
            } else {
                Error::BadRequest(format!("deletion breaks calcs: {}", broken.join(", ")))
            }
        })
    }

    /// Applies the steps to the live store, then promotes and installs the
    /// new schema. Conversions are checked before anything is written.
    pub fn execute(mut self, engine: &Engine) -> Result<MutationReport> {
        let current = engine.schema();
        if current.def.id != self.from.id {
            return Err(Error::BadRequest(format!(
                "mutation planned against {} but current schema is {}",
                self.from.id,
                current.id()
            )));
        }
        self.to.ensure_builtins();
        self.to.seal();
        let target = self.build_target(&current)?;
        self.check_conversions(engine, &current, &target)?;

        let record = UpdateRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind: UpdateKind::Mutation,
            payload: json!({ "from": self.from.id, "to": self.to.id, "steps": self.steps }),
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        engine.store().create_update(&record)?;
        tracing::info!(from = %self.from.id, to = %self.to.id, steps = self.steps.len(), "mutation started");

        match self.apply(engine, &current, &target) {
            Ok(recomputed) => {
                engine.store().finish_update(&record.id, None)?;
                tracing::info!(schema = %target.id(), recomputed, "mutation finished");
                Ok(MutationReport {
                    schema_id: target.id().to_string(),
                    steps: self.steps.len(),
                    recomputed,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "mutation failed");
                engine.store().finish_update(&record.id, Some(&e.to_string()))?;
                Err(e)
            }
        }
    }

    fn apply(&self, engine: &Engine, from: &Schema, to: &Arc<Schema>) -> Result<usize> {
        let ctx = Context {
            schema: Arc::clone(to),
            principal: Principal::System,
            deadline: engine.now() + engine.config().propagation_deadline(),
        };
        let mut touched = BTreeSet::new();
        for step in &self.steps {
            tracing::debug!(?step, "applying mutation step");
            self.apply_step(engine, &ctx, from, step, &mut touched)?;
        }

        let store = engine.store();
        store.save_schema(&self.to)?;
        store.promote_schema(&self.to.id)?;
        ensure_indexes(store, to)?;
        engine.install_schema(Arc::clone(to));

        self.recompute(engine, &ctx, from, &touched)
    }

    fn apply_step(&self, engine: &Engine, ctx: &Context, from: &Schema, step: &Step, touched: &mut BTreeSet<String>) -> Result<()> {
        let store = engine.store();
        match step {
            Step::CreateSpec { .. } => {}
            Step::CreateField { spec, field } => {
                touched.insert(format!("{spec}.{field}"));
                let declared = ctx.schema.registry.require_field(spec, field)?;
                if let Some(default) = &declared.default {
                    let value = crate::schema::coerce_value(declared, default)?;
                    let missing = Filter::And(vec![
                        Filter::eq(TYPE, spec.as_str()),
                        Filter::Exists {
                            field: field.clone(),
                            exists: false,
                        },
                    ]);
                    let mut set = Document::new();
                    set.insert(field.clone(), value);
                    let mut filled = 0;
                    for doc in store.find(&missing, None)? {
                        if let Some(id) = doc_id(&doc) {
                            filled += usize::from(store.update_resource(&id, &set, &[], None)?);
                        }
                    }
                    tracing::debug!(spec, field, filled, "backfilled default");
                }
            }
            Step::RenameSpec { from: old, to: new } => {
                touched.insert(format!("{new}.*"));
                for name in from.def.spec(old).map(|s| s.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>()).unwrap_or_default() {
                    store.drop_indexes(old, &name)?;
                }
                retag(store, TYPE, old, new)?;
                retag(store, PARENT_TYPE, old, new)?;
            }
            Step::RenameField { spec, from: old, to: new } => {
                touched.insert(format!("{spec}.{new}"));
                store.drop_indexes(spec, old)?;
                let is_collection = from
                    .registry
                    .field(spec, old)
                    .is_some_and(|f| f.kind == FieldKind::Collection);
                rename_field(engine, spec, old, new, is_collection)?;
            }
            Step::AlterField { spec, field } => {
                touched.insert(format!("{spec}.{field}"));
                let (Some(before), Ok(after)) = (from.registry.field(spec, field), ctx.schema.registry.require_field(spec, field)) else {
                    return Ok(());
                };
                if before.indexed != after.indexed || before.unique != after.unique || before.unique_global != after.unique_global {
                    store.drop_indexes(spec, field)?;
                }
                if before.kind != after.kind && before.kind.is_primitive() && after.kind.is_primitive() {
                    convert_all(engine, spec, field, after.kind)?;
                }
            }
            Step::Move { from_path, to_path } => {
                let mut body = Document::new();
                body.insert(FROM_KEY.to_string(), json!(from_path));
                engine.writer(ctx).put_move(to_path, body)?;
            }
            Step::DeleteField { spec, field } => {
                let kind = from.registry.field(spec, field).map(|f| f.kind);
                if kind == Some(FieldKind::Collection) {
                    let children = store.find(
                        &Filter::And(vec![
                            Filter::eq(PARENT_TYPE, spec.as_str()),
                            Filter::eq(PARENT_FIELD_NAME, field.as_str()),
                        ]),
                        None,
                    )?;
                    delete_all(engine, ctx, &children)?;
                }
                store.drop_indexes(spec, field)?;
                let unset = [
                    field.clone(),
                    format!("{CANONICAL_URL_PREFIX}{field}"),
                    format!("{DIRTY}.{field}"),
                ];
                for doc in store.find(&Filter::eq(TYPE, spec.as_str()), None)? {
                    if let Some(id) = doc_id(&doc) {
                        store.update_resource(&id, &Document::new(), &unset, None)?;
                    }
                }
            }
            Step::DeleteSpec { spec } => {
                for field in from.def.spec(spec).map(|s| s.fields.as_slice()).unwrap_or_default() {
                    store.drop_indexes(spec, &field.name)?;
                }
                let docs = store.find(&Filter::eq(TYPE, spec.as_str()), None)?;
                delete_all(engine, ctx, &docs)?;
            }
        }
        Ok(())
    }

    /// Refuses primitive conversions that would lose data, naming the
    /// first offending resource.
    fn check_conversions(&self, engine: &Engine, from: &Schema, to: &Schema) -> Result<()> {
        for step in &self.steps {
            let Step::AlterField { spec, field } = step else { continue };
            let (Some(before), Some(after)) = (from.registry.field(spec, field), to.registry.field(spec, field)) else {
                continue;
            };
            if before.kind == after.kind {
                continue;
            }
            if !(before.kind.is_primitive() && after.kind.is_primitive()) {
                // A calc may replace a stored value or the other way round.
                if before.kind == FieldKind::Calc || after.kind == FieldKind::Calc {
                    continue;
                }
                return Err(Error::BadRequest(format!(
                    "cannot convert {spec}.{field} from {} to {}",
                    before.kind, after.kind
                )));
            }
            for doc in engine.store().find(&Filter::eq(TYPE, spec.as_str()), None)? {
                let value = doc.get(field).unwrap_or(&Value::Null);
                if convert(value, after.kind).is_none() {
                    let id = doc_id(&doc).map(|id| id.encode()).unwrap_or_default();
                    return Err(Error::BadRequest(format!(
                        "cannot convert {spec}.{field} of {id}: {value} is not a lossless {}",
                        after.kind
                    )));
                }
            }
        }
        Ok(())
    }

    /// Recomputes every calc that is new, changed or reads something the
    /// steps touched, for every resource of its spec.
    fn recompute(&self, engine: &Engine, ctx: &Context, from: &Schema, touched: &BTreeSet<String>) -> Result<usize> {
        let store = engine.store();
        let mut targets = Vec::new();
        for entry in ctx.schema.calcs.entries() {
            let unchanged = from
                .calcs
                .get(&entry.spec, &entry.field)
                .is_some_and(|old| old.expr == entry.expr);
            let reads_touched = entry.deps.iter().any(|d| touched.contains(d))
                || touched.iter().any(|t| {
                    t.strip_suffix(".*")
                        .is_some_and(|spec| entry.deps.iter().any(|d| d.starts_with(&format!("{spec}."))))
                });
            if unchanged && !reads_touched {
                continue;
            }
            for doc in store.find(&Filter::eq(TYPE, entry.spec.as_str()), None)? {
                if let Some(id) = doc_id(&doc) {
                    targets.push((entry.spec.clone(), entry.field.clone(), id));
                }
            }
        }
        if targets.is_empty() {
            return Ok(0);
        }
        let report = engine.updater(ctx).resume(Vec::new(), targets);
        Ok(report.recomputed)
    }
}

/// Rewrites a string field holding a spec name.
fn retag(store: &dyn crate::store::Store, key: &str, old: &str, new: &str) -> Result<()> {
    let mut set = Document::new();
    set.insert(key.to_string(), json!(new));
    for doc in store.find(&Filter::eq(key, old), None)? {
        if let Some(id) = doc_id(&doc) {
            store.update_resource(&id, &set, &[], None)?;
        }
    }
    Ok(())
}

fn rename_field(engine: &Engine, spec: &str, old: &str, new: &str, is_collection: bool) -> Result<()> {
    let store = engine.store();
    let owners = if spec == ROOT_SPEC {
        vec![None]
    } else {
        store
            .find(&Filter::eq(TYPE, spec), None)?
            .into_iter()
            .map(Some)
            .collect()
    };

    for owner in owners {
        if let Some(doc) = &owner {
            let Some(id) = doc_id(doc) else { continue };
            let mut set = Document::new();
            let mut unset = Vec::new();
            for (from_key, to_key) in [
                (old.to_string(), new.to_string()),
                (format!("{CANONICAL_URL_PREFIX}{old}"), format!("{CANONICAL_URL_PREFIX}{new}")),
                (format!("{DIRTY}.{old}"), format!("{DIRTY}.{new}")),
            ] {
                if let Some(value) = get_path(doc, &from_key) {
                    set.insert(to_key, value);
                    unset.push(from_key);
                }
            }
            if !set.is_empty() {
                store.update_resource(&id, &set, &unset, None)?;
            }
        }
        if !is_collection {
            continue;
        }

        // Children of a renamed collection move to a new canonical URL.
        let parent = match &owner {
            None => Parent::root(old),
            Some(doc) => Parent::of(doc, old)?,
        };
        let children = store.find(
            &Filter::And(vec![
                Filter::eq(PARENT_FIELD_NAME, old),
                Filter::eq(PARENT_CANONICAL_URL, parent.canonical_url.as_str()),
            ]),
            None,
        )?;
        if children.is_empty() {
            continue;
        }
        let mut set = Document::new();
        set.insert(PARENT_FIELD_NAME.to_string(), json!(new));
        for child in &children {
            if let Some(id) = doc_id(child) {
                store.update_resource(&id, &set, &[], None)?;
            }
        }
        let old_url = parent.collection_url();
        let new_url = Parent { field: new.to_string(), ..parent }.collection_url();
        store.rewrite_canonical_prefix(&old_url, &new_url)?;
        super::grants::recompute_subtree(store, &new_url)?;
    }
    Ok(())
}

/// Deletes each resource through the updater so inbound links are nulled
/// and readers of the removed data recompute.
fn delete_all(engine: &Engine, ctx: &Context, docs: &[Document]) -> Result<usize> {
    let updater = engine.updater(ctx);
    let mut deleted = 0;
    for id in docs.iter().filter_map(doc_id) {
        match updater.delete_resource(&id) {
            Ok(ids) => deleted += ids.len(),
            // Already gone with an ancestor's subtree.
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(deleted)
}

fn convert_all(engine: &Engine, spec: &str, field: &str, kind: FieldKind) -> Result<usize> {
    let store = engine.store();
    let mut converted = 0;
    for doc in store.find(&Filter::eq(TYPE, spec), None)? {
        let (Some(id), Some(value)) = (doc_id(&doc), doc.get(field)) else {
            continue;
        };
        let new = convert(value, kind).ok_or_else(|| {
            Error::BadRequest(format!("cannot convert {spec}.{field} of {}", id.encode()))
        })?;
        if new != *value {
            let mut set = Document::new();
            set.insert(field.to_string(), new);
            converted += usize::from(store.update_resource(&id, &set, &[], None)?);
        }
    }
    tracing::debug!(spec, field, to = %kind, converted, "converted field values");
    Ok(converted)
}

/// Lossless primitive conversion; `None` when the value does not survive.
fn convert(value: &Value, kind: FieldKind) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }
    match kind {
        FieldKind::Str => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(json!(n.to_string())),
            Value::Bool(b) => Some(json!(b.to_string())),
            _ => None,
        },
        FieldKind::Float => match value {
            Value::Number(n) => n.as_f64().map(|f| json!(f)),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| json!(f)),
            _ => None,
        },
        FieldKind::Int => match value {
            Value::Number(n) if n.is_i64() => Some(value.clone()),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| json!(f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok().map(|i| json!(i)),
            _ => None,
        },
        FieldKind::Bool => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.as_str() {
                "true" => Some(json!(true)),
                "false" => Some(json!(false)),
                _ => None,
            },
            _ => None,
        },
        FieldKind::Datetime => value.as_str().and_then(normalize_datetime).map(Value::String),
        _ => None,
    }
}
