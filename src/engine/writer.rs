use serde_json::Value;

use super::grants;
use super::updater::{Parent, Updater};
use super::{Context, Engine};
use crate::error::{Error, Result};
use crate::lang::{self, Node, NodeKind, RefKind};
use crate::plan::url_pipeline;
use crate::types::*;

/// Body key naming the source URL of a move.
pub const FROM_KEY: &str = "_from";

/// Body key of a link-collection POST.
pub const LINK_KEY: &str = "id";

/// A collection field addressed by a URL, with the resources owning it.
struct Slot {
    /// `None` for root collections.
    owners: Option<Vec<Document>>,
    field: String,
    kind: RefKind,
}

pub struct Writer<'a> {
    engine: &'a Engine,
    ctx: &'a Context,
    updater: Updater<'a>,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(engine: &'a Engine, ctx: &'a Context) -> Self {
        Self {
            engine,
            ctx,
            updater: Updater::new(engine, ctx),
        }
    }

    fn resolve(&self, path: &str) -> Result<Node> {
        lang::parse_url(&self.ctx.schema.registry, &self.ctx.schema.calcs, path)
    }

    /// Resources a resource-valued node reaches, minus those the principal
    /// cannot read.
    fn fetch(&self, node: &Node) -> Result<Vec<Document>> {
        let pipeline = url_pipeline(node, &self.ctx.schema.registry)?;
        let docs = self.engine.store().aggregate(&pipeline, None)?;
        Ok(docs
            .into_iter()
            .filter(|d| d.contains_key(CANONICAL_URL) && grants::can_read(&self.ctx.principal, d))
            .collect())
    }

    fn authorize(&self, op: GrantKind, url: &str) -> Result<()> {
        if grants::can_access(&self.ctx.principal, op, url) {
            Ok(())
        } else {
            tracing::debug!(op = op.as_str(), url, "write denied");
            Err(Error::Forbidden)
        }
    }

    fn slot(&self, node: &Node) -> Result<Option<Slot>> {
        match &node.kind {
            NodeKind::Root { name } if name != "self" => {
                let field = self.ctx.schema.registry.require_field(ROOT_SPEC, name)?;
                Ok(Some(Slot {
                    owners: None,
                    field: name.clone(),
                    kind: RefKind::from_field_kind(field.kind),
                }))
            }
            NodeKind::Ref {
                kind: kind @ (RefKind::Collection | RefKind::LinkCollection | RefKind::OrderedCollection),
                parent,
                field,
                ..
            } => Ok(Some(Slot {
                owners: Some(self.fetch(parent)?),
                field: field.clone(),
                kind: *kind,
            })),
            _ => Ok(None),
        }
    }

    fn containing(&self, slot: &Slot) -> Result<Parent> {
        match &slot.owners {
            None => Ok(Parent::root(&slot.field)),
            Some(owners) => Parent::of(&exactly_one(owners.clone())?, &slot.field),
        }
    }

    /// Creates a resource in a collection, or links an existing one into a
    /// link collection (`{"id": "ID…"}`).
    pub fn post(&self, path: &str, body: Document) -> Result<Document> {
        let node = self.resolve(path)?;
        let slot = self
            .slot(&node)?
            .ok_or_else(|| Error::BadRequest(format!("cannot POST to {path}")))?;
        let parent = self.containing(&slot)?;
        self.authorize(GrantKind::Create, &parent.collection_url())?;

        match slot.kind {
            RefKind::Collection => {
                let spec = node
                    .ty
                    .ty
                    .resource_spec()
                    .ok_or_else(|| Error::Invariant(format!("untyped collection {path}")))?;
                self.updater.create_resource(spec, &parent, body)
            }
            RefKind::LinkCollection | RefKind::OrderedCollection => {
                let target = body
                    .get(LINK_KEY)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::BadRequest(format!("POST to {path} needs an \"{LINK_KEY}\"")))?;
                let target = ResourceId::decode(target)?;
                let owner = parent
                    .id
                    .ok_or_else(|| Error::Invariant(format!("root link collection {path}")))?;
                self.updater.create_linkcollection_entry(&owner, &slot.field, &target)
            }
            _ => Err(Error::BadRequest(format!("cannot POST to {path}"))),
        }
    }

    /// Partial update of the single resource at `path`.
    pub fn patch(&self, path: &str, body: Document) -> Result<Document> {
        let node = self.resolve(path)?;
        if node.ty.collection {
            return Err(Error::Forbidden);
        }
        if node.ty.ty.resource_spec().is_none() {
            return Err(Error::BadRequest(format!("{path} is not a resource")));
        }
        let doc = exactly_one(self.fetch(&node)?)?;
        self.authorize(GrantKind::Update, doc_str(&doc, CANONICAL_URL).unwrap_or_default())?;
        let id = doc_id(&doc).ok_or(Error::NotFound)?;
        self.updater.update_fields(&id, body)
    }

    /// Moves every resource `{"_from": url}` matches into the collection at
    /// `path`.
    pub fn put_move(&self, path: &str, body: Document) -> Result<Vec<Document>> {
        let from = body
            .get(FROM_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest(format!("PUT needs \"{FROM_KEY}\"")))?;
        let node = self.resolve(path)?;
        let slot = self
            .slot(&node)?
            .filter(|s| s.kind == RefKind::Collection)
            .ok_or_else(|| Error::BadRequest(format!("cannot move into {path}")))?;
        let parent = self.containing(&slot)?;
        self.authorize(GrantKind::Put, &parent.collection_url())?;

        let source = self.resolve(from)?;
        if source.ty.ty.resource_spec() != node.ty.ty.resource_spec() {
            return Err(Error::BadRequest(format!("{from} does not hold what {path} holds")));
        }
        let mut moved = Vec::new();
        for doc in self.fetch(&source)? {
            let Some(id) = doc_id(&doc) else { continue };
            moved.push(self.updater.move_resource(&id, &parent)?);
        }
        tracing::info!(from, to = path, moved = moved.len(), "resources moved");
        Ok(moved)
    }

    /// Tombstones the resource at `path`, or unlinks it when `path` points
    /// into a link collection. Returns the ids removed.
    pub fn delete(&self, path: &str) -> Result<Vec<ResourceId>> {
        let node = self.resolve(path)?;
        if let NodeKind::IdMatch { parent, id } = &node.kind {
            if let Some(slot) = self.slot(parent)? {
                if matches!(slot.kind, RefKind::LinkCollection | RefKind::OrderedCollection) {
                    let owner = self.containing(&slot)?;
                    let url = format!("{}/{}", owner.collection_url(), id.encode());
                    self.authorize(GrantKind::Delete, &url)?;
                    let owner_id = owner.id.ok_or(Error::NotFound)?;
                    self.updater
                        .delete_linkcollection_entry(&owner_id, &slot.field, id)?;
                    return Ok(vec![id.clone()]);
                }
            }
        }
        if node.ty.collection {
            return Err(Error::Forbidden);
        }

        let doc = exactly_one(self.fetch(&node)?)?;
        self.authorize(GrantKind::Delete, doc_str(&doc, CANONICAL_URL).unwrap_or_default())?;
        let id = doc_id(&doc).ok_or(Error::NotFound)?;
        self.updater.delete_resource(&id)
    }
}

fn exactly_one(mut docs: Vec<Document>) -> Result<Document> {
    match docs.len() {
        0 => Err(Error::NotFound),
        1 => Ok(docs.remove(0)),
        n => Err(Error::BadRequest(format!("URL matches {n} resources"))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::Principal;
    use crate::engine::testing::*;
    use crate::schema::{Field, SchemaDef};

    fn schema() -> SchemaDef {
        let mut def = company();
        def.add_field("employee", Field::linkcollection("teams", "division")).unwrap();
        def.add_field("root", Field::collection("former_divisions", "division")).unwrap();
        def
    }

    fn url_of(engine: &crate::engine::Engine, id: &ResourceId) -> String {
        doc_str(&get(engine, id), CANONICAL_URL).unwrap().to_string()
    }

    #[test]
    fn test_post_and_patch() {
        let engine = engine_with(schema());
        let ctx = admin(&engine);
        let writer = engine.writer(&ctx);
        let doc = writer.post("/employees", fields(json!({"name": "Ann"}))).unwrap();
        let url = doc_str(&doc, CANONICAL_URL).unwrap().to_string();

        let patched = writer.patch(&url, fields(json!({"age": 33}))).unwrap();
        assert_eq!(patched["age"], json!(33));
        assert_eq!(patched["name"], json!("Ann"));
    }

    #[test]
    fn test_post_into_child_collection() {
        let engine = engine_with(schema());
        let d = create(&engine, "division", &root("divisions"), json!({}));
        let ctx = admin(&engine);
        let path = format!("{}/employees", url_of(&engine, &d));
        let doc = engine.writer(&ctx).post(&path, fields(json!({"age": 1}))).unwrap();
        assert_eq!(doc_str(&doc, PARENT_ID), Some(d.as_str()));
        assert!(doc_str(&doc, CANONICAL_URL).unwrap().starts_with(&path));
    }

    #[test]
    fn test_patch_collection_forbidden() {
        let engine = engine_with(schema());
        let ctx = admin(&engine);
        let err = engine
            .writer(&ctx)
            .patch("/employees", fields(json!({"age": 1})))
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden));
    }

    #[test]
    fn test_unknown_resource_is_not_found() {
        let engine = engine_with(schema());
        let ctx = admin(&engine);
        let path = format!("/employees/{}", ResourceId::generate().encode());
        assert!(matches!(
            engine.writer(&ctx).patch(&path, fields(json!({"age": 1}))),
            Err(Error::NotFound)
        ));
        assert!(matches!(engine.writer(&ctx).delete(&path), Err(Error::NotFound)));
    }

    #[test]
    fn test_link_collection_post_and_unlink() {
        let engine = engine_with(schema());
        let d = create(&engine, "division", &root("divisions"), json!({}));
        let e = create(&engine, "employee", &root("employees"), json!({}));
        let ctx = admin(&engine);
        let writer = engine.writer(&ctx);
        let teams = format!("{}/teams", url_of(&engine, &e));

        writer.post(&teams, fields(json!({"id": d.encode()}))).unwrap();
        assert_eq!(linked_ids(&get(&engine, &e), "teams"), vec![d.clone()]);

        let removed = writer.delete(&format!("{teams}/{}", d.encode())).unwrap();
        assert_eq!(removed, vec![d.clone()]);
        assert!(linked_ids(&get(&engine, &e), "teams").is_empty());
        assert!(engine.store().get_resource(&d).unwrap().is_some());
    }

    #[test]
    fn test_put_moves_filtered_set() {
        let engine = engine_with(schema());
        create(&engine, "division", &root("divisions"), json!({"yearly_sales": 1}));
        create(&engine, "division", &root("divisions"), json!({"yearly_sales": 9}));
        let ctx = admin(&engine);
        let moved = engine
            .writer(&ctx)
            .put_move("/former_divisions", fields(json!({"_from": "/divisions[yearly_sales>5]"})))
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(
            doc_str(&moved[0], CANONICAL_URL)
                .unwrap()
                .starts_with("/former_divisions/")
        );
    }

    #[test]
    fn test_delete_collection_forbidden() {
        let engine = engine_with(schema());
        let ctx = admin(&engine);
        assert!(matches!(engine.writer(&ctx).delete("/employees"), Err(Error::Forbidden)));
    }

    #[test]
    fn test_user_without_grants_is_forbidden() {
        let engine = engine_with(schema());
        let ctx = engine.context(Principal::User {
            user_id: ResourceId::generate(),
            grants: Vec::new(),
        });
        let err = engine
            .writer(&ctx)
            .post("/employees", fields(json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden));
    }
}
