use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value, json};

use super::grants;
use super::{Context, Engine};
use crate::error::{Error, Result};
use crate::lang::{self, Node};
use crate::plan::{VAL, url_pipeline};
use crate::schema::FieldKind;
use crate::types::*;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Dotted paths to join inline, e.g. `division.employees`.
    pub expand: Vec<String>,
    /// 1-based.
    pub page: usize,
    pub page_size: Option<usize>,
}

impl ReadOptions {
    /// Parses the comma-separated `expand` query parameter.
    #[must_use]
    pub fn with_expand(mut self, expand: Option<&str>) -> Self {
        self.expand = expand
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self
    }
}

/// One page of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub count: usize,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<Value>,
    #[serde(rename = "_meta")]
    pub meta: Value,
}

/// Nested `expand` paths.
#[derive(Debug, Default)]
struct Expand(BTreeMap<String, Expand>);

impl Expand {
    fn parse(paths: &[String]) -> Self {
        let mut root = Expand::default();
        for path in paths {
            let mut node = &mut root;
            for part in path.split('.') {
                node = node.0.entry(part.to_string()).or_default();
            }
        }
        root
    }

    fn get(&self, field: &str) -> Option<&Expand> {
        self.0.get(field)
    }
}

pub struct Reader<'a> {
    engine: &'a Engine,
    ctx: &'a Context,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(engine: &'a Engine, ctx: &'a Context) -> Self {
        Self { engine, ctx }
    }

    /// Reads whatever `path` addresses: a resource, a collection page or a
    /// primitive value.
    pub fn get(&self, path: &str, options: &ReadOptions) -> Result<Value> {
        let node = self.resolve(path)?;
        let expand = Expand::parse(&options.expand);

        if node.ty.ty.resource_spec().is_none() {
            let docs = self.run(&node)?;
            let values: Vec<Value> = docs.iter().filter_map(|d| d.get(VAL).cloned()).collect();
            return Ok(if node.ty.collection {
                Value::Array(values)
            } else {
                values.into_iter().next().ok_or(Error::NotFound)?
            });
        }

        let docs = self.visible(&node)?;
        if !node.ty.collection {
            let doc = docs.into_iter().next().ok_or(Error::NotFound)?;
            return self.view(&doc, &expand);
        }
        let page = self.page(path, &node, docs, options, &expand)?;
        Ok(serde_json::to_value(page)?)
    }

    fn resolve(&self, path: &str) -> Result<Node> {
        lang::parse_url(&self.ctx.schema.registry, &self.ctx.schema.calcs, path)
    }

    fn run(&self, node: &Node) -> Result<Vec<Document>> {
        let pipeline = url_pipeline(node, &self.ctx.schema.registry)?;
        self.engine.store().aggregate(&pipeline, None)
    }

    fn visible(&self, node: &Node) -> Result<Vec<Document>> {
        Ok(self
            .run(node)?
            .into_iter()
            .filter(|d| grants::can_read(&self.ctx.principal, d))
            .collect())
    }

    fn page(&self, path: &str, node: &Node, docs: Vec<Document>, options: &ReadOptions, expand: &Expand) -> Result<Page> {
        let config = self.engine.config();
        let size = options
            .page_size
            .unwrap_or(config.default_page_size)
            .clamp(1, config.max_page_size.max(1));
        let page = options.page.max(1);
        let count = docs.len();
        let start = (page - 1).saturating_mul(size);

        let link = |n: usize| {
            let mut url = format!("{path}?page={n}&page_size={size}");
            if !options.expand.is_empty() {
                url.push_str("&expand=");
                url.push_str(&urlencoding::encode(&options.expand.join(",")));
            }
            url
        };
        let results = docs
            .iter()
            .skip(start)
            .take(size)
            .map(|d| self.view(d, expand))
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            count,
            next: (start.saturating_add(size) < count).then(|| link(page + 1)),
            previous: (page > 1).then(|| link(page - 1)),
            results,
            meta: json!({
                "is_collection": true,
                "spec": { "name": node.ty.ty.resource_spec() },
                "page": page,
                "page_size": size,
            }),
        })
    }

    /// Renders a resource: every declared field, `id`, `self` and `_meta`.
    /// Links render as the target URL, collections as their own URL, unless
    /// expanded.
    fn view(&self, doc: &Document, expand: &Expand) -> Result<Value> {
        let registry = &self.ctx.schema.registry;
        let spec = doc_str(doc, TYPE).ok_or_else(|| Error::Invariant("resource without type".into()))?;
        let url = doc_str(doc, CANONICAL_URL).unwrap_or_default();
        let id = doc_id(doc).ok_or_else(|| Error::Invariant("resource without id".into()))?;

        let mut out = Map::new();
        out.insert("id".into(), json!(id.encode()));
        out.insert("self".into(), json!(url));
        for field in registry.all_fields(spec) {
            let name = field.name.as_str();
            let nested = expand.get(name);
            let stored = doc.get(name).cloned().unwrap_or(Value::Null);
            let value = match field.kind {
                kind if kind.is_primitive() => stored,
                FieldKind::Link => match nested {
                    Some(sub) => self.linked(&stored, sub)?,
                    None => doc
                        .get(&format!("{CANONICAL_URL_PREFIX}{name}"))
                        .cloned()
                        .unwrap_or(Value::Null),
                },
                FieldKind::Calc => {
                    let ty = self
                        .ctx
                        .schema
                        .calcs
                        .get(spec, name)
                        .map(|e| e.calc_type().clone());
                    match ty {
                        Some(ty) if ty.ty.resource_spec().is_some() && !ty.collection => match nested {
                            Some(sub) => self.linked(&stored, sub)?,
                            None => self.target_url(&stored)?,
                        },
                        Some(ty) if ty.ty.resource_spec().is_some() => {
                            self.members(&format!("{url}/{name}"), nested)?
                        }
                        _ => stored,
                    }
                }
                _ => self.members(&format!("{url}/{name}"), nested)?,
            };
            out.insert(name.to_string(), value);
        }
        out.insert(
            "_meta".into(),
            json!({ "is_collection": false, "spec": { "name": spec } }),
        );
        Ok(Value::Object(out))
    }

    /// A resource-valued field: its URL, or the rendered members when
    /// expanded.
    fn members(&self, url: &str, expand: Option<&Expand>) -> Result<Value> {
        let Some(sub) = expand else {
            return Ok(json!(url));
        };
        let node = self.resolve(url)?;
        let docs = self.visible(&node)?;
        if node.ty.collection {
            Ok(Value::Array(
                docs.iter().map(|d| self.view(d, sub)).collect::<Result<_>>()?,
            ))
        } else {
            docs.first().map_or(Ok(Value::Null), |d| self.view(d, sub))
        }
    }

    fn target(&self, stored: &Value) -> Result<Option<Document>> {
        let Some(hex) = stored.as_str() else {
            return Ok(None);
        };
        let id = ResourceId::from_hex(hex)?;
        Ok(self
            .engine
            .store()
            .get_resource(&id)?
            .filter(|d| grants::can_read(&self.ctx.principal, d)))
    }

    fn linked(&self, stored: &Value, expand: &Expand) -> Result<Value> {
        match self.target(stored)? {
            Some(doc) => self.view(&doc, expand),
            None => Ok(Value::Null),
        }
    }

    fn target_url(&self, stored: &Value) -> Result<Value> {
        Ok(self
            .target(stored)?
            .and_then(|d| d.get(CANONICAL_URL).cloned())
            .unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Principal;
    use crate::engine::testing::*;
    use crate::schema::Field;

    fn options() -> ReadOptions {
        ReadOptions {
            page: 1,
            ..ReadOptions::default()
        }
    }

    #[test]
    fn test_resource_view() {
        let engine = engine_with(company());
        let d = create(&engine, "division", &root("divisions"), json!({"name": "sales"}));
        let e = create(&engine, "employee", &root("employees"), json!({"name": "ned", "division": d.encode()}));
        let ctx = admin(&engine);
        let url = doc_str(&get(&engine, &e), CANONICAL_URL).unwrap().to_string();
        let division_url = doc_str(&get(&engine, &d), CANONICAL_URL).unwrap().to_string();

        let view = engine.reader(&ctx).get(&url, &options()).unwrap();
        assert_eq!(view["id"], json!(e.encode()));
        assert_eq!(view["self"], json!(url));
        assert_eq!(view["name"], json!("ned"));
        assert_eq!(view["age"], json!(null));
        assert_eq!(view["division"], json!(division_url));
        assert_eq!(view["_meta"]["spec"]["name"], json!("employee"));

        let division = engine.reader(&ctx).get(&division_url, &options()).unwrap();
        assert_eq!(division["employees"], json!(format!("{division_url}/employees")));
    }

    #[test]
    fn test_expand_link() {
        let engine = engine_with(company());
        let d = create(&engine, "division", &root("divisions"), json!({"name": "sales"}));
        let e = create(&engine, "employee", &root("employees"), json!({"division": d.encode()}));
        let ctx = admin(&engine);
        let url = doc_str(&get(&engine, &e), CANONICAL_URL).unwrap().to_string();

        let opts = options().with_expand(Some("division"));
        let view = engine.reader(&ctx).get(&url, &opts).unwrap();
        assert_eq!(view["division"]["name"], json!("sales"));
    }

    #[test]
    fn test_collection_pages() {
        let config = EngineConfig {
            default_page_size: 2,
            ..EngineConfig::default()
        };
        let engine = engine_with_config(company(), config);
        for age in [1, 2, 3] {
            create(&engine, "employee", &root("employees"), json!({"age": age}));
        }
        let ctx = admin(&engine);
        let first = engine.reader(&ctx).get("/employees", &options()).unwrap();
        assert_eq!(first["count"], json!(3));
        assert_eq!(first["results"].as_array().map(Vec::len), Some(2));
        assert_eq!(first["previous"], json!(null));
        assert_eq!(first["next"], json!("/employees?page=2&page_size=2"));

        let second = engine
            .reader(&ctx)
            .get("/employees", &ReadOptions { page: 2, ..options() })
            .unwrap();
        assert_eq!(second["results"].as_array().map(Vec::len), Some(1));
        assert_eq!(second["next"], json!(null));
        assert_eq!(second["_meta"]["is_collection"], json!(true));
    }

    #[test]
    fn test_page_past_the_end_is_empty() {
        let engine = engine_with(company());
        create(&engine, "employee", &root("employees"), json!({}));
        let ctx = admin(&engine);
        let page = engine
            .reader(&ctx)
            .get("/employees", &ReadOptions { page: usize::MAX, ..options() })
            .unwrap();
        assert_eq!(page["count"], json!(1));
        assert_eq!(page["results"], json!([]));
        assert_eq!(page["next"], json!(null));
    }

    #[test]
    fn test_filtered_read_and_value() {
        let engine = engine_with(company());
        let e = create(&engine, "employee", &root("employees"), json!({"age": 40}));
        create(&engine, "employee", &root("employees"), json!({"age": 20}));
        let ctx = admin(&engine);
        let older = engine.reader(&ctx).get("/employees[age>30]", &options()).unwrap();
        assert_eq!(older["count"], json!(1));

        let url = doc_str(&get(&engine, &e), CANONICAL_URL).unwrap().to_string();
        let age = engine.reader(&ctx).get(&format!("{url}/age"), &options()).unwrap();
        assert_eq!(age, json!(40));
    }

    #[test]
    fn test_reads_filtered_by_grants() {
        let engine = engine_with(company());
        create(&engine, "employee", &root("employees"), json!({}));
        let ctx = engine.context(Principal::User {
            user_id: ResourceId::generate(),
            grants: Vec::new(),
        });
        let page = engine.reader(&ctx).get("/employees", &options()).unwrap();
        assert_eq!(page["count"], json!(0));
    }

    #[test]
    fn test_link_calc_renders_target_url() {
        let mut def = company();
        def.add_field("employee", Field::calc("boss_division", "self.division")).unwrap();
        let engine = engine_with(def);
        let d = create(&engine, "division", &root("divisions"), json!({}));
        let e = create(&engine, "employee", &root("employees"), json!({"division": d.encode()}));
        let ctx = admin(&engine);
        let url = doc_str(&get(&engine, &e), CANONICAL_URL).unwrap().to_string();
        let view = engine.reader(&ctx).get(&url, &options()).unwrap();
        assert_eq!(
            view["boss_division"],
            json!(doc_str(&get(&engine, &d), CANONICAL_URL))
        );
    }
}
