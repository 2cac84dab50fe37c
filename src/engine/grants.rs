//! URL-shaped permissions.
//!
//! A grant `{type, url}` authorizes one operation kind on the canonical URLs
//! its pattern matches. `*` stands for any encoded id. Read grants also cover
//! every descendant and are denormalized onto resources as `_grants`, so a
//! read check is a set intersection. Other kinds are matched at request time.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use super::Principal;
use crate::error::{Error, Result};
use crate::plan::Filter;
use crate::schema::GRANT_SPEC;
use crate::store::Store;
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A parsed grant URL such as `/divisions/*/employees`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantUrl {
    segments: Vec<Segment>,
}

fn split(url: &str) -> Vec<&str> {
    url.split('/').filter(|s| !s.is_empty()).collect()
}

impl GrantUrl {
    pub fn parse(url: &str) -> Result<Self> {
        if !url.starts_with('/') {
            return Err(Error::BadRequest(format!("grant url must start with '/': {url}")));
        }
        let segments = split(url)
            .into_iter()
            .map(|s| match s {
                "*" => Segment::Wildcard,
                _ => Segment::Literal(s.to_string()),
            })
            .collect();
        Ok(Self { segments })
    }

    fn segment_matches(pattern: &Segment, segment: &str) -> bool {
        match pattern {
            Segment::Wildcard => ResourceId::is_encoded(segment),
            Segment::Literal(lit) => lit == segment,
        }
    }

    fn prefix_matches(&self, segments: &[&str]) -> bool {
        segments.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(segments)
                .all(|(p, s)| Self::segment_matches(p, s))
    }

    /// True for the URL itself and every URL below it.
    #[must_use]
    pub fn covers(&self, url: &str) -> bool {
        self.prefix_matches(&split(url))
    }

    #[must_use]
    pub fn matches_exact(&self, url: &str) -> bool {
        let segments = split(url);
        segments.len() == self.segments.len() && self.prefix_matches(&segments)
    }

    /// The URL up to the first wildcard, for narrowing store scans.
    #[must_use]
    pub fn literal_prefix(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    out.push('/');
                    out.push_str(lit);
                }
                Segment::Wildcard => break,
            }
        }
        out
    }
}

impl fmt::Display for GrantUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => write!(f, "/{lit}")?,
                Segment::Wildcard => f.write_str("/*")?,
            }
        }
        Ok(())
    }
}

/// A grant resource in its parsed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub id: ResourceId,
    pub kind: GrantKind,
    pub url: GrantUrl,
}

impl Grant {
    /// Parses a stored `grant` document; malformed grants authorize nothing.
    #[must_use]
    pub fn from_doc(doc: &Document) -> Option<Self> {
        let id = doc_id(doc)?;
        let kind = GrantKind::parse(doc_str(doc, "type")?)?;
        let url = GrantUrl::parse(doc_str(doc, "url")?).ok()?;
        Some(Self { id, kind, url })
    }
}

/// Whether a grant of `granted` kind on `pattern` authorizes `op` on `url`.
///
/// Reads cover descendants. Other kinds match the URL itself, or one id
/// below it so a grant on a collection reaches its members.
#[must_use]
pub fn grant_matches(granted: GrantKind, pattern: &GrantUrl, op: GrantKind, url: &str) -> bool {
    if granted != op {
        return false;
    }
    if op == GrantKind::Read {
        return pattern.covers(url);
    }
    let segments = split(url);
    match segments.split_last() {
        Some((last, parent)) if ResourceId::is_encoded(last) && parent.len() == pattern.segments.len() => {
            pattern.matches_exact(url) || pattern.prefix_matches(parent)
        }
        _ => pattern.matches_exact(url),
    }
}

#[must_use]
pub fn can_access(principal: &Principal, op: GrantKind, url: &str) -> bool {
    match principal {
        Principal::Admin | Principal::System => true,
        Principal::User { grants, .. } => grants
            .iter()
            .any(|g| grant_matches(g.kind, &g.url, op, url)),
    }
}

/// Read check against a resource's cached `_grants`.
#[must_use]
pub fn can_read(principal: &Principal, doc: &Document) -> bool {
    match principal {
        Principal::Admin | Principal::System => true,
        Principal::User { grants, .. } => {
            let cached = cached_grants(doc);
            grants
                .iter()
                .any(|g| g.kind == GrantKind::Read && cached.contains(g.id.as_str()))
        }
    }
}

fn cached_grants(doc: &Document) -> BTreeSet<&str> {
    doc.get(GRANTS)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Ids of the read grants covering `url`, in grant order.
#[must_use]
pub fn grants_for_url(grants: &[Grant], url: &str) -> Vec<String> {
    grants
        .iter()
        .filter(|g| g.kind == GrantKind::Read && g.url.covers(url))
        .map(|g| g.id.as_str().to_string())
        .collect()
}

pub fn load_read_grants(store: &dyn Store) -> Result<Vec<Grant>> {
    let docs = store.find(
        &Filter::And(vec![
            Filter::eq(TYPE, GRANT_SPEC),
            Filter::eq("type", GrantKind::Read.as_str()),
        ]),
        None,
    )?;
    Ok(docs.iter().filter_map(Grant::from_doc).collect())
}

/// Brings every resource's `_grants` in line with the current state of one
/// grant: adds it where it now covers, drops it where it no longer does.
///
/// Returns the number of resources rewritten.
pub fn refresh_grant(store: &dyn Store, grant_id: &ResourceId) -> Result<usize> {
    let grant = store
        .get_resource(grant_id)?
        .as_ref()
        .and_then(Grant::from_doc)
        .filter(|g| g.kind == GrantKind::Read);
    let key = Value::String(grant_id.as_str().to_string());

    let mut changed = 0;
    for holder in store.find(&Filter::eq(GRANTS, key.clone()), None)? {
        let url = doc_str(&holder, CANONICAL_URL).unwrap_or_default();
        if grant.as_ref().is_some_and(|g| g.url.covers(url)) {
            continue;
        }
        let kept: Vec<Value> = holder
            .get(GRANTS)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter(|v| **v != key).cloned().collect())
            .unwrap_or_default();
        changed += usize::from(write_grants(store, &holder, kept)?);
    }

    if let Some(grant) = grant {
        let scope = Filter::Prefix {
            field: CANONICAL_URL.to_string(),
            prefix: grant.url.literal_prefix(),
        };
        for doc in store.find(&scope, None)? {
            let url = doc_str(&doc, CANONICAL_URL).unwrap_or_default();
            if !grant.url.covers(url) || cached_grants(&doc).contains(grant_id.as_str()) {
                continue;
            }
            let mut ids: Vec<Value> = doc
                .get(GRANTS)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            ids.push(key.clone());
            changed += usize::from(write_grants(store, &doc, ids)?);
        }
    }
    tracing::debug!(grant = %grant_id, changed, "refreshed grant");
    Ok(changed)
}

/// Recomputes `_grants` from scratch for a resource and everything below it.
pub fn recompute_subtree(store: &dyn Store, root_url: &str) -> Result<usize> {
    let grants = load_read_grants(store)?;
    let scope = Filter::Or(vec![
        Filter::eq(CANONICAL_URL, root_url),
        Filter::Prefix {
            field: CANONICAL_URL.to_string(),
            prefix: format!("{}/", root_url.trim_end_matches('/')),
        },
    ]);
    let mut changed = 0;
    for doc in store.find(&scope, None)? {
        let url = doc_str(&doc, CANONICAL_URL).unwrap_or_default();
        let ids: Vec<Value> = grants_for_url(&grants, url)
            .into_iter()
            .map(Value::String)
            .collect();
        if doc.get(GRANTS).and_then(Value::as_array) != Some(&ids) {
            changed += usize::from(write_grants(store, &doc, ids)?);
        }
    }
    Ok(changed)
}

fn write_grants(store: &dyn Store, doc: &Document, ids: Vec<Value>) -> Result<bool> {
    let Some(id) = doc_id(doc) else {
        return Ok(false);
    };
    let mut set = Document::new();
    set.insert(GRANTS.to_string(), Value::Array(ids));
    store.update_resource(&id, &set, &[], None)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const A: &str = "ID5e1b3c9f0a1b2c3d4e5f6a7b";
    const B: &str = "ID5e1b3c9f0a1b2c3d4e5f6a7c";

    fn grant(kind: GrantKind, url: &str) -> Grant {
        Grant {
            id: ResourceId::generate(),
            kind,
            url: GrantUrl::parse(url).unwrap(),
        }
    }

    #[test]
    fn test_parse_and_display() {
        let url = GrantUrl::parse("/divisions/*/employees/").unwrap();
        assert_eq!(url.to_string(), "/divisions/*/employees");
        assert_eq!(url.literal_prefix(), "/divisions");
        assert!(GrantUrl::parse("divisions").is_err());
    }

    #[test]
    fn test_read_covers_descendants() {
        let url = GrantUrl::parse("/divisions/*/employees").unwrap();
        assert!(grant_matches(GrantKind::Read, &url, GrantKind::Read, &format!("/divisions/{A}/employees")));
        assert!(grant_matches(
            GrantKind::Read,
            &url,
            GrantKind::Read,
            &format!("/divisions/{A}/employees/{B}/laptops")
        ));
        assert!(!grant_matches(GrantKind::Read, &url, GrantKind::Read, &format!("/divisions/{A}")));
        assert!(!grant_matches(GrantKind::Read, &url, GrantKind::Read, "/divisions/bob/employees"));
    }

    #[test]
    fn test_non_read_exact_or_member() {
        let url = GrantUrl::parse("/employees").unwrap();
        assert!(grant_matches(GrantKind::Create, &url, GrantKind::Create, "/employees"));
        assert!(grant_matches(GrantKind::Update, &url, GrantKind::Update, &format!("/employees/{A}")));
        assert!(!grant_matches(
            GrantKind::Update,
            &url,
            GrantKind::Update,
            &format!("/employees/{A}/laptops/{B}")
        ));
        assert!(!grant_matches(GrantKind::Create, &url, GrantKind::Delete, "/employees"));
    }

    #[test]
    fn test_can_access_and_read() {
        let read = grant(GrantKind::Read, "/employees");
        let principal = Principal::User {
            user_id: ResourceId::generate(),
            grants: vec![read.clone()],
        };
        assert!(can_access(&principal, GrantKind::Read, &format!("/employees/{A}")));
        assert!(!can_access(&principal, GrantKind::Create, "/employees"));
        assert!(can_access(&Principal::Admin, GrantKind::Delete, "/anything"));

        let visible = json!({ "_grants": [read.id.as_str()] }).as_object().cloned().unwrap();
        let hidden = json!({ "_grants": [] }).as_object().cloned().unwrap();
        assert!(can_read(&principal, &visible));
        assert!(!can_read(&principal, &hidden));
    }

    #[test]
    fn test_grants_for_url() {
        let all = vec![
            grant(GrantKind::Read, "/employees"),
            grant(GrantKind::Read, "/divisions"),
            grant(GrantKind::Create, "/employees"),
        ];
        let ids = grants_for_url(&all, &format!("/employees/{A}"));
        assert_eq!(ids, vec![all[0].id.as_str().to_string()]);
    }

    fn grant_ids(doc: &Document) -> Vec<String> {
        doc.get(GRANTS)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_grants_inherit_and_revoke() {
        use crate::engine::Parent;
        use crate::engine::testing::*;
        use crate::schema::{GROUP_SPEC, USER_SPEC};

        let engine = engine_with(company());
        let ctx = admin(&engine);
        let updater = engine.updater(&ctx);
        let group = create(&engine, GROUP_SPEC, &root("groups"), json!({"name": "sales"}));
        let grants_of_group = Parent::of(&get(&engine, &group), "grants").unwrap();
        let read = create(&engine, GRANT_SPEC, &grants_of_group, json!({"type": "read", "url": "/divisions"}));
        create(&engine, GRANT_SPEC, &grants_of_group, json!({"type": "create", "url": "/divisions"}));
        let user = create(&engine, USER_SPEC, &root("users"), json!({"username": "ann"}));
        updater.create_linkcollection_entry(&user, "groups", &group).unwrap();

        let as_user = engine.context(engine.user_principal(&user).unwrap());
        let division = engine
            .writer(&as_user)
            .post("/divisions", fields(json!({"name": "east"})))
            .unwrap();
        let division_id = doc_id(&division).unwrap();
        assert_eq!(grant_ids(&division), vec![read.as_str().to_string()]);

        let parent = Parent::of(&get(&engine, &division_id), "employees").unwrap();
        let child = create(&engine, "employee", &parent, json!({"name": "sam"}));
        assert_eq!(grant_ids(&get(&engine, &child)), vec![read.as_str().to_string()]);

        updater.delete_resource(&read).unwrap();
        assert!(grant_ids(&get(&engine, &division_id)).is_empty());
        assert!(grant_ids(&get(&engine, &child)).is_empty());
    }
}
