use serde_json::{Map, Value};

use super::ResourceId;

/// A stored resource: declared fields plus the reserved `_`-prefixed fields.
pub type Document = Map<String, Value>;

pub const ID: &str = "_id";
pub const TYPE: &str = "_type";
pub const PARENT_ID: &str = "_parent_id";
pub const PARENT_TYPE: &str = "_parent_type";
pub const PARENT_FIELD_NAME: &str = "_parent_field_name";
pub const PARENT_CANONICAL_URL: &str = "_parent_canonical_url";
pub const CANONICAL_URL: &str = "_canonical_url";
pub const CANONICAL_URL_PREFIX: &str = "_canonical_url_";
pub const GRANTS: &str = "_grants";
pub const DELETED: &str = "_deleted";
pub const SCHEMA_ID: &str = "_schema_id";
pub const DIRTY: &str = "_dirty";
pub const VERSION: &str = "_version";

/// The parent spec name recorded on root-level resources.
pub const ROOT_SPEC: &str = "root";

/// Canonical URL of a resource with the given parent URL and container field.
///
/// Root-level resources have parent URL `/`, giving `/<field>/<ID...>`.
#[must_use]
pub fn canonical_url(parent_url: &str, field: &str, id: &ResourceId) -> String {
    format!("{}/{field}/{}", parent_url.trim_end_matches('/'), id.encode())
}

/// True when `url` is `prefix` itself or lies below it.
#[must_use]
pub fn url_under(url: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    url == prefix || url.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

/// Reads `_id` as a [`ResourceId`].
#[must_use]
pub fn doc_id(doc: &Document) -> Option<ResourceId> {
    doc.get(ID)
        .and_then(Value::as_str)
        .and_then(|s| ResourceId::from_hex(s).ok())
}

#[must_use]
pub fn doc_str<'a>(doc: &'a Document, field: &str) -> Option<&'a str> {
    doc.get(field).and_then(Value::as_str)
}

#[must_use]
pub fn doc_version(doc: &Document) -> i64 {
    doc.get(VERSION).and_then(Value::as_i64).unwrap_or(0)
}

/// Resolves a dotted path against a document.
///
/// Arrays along the path are mapped over and flattened, so `groups._id`
/// on `{"groups": [{"_id": "a"}, {"_id": "b"}]}` yields `["a", "b"]`.
#[must_use]
pub fn get_path(doc: &Document, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?.clone();
    for part in parts {
        current = step(&current, part)?;
    }
    Some(current)
}

fn step(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(key).cloned(),
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match step(item, key) {
                    Some(Value::Array(inner)) => out.extend(inner),
                    Some(v) => out.push(v),
                    None => {}
                }
            }
            Some(Value::Array(out))
        }
        _ => None,
    }
}

/// Sets a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

/// Removes a dotted path if present.
pub fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(inner)) = doc.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

/// Ids stored in a link collection field: `[{"_id": "..."}, ...]`.
#[must_use]
pub fn linked_ids(doc: &Document, field: &str) -> Vec<ResourceId> {
    doc.get(field)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get(ID).and_then(Value::as_str))
                .filter_map(|s| ResourceId::from_hex(s).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_get_path_nested() {
        let d = doc(json!({"a": {"b": {"c": 3}}}));
        assert_eq!(get_path(&d, "a.b.c"), Some(json!(3)));
        assert_eq!(get_path(&d, "a.x"), None);
    }

    #[test]
    fn test_get_path_through_array() {
        let d = doc(json!({"groups": [{"_id": "a"}, {"_id": "b"}]}));
        assert_eq!(get_path(&d, "groups._id"), Some(json!(["a", "b"])));
    }

    #[test]
    fn test_set_and_remove_path() {
        let mut d = Document::new();
        set_path(&mut d, "_dirty.total", json!("division by zero"));
        assert_eq!(d, doc(json!({"_dirty": {"total": "division by zero"}})));
        remove_path(&mut d, "_dirty.total");
        assert_eq!(d, doc(json!({"_dirty": {}})));
    }

    #[test]
    fn test_canonical_url() {
        let id = ResourceId::from_hex("5e1b3c9f0a1b2c3d4e5f6a7b").unwrap();
        assert_eq!(canonical_url("/", "employees", &id), "/employees/ID5e1b3c9f0a1b2c3d4e5f6a7b");
        assert_eq!(
            canonical_url("/divisions/IDaa", "employees", &id),
            "/divisions/IDaa/employees/ID5e1b3c9f0a1b2c3d4e5f6a7b"
        );
    }

    #[test]
    fn test_url_under() {
        assert!(url_under("/divisions", "/divisions"));
        assert!(url_under("/divisions/IDa/employees", "/divisions"));
        assert!(!url_under("/divisions_old/IDa", "/divisions"));
        assert!(url_under("/employees/IDa", "/"));
    }

    #[test]
    fn test_linked_ids() {
        let d = doc(json!({"groups": [{"_id": "5e1b3c9f0a1b2c3d4e5f6a7b"}, {"_id": "bad"}]}));
        let ids = linked_ids(&d, "groups");
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].as_str(), "5e1b3c9f0a1b2c3d4e5f6a7b");
    }
}
