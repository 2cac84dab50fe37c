use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use super::def::SchemaDef;
use super::field::{Field, FieldKind, ReverseOf};
use super::names::{is_reserved_key, validate_field_name, validate_spec_name};
use crate::error::{Error, Result};
use crate::types::{Document, ROOT_SPEC, ResourceId};

#[derive(Debug, Clone)]
pub struct Spec {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Spec {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn calc_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.kind == FieldKind::Calc)
    }
}

/// In-memory typed view of a [`SchemaDef`].
///
/// Authored fields live on their spec; reverse fields are kept in a separate
/// adjacency map keyed by the spec they appear on.
#[derive(Debug, Clone)]
pub struct Registry {
    specs: BTreeMap<String, Spec>,
    reverse: BTreeMap<String, Vec<Field>>,
}

impl Registry {
    pub fn from_def(def: &SchemaDef) -> Result<Self> {
        let mut specs = BTreeMap::new();
        for (name, spec_def) in &def.specs {
            validate_spec_name(name)?;
            specs.insert(
                name.clone(),
                Spec {
                    name: name.clone(),
                    fields: spec_def.fields.clone(),
                },
            );
        }
        specs.insert(
            ROOT_SPEC.to_string(),
            Spec {
                name: ROOT_SPEC.to_string(),
                fields: def.root.fields.clone(),
            },
        );

        let mut reverse: BTreeMap<String, Vec<Field>> = BTreeMap::new();
        for spec in specs.values() {
            for field in &spec.fields {
                validate_field_name(&field.name)?;
                check_field_shape(spec, field)?;
                if let Some(target) = field.target() {
                    if !specs.contains_key(target) || target == ROOT_SPEC {
                        return Err(Error::BadRequest(format!(
                            "{}.{} targets unknown spec {target}",
                            spec.name, field.name
                        )));
                    }
                }
                if spec.name == ROOT_SPEC && field.kind != FieldKind::Collection {
                    return Err(Error::BadRequest(format!(
                        "root field {} must be a collection",
                        field.name
                    )));
                }
                if let Some(view) = reverse_view(spec, field) {
                    let target = field.target().unwrap_or_default().to_string();
                    reverse.entry(target).or_default().push(view);
                }
            }
        }

        Ok(Self { specs, reverse })
    }

    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&Spec> {
        self.specs.get(name)
    }

    pub fn require_spec(&self, name: &str) -> Result<&Spec> {
        self.spec(name)
            .ok_or_else(|| Error::BadRequest(format!("no such spec: {name}")))
    }

    #[must_use]
    pub fn root(&self) -> &Spec {
        &self.specs[ROOT_SPEC]
    }

    /// Every declared spec, root included.
    pub fn specs(&self) -> impl Iterator<Item = &Spec> {
        self.specs.values()
    }

    /// Looks a field up on a spec, authored fields first, then reverse views.
    #[must_use]
    pub fn field(&self, spec: &str, name: &str) -> Option<&Field> {
        self.spec(spec)
            .and_then(|s| s.field(name))
            .or_else(|| self.reverse_fields(spec).iter().find(|f| f.name == name))
    }

    pub fn require_field(&self, spec: &str, name: &str) -> Result<&Field> {
        self.field(spec, name)
            .ok_or_else(|| Error::UnknownField(format!("{spec}.{name}")))
    }

    #[must_use]
    pub fn reverse_fields(&self, spec: &str) -> &[Field] {
        self.reverse.get(spec).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Authored fields followed by reverse views.
    pub fn all_fields<'a>(&'a self, spec: &str) -> impl Iterator<Item = &'a Field> {
        self.spec(spec)
            .map(|s| s.fields.as_slice())
            .unwrap_or(&[])
            .iter()
            .chain(self.reverse_fields(spec).iter())
    }

    /// `(spec, field)` pairs of the collections that can contain `spec`.
    #[must_use]
    pub fn containers_of(&self, spec: &str) -> Vec<(&str, &Field)> {
        self.specs
            .values()
            .flat_map(|s| s.fields.iter().map(move |f| (s.name.as_str(), f)))
            .filter(|(_, f)| f.kind == FieldKind::Collection && f.target() == Some(spec))
            .collect()
    }

    /// Validates and normalizes a write payload for `spec`.
    ///
    /// With `partial == false` missing fields take their defaults and
    /// required fields must be present.
    pub fn validate_payload(&self, spec: &str, payload: &Document, partial: bool) -> Result<Document> {
        let spec_def = self.require_spec(spec)?;
        let mut out = Document::new();

        for (key, value) in payload {
            if is_reserved_key(key) {
                return Err(Error::BadRequest(format!("cannot write reserved field {key}")));
            }
            let field = self
                .field(spec, key)
                .ok_or_else(|| Error::UnknownField(key.clone()))?;
            let coerced = match field.kind {
                FieldKind::Calc => {
                    return Err(Error::BadRequest(format!("cannot write calc field {key}")));
                }
                kind if kind.is_reverse() => {
                    return Err(Error::BadRequest(format!("cannot write read-only field {key}")));
                }
                FieldKind::Collection | FieldKind::LinkCollection | FieldKind::OrderedCollection => {
                    return Err(Error::BadRequest(format!(
                        "cannot write collection field {key} directly"
                    )));
                }
                _ => coerce_value(field, value)?,
            };
            if field.required && coerced.is_null() {
                return Err(Error::BadRequest(format!("field {key} is required")));
            }
            out.insert(key.clone(), coerced);
        }

        if !partial {
            for field in &spec_def.fields {
                if out.contains_key(&field.name) {
                    continue;
                }
                if let Some(default) = &field.default {
                    out.insert(field.name.clone(), coerce_value(field, default)?);
                } else if field.required {
                    return Err(Error::BadRequest(format!("field {} is required", field.name)));
                }
            }
        }

        Ok(out)
    }
}

fn check_field_shape(spec: &Spec, field: &Field) -> Result<()> {
    let needs_target = matches!(
        field.kind,
        FieldKind::Link | FieldKind::LinkCollection | FieldKind::OrderedCollection | FieldKind::Collection
    );
    if needs_target && field.target().is_none() {
        return Err(Error::BadRequest(format!(
            "{}.{} needs a target spec",
            spec.name, field.name
        )));
    }
    if field.kind.is_reverse() {
        return Err(Error::BadRequest(format!(
            "{}.{}: {} fields are synthesized, not declared",
            spec.name, field.name, field.kind
        )));
    }
    if field.kind == FieldKind::Calc && field.calc_str.is_none() {
        return Err(Error::BadRequest(format!(
            "{}.{} is a calc without an expression",
            spec.name, field.name
        )));
    }
    Ok(())
}

fn reverse_view(spec: &Spec, field: &Field) -> Option<Field> {
    let (name, kind) = match field.kind {
        FieldKind::Link => (format!("link_{}_{}", spec.name, field.name), FieldKind::ReverseLink),
        FieldKind::LinkCollection | FieldKind::OrderedCollection => (
            format!("link_{}_{}", spec.name, field.name),
            FieldKind::ReverseLinkCollection,
        ),
        FieldKind::Collection if spec.name != ROOT_SPEC => (
            format!("parent_{}_{}", spec.name, field.name),
            FieldKind::ParentCollection,
        ),
        _ => return None,
    };
    let mut view = Field::reference(&name, kind, &spec.name);
    view.indexed = true;
    view.reverse_of = Some(ReverseOf {
        spec: spec.name.clone(),
        field: field.name.clone(),
    });
    Some(view)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Normalizes a stored datetime to millisecond RFC 3339 in UTC.
pub fn normalize_datetime(s: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").map(|n| n.and_utc())
        })
        .ok()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Checks a single value against a field, converting ids and datetimes.
pub fn coerce_value(field: &Field, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let bad = || Error::bad_type(&field.name, field.kind.as_str(), json_type_name(value));
    match field.kind {
        FieldKind::Str => value.as_str().map(|_| value.clone()).ok_or_else(bad),
        FieldKind::Int => match value.as_i64() {
            Some(i) => Ok(Value::from(i)),
            None => Err(bad()),
        },
        FieldKind::Float => value.as_f64().map(Value::from).ok_or_else(bad),
        FieldKind::Bool => value.as_bool().map(Value::Bool).ok_or_else(bad),
        FieldKind::Datetime => value
            .as_str()
            .and_then(normalize_datetime)
            .map(Value::String)
            .ok_or_else(bad),
        FieldKind::Link => {
            let encoded = value.as_str().ok_or_else(bad)?;
            let id = ResourceId::decode(encoded).map_err(|_| bad())?;
            Ok(Value::String(id.as_str().to_string()))
        }
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> SchemaDef {
        let mut def = SchemaDef::new();
        def.add_spec("employee").unwrap();
        def.add_spec("division").unwrap();
        def.add_field("employee", Field::primitive("name", FieldKind::Str).required())
            .unwrap();
        def.add_field("employee", Field::primitive("age", FieldKind::Int))
            .unwrap();
        def.add_field(
            "employee",
            Field::primitive("active", FieldKind::Bool).with_default(json!(true)),
        )
        .unwrap();
        def.add_field("employee", Field::link("division", "division"))
            .unwrap();
        def.add_field("employee", Field::calc("older", "self.age + 1"))
            .unwrap();
        def.add_field("division", Field::collection("staff", "employee"))
            .unwrap();
        def.add_field("root", Field::collection("employees", "employee"))
            .unwrap();
        def
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_reverse_views_synthesized() {
        let registry = Registry::from_def(&schema()).unwrap();
        let reverse = registry.field("division", "link_employee_division").unwrap();
        assert_eq!(reverse.kind, FieldKind::ReverseLink);
        assert_eq!(reverse.target(), Some("employee"));

        let parent = registry.field("employee", "parent_division_staff").unwrap();
        assert_eq!(parent.kind, FieldKind::ParentCollection);

        let groups = registry.field("group", "link_user_groups").unwrap();
        assert_eq!(groups.kind, FieldKind::ReverseLinkCollection);

        assert!(registry.field("employee", "parent_root_employees").is_none());
    }

    #[test]
    fn test_unknown_target_rejected() {
        let mut def = schema();
        def.add_field("employee", Field::link("boss", "manager")).unwrap();
        assert!(Registry::from_def(&def).is_err());
    }

    #[test]
    fn test_validate_create_applies_defaults() {
        let registry = Registry::from_def(&schema()).unwrap();
        let out = registry
            .validate_payload("employee", &doc(json!({"name": "Bob", "age": 40})), false)
            .unwrap();
        assert_eq!(out["active"], json!(true));
        assert_eq!(out["age"], json!(40));
    }

    #[test]
    fn test_validate_required_missing() {
        let registry = Registry::from_def(&schema()).unwrap();
        let err = registry
            .validate_payload("employee", &doc(json!({"age": 40})), false)
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert!(registry
            .validate_payload("employee", &doc(json!({"age": 41})), true)
            .is_ok());
    }

    #[test]
    fn test_validate_bad_type() {
        let registry = Registry::from_def(&schema()).unwrap();
        let err = registry
            .validate_payload("employee", &doc(json!({"name": "Bob", "age": "old"})), false)
            .unwrap_err();
        match err {
            Error::BadType { field, expected, got } => {
                assert_eq!(field, "age");
                assert_eq!(expected, "int");
                assert_eq!(got, "str");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_calc_and_reserved() {
        let registry = Registry::from_def(&schema()).unwrap();
        assert!(matches!(
            registry.validate_payload("employee", &doc(json!({"salary": 1})), true),
            Err(Error::UnknownField(_))
        ));
        assert!(registry
            .validate_payload("employee", &doc(json!({"older": 1})), true)
            .is_err());
        assert!(registry
            .validate_payload("employee", &doc(json!({"_id": "x"})), true)
            .is_err());
    }

    #[test]
    fn test_link_id_decoded() {
        let registry = Registry::from_def(&schema()).unwrap();
        let out = registry
            .validate_payload(
                "employee",
                &doc(json!({"division": "ID5e1b3c9f0a1b2c3d4e5f6a7b"})),
                true,
            )
            .unwrap();
        assert_eq!(out["division"], json!("5e1b3c9f0a1b2c3d4e5f6a7b"));
    }

    #[test]
    fn test_datetime_normalized() {
        assert_eq!(
            normalize_datetime("2021-01-02T03:04:05Z").as_deref(),
            Some("2021-01-02T03:04:05.000Z")
        );
        assert_eq!(
            normalize_datetime("2021-01-02T03:04:05").as_deref(),
            Some("2021-01-02T03:04:05.000Z")
        );
        assert!(normalize_datetime("yesterday").is_none());
    }
}
