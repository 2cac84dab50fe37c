use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::field::{Field, FieldKind};
use crate::error::{Error, Result};
use crate::types::ROOT_SPEC;

pub const USER_SPEC: &str = "user";
pub const GROUP_SPEC: &str = "group";
pub const GRANT_SPEC: &str = "grant";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecDef {
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl SpecDef {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name == name)
    }
}

/// The persisted, versioned form of a schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub specs: BTreeMap<String, SpecDef>,
    #[serde(default)]
    pub root: SpecDef,
}

impl SchemaDef {
    /// An empty schema carrying the built-in auth specs.
    #[must_use]
    pub fn new() -> Self {
        let mut def = Self::default();
        def.ensure_builtins();
        def
    }

    /// Adds `user`, `group`, `grant` and the `users`/`groups` roots if absent.
    pub fn ensure_builtins(&mut self) {
        let builtins = [
            (
                GRANT_SPEC,
                vec![
                    Field::primitive("type", FieldKind::Str).required(),
                    Field::primitive("url", FieldKind::Str).required(),
                ],
            ),
            (
                GROUP_SPEC,
                vec![
                    Field::primitive("name", FieldKind::Str).unique_global(),
                    Field::collection("grants", GRANT_SPEC),
                ],
            ),
            (
                USER_SPEC,
                vec![
                    Field::primitive("username", FieldKind::Str).unique_global(),
                    Field::linkcollection("groups", GROUP_SPEC),
                ],
            ),
        ];
        for (name, fields) in builtins {
            self.specs
                .entry(name.to_string())
                .or_insert_with(|| SpecDef { fields });
        }
        for (root_name, target) in [("users", USER_SPEC), ("groups", GROUP_SPEC)] {
            if self.root.field(root_name).is_none() {
                self.root.fields.push(Field::collection(root_name, target));
            }
        }
    }

    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&SpecDef> {
        if name == ROOT_SPEC {
            Some(&self.root)
        } else {
            self.specs.get(name)
        }
    }

    fn spec_mut(&mut self, name: &str) -> Result<&mut SpecDef> {
        if name == ROOT_SPEC {
            return Ok(&mut self.root);
        }
        self.specs
            .get_mut(name)
            .ok_or_else(|| Error::BadRequest(format!("no such spec: {name}")))
    }

    pub fn add_spec(&mut self, name: &str) -> Result<()> {
        if name == ROOT_SPEC || self.specs.contains_key(name) {
            return Err(Error::BadRequest(format!("spec already exists: {name}")));
        }
        self.specs.insert(name.to_string(), SpecDef::default());
        Ok(())
    }

    pub fn add_field(&mut self, spec: &str, field: Field) -> Result<()> {
        let def = self.spec_mut(spec)?;
        if def.field(&field.name).is_some() {
            return Err(Error::BadRequest(format!(
                "field already exists: {spec}.{}",
                field.name
            )));
        }
        def.fields.push(field);
        Ok(())
    }

    pub fn replace_field(&mut self, spec: &str, field: Field) -> Result<()> {
        let def = self.spec_mut(spec)?;
        let slot = def
            .field_mut(&field.name)
            .ok_or_else(|| Error::BadRequest(format!("no such field: {spec}.{}", field.name)))?;
        *slot = field;
        Ok(())
    }

    pub fn remove_field(&mut self, spec: &str, name: &str) -> Result<Field> {
        let def = self.spec_mut(spec)?;
        let pos = def
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| Error::BadRequest(format!("no such field: {spec}.{name}")))?;
        Ok(def.fields.remove(pos))
    }

    pub fn rename_field(&mut self, spec: &str, from: &str, to: &str) -> Result<()> {
        let def = self.spec_mut(spec)?;
        if def.field(to).is_some() {
            return Err(Error::BadRequest(format!("field already exists: {spec}.{to}")));
        }
        let field = def
            .field_mut(from)
            .ok_or_else(|| Error::BadRequest(format!("no such field: {spec}.{from}")))?;
        field.name = to.to_string();
        Ok(())
    }

    pub fn remove_spec(&mut self, name: &str) -> Result<SpecDef> {
        self.specs
            .remove(name)
            .ok_or_else(|| Error::BadRequest(format!("no such spec: {name}")))
    }

    /// Renames a spec and every reference to it.
    pub fn rename_spec(&mut self, from: &str, to: &str) -> Result<()> {
        if self.specs.contains_key(to) {
            return Err(Error::BadRequest(format!("spec already exists: {to}")));
        }
        let spec = self.remove_spec(from)?;
        self.specs.insert(to.to_string(), spec);
        for def in self.specs.values_mut().chain(std::iter::once(&mut self.root)) {
            for field in &mut def.fields {
                if field.target_spec_name.as_deref() == Some(from) {
                    field.target_spec_name = Some(to.to_string());
                }
            }
        }
        Ok(())
    }

    /// Content hash of the specs, used as the version id.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let body = serde_json::json!({ "specs": self.specs, "root": self.root });
        let digest = Sha256::digest(body.to_string().as_bytes());
        hex::encode(&digest[..12])
    }

    /// Stamps `id` from the content hash.
    pub fn seal(&mut self) {
        self.id = self.fingerprint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_present() {
        let def = SchemaDef::new();
        assert!(def.spec(USER_SPEC).is_some());
        assert!(def.spec(GROUP_SPEC).is_some());
        assert!(def.spec(GRANT_SPEC).is_some());
        assert!(def.root.field("users").is_some());
        assert!(def.root.field("groups").is_some());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let mut a = SchemaDef::new();
        let b = SchemaDef::new();
        assert_eq!(a.fingerprint(), b.fingerprint());

        a.add_spec("employee").unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_rename_spec_updates_targets() {
        let mut def = SchemaDef::new();
        def.add_spec("employee").unwrap();
        def.add_field("root", Field::collection("employees", "employee"))
            .unwrap();
        def.rename_spec("employee", "person").unwrap();

        assert!(def.spec("employee").is_none());
        assert_eq!(
            def.root.field("employees").unwrap().target(),
            Some("person")
        );
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut def = SchemaDef::new();
        def.add_spec("employee").unwrap();
        def.add_field("employee", Field::primitive("name", FieldKind::Str))
            .unwrap();
        assert!(def
            .add_field("employee", Field::primitive("name", FieldKind::Int))
            .is_err());
    }
}
