use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Str,
    Int,
    Float,
    Bool,
    Datetime,
    Link,
    #[serde(rename = "linkcollection")]
    LinkCollection,
    #[serde(rename = "orderedcollection")]
    OrderedCollection,
    Collection,
    ParentCollection,
    ReverseLink,
    ReverseLinkCollection,
    Calc,
}

impl FieldKind {
    pub fn parse(s: &str) -> Option<FieldKind> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Datetime => "datetime",
            Self::Link => "link",
            Self::LinkCollection => "linkcollection",
            Self::OrderedCollection => "orderedcollection",
            Self::Collection => "collection",
            Self::ParentCollection => "parent_collection",
            Self::ReverseLink => "reverse_link",
            Self::ReverseLinkCollection => "reverse_link_collection",
            Self::Calc => "calc",
        }
    }

    #[must_use]
    pub const fn is_primitive(self) -> bool {
        matches!(
            self,
            Self::Str | Self::Int | Self::Float | Self::Bool | Self::Datetime
        )
    }

    /// Fields whose value is a set of resources rather than a single one.
    #[must_use]
    pub const fn is_collection(self) -> bool {
        matches!(
            self,
            Self::LinkCollection
                | Self::OrderedCollection
                | Self::Collection
                | Self::ReverseLink
                | Self::ReverseLinkCollection
        )
    }

    /// Kinds that only exist as registry views of another spec's field.
    #[must_use]
    pub const fn is_reverse(self) -> bool {
        matches!(
            self,
            Self::ParentCollection | Self::ReverseLink | Self::ReverseLinkCollection
        )
    }

    /// Kinds stored as `[{"_id": ...}]` arrays on the owning document.
    #[must_use]
    pub const fn is_link_list(self) -> bool {
        matches!(self, Self::LinkCollection | Self::OrderedCollection)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authored field a synthesized reverse field mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseOf {
    pub spec: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_spec_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub unique_global: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc_str: Option<String>,
    #[serde(skip)]
    pub reverse_of: Option<ReverseOf>,
}

impl Field {
    fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            target_spec_name: None,
            default: None,
            required: false,
            indexed: false,
            unique: false,
            unique_global: false,
            calc_str: None,
            reverse_of: None,
        }
    }

    #[must_use]
    pub fn primitive(name: &str, kind: FieldKind) -> Self {
        Self::new(name, kind)
    }

    #[must_use]
    pub fn reference(name: &str, kind: FieldKind, target: &str) -> Self {
        Self {
            target_spec_name: Some(target.to_string()),
            ..Self::new(name, kind)
        }
    }

    #[must_use]
    pub fn link(name: &str, target: &str) -> Self {
        Self::reference(name, FieldKind::Link, target)
    }

    #[must_use]
    pub fn collection(name: &str, target: &str) -> Self {
        Self::reference(name, FieldKind::Collection, target)
    }

    #[must_use]
    pub fn linkcollection(name: &str, target: &str) -> Self {
        Self::reference(name, FieldKind::LinkCollection, target)
    }

    #[must_use]
    pub fn orderedcollection(name: &str, target: &str) -> Self {
        Self::reference(name, FieldKind::OrderedCollection, target)
    }

    #[must_use]
    pub fn calc(name: &str, expr: &str) -> Self {
        Self {
            calc_str: Some(expr.to_string()),
            ..Self::new(name, FieldKind::Calc)
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    #[must_use]
    pub fn unique_global(mut self) -> Self {
        self.unique_global = true;
        self.indexed = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target_spec_name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(FieldKind::parse("linkcollection"), Some(FieldKind::LinkCollection));
        assert_eq!(FieldKind::parse("parent_collection"), Some(FieldKind::ParentCollection));
        assert_eq!(FieldKind::parse("int"), Some(FieldKind::Int));
        assert_eq!(FieldKind::parse("integer"), None);
        assert_eq!(FieldKind::OrderedCollection.as_str(), "orderedcollection");
    }

    #[test]
    fn test_field_serde_shape() {
        let field = Field::link("division", "division").required();
        let value = serde_json::to_value(&field).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "division",
                "type": "link",
                "target_spec_name": "division",
                "required": true,
                "indexed": false,
                "unique": false,
                "unique_global": false,
            })
        );
        let back: Field = serde_json::from_value(value).unwrap();
        assert_eq!(back, field);
    }
}
