use std::fmt;

use serde::{Deserialize, Serialize};

/// The operation a grant authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantKind {
    Read,
    Create,
    Update,
    Delete,
    Put,
}

impl GrantKind {
    pub const ALL: [GrantKind; 5] = [
        GrantKind::Read,
        GrantKind::Create,
        GrantKind::Update,
        GrantKind::Delete,
        GrantKind::Put,
    ];

    pub fn parse(s: &str) -> Option<GrantKind> {
        match s {
            "read" => Some(Self::Read),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "put" => Some(Self::Put),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Put => "put",
        }
    }
}

impl fmt::Display for GrantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all() {
        for kind in GrantKind::ALL {
            assert_eq!(GrantKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(GrantKind::parse("admin"), None);
        assert_eq!(GrantKind::parse("READ"), None);
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&GrantKind::Update).unwrap();
        assert_eq!(json, "\"update\"");
    }
}
