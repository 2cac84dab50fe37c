use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 64;
const RESERVED_PREFIXES: &[&str] = &["_", "link_", "parent_"];
const RESERVED_NAMES: &[&str] = &["self", "id", "root"];

fn validate_name(name: &str, entity: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BadRequest(format!("{entity} name cannot be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::BadRequest(format!(
            "{entity} name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::BadRequest(format!(
            "{entity} name can only contain alphanumeric characters and underscores"
        )));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(Error::BadRequest(format!(
            "{entity} name cannot start with a digit"
        )));
    }
    if let Some(prefix) = RESERVED_PREFIXES.iter().find(|p| name.starts_with(**p)) {
        return Err(Error::BadRequest(format!(
            "{entity} name cannot start with reserved prefix '{prefix}'"
        )));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(Error::BadRequest(format!("{entity} name '{name}' is reserved")));
    }
    Ok(())
}

pub fn validate_spec_name(name: &str) -> Result<()> {
    validate_name(name, "Spec")
}

pub fn validate_field_name(name: &str) -> Result<()> {
    validate_name(name, "Field")
}

/// Names beginning with `_` or equal to `id`/`self` never appear in payloads.
#[must_use]
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with('_') || key == "id" || key == "self"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_field_name("yearly_sales").is_ok());
        assert!(validate_spec_name("employee2").is_ok());
    }

    #[test]
    fn test_reserved_prefixes() {
        assert!(validate_field_name("_secret").is_err());
        assert!(validate_field_name("link_employee_division").is_err());
        assert!(validate_field_name("parent_division_employees").is_err());
    }

    #[test]
    fn test_reserved_names() {
        assert!(validate_field_name("self").is_err());
        assert!(validate_field_name("id").is_err());
        assert!(validate_spec_name("root").is_err());
    }

    #[test]
    fn test_bad_characters() {
        assert!(validate_field_name("").is_err());
        assert!(validate_field_name("first-name").is_err());
        assert!(validate_field_name("a.b").is_err());
        assert!(validate_field_name("1st").is_err());
    }

    #[test]
    fn test_reserved_keys() {
        assert!(is_reserved_key("_id"));
        assert!(is_reserved_key("id"));
        assert!(!is_reserved_key("name"));
    }
}
