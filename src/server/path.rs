use crate::error::{Error, Result};

const MAX_SEGMENT_LEN: usize = 512;

/// Turns the wildcard tail of `/api/{*path}` into an absolute resource URL.
pub fn normalize_path(path: &str) -> Result<String> {
    let path = path.trim();

    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    if segments.is_empty() {
        return Err(Error::BadRequest("Path cannot be empty".to_string()));
    }

    for segment in &segments {
        validate_segment(segment)?;
    }

    Ok(format!("/{}", segments.join("/")))
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(Error::BadRequest(format!(
            "Path segment cannot exceed {MAX_SEGMENT_LEN} characters"
        )));
    }

    const INVALID_CHARS: &[char] = &['\0', '\n', '\r'];
    if segment.chars().any(|c| INVALID_CHARS.contains(&c)) {
        return Err(Error::BadRequest(
            "Path segment contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_basic() {
        assert_eq!(normalize_path("employees").unwrap(), "/employees");
        assert_eq!(normalize_path("/employees/").unwrap(), "/employees");
        assert_eq!(
            normalize_path("divisions//ID0123/employees").unwrap(),
            "/divisions/ID0123/employees"
        );
    }

    #[test]
    fn test_normalize_path_keeps_filters() {
        assert_eq!(
            normalize_path("employees[age>10]").unwrap(),
            "/employees[age>10]"
        );
    }

    #[test]
    fn test_normalize_path_rejects() {
        assert!(normalize_path("").is_err());
        assert!(normalize_path("///").is_err());
        assert!(normalize_path("a\nb").is_err());
        assert!(normalize_path(&"x".repeat(600)).is_err());
    }
}
