//! Shared path-hygiene helper (§9 design note): every file operation that
//! consumes a caller-supplied id resolves it against a configured base
//! directory and rejects traversal, in one place rather than inline at each
//! call site.

use std::path::{Path, PathBuf};

use crate::error::RuntimeError;

/// Resolve `id` to a path under `base`, rejecting empty ids, absolute paths,
/// and any path containing a `..` component.
pub fn resolve_under(base: &Path, id: &str, extension: &str) -> Result<PathBuf, RuntimeError> {
    if id.is_empty() {
        return Err(RuntimeError::Validation("id must not be empty".to_string()));
    }
    let candidate = Path::new(id);
    if candidate.is_absolute() {
        return Err(RuntimeError::Validation(format!("id must not be an absolute path: {id}")));
    }
    if candidate.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(RuntimeError::Validation(format!("id must not contain '..': {id}")));
    }
    Ok(base.join(format!("{id}.{extension}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_id() {
        assert!(resolve_under(Path::new("/data"), "", "json").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(resolve_under(Path::new("/data"), "../etc/passwd", "json").is_err());
    }

    #[test]
    fn rejects_absolute_id() {
        assert!(resolve_under(Path::new("/data"), "/etc/passwd", "json").is_err());
    }

    #[test]
    fn accepts_plain_id() {
        let resolved = resolve_under(Path::new("/data"), "workflow-1", "json").unwrap();
        assert_eq!(resolved, Path::new("/data/workflow-1.json"));
    }
}
