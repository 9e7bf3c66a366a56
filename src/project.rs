//! Project identity: every socket, cache directory and overflow-queue
//! partition is namespaced by a 12-hex-character digest of the project's
//! normalised root path, so two daemons pointed at different projects never
//! collide even when run under the same user.

use std::path::Path;

use sha2::{Digest, Sha256};

/// First 12 hex characters of `SHA-256(normalized_absolute_path)`.
pub fn project_id(project_root: &Path) -> String {
    let normalized = normalize(project_root);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex[..12].to_string()
}

/// Canonicalises when possible, otherwise falls back to a lexical cleanup
/// of the given path so two different spellings of the same project root
/// (`./foo`, `foo/`, `foo`) still land on the same id.
fn normalize(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    canonical.to_string_lossy().trim_end_matches('/').to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn id_is_twelve_lowercase_hex_chars() {
        let id = project_id(&PathBuf::from("/tmp/does/not/exist"));
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_path_yields_same_id() {
        let a = project_id(&PathBuf::from("/tmp/project-a"));
        let b = project_id(&PathBuf::from("/tmp/project-a"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_paths_yield_different_ids() {
        let a = project_id(&PathBuf::from("/tmp/project-a"));
        let b = project_id(&PathBuf::from("/tmp/project-b"));
        assert_ne!(a, b);
    }
}
