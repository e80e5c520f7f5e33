// SPDX-License-Identifier: MIT OR Apache-2.0

//! Index directory resolution

use std::path::{Path, PathBuf};

/// The name of the index directory
pub const INDEX_DIR: &str = ".evidex";

/// Lexical index directory inside the index dir
pub const LEXICAL_DIR: &str = "lexical";

/// Nearest `.evidex` directory in `start` or one of its ancestors.
pub fn nearest_index_dir(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .map(|dir| dir.join(INDEX_DIR))
        .find(|candidate| candidate.is_dir())
}

/// Resolves the index directory for a command run from `cwd`.
///
/// An explicit `--index` path wins. Otherwise the nearest existing `.evidex`
/// above `cwd` is used, and a fresh index goes to `cwd/.evidex`.
pub fn resolve_index_dir(explicit: Option<&Path>, cwd: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    nearest_index_dir(cwd).unwrap_or_else(|| cwd.join(INDEX_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn index_in_working_dir_is_found() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(INDEX_DIR)).unwrap();

        let found = resolve_index_dir(None, dir.path());
        assert_eq!(found, dir.path().canonicalize().unwrap().join(INDEX_DIR));
    }

    #[test]
    fn index_in_ancestor_is_found() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(INDEX_DIR)).unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();

        let found = resolve_index_dir(None, &nested);
        assert_eq!(found, dir.path().canonicalize().unwrap().join(INDEX_DIR));
    }

    #[test]
    fn fresh_index_goes_to_working_dir() {
        let dir = TempDir::new().unwrap();
        assert!(nearest_index_dir(dir.path()).is_none());
        assert_eq!(resolve_index_dir(None, dir.path()), dir.path().join(INDEX_DIR));
    }

    #[test]
    fn explicit_index_dir_wins() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(INDEX_DIR)).unwrap();
        let explicit = dir.path().join("custom");
        assert_eq!(resolve_index_dir(Some(&explicit), dir.path()), explicit);
    }
}
