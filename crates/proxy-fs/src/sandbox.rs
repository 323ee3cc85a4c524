//! Path containment under a fixed root.

use crate::error::FsError;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// A canonicalized directory below which all client paths are confined.
///
/// Resolution is lexical first (`.` and `..` are folded, with `..` above
/// the root rejected outright), then the longest existing prefix is
/// canonicalized so symlinks cannot smuggle a path outside the root.
#[derive(Debug, Clone)]
pub struct SandboxRoot {
    root: PathBuf,
}

impl SandboxRoot {
    /// Open an existing directory as a sandbox root.
    pub fn open(root: &Path) -> std::io::Result<Self> {
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// Create the directory (and parents) if needed, then open it.
    pub fn create(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Self::open(root)
    }

    /// The canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client-supplied path to an absolute path under the root.
    ///
    /// The empty path resolves to the root itself. Absolute inputs are
    /// re-rooted (their leading `/` is dropped). The result is guaranteed
    /// to be the root or a descendant of it; everything else is
    /// [`FsError::PathEscape`].
    pub fn resolve(&self, input: &str) -> Result<PathBuf, FsError> {
        let mut rel = PathBuf::new();
        for comp in Path::new(input).components() {
            match comp {
                Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if !rel.pop() {
                        return Err(FsError::PathEscape);
                    }
                }
                Component::Normal(seg) => rel.push(seg),
            }
        }
        let joined = self.root.join(&rel);

        // Canonicalize the longest existing prefix; the non-existent tail
        // is appended literally (it contains no `.`/`..` at this point).
        let mut existing = joined.as_path();
        let mut tail: Vec<OsString> = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_os_string());
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut full = existing
            .canonicalize()
            .map_err(|e| FsError::classify(e, existing))?;
        for name in tail.iter().rev() {
            full.push(name);
        }

        if full == self.root || full.starts_with(&self.root) {
            Ok(full)
        } else {
            Err(FsError::PathEscape)
        }
    }

    /// Root-relative rendition of a resolved path, for wire output.
    pub fn relative(&self, full: &Path) -> String {
        full.strip_prefix(&self.root)
            .unwrap_or(full)
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn root() -> (tempfile::TempDir, SandboxRoot) {
        let dir = tempdir().unwrap();
        let sandbox = SandboxRoot::open(dir.path()).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn test_empty_path_resolves_to_root() {
        let (_dir, sandbox) = root();
        assert_eq!(sandbox.resolve("").unwrap(), sandbox.root());
        assert_eq!(sandbox.resolve(".").unwrap(), sandbox.root());
    }

    #[test]
    fn test_simple_descendant() {
        let (_dir, sandbox) = root();
        let full = sandbox.resolve("a/b.txt").unwrap();
        assert_eq!(full, sandbox.root().join("a/b.txt"));
        assert_eq!(sandbox.relative(&full), "a/b.txt");
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let (_dir, sandbox) = root();
        assert!(matches!(sandbox.resolve(".."), Err(FsError::PathEscape)));
        assert!(matches!(
            sandbox.resolve("../.."),
            Err(FsError::PathEscape)
        ));
        assert!(matches!(
            sandbox.resolve("a/../../etc/passwd"),
            Err(FsError::PathEscape)
        ));
    }

    #[test]
    fn test_internal_dotdot_folds() {
        let (_dir, sandbox) = root();
        let full = sandbox.resolve("a/b/../c").unwrap();
        assert_eq!(full, sandbox.root().join("a/c"));
    }

    #[test]
    fn test_absolute_input_is_rerooted() {
        let (_dir, sandbox) = root();
        let full = sandbox.resolve("/etc/passwd").unwrap();
        assert_eq!(full, sandbox.root().join("etc/passwd"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, sandbox) = root();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        assert!(matches!(
            sandbox.resolve("link/secret"),
            Err(FsError::PathEscape)
        ));
    }

    #[test]
    fn test_nonexistent_suffix_is_contained() {
        let (_dir, sandbox) = root();
        let full = sandbox.resolve("missing/deeper/file.bin").unwrap();
        assert!(full.starts_with(sandbox.root()));
    }
}
