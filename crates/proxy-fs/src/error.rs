//! Error types for proxy-fs.

use proxy_protocol::ErrorKind;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during sandboxed filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Resolved path falls outside the sandbox root.
    #[error("path escapes the sandbox root")]
    PathEscape,

    /// File or directory does not exist.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// Target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation needs a file but found a directory.
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// Operation needs a directory but found a file.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// Remote download failed.
    #[error("download failed: {0}")]
    FetchFailed(String),

    /// Archive could not be parsed.
    #[error("archive malformed: {0}")]
    ArchiveMalformed(String),

    /// Archive entry would land outside the sandbox root.
    #[error("archive entry escapes the sandbox root: {0}")]
    EntryEscape(String),

    /// Any other I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The wire taxonomy token for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathEscape => ErrorKind::PathEscape,
            Self::NotFound(_) => ErrorKind::Enoent,
            Self::AlreadyExists(_) => ErrorKind::Eexist,
            Self::IsDirectory(_) => ErrorKind::Eisdir,
            Self::NotDirectory(_) => ErrorKind::Enotdir,
            Self::FetchFailed(_) => ErrorKind::FetchFailed,
            Self::ArchiveMalformed(_) => ErrorKind::ArchiveMalformed,
            Self::EntryEscape(_) => ErrorKind::EntryEscape,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Map a raw I/O error to the taxonomy, keeping the path for the log.
    pub(crate) fn classify(err: std::io::Error, path: &Path) -> Self {
        use std::io::ErrorKind as IoKind;
        let shown = path.display().to_string();
        match err.kind() {
            IoKind::NotFound => Self::NotFound(shown),
            IoKind::AlreadyExists => Self::AlreadyExists(shown),
            IoKind::IsADirectory => Self::IsDirectory(shown),
            IoKind::NotADirectory => Self::NotDirectory(shown),
            _ => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tokens() {
        assert_eq!(FsError::PathEscape.kind(), ErrorKind::PathEscape);
        assert_eq!(FsError::NotFound("x".into()).kind(), ErrorKind::Enoent);
        assert_eq!(
            FsError::EntryEscape("../x".into()).kind(),
            ErrorKind::EntryEscape
        );
    }

    #[test]
    fn test_classify_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let fs = FsError::classify(err, Path::new("a/b"));
        assert!(matches!(fs, FsError::NotFound(_)));
    }
}
