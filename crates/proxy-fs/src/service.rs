//! Filesystem operations exposed on the control channel.

use crate::archive;
use crate::error::FsError;
use crate::sandbox::SandboxRoot;
use regex::Regex;
use serde::Serialize;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// One entry in a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    /// False means the entry is a directory.
    pub isfile: bool,
    pub islink: bool,
}

/// Metadata for a single path. Times are POSIX seconds.
#[derive(Debug, Clone, Serialize)]
pub struct StatInfo {
    pub size: u64,
    pub isfile: bool,
    pub ctime: i64,
    pub mtime: i64,
}

/// Sandboxed filesystem service bound to one session root.
pub struct FsService {
    root: SandboxRoot,
    staging: PathBuf,
    http: reqwest::Client,
}

impl FsService {
    /// Create a service over `root`, staging archive downloads in `staging`.
    pub fn new(root: SandboxRoot, staging: PathBuf) -> Self {
        Self {
            root,
            staging,
            http: reqwest::Client::new(),
        }
    }

    /// The sandbox this service operates in.
    pub fn sandbox(&self) -> &SandboxRoot {
        &self.root
    }

    /// List a directory.
    pub async fn list(&self, path: &str) -> Result<Vec<DirEntryInfo>, FsError> {
        let full = self.root.resolve(path)?;
        let mut dir = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| FsError::classify(e, &full))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            // is_file follows symlinks, matching what clients expect to see
            let isfile = tokio::fs::metadata(entry.path())
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                isfile,
                islink: file_type.is_symlink(),
            });
        }
        Ok(entries)
    }

    /// Stat a path without following a final symlink.
    pub async fn stat(&self, path: &str) -> Result<StatInfo, FsError> {
        let full = self.root.resolve(path)?;
        let meta = tokio::fs::symlink_metadata(&full)
            .await
            .map_err(|e| FsError::classify(e, &full))?;
        let isfile = tokio::fs::metadata(&full)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        Ok(StatInfo {
            size: meta.len(),
            isfile,
            ctime: meta.ctime(),
            mtime: meta.mtime(),
        })
    }

    /// Read a whole file.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let full = self.root.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| FsError::classify(e, &full))
    }

    /// Write a whole file atomically (write-then-rename in the target
    /// directory). Parent directories are not created: a missing parent is
    /// an error, not an implicit mkdir.
    pub async fn upload(&self, path: &str, data: Vec<u8>) -> Result<String, FsError> {
        let full = self.root.resolve(path)?;
        let parent = full
            .parent()
            .expect("resolved path always has a parent")
            .to_path_buf();
        let parent_meta = tokio::fs::metadata(&parent)
            .await
            .map_err(|e| FsError::classify(e, &parent))?;
        if !parent_meta.is_dir() {
            return Err(FsError::NotDirectory(parent.display().to_string()));
        }
        if let Ok(meta) = tokio::fs::metadata(&full).await {
            if meta.is_dir() {
                return Err(FsError::IsDirectory(full.display().to_string()));
            }
        }

        let dest = full.clone();
        tokio::task::spawn_blocking(move || -> Result<(), FsError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(&data)?;
            tmp.persist(&dest).map_err(|e| FsError::Io(e.error))?;
            Ok(())
        })
        .await
        .expect("upload task panicked")?;

        tracing::debug!(path = %full.display(), "file uploaded");
        Ok(self.root.relative(&full))
    }

    /// Create a directory, including missing parents. Idempotent for an
    /// existing directory; an existing file at the path is an error.
    pub async fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let full = self.root.resolve(path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| FsError::classify(e, &full))
    }

    /// Remove a file, symlink, or directory tree.
    pub async fn remove(&self, path: &str) -> Result<String, FsError> {
        let full = self.root.resolve(path)?;
        let meta = tokio::fs::symlink_metadata(&full)
            .await
            .map_err(|e| FsError::classify(e, &full))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        tracing::debug!(path = %full.display(), "removed");
        Ok(self.root.relative(&full))
    }

    /// Rename a file or directory. Both endpoints are sandbox-checked.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(String, String), FsError> {
        let src = self.root.resolve(from)?;
        let dst = self.root.resolve(to)?;
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| FsError::classify(e, &src))?;
        Ok((self.root.relative(&src), self.root.relative(&dst)))
    }

    /// Copy a file or directory tree, preserving permissions.
    pub async fn copy(&self, from: &str, to: &str) -> Result<(String, String), FsError> {
        let src = self.root.resolve(from)?;
        let dst = self.root.resolve(to)?;
        let meta = tokio::fs::metadata(&src)
            .await
            .map_err(|e| FsError::classify(e, &src))?;
        if meta.is_dir() {
            let (src_task, dst_task) = (src.clone(), dst.clone());
            tokio::task::spawn_blocking(move || copy_tree(&src_task, &dst_task))
                .await
                .expect("copy task panicked")?;
        } else {
            tokio::fs::copy(&src, &dst)
                .await
                .map_err(|e| FsError::classify(e, &dst))?;
        }
        Ok((self.root.relative(&src), self.root.relative(&dst)))
    }

    /// Download a single file into the root. The filename comes from the
    /// URL path; an existing name gets a `-1`, `-2`, … suffix.
    pub async fn fetch_url(&self, url: &str) -> Result<String, FsError> {
        let name = filename_from_url(url);
        let full = self.unique_target(&name)?;
        let bytes = self.fetch_bytes(url).await?;
        tokio::fs::write(&full, &bytes)
            .await
            .map_err(|e| FsError::classify(e, &full))?;
        tracing::info!(url, path = %full.display(), size = bytes.len(), "fetched file");
        Ok(self.root.relative(&full))
    }

    /// Download a zip archive and extract it into the root. Every entry is
    /// checked against the sandbox before anything is written.
    pub async fn fetch_zip(&self, url: &str) -> Result<String, FsError> {
        let bytes = self.fetch_bytes(url).await?;
        let staging = self.staging.clone();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || archive::extract_zip(&staging, &root, &bytes))
            .await
            .expect("extract task panicked")?;
        tracing::info!(url, root = %self.root.root().display(), "archive extracted");
        // extraction lands directly in the root
        Ok(String::new())
    }

    /// Rewrite `showAnalyzer <peripheral>` lines in a script so the
    /// peripheral output goes to a server socket terminal on `port`.
    pub async fn replace_analyzer(&self, path: &str, port: u16) -> Result<(), FsError> {
        let full = self.root.resolve(path)?;
        let text = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| FsError::classify(e, &full))?;
        let re = Regex::new(r"(?m)^showAnalyzer +([A-Za-z0-9_.]+)").expect("static regex");
        let replacement = format!(
            "emulation CreateServerSocketTerminal {port} \"term\"; connector Connect $1 term"
        );
        let rewritten = re.replace_all(&text, replacement.as_str());
        tokio::fs::write(&full, rewritten.as_bytes())
            .await
            .map_err(|e| FsError::classify(e, &full))?;
        tracing::debug!(path = %full.display(), port, "analyzer rewritten to socket terminal");
        Ok(())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FsError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FsError::FetchFailed(e.to_string()))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FsError::FetchFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn unique_target(&self, name: &str) -> Result<PathBuf, FsError> {
        let base = self.root.resolve(name)?;
        if !base.exists() {
            return Ok(base);
        }
        let stem = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let ext = Path::new(name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()));
        for i in 1u32.. {
            let candidate = match &ext {
                Some(ext) => format!("{stem}-{i}{ext}"),
                None => format!("{stem}-{i}"),
            };
            let full = self.root.resolve(&candidate)?;
            if !full.exists() {
                return Ok(full);
            }
        }
        unreachable!("suffix search is unbounded")
    }
}

/// Filename portion of a URL path, ignoring query and fragment.
fn filename_from_url(url: &str) -> String {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/');
    let name = path.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "download".to_string()
    } else {
        name.to_string()
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), FsError> {
    std::fs::create_dir_all(dst)?;
    let meta = std::fs::metadata(src)?;
    std::fs::set_permissions(dst, meta.permissions())?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
