//! Zip archive extraction with per-entry sandbox checks.

use crate::error::FsError;
use crate::sandbox::SandboxRoot;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Stage `bytes` to a tempfile under `staging` and extract the archive
/// into the sandbox root.
///
/// Entry names are validated in a first pass so a malicious entry anywhere
/// in the archive means nothing at all is written.
pub(crate) fn extract_zip(
    staging: &Path,
    root: &SandboxRoot,
    bytes: &[u8],
) -> Result<(), FsError> {
    let mut staged = tempfile::NamedTempFile::new_in(staging)?;
    staged.write_all(bytes)?;
    let file = staged.reopen()?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| FsError::ArchiveMalformed(e.to_string()))?;

    // Pass 1: every destination must stay inside the root.
    let mut destinations: Vec<PathBuf> = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| FsError::ArchiveMalformed(e.to_string()))?;
        let raw_name = entry.name().to_string();
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| FsError::EntryEscape(raw_name.clone()))?;
        let dest = match root.resolve(&rel.to_string_lossy()) {
            Ok(dest) => dest,
            Err(FsError::PathEscape) => return Err(FsError::EntryEscape(raw_name)),
            Err(other) => return Err(other),
        };
        destinations.push(dest);
    }

    // Pass 2: write entries.
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| FsError::ArchiveMalformed(e.to_string()))?;
        let dest = &destinations[i];
        if entry.is_dir() {
            std::fs::create_dir_all(dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(dest)?;
        std::io::copy(&mut entry, &mut out)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))?;
        }
        tracing::trace!(entry = %dest.display(), "extracted");
    }
    Ok(())
}
