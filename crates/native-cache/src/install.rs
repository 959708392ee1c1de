//! Cache installer.
//!
//! Brings the user-cache copy of a module up to date with its canonical
//! source. Safe against crashes and against any number of processes racing
//! on the same destination:
//!
//! 1. Stat both files; a cache copy at least as new as the source is kept.
//! 2. Create the cache directory, ancestors included.
//! 3. Copy the source into a uniquely named staging file in the SAME
//!    directory as the destination, then fsync it.
//! 4. Rename the staging file over the destination. This is the only
//!    commit point; readers see the old file or the new one, never a mix.
//! 5. On any failure the staging file is dropped, which deletes it.

use crate::error::InstallError;
use crate::provision::ensure_directory;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::{NamedTempFile, PersistError};
use tracing::{debug, info, warn};

pub const STAGING_SUFFIX: &str = ".staging";

/// Staging files older than this are crash leftovers, not in-flight writes.
pub const STAGING_ORPHAN_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallAction {
    AlreadyCurrent,
    Installed,
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub path: PathBuf,
    pub action: InstallAction,
}

pub fn ensure_installed(canonical: &Path, cached: &Path) -> Result<Installed, InstallError> {
    let source_mtime = match fs::metadata(canonical) {
        Ok(meta) => modified(&meta, canonical)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(InstallError::SourceMissing(canonical.to_path_buf()))
        }
        Err(e) => return Err(InstallError::io("stat", canonical, e)),
    };

    let action = match fs::metadata(cached) {
        Ok(meta) => {
            if modified(&meta, cached)? >= source_mtime {
                return Ok(Installed {
                    path: cached.to_path_buf(),
                    action: InstallAction::AlreadyCurrent,
                });
            }
            InstallAction::Refreshed
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => InstallAction::Installed,
        Err(e) => return Err(InstallError::io("stat", cached, e)),
    };

    let parent = parent_dir(cached)?;
    ensure_directory(parent)?;

    let mut staging = stage_in(parent, cached)?;
    let mut source =
        File::open(canonical).map_err(|e| InstallError::io("open", canonical, e))?;
    io::copy(&mut source, staging.as_file_mut())
        .map_err(|e| InstallError::io("copy into", staging.path(), e))?;
    staging
        .as_file()
        .sync_all()
        .map_err(|e| InstallError::io("sync", staging.path(), e))?;
    commit(staging, cached)?;
    sync_dir(parent);

    info!(
        source = %canonical.display(),
        dest = %cached.display(),
        ?action,
        "native module cached"
    );
    Ok(Installed {
        path: cached.to_path_buf(),
        action,
    })
}

/// Write `bytes` to `dest` through a staging file and an atomic rename.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), InstallError> {
    let parent = parent_dir(dest)?;
    ensure_directory(parent)?;
    let mut staging = stage_in(parent, dest)?;
    staging
        .write_all(bytes)
        .map_err(|e| InstallError::io("write", staging.path(), e))?;
    staging
        .as_file()
        .sync_all()
        .map_err(|e| InstallError::io("sync", staging.path(), e))?;
    commit(staging, dest)?;
    sync_dir(parent);
    Ok(())
}

/// Remove `*.staging` files in `dir` last modified more than `max_age` ago.
/// Returns how many were removed. A missing directory has nothing to sweep.
pub fn sweep_orphaned_staging(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with('.') && name.ends_with(STAGING_SUFFIX)) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| now.duration_since(t).ok());
        if !matches!(age, Some(age) if age > max_age) {
            continue;
        }
        warn!(path = %entry.path().display(), "removing orphaned staging file");
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            // another process swept it first
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

// ── internals ───────────────────────────────────────────────────────────────

fn parent_dir(path: &Path) -> Result<&Path, InstallError> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| InstallError::NoParent(path.to_path_buf()))
}

fn modified(meta: &fs::Metadata, path: &Path) -> Result<SystemTime, InstallError> {
    meta.modified()
        .map_err(|e| InstallError::io("read mtime of", path, e))
}

fn stage_in(dir: &Path, dest: &Path) -> Result<NamedTempFile, InstallError> {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(STAGING_SUFFIX)
        .rand_bytes(12)
        .tempfile_in(dir)
        .map_err(|e| InstallError::io("create staging file in", dir, e))
}

fn commit(staging: NamedTempFile, dest: &Path) -> Result<(), InstallError> {
    match staging.persist(dest) {
        Ok(_) => Ok(()),
        Err(PersistError { error, file }) if dest.exists() => {
            // Some filesystems refuse to rename over an existing file.
            debug!(dest = %dest.display(), %error, "rename over existing file refused; replacing");
            match fs::remove_file(dest) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(InstallError::io("remove stale", dest, e)),
            }
            file.persist(dest)
                .map(|_| ())
                .map_err(|e| InstallError::io("rename staging file to", dest, e.error))
        }
        Err(e) => Err(InstallError::io("rename staging file to", dest, e.error)),
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
