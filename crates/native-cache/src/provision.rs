use crate::error::ProvisionError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Make sure `path` and all of its ancestors exist as directories.
///
/// Missing levels are created shallowest first, one check-then-create per
/// level. Another process creating the same level in between is fine.
pub fn ensure_directory(path: &Path) -> Result<(), ProvisionError> {
    let mut missing: Vec<PathBuf> = Vec::new();
    let mut cursor = Some(path);
    while let Some(dir) = cursor {
        if dir.as_os_str().is_empty() {
            break;
        }
        match fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => break,
            Ok(_) => return Err(ProvisionError::NotADirectory(dir.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                missing.push(dir.to_path_buf());
                cursor = dir.parent();
            }
            Err(source) => {
                return Err(ProvisionError::Inspect {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        }
    }

    for dir in missing.iter().rev() {
        create_level(dir)?;
    }
    if !missing.is_empty() {
        debug!(path = %path.display(), levels = missing.len(), "created directory levels");
    }
    Ok(())
}

fn create_level(dir: &Path) -> Result<(), ProvisionError> {
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // lost the race to another creator; fine as long as it is a dir
            if dir.is_dir() {
                Ok(())
            } else {
                Err(ProvisionError::NotADirectory(dir.to_path_buf()))
            }
        }
        Err(source) => Err(ProvisionError::Create {
            path: dir.to_path_buf(),
            source,
        }),
    }
}
