use anyhow::{bail, Context, Result};
use native_cache::install::write_atomic;
use native_cache::obfuscation::{is_wrapped, wrap, ObfuscationKey};
use native_cache::paths::encrypted_path;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Write `<path>.encrypted` next to `path` and return the artifact path.
pub fn protect_file(path: &Path, key: &ObfuscationKey, delete_original: bool) -> Result<PathBuf> {
    let plain = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if is_wrapped(&plain) {
        bail!("{} is already protected", path.display());
    }
    let artifact = encrypted_path(path);
    write_atomic(&artifact, &wrap(&plain, key))
        .with_context(|| format!("write {}", artifact.display()))?;
    debug!(src = %path.display(), bytes = plain.len(), "artifact written");

    if delete_original {
        fs::remove_file(path).with_context(|| format!("remove original {}", path.display()))?;
        info!(path = %path.display(), "original removed");
    }
    Ok(artifact)
}
