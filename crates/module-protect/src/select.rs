use anyhow::Result;
use native_cache::paths::ENCRYPTED_SUFFIX;
use native_cache::Platform;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every native module under `root` whose file name contains `substring`.
pub fn find_modules(root: &Path, substring: &str, platform: Platform) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && is_candidate(entry.path(), substring, platform) {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

pub fn is_candidate(path: &Path, substring: &str, platform: Platform) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.ends_with(ENCRYPTED_SUFFIX) || !name.contains(substring) {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            platform
                .native_extensions()
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}
