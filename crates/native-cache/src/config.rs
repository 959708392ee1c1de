use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_RELOCATE: &str = "LUMEN_NATIVE_RELOCATE";
pub const ENV_PROTECT: &str = "LUMEN_NATIVE_PROTECT";
pub const ENV_TRACE: &str = "LUMEN_NATIVE_TRACE";

/// Loader feature switches. Everything is off by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Copy the framework module into the per-user cache and load it there.
    pub relocation_enabled: bool,
    /// The framework module ships as an obfuscated `.encrypted` artifact.
    pub protection_enabled: bool,
    /// Emit a trace event at every loader decision point.
    pub trace_enabled: bool,
    /// Where decrypted scratch copies go; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).map(|v| is_truthy(&v)).unwrap_or(false);
        Self {
            relocation_enabled: flag(ENV_RELOCATE),
            protection_enabled: flag(ENV_PROTECT),
            trace_enabled: flag(ENV_TRACE),
            scratch_dir: None,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
