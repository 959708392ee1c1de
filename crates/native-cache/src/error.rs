use std::io;
use std::path::PathBuf;

// ── Resolution ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("cannot determine {0} for the current user")]
    MissingDirectory(&'static str),
}

// ── Filesystem ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("create directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("inspect {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} exists but is not a directory")]
    NotADirectory(PathBuf),
}

impl ProvisionError {
    fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Create { source, .. } | Self::Inspect { source, .. } => Some(source.kind()),
            Self::NotADirectory(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("canonical module missing at {0}")]
    SourceMissing(PathBuf),
    #[error("cache path {0} has no parent directory")]
    NoParent(PathBuf),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl InstallError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Routine conditions the loader silently falls back from: the cache
    /// location is read-only or full, or there is nothing to copy. Anything
    /// else is logged at `warn`.
    pub fn is_environmental(&self) -> bool {
        let kind = match self {
            Self::SourceMissing(_) => return true,
            Self::NoParent(_) => return false,
            Self::Provision(e) => e.io_kind(),
            Self::Io { source, .. } => Some(source.kind()),
        };
        matches!(
            kind,
            Some(io::ErrorKind::PermissionDenied)
                | Some(io::ErrorKind::NotFound)
                | Some(io::ErrorKind::ReadOnlyFilesystem)
                | Some(io::ErrorKind::StorageFull)
        )
    }
}

// ── Artifact format ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("artifact truncated: {len} bytes, header needs {needed}")]
    Truncated { len: usize, needed: usize },
    #[error("artifact magic mismatch")]
    BadMagic,
    #[error("obfuscation key must not be empty")]
    EmptyKey,
}

// ── Loading ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("native module {module} not found (tried {tried:?})")]
    NotFound { module: String, tried: Vec<PathBuf> },
    #[error("protected module {module} unreadable: {source}")]
    Format {
        module: String,
        #[source]
        source: FormatError,
    },
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("dynamic load of {path} failed: {message}")]
    Load { path: PathBuf, message: String },
}

impl LoadError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
