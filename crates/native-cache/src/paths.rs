//! Where a native module lives on disk.
//!
//! Resolution is a pure function of the module, the platform and a
//! [`HostEnvironment`]; [`HostEnvironment::detect`] is the only place that
//! looks at the running process.

use crate::error::ResolveError;
use directories::BaseDirs;
use std::path::{Path, PathBuf};

pub const PRODUCT_NAME: &str = "Lumen";
pub const PRODUCT_SUBFOLDER: &str = "native-modules";
pub const FRAMEWORK_MODULE: &str = "lumen_core";
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Result<Self, ResolveError> {
        Self::from_os_name(std::env::consts::OS)
    }

    pub fn from_os_name(name: &str) -> Result<Self, ResolveError> {
        match name {
            "windows" => Ok(Self::Windows),
            "macos" => Ok(Self::MacOs),
            "linux" => Ok(Self::Linux),
            other => Err(ResolveError::UnsupportedPlatform(other.to_string())),
        }
    }

    /// File name the platform linker gives a module called `name`.
    pub fn module_file_name(self, name: &str) -> String {
        match self {
            Self::Windows => format!("{name}.dll"),
            Self::MacOs => format!("lib{name}.dylib"),
            Self::Linux => format!("lib{name}.so"),
        }
    }

    /// Extensions (without the dot) recognised as native modules.
    pub fn native_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Windows => &["dll"],
            Self::MacOs => &["dylib", "so"],
            Self::Linux => &["so"],
        }
    }
}

/// Logical identity of a native module for one loading attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
    name: String,
    protected_candidate: bool,
}

impl ModuleIdentity {
    /// The runtime's own module, the only one eligible for relocation and
    /// protection.
    pub fn framework() -> Self {
        Self {
            name: FRAMEWORK_MODULE.to_string(),
            protected_candidate: true,
        }
    }

    /// Third-party modules stay beside their sibling libraries.
    pub fn third_party(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protected_candidate: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_protected_candidate(&self) -> bool {
        self.protected_candidate
    }
}

/// Directories resolution depends on. Any field may be absent; only the
/// ones the target platform needs are required.
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    pub exe_dir: PathBuf,
    pub home_dir: Option<PathBuf>,
    pub local_app_data: Option<PathBuf>,
    pub xdg_data_home: Option<PathBuf>,
}

impl HostEnvironment {
    pub fn detect() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let exe_dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = BaseDirs::new();
        let home_dir = base.as_ref().map(|b| b.home_dir().to_path_buf());
        let local_app_data = if cfg!(windows) {
            base.as_ref().map(|b| b.data_local_dir().to_path_buf())
        } else {
            None
        };
        // on Linux `data_dir` is $XDG_DATA_HOME or ~/.local/share
        let xdg_data_home = if cfg!(target_os = "linux") {
            base.as_ref().map(|b| b.data_dir().to_path_buf())
        } else {
            None
        };
        Ok(Self {
            exe_dir,
            home_dir,
            local_app_data,
            xdg_data_home,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Canonical,
    UserCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub path: PathBuf,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLocations {
    pub canonical: ResolvedLocation,
    pub user_cache: ResolvedLocation,
}

impl ModuleLocations {
    /// The same pair of locations pointing at the encrypted artifacts.
    pub fn encrypted(&self) -> Self {
        Self {
            canonical: ResolvedLocation {
                path: encrypted_path(&self.canonical.path),
                origin: Origin::Canonical,
            },
            user_cache: ResolvedLocation {
                path: encrypted_path(&self.user_cache.path),
                origin: Origin::UserCache,
            },
        }
    }
}

/// `<path>.encrypted`
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(ENCRYPTED_SUFFIX);
    PathBuf::from(os)
}

pub fn user_cache_dir(platform: Platform, env: &HostEnvironment) -> Result<PathBuf, ResolveError> {
    let root = match platform {
        Platform::Windows => env
            .local_app_data
            .clone()
            .ok_or(ResolveError::MissingDirectory("local application data"))?,
        Platform::MacOs => env
            .home_dir
            .as_ref()
            .ok_or(ResolveError::MissingDirectory("home directory"))?
            .join("Library")
            .join("Application Support"),
        Platform::Linux => match &env.xdg_data_home {
            Some(xdg) => xdg.clone(),
            None => env
                .home_dir
                .as_ref()
                .ok_or(ResolveError::MissingDirectory("home directory"))?
                .join(".local")
                .join("share"),
        },
    };
    Ok(root.join(PRODUCT_NAME).join(PRODUCT_SUBFOLDER))
}

pub fn resolve(
    module: &ModuleIdentity,
    platform: Platform,
    env: &HostEnvironment,
) -> Result<ModuleLocations, ResolveError> {
    let file_name = platform.module_file_name(module.name());
    Ok(ModuleLocations {
        canonical: ResolvedLocation {
            path: env.exe_dir.join(&file_name),
            origin: Origin::Canonical,
        },
        user_cache: ResolvedLocation {
            path: user_cache_dir(platform, env)?.join(&file_name),
            origin: Origin::UserCache,
        },
    })
}
