//! Resolution, per-user caching and at-rest protection of Lumen native
//! modules.
//!
//! [`loader::ModuleLoader`] is the entry point; the other modules are its
//! building blocks and are public for tools and tests.

pub mod config;
pub mod error;
pub mod install;
pub mod loader;
pub mod obfuscation;
pub mod paths;
pub mod provision;
pub mod trace;

pub use config::LoaderConfig;
pub use error::{FormatError, InstallError, LoadError, ProvisionError, ResolveError};
pub use loader::{DynamicLoad, ModuleLoader, PreparedModule};
pub use paths::{HostEnvironment, ModuleIdentity, Origin, Platform};
