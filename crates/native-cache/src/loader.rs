//! Module loader: decides which file the platform loader gets.
//!
//! Policy, in order:
//! 1. Third-party modules always load from their canonical location so
//!    sibling libraries next to them keep resolving.
//! 2. With relocation off, the framework module loads from canonical too.
//! 3. With relocation on, the cache installer runs; on failure the loader
//!    falls back to canonical and traces why.
//! 4. With protection on, the chosen `.encrypted` artifact is unwrapped into
//!    a scratch file that is removed once the load is done.

use crate::config::LoaderConfig;
use crate::error::{InstallError, LoadError};
use crate::install::{
    ensure_installed, sweep_orphaned_staging, InstallAction, STAGING_ORPHAN_AGE,
};
use crate::obfuscation::{self, ObfuscationKey};
use crate::paths::{
    resolve, HostEnvironment, ModuleIdentity, ModuleLocations, Origin, Platform, ResolvedLocation,
};
use crate::provision::ensure_directory;
use crate::trace::{TraceEvent, TraceKind, TraceSink, TracingSink};
use std::fmt::Display;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::warn;
use zeroize::Zeroizing;

/// The platform's dynamic-load primitive.
pub trait DynamicLoad {
    type Handle;
    type Error: Display;

    fn load(&self, path: &Path) -> Result<Self::Handle, Self::Error>;
}

/// A file ready to hand to the platform loader. A decrypted scratch copy is
/// deleted when this is dropped.
#[derive(Debug)]
pub struct PreparedModule {
    path: PathBuf,
    origin: Origin,
    scratch: Option<TempPath>,
}

impl PreparedModule {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the bytes came from; a scratch file reports its artifact's origin.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_scratch(&self) -> bool {
        self.scratch.is_some()
    }
}

enum Chosen {
    OnDisk(ResolvedLocation),
    Decrypted(ResolvedLocation, Zeroizing<Vec<u8>>),
}

pub struct ModuleLoader {
    config: LoaderConfig,
    platform: Platform,
    env: HostEnvironment,
    key: ObfuscationKey,
    sink: Arc<dyn TraceSink>,
}

impl ModuleLoader {
    pub fn new(config: LoaderConfig, platform: Platform, env: HostEnvironment) -> Self {
        Self {
            config,
            platform,
            env,
            key: ObfuscationKey::builtin(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Loader for the running process. Fails on platforms without a cache
    /// layout.
    pub fn for_current_process(config: LoaderConfig) -> Result<Self, LoadError> {
        let platform = Platform::current()?;
        let env = HostEnvironment::detect()
            .map_err(|e| LoadError::io("locate executable", PathBuf::new(), e))?;
        Ok(Self::new(config, platform, env))
    }

    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_key(mut self, key: ObfuscationKey) -> Self {
        self.key = key;
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn prepare(&self, module: &ModuleIdentity) -> Result<PreparedModule, LoadError> {
        match self.choose(module)? {
            Chosen::OnDisk(location) => Ok(PreparedModule {
                path: location.path,
                origin: location.origin,
                scratch: None,
            }),
            Chosen::Decrypted(location, plain) => {
                let scratch = self.write_scratch(module, &plain)?;
                self.trace(
                    TraceKind::Decrypted,
                    module,
                    Some(&*scratch),
                    format!("unwrapped {} into scratch file", location.path.display()),
                );
                Ok(PreparedModule {
                    path: scratch.to_path_buf(),
                    origin: location.origin,
                    scratch: Some(scratch),
                })
            }
        }
    }

    /// Prepare, hand the path to `loader`, then drop any scratch copy
    /// whether or not the load worked.
    pub fn load_with<L: DynamicLoad>(
        &self,
        module: &ModuleIdentity,
        loader: &L,
    ) -> Result<L::Handle, LoadError> {
        let prepared = self.prepare(module)?;
        let result = loader.load(prepared.path()).map_err(|e| LoadError::Load {
            path: prepared.path().to_path_buf(),
            message: e.to_string(),
        });
        self.release(module, prepared);
        result
    }

    /// Final module bytes, decrypted if protected, without a scratch file.
    pub fn read_bytes(&self, module: &ModuleIdentity) -> Result<Zeroizing<Vec<u8>>, LoadError> {
        match self.choose(module)? {
            Chosen::OnDisk(location) => fs::read(&location.path)
                .map(Zeroizing::new)
                .map_err(|e| LoadError::io("read", location.path, e)),
            Chosen::Decrypted(_, plain) => Ok(plain),
        }
    }

    /// Remove the scratch copy behind `prepared`, if any.
    pub fn release(&self, module: &ModuleIdentity, prepared: PreparedModule) {
        let Some(scratch) = prepared.scratch else {
            return;
        };
        let path = scratch.to_path_buf();
        match scratch.close() {
            Ok(()) => self.trace(
                TraceKind::ScratchRemoved,
                module,
                Some(path.as_path()),
                "scratch copy removed",
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove scratch copy"),
        }
    }

    // ── decision policy ─────────────────────────────────────────────────

    fn choose(&self, module: &ModuleIdentity) -> Result<Chosen, LoadError> {
        let locations = resolve(module, self.platform, &self.env)?;

        if !module.is_protected_candidate() {
            self.trace(
                TraceKind::Canonical,
                module,
                Some(locations.canonical.path.as_path()),
                "third-party module loads in place",
            );
            return self.first_on_disk(module, vec![locations.canonical]);
        }

        if !self.config.protection_enabled {
            let candidates = self.candidates(module, &locations);
            return self.first_on_disk(module, candidates);
        }

        let artifacts = locations.encrypted();
        let candidates = self.candidates(module, &artifacts);
        self.first_decryptable(module, candidates, locations.canonical)
    }

    /// Ordered places to look, running the cache installer when relocation
    /// is on.
    fn candidates(&self, module: &ModuleIdentity, loc: &ModuleLocations) -> Vec<ResolvedLocation> {
        if !self.config.relocation_enabled {
            self.trace(
                TraceKind::RelocationSkipped,
                module,
                Some(loc.canonical.path.as_path()),
                "relocation disabled; using canonical location",
            );
            return vec![loc.canonical.clone()];
        }

        if let Some(dir) = loc.user_cache.path.parent() {
            if let Err(e) = sweep_orphaned_staging(dir, STAGING_ORPHAN_AGE) {
                warn!(dir = %dir.display(), error = %e, "staging sweep failed");
            }
        }

        match ensure_installed(&loc.canonical.path, &loc.user_cache.path) {
            Ok(installed) => {
                let (kind, message) = match installed.action {
                    InstallAction::AlreadyCurrent => (TraceKind::CacheHit, "cache copy is current"),
                    InstallAction::Installed => (TraceKind::CacheInstalled, "cache copy installed"),
                    InstallAction::Refreshed => (TraceKind::CacheInstalled, "stale cache copy replaced"),
                };
                self.trace(kind, module, Some(installed.path.as_path()), message);
                vec![loc.user_cache.clone(), loc.canonical.clone()]
            }
            Err(e) => {
                self.install_failed(module, &loc.user_cache.path, &e);
                // canonical first; a cache copy is only a last resort when
                // the shipped file is gone
                vec![loc.canonical.clone(), loc.user_cache.clone()]
            }
        }
    }

    fn install_failed(&self, module: &ModuleIdentity, cached: &Path, e: &InstallError) {
        if !e.is_environmental() {
            warn!(module = module.name(), error = %e, "native module cache install failed");
        }
        self.trace(
            TraceKind::CacheFailed,
            module,
            Some(cached),
            format!("cache install failed, falling back to canonical: {e}"),
        );
    }

    fn first_on_disk(
        &self,
        module: &ModuleIdentity,
        candidates: Vec<ResolvedLocation>,
    ) -> Result<Chosen, LoadError> {
        let tried: Vec<PathBuf> = candidates.iter().map(|c| c.path.clone()).collect();
        match candidates.into_iter().find(|c| c.path.is_file()) {
            Some(found) => Ok(Chosen::OnDisk(found)),
            None => Err(self.not_found(module, tried)),
        }
    }

    fn first_decryptable(
        &self,
        module: &ModuleIdentity,
        candidates: Vec<ResolvedLocation>,
        unprotected: ResolvedLocation,
    ) -> Result<Chosen, LoadError> {
        let mut tried = Vec::with_capacity(candidates.len() + 1);
        let mut last_format = None;
        let mut last_io = None;

        for candidate in candidates {
            tried.push(candidate.path.clone());
            let framed = match fs::read(&candidate.path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %candidate.path.display(), error = %e, "cannot read protected artifact");
                    self.trace(
                        TraceKind::DecryptFailed,
                        module,
                        Some(candidate.path.as_path()),
                        format!("cannot read artifact: {e}"),
                    );
                    last_io = Some((candidate.path, e));
                    continue;
                }
            };
            match obfuscation::unwrap(&framed, &self.key) {
                Ok(plain) => return Ok(Chosen::Decrypted(candidate, plain)),
                Err(e) => {
                    self.trace(
                        TraceKind::DecryptFailed,
                        module,
                        Some(candidate.path.as_path()),
                        format!("cannot unwrap artifact: {e}"),
                    );
                    last_format = Some(e);
                }
            }
        }

        tried.push(unprotected.path.clone());
        if unprotected.path.is_file() {
            self.trace(
                TraceKind::Canonical,
                module,
                Some(unprotected.path.as_path()),
                "no usable artifact; loading unprotected module",
            );
            return Ok(Chosen::OnDisk(unprotected));
        }

        // an artifact that exists but cannot be used is not a missing module
        match (last_format, last_io) {
            (Some(source), _) => Err(LoadError::Format {
                module: module.name().to_string(),
                source,
            }),
            (None, Some((path, source))) => Err(LoadError::io("read artifact", path, source)),
            (None, None) => Err(self.not_found(module, tried)),
        }
    }

    fn not_found(&self, module: &ModuleIdentity, tried: Vec<PathBuf>) -> LoadError {
        self.trace(
            TraceKind::NotFound,
            module,
            None,
            format!("no loadable copy among {tried:?}"),
        );
        LoadError::NotFound {
            module: module.name().to_string(),
            tried,
        }
    }

    fn write_scratch(&self, module: &ModuleIdentity, plain: &[u8]) -> Result<TempPath, LoadError> {
        let dir = self
            .config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        ensure_directory(&dir)?;
        // keep the native extension; some platform loaders insist on it
        let ext = self
            .platform
            .native_extensions()
            .first()
            .copied()
            .unwrap_or("bin");
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", module.name()))
            .suffix(&format!(".{ext}"))
            .tempfile_in(&dir)
            .map_err(|e| LoadError::io("create scratch file in", &dir, e))?;
        file.write_all(plain)
            .and_then(|()| file.flush())
            .map_err(|e| LoadError::io("write", file.path(), e))?;
        Ok(file.into_temp_path())
    }

    fn trace(
        &self,
        kind: TraceKind,
        module: &ModuleIdentity,
        path: Option<&Path>,
        message: impl Into<String>,
    ) {
        if self.config.trace_enabled {
            self.sink.emit(TraceEvent::new(kind, module.name(), path, message));
        }
    }
}
