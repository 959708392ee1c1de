//! Loader policy tests. Every test uses the Linux layout against temp
//! directories so the paths are predictable on any host.

use native_cache::obfuscation::{wrap, ObfuscationKey};
use native_cache::trace::{RecordingSink, TraceKind};
use native_cache::{
    DynamicLoad, HostEnvironment, LoadError, LoaderConfig, ModuleIdentity, ModuleLoader, Origin,
    Platform,
};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::{tempdir, TempDir};

const PAYLOAD: &[u8] = b"\x7fELF lumen_core test payload \x00\x01\x02\x03";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        Self { dir }
    }

    fn exe_dir(&self) -> PathBuf {
        self.dir.path().join("app")
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    fn canonical(&self) -> PathBuf {
        self.exe_dir().join("liblumen_core.so")
    }

    fn cached(&self) -> PathBuf {
        self.home()
            .join(".local/share/Lumen/native-modules")
            .join("liblumen_core.so")
    }

    fn env(&self) -> HostEnvironment {
        HostEnvironment {
            exe_dir: self.exe_dir(),
            home_dir: Some(self.home()),
            local_app_data: None,
            xdg_data_home: None,
        }
    }

    fn loader(&self, relocate: bool, protect: bool) -> (ModuleLoader, Arc<RecordingSink>) {
        let config = LoaderConfig {
            relocation_enabled: relocate,
            protection_enabled: protect,
            trace_enabled: true,
            scratch_dir: Some(self.scratch_dir()),
        };
        let sink = Arc::new(RecordingSink::default());
        let loader = ModuleLoader::new(config, Platform::Linux, self.env()).with_sink(sink.clone());
        (loader, sink)
    }

    fn scratch_entries(&self) -> usize {
        fs::read_dir(self.scratch_dir()).map(|d| d.count()).unwrap_or(0)
    }
}

fn encrypted(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".encrypted");
    PathBuf::from(s)
}

/// Reads the file it is asked to load, standing in for dlopen.
struct ReadingLoader;

impl DynamicLoad for ReadingLoader {
    type Handle = (PathBuf, Vec<u8>);
    type Error = std::io::Error;

    fn load(&self, path: &Path) -> Result<Self::Handle, Self::Error> {
        Ok((path.to_path_buf(), fs::read(path)?))
    }
}

struct RefusingLoader;

impl DynamicLoad for RefusingLoader {
    type Handle = ();
    type Error = String;

    fn load(&self, path: &Path) -> Result<(), String> {
        assert!(path.exists());
        Err("undefined symbol: lumen_init".to_string())
    }
}

// ─── Relocation ─────────────────────────────────────────────────────────────

#[test]
fn test_relocation_disabled_loads_canonical() {
    let fx = Fixture::new();
    fs::write(fx.canonical(), PAYLOAD).unwrap();
    let (loader, sink) = fx.loader(false, false);

    let prepared = loader.prepare(&ModuleIdentity::framework()).unwrap();
    assert_eq!(prepared.path(), fx.canonical());
    assert_eq!(prepared.origin(), Origin::Canonical);
    assert!(!fx.home().exists());
    assert_eq!(sink.kinds(), vec![TraceKind::RelocationSkipped]);
}

#[test]
fn test_relocation_installs_and_loads_from_cache() {
    let fx = Fixture::new();
    fs::write(fx.canonical(), PAYLOAD).unwrap();
    let (loader, sink) = fx.loader(true, false);

    let (path, bytes) = loader
        .load_with(&ModuleIdentity::framework(), &ReadingLoader)
        .unwrap();
    assert_eq!(path, fx.cached());
    assert_eq!(bytes, PAYLOAD);
    assert_eq!(sink.kinds(), vec![TraceKind::CacheInstalled]);

    let again = loader.prepare(&ModuleIdentity::framework()).unwrap();
    assert_eq!(again.origin(), Origin::UserCache);
    assert_eq!(sink.kinds().last(), Some(&TraceKind::CacheHit));
}

#[test]
fn test_install_failure_falls_back_to_canonical() {
    let fx = Fixture::new();
    fs::write(fx.canonical(), PAYLOAD).unwrap();
    // block the cache root with a regular file
    fs::write(fx.home(), b"not a directory").unwrap();
    let (loader, sink) = fx.loader(true, false);

    let prepared = loader.prepare(&ModuleIdentity::framework()).unwrap();
    assert_eq!(prepared.path(), fx.canonical());
    assert_eq!(prepared.origin(), Origin::Canonical);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, TraceKind::CacheFailed);
    assert_eq!(events[0].path.as_deref(), Some(fx.cached().as_path()));
    assert!(events[0].message.contains("falling back"));
}

#[test]
fn test_cache_copy_used_when_canonical_is_gone() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.cached().parent().unwrap()).unwrap();
    fs::write(fx.cached(), PAYLOAD).unwrap();
    let (loader, _) = fx.loader(true, false);

    let prepared = loader.prepare(&ModuleIdentity::framework()).unwrap();
    assert_eq!(prepared.path(), fx.cached());
}

#[test]
fn test_third_party_modules_never_move() {
    let fx = Fixture::new();
    let sqlite = fx.exe_dir().join("libsqlite3.so");
    fs::write(&sqlite, b"sqlite").unwrap();
    let (loader, sink) = fx.loader(true, true);

    let prepared = loader.prepare(&ModuleIdentity::third_party("sqlite3")).unwrap();
    assert_eq!(prepared.path(), sqlite);
    assert!(!prepared.is_scratch());
    assert!(!fx.home().exists());
    assert_eq!(sink.kinds(), vec![TraceKind::Canonical]);
}

#[test]
fn test_missing_module_is_not_found() {
    let fx = Fixture::new();
    let (loader, sink) = fx.loader(true, false);

    let err = loader.prepare(&ModuleIdentity::framework()).unwrap_err();
    match err {
        LoadError::NotFound { module, tried } => {
            assert_eq!(module, "lumen_core");
            assert_eq!(tried, vec![fx.canonical(), fx.cached()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        sink.kinds(),
        vec![TraceKind::CacheFailed, TraceKind::NotFound]
    );
}

#[test]
fn test_trace_disabled_emits_nothing() {
    let fx = Fixture::new();
    fs::write(fx.canonical(), PAYLOAD).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let config = LoaderConfig {
        relocation_enabled: true,
        ..LoaderConfig::default()
    };
    let loader = ModuleLoader::new(config, Platform::Linux, fx.env()).with_sink(sink.clone());

    loader.prepare(&ModuleIdentity::framework()).unwrap();
    assert!(sink.events().is_empty());
}

// ─── Protection ─────────────────────────────────────────────────────────────

#[test]
fn test_protected_module_end_to_end() {
    let fx = Fixture::new();
    let artifact = wrap(PAYLOAD, &ObfuscationKey::builtin());
    fs::write(encrypted(&fx.canonical()), &artifact).unwrap();
    let (loader, sink) = fx.loader(true, true);

    let (loaded_from, bytes) = loader
        .load_with(&ModuleIdentity::framework(), &ReadingLoader)
        .unwrap();
    assert_eq!(bytes, PAYLOAD);
    assert!(loaded_from.starts_with(fx.scratch_dir()));
    assert_eq!(loaded_from.extension().unwrap(), "so");
    assert!(!loaded_from.exists());
    assert_eq!(fx.scratch_entries(), 0);

    // the cache holds the artifact, never plaintext
    assert_eq!(fs::read(encrypted(&fx.cached())).unwrap(), artifact);
    assert!(!fx.cached().exists());
    assert_eq!(
        sink.kinds(),
        vec![
            TraceKind::CacheInstalled,
            TraceKind::Decrypted,
            TraceKind::ScratchRemoved
        ]
    );
}

#[test]
fn test_scratch_removed_when_load_fails() {
    let fx = Fixture::new();
    fs::write(
        encrypted(&fx.canonical()),
        wrap(PAYLOAD, &ObfuscationKey::builtin()),
    )
    .unwrap();
    let (loader, _) = fx.loader(false, true);

    let err = loader
        .load_with(&ModuleIdentity::framework(), &RefusingLoader)
        .unwrap_err();
    assert!(matches!(err, LoadError::Load { .. }));
    assert_eq!(fx.scratch_entries(), 0);
}

#[test]
fn test_dropping_prepared_module_removes_scratch() {
    let fx = Fixture::new();
    fs::write(
        encrypted(&fx.canonical()),
        wrap(PAYLOAD, &ObfuscationKey::builtin()),
    )
    .unwrap();
    let (loader, _) = fx.loader(false, true);

    let prepared = loader.prepare(&ModuleIdentity::framework()).unwrap();
    assert!(prepared.is_scratch());
    let path = prepared.path().to_path_buf();
    assert_eq!(fs::read(&path).unwrap(), PAYLOAD);
    drop(prepared);
    assert!(!path.exists());
}

#[test]
fn test_corrupt_cache_artifact_falls_back_to_canonical_artifact() {
    let fx = Fixture::new();
    let canonical_artifact = encrypted(&fx.canonical());
    fs::write(&canonical_artifact, wrap(PAYLOAD, &ObfuscationKey::builtin())).unwrap();
    File::options()
        .write(true)
        .open(&canonical_artifact)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();
    let cached_artifact = encrypted(&fx.cached());
    fs::create_dir_all(cached_artifact.parent().unwrap()).unwrap();
    fs::write(&cached_artifact, b"garbage that is not an artifact").unwrap();
    let (loader, sink) = fx.loader(true, true);

    let bytes = loader.read_bytes(&ModuleIdentity::framework()).unwrap();
    assert_eq!(bytes.as_slice(), PAYLOAD);
    assert_eq!(
        sink.kinds(),
        vec![TraceKind::CacheHit, TraceKind::DecryptFailed]
    );
}

#[test]
fn test_corrupt_artifact_without_fallback_is_a_format_error() {
    let fx = Fixture::new();
    fs::write(encrypted(&fx.canonical()), b"MZ plain dll bytes").unwrap();
    let (loader, _) = fx.loader(false, true);

    let err = loader.prepare(&ModuleIdentity::framework()).unwrap_err();
    assert!(matches!(err, LoadError::Format { .. }));
}

#[test]
fn test_unreadable_artifact_is_an_io_error() {
    let fx = Fixture::new();
    let artifact = encrypted(&fx.canonical());
    // exists, but cannot be read as a file
    fs::create_dir_all(&artifact).unwrap();
    let (loader, sink) = fx.loader(false, true);

    let err = loader.prepare(&ModuleIdentity::framework()).unwrap_err();
    match err {
        LoadError::Io { path, .. } => assert_eq!(path, artifact),
        other => panic!("unexpected error: {other}"),
    }
    let events = sink.events();
    assert_eq!(
        sink.kinds(),
        vec![TraceKind::RelocationSkipped, TraceKind::DecryptFailed]
    );
    assert_eq!(events[1].path.as_deref(), Some(artifact.as_path()));
}

#[test]
fn test_corrupt_artifact_with_plain_module_loads_plain() {
    let fx = Fixture::new();
    fs::write(encrypted(&fx.canonical()), b"MZ plain dll bytes").unwrap();
    fs::write(fx.canonical(), PAYLOAD).unwrap();
    let (loader, _) = fx.loader(false, true);

    let prepared = loader.prepare(&ModuleIdentity::framework()).unwrap();
    assert_eq!(prepared.path(), fx.canonical());
    assert!(!prepared.is_scratch());
}

#[test]
fn test_custom_key_must_match() {
    let fx = Fixture::new();
    let key = ObfuscationKey::from_passphrase(b"another build");
    fs::write(encrypted(&fx.canonical()), wrap(PAYLOAD, &key)).unwrap();

    let (loader, _) = fx.loader(false, true);
    let wrong = loader.read_bytes(&ModuleIdentity::framework()).unwrap();
    assert_ne!(wrong.as_slice(), PAYLOAD);

    let (loader, _) = fx.loader(false, true);
    let right = loader
        .with_key(key)
        .read_bytes(&ModuleIdentity::framework())
        .unwrap();
    assert_eq!(right.as_slice(), PAYLOAD);
}
