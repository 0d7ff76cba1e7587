//! Native library resolution and loading
//!
//! The BLE backend ships as a prebuilt shared library per CPU architecture:
//!
//! ```text
//! <root>/x86/<artifact>
//! <root>/x64/<artifact>
//! <root>/aarch64/<artifact>
//! ```
//!
//! where `<artifact>` is `name.dll`, `libname.so` or `libname.dylib`
//! depending on the OS. The selected artifact is copied into a fresh
//! process-unique temp directory and loaded from there, at most once per
//! process. Extracted directories are removed on normal exit when possible.

mod platform;

pub use platform::{Arch, Os, Platform};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once, OnceLock};
use thiserror::Error;

/// Environment variable overriding the native resource root
pub const NATIVE_DIR_ENV: &str = "BLUEBRIDGE_NATIVE_DIR";

const EXTRACT_DIR_PREFIX: &str = "bluebridge-native-";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Native library not found: {}", .path.display())]
    LibraryNotFound { path: PathBuf },

    #[error("Failed to load native library {}: {reason}", .path.display())]
    LibraryLoadFailed { path: PathBuf, reason: String },

    #[error("Failed to extract native library to {}: {source}", .path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// RESOURCE ROOT
// ============================================================================

/// Directory holding the per-architecture native artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRoot(PathBuf);

impl ResourceRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Explicit path, then `BLUEBRIDGE_NATIVE_DIR`, then `<exe dir>/native`
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        if let Some(path) = std::env::var_os(NATIVE_DIR_ENV) {
            return Self::new(path);
        }
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(exe_dir.join("native"))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

/// A library resident in this process
#[derive(Debug)]
pub struct LoadedLibrary<L = libloading::Library> {
    pub name: String,
    pub platform: Platform,
    /// Path of the copy the library was loaded from
    pub extracted_path: PathBuf,
    pub library: L,
}

type Opener<L> = Box<dyn Fn(&Path) -> Result<L, String> + Send + Sync>;

/// Resolves, extracts and opens native libraries, once per base name.
pub struct Resolver<L> {
    opener: Opener<L>,
    loaded: Mutex<HashMap<String, Arc<LoadedLibrary<L>>>>,
}

impl<L> Resolver<L> {
    pub fn new(opener: impl Fn(&Path) -> Result<L, String> + Send + Sync + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Return the resident library for `base_name`, loading it on first use.
    ///
    /// The table lock is held across extraction so concurrent callers never
    /// extract or open the same library twice.
    pub fn resolve(
        &self,
        platform: Platform,
        base_name: &str,
        root: &ResourceRoot,
    ) -> Result<Arc<LoadedLibrary<L>>, LoaderError> {
        let mut loaded = self.loaded.lock();
        if let Some(existing) = loaded.get(base_name) {
            tracing::debug!("Native library {} already loaded", base_name);
            return Ok(existing.clone());
        }

        let source = platform.resource_path(root.path(), base_name);
        if !source.is_file() {
            return Err(LoaderError::LibraryNotFound { path: source });
        }

        let extracted_path = extract(&source, &platform.artifact_name(base_name))?;
        let library = (self.opener)(&extracted_path).map_err(|reason| {
            LoaderError::LibraryLoadFailed {
                path: extracted_path.clone(),
                reason,
            }
        })?;

        tracing::info!(
            "Loaded native library {} for {} from {}",
            base_name,
            platform,
            extracted_path.display()
        );

        let entry = Arc::new(LoadedLibrary {
            name: base_name.to_string(),
            platform,
            extracted_path,
            library,
        });
        loaded.insert(base_name.to_string(), entry.clone());
        Ok(entry)
    }

    pub fn is_loaded(&self, base_name: &str) -> bool {
        self.loaded.lock().contains_key(base_name)
    }
}

fn global_resolver() -> &'static Resolver<libloading::Library> {
    static GLOBAL: OnceLock<Resolver<libloading::Library>> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        Resolver::new(|path: &Path| {
            // SAFETY: the artifact is our own bundled library; its
            // initializers have no preconditions on the host process.
            unsafe { libloading::Library::new(path) }.map_err(|e| e.to_string())
        })
    })
}

/// Detect the running platform and load `base_name` from `root`.
///
/// Idempotent per process: later calls return the already-resident library.
pub fn resolve_and_load(
    base_name: &str,
    root: &ResourceRoot,
) -> Result<Arc<LoadedLibrary>, LoaderError> {
    let platform = Platform::detect()?;
    global_resolver().resolve(platform, base_name, root)
}

// ============================================================================
// EXTRACTION & CLEANUP
// ============================================================================

static EXTRACTED_DIRS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

fn extract(source: &Path, artifact_name: &str) -> Result<PathBuf, LoaderError> {
    let dir = tempfile::Builder::new()
        .prefix(EXTRACT_DIR_PREFIX)
        .tempdir()
        .map_err(|source| LoaderError::Extraction {
            path: std::env::temp_dir(),
            source,
        })?
        .keep();
    register_cleanup(dir.clone());

    let target = dir.join(artifact_name);
    if target.exists() {
        if let Err(e) = std::fs::remove_file(&target) {
            tracing::debug!("Could not remove stale {}: {}", target.display(), e);
        }
    }
    std::fs::copy(source, &target).map_err(|source| LoaderError::Extraction {
        path: target.clone(),
        source,
    })?;
    tracing::debug!("Extracted {} to {}", source.display(), target.display());
    Ok(target)
}

fn register_cleanup(dir: PathBuf) {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        // SAFETY: registering a plain extern "C" fn with no captured state
        let rc = unsafe { libc::atexit(remove_extracted_dirs) };
        if rc != 0 {
            tracing::warn!("Could not register native library cleanup at exit");
        }
    });
    EXTRACTED_DIRS.lock().push(dir);
}

extern "C" fn remove_extracted_dirs() {
    let dirs = std::mem::take(&mut *EXTRACTED_DIRS.lock());
    for dir in dirs {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_root_explicit_wins() {
        let root = ResourceRoot::resolve(Some(Path::new("/opt/bluebridge/native")));
        assert_eq!(root.path(), Path::new("/opt/bluebridge/native"));
    }

    #[test]
    fn test_missing_artifact_names_expected_path() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(|_: &Path| Ok(()));
        let platform = Platform::from_names("linux", "x86_64").unwrap();
        let err = resolver
            .resolve(platform, "simplecble", &ResourceRoot::new(dir.path()))
            .unwrap_err();
        match err {
            LoaderError::LibraryNotFound { path } => {
                assert_eq!(path, dir.path().join("x64").join("libsimplecble.so"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!resolver.is_loaded("simplecble"));
    }

    #[test]
    fn test_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("aarch64")).unwrap();
        std::fs::write(dir.path().join("aarch64").join("libsimplecble.dylib"), b"junk").unwrap();

        let resolver: Resolver<()> = Resolver::new(|_: &Path| Err("bad ELF header".to_string()));
        let platform = Platform::from_names("macos", "aarch64").unwrap();
        let err = resolver
            .resolve(platform, "simplecble", &ResourceRoot::new(dir.path()))
            .unwrap_err();
        assert!(matches!(err, LoaderError::LibraryLoadFailed { ref reason, .. } if reason == "bad ELF header"));
    }

    #[test]
    fn test_extraction_copies_into_unique_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("x86")).unwrap();
        std::fs::write(dir.path().join("x86").join("simplecble.dll"), b"payload").unwrap();

        let resolver = Resolver::new(|path: &Path| std::fs::read(path).map_err(|e| e.to_string()));
        let platform = Platform::from_names("windows", "x86").unwrap();
        let loaded = resolver
            .resolve(platform, "simplecble", &ResourceRoot::new(dir.path()))
            .unwrap();

        assert_eq!(loaded.library, b"payload".to_vec());
        // The extracted copy outlives the resolve call
        assert!(loaded.extracted_path.exists());
        assert_ne!(loaded.extracted_path.parent(), Some(dir.path().join("x86").as_path()));
        let parent = loaded.extracted_path.parent().unwrap();
        assert!(parent
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(EXTRACT_DIR_PREFIX));
    }
}
