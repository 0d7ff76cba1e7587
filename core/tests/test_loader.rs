//! Integration tests for native library resolution
//!
//! Exercises the resolver with a counting opener so the once-per-process
//! guarantee can be observed without a real shared library.

use bluebridge_core::loader::{LoaderError, Platform, ResourceRoot, Resolver};
use bluebridge_core::{BridgeConfig, Error, Session};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn counting_resolver() -> (Arc<Resolver<String>>, Arc<AtomicUsize>) {
    let opens = Arc::new(AtomicUsize::new(0));
    let counter = opens.clone();
    let resolver = Resolver::new(move |path: &Path| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(path.display().to_string())
    });
    (Arc::new(resolver), opens)
}

fn stage_artifact(root: &Path, platform: Platform, base_name: &str) {
    let path = platform.resource_path(root, base_name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"\x7fELF not really").unwrap();
}

#[test]
fn test_repeated_resolve_opens_once() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempfile::tempdir().unwrap();
    let platform = Platform::from_names("linux", "x86_64").unwrap();
    stage_artifact(dir.path(), platform, "simplecble");
    let root = ResourceRoot::new(dir.path());

    let (resolver, opens) = counting_resolver();
    let first = resolver.resolve(platform, "simplecble", &root).unwrap();
    let second = resolver.resolve(platform, "simplecble", &root).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert!(resolver.is_loaded("simplecble"));
    assert!(first.extracted_path.ends_with("libsimplecble.so"));
    assert_ne!(first.extracted_path.parent(), Some(dir.path().join("x64").as_path()));
    println!("✓ Second resolve reused {}", first.extracted_path.display());
}

#[test]
fn test_concurrent_resolve_opens_once() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Platform::from_names("macos", "arm64").unwrap();
    stage_artifact(dir.path(), platform, "simplecble");

    let (resolver, opens) = counting_resolver();
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let resolver = resolver.clone();
            let root = ResourceRoot::new(dir.path());
            std::thread::spawn(move || resolver.resolve(platform, "simplecble", &root).unwrap())
        })
        .collect();

    let loaded: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert!(loaded.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    println!("✓ 8 concurrent callers shared one library");
}

#[test]
fn test_missing_artifact_is_not_found_even_with_other_arches() {
    let dir = tempfile::tempdir().unwrap();
    let x86 = Platform::from_names("windows", "i686").unwrap();
    let aarch64 = Platform::from_names("windows", "aarch64").unwrap();
    stage_artifact(dir.path(), x86, "simplecble");
    stage_artifact(dir.path(), aarch64, "simplecble");

    let x64 = Platform::from_names("Windows 11", "amd64").unwrap();
    let (resolver, opens) = counting_resolver();
    let err = resolver
        .resolve(x64, "simplecble", &ResourceRoot::new(dir.path()))
        .unwrap_err();

    match err {
        LoaderError::LibraryNotFound { path } => {
            assert_eq!(path, dir.path().join("x64").join("simplecble.dll"));
        }
        other => panic!("expected LibraryNotFound, got {:?}", other),
    }
    assert_eq!(opens.load(Ordering::SeqCst), 0);
    assert!(!resolver.is_loaded("simplecble"));
}

#[test]
fn test_unsupported_platforms_are_rejected() {
    assert!(matches!(
        Platform::from_names("freebsd", "x86_64"),
        Err(LoaderError::UnsupportedPlatform(_))
    ));
    assert!(matches!(
        Platform::from_names("linux", "riscv64"),
        Err(LoaderError::UnsupportedArchitecture(_))
    ));
    assert!(Platform::from_names("Mac OS X", "x86_64").is_ok());
    assert!(Platform::from_names("darwin", "aarch64").is_ok());
}

#[test]
fn test_failed_open_is_retried_on_next_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Platform::from_names("linux", "aarch64").unwrap();
    stage_artifact(dir.path(), platform, "flaky");
    let root = ResourceRoot::new(dir.path());

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let resolver = Resolver::new(move |_: &Path| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err("first open fails".to_string())
        } else {
            Ok(())
        }
    });

    assert!(matches!(
        resolver.resolve(platform, "flaky", &root),
        Err(LoaderError::LibraryLoadFailed { .. })
    ));
    assert!(!resolver.is_loaded("flaky"));
    assert!(resolver.resolve(platform, "flaky", &root).is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_session_load_reports_missing_library() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig {
        library_name: "bluebridge-test-absent".to_string(),
        native_dir: Some(dir.path().to_path_buf()),
        ..BridgeConfig::default()
    };

    match Session::load(&config) {
        Err(Error::Loader(LoaderError::LibraryNotFound { path })) => {
            assert!(path.starts_with(dir.path()));
        }
        // Hosts outside the supported matrix fail before the lookup
        Err(Error::Loader(LoaderError::UnsupportedPlatform(_)))
        | Err(Error::Loader(LoaderError::UnsupportedArchitecture(_))) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("session opened without a native library"),
    }
}

#[test]
fn test_session_load_trims_library_name() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig {
        library_name: "  bluebridge-test-padded\n".to_string(),
        native_dir: Some(dir.path().to_path_buf()),
        ..BridgeConfig::default()
    };

    let Ok(platform) = Platform::detect() else {
        return;
    };
    match Session::load(&config) {
        Err(Error::Loader(LoaderError::LibraryNotFound { path })) => {
            assert_eq!(
                path,
                platform.resource_path(dir.path(), "bluebridge-test-padded")
            );
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("session opened without a native library"),
    }
    println!("✓ Padded library name resolves to the trimmed artifact path");
}
