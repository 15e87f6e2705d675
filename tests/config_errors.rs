// tests/config_errors.rs

mod common;
use crate::common::builders::ConfigFileBuilder;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::NamedTempFile;

use ducc::config::{ConfigFile, load_and_validate, load_from_path};
use ducc::errors::DuccError;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn expect_config_error(contents: &str) -> String {
    let file = write_config(contents);
    match load_and_validate(file.path()) {
        Err(DuccError::ConfigError(msg)) => msg,
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_full_config_is_loaded() {
    let file = write_config(
        r#"
[scheduler]
max_retries = 5
registry_concurrency = 8
repository_concurrency = 2
rate_limit_backoff_secs = 12

[storage]
tar_cache_dir = "/var/tmp/ducc"

[registry."registry.example.org"]
concurrency = 2

[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "https://registry.example.org/library/ubuntu:2*"

[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "registry.example.org/library/alpine"
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();
    let settings = cfg.ingest_settings();

    assert_eq!(settings.max_retries, 5);
    assert_eq!(settings.registry_capacity("registry.example.org"), 2);
    assert_eq!(settings.registry_capacity("ghcr.io"), 8);
    assert_eq!(settings.repository_concurrency, 2);
    assert_eq!(settings.tar_cache_dir, PathBuf::from("/var/tmp/ducc"));
    assert_eq!(cfg.rate_limit_backoff(), Duration::from_secs(12));

    let wishes = cfg.wish_specs().unwrap();
    assert_eq!(wishes.len(), 2);
    assert!(wishes[0].input.is_wildcard());
    assert_eq!(wishes[1].input.tag.as_deref(), Some("latest"));
}

#[test]
fn test_omitted_sections_use_defaults() {
    let file = write_config(
        r#"
[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "registry.example.org/library/alpine:3.20"
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();

    assert_eq!(cfg.scheduler.max_retries, 3);
    assert_eq!(cfg.scheduler.registry_concurrency, 4);
    assert_eq!(cfg.scheduler.repository_concurrency, 1);
    assert_eq!(cfg.rate_limit_backoff(), Duration::from_secs(30));
    assert_eq!(cfg.storage.registry_root, PathBuf::from("registry"));
    assert_eq!(cfg.storage.repository_root, PathBuf::from("cvmfs"));
    assert!(cfg.storage.tar_cache_dir.is_none());
}

#[test]
fn test_config_without_wishes_is_rejected() {
    let msg = expect_config_error(
        r#"
[scheduler]
max_retries = 1
"#,
    );
    assert!(msg.contains("at least one [[wish]]"));
}

#[test]
fn test_zero_capacities_are_rejected() {
    let msg = expect_config_error(
        r#"
[scheduler]
registry_concurrency = 0

[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "registry.example.org/library/alpine"
"#,
    );
    assert!(msg.contains("registry_concurrency must be >= 1"));

    let msg = expect_config_error(
        r#"
[scheduler]
repository_concurrency = 0

[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "registry.example.org/library/alpine"
"#,
    );
    assert!(msg.contains("repository_concurrency must be >= 1"));

    let msg = expect_config_error(
        r#"
[registry."slow.example.org"]
concurrency = 0

[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "registry.example.org/library/alpine"
"#,
    );
    assert!(msg.contains("slow.example.org"));
}

#[test]
fn test_bad_wishes_are_rejected() {
    let msg = expect_config_error(
        r#"
[[wish]]
cvmfs_repo = "  "
input = "registry.example.org/library/alpine"
"#,
    );
    assert!(msg.contains("wish #1 has an empty cvmfs_repo"));

    let msg = expect_config_error(
        r#"
[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "registry.example.org/library/alpine"

[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "ftp://registry.example.org/library/alpine"
"#,
    );
    assert!(msg.contains("wish #2 has an invalid input"));
    assert!(msg.contains("unsupported protocol"));
}

#[test]
fn test_duplicate_wishes_are_rejected() {
    // Same image once spelled with the default scheme and tag.
    let msg = expect_config_error(
        r#"
[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "registry.example.org/library/alpine"

[[wish]]
cvmfs_repo = "unpacked.example.org"
input = "https://registry.example.org/library/alpine:latest"
"#,
    );
    assert!(msg.contains("duplicate wish"));
}

#[test]
fn test_same_input_into_different_repositories_is_fine() {
    let cfg = ConfigFileBuilder::new()
        .with_wish("one.example.org", "registry.example.org/library/alpine")
        .with_wish("two.example.org", "registry.example.org/library/alpine")
        .build();
    assert_eq!(cfg.wish_specs().unwrap().len(), 2);
}

#[test]
fn test_builder_errors_match_file_errors() {
    let raw = ConfigFileBuilder::new()
        .with_wish("unpacked.example.org", "registry.example.org/library/alpine")
        .with_registry_override("registry.example.org", 0)
        .build_raw();

    match ConfigFile::try_from(raw) {
        Err(DuccError::ConfigError(msg)) => assert!(msg.contains("registry.example.org")),
        other => panic!("Expected ConfigError, got: {:?}", other),
    }
}

#[test]
fn test_malformed_toml_is_a_toml_error() {
    let file = write_config("[[wish]\ncvmfs_repo = ");
    assert!(matches!(
        load_from_path(file.path()),
        Err(DuccError::TomlError(_))
    ));
}

#[test]
fn test_missing_file_is_an_io_error() {
    assert!(matches!(
        load_and_validate("/nonexistent/Ducc.toml"),
        Err(DuccError::IoError(_))
    ));
}

#[test]
fn test_demo_config_is_valid() {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let cfg = load_and_validate(manifest.join("demos/Ducc.toml")).unwrap();
    assert!(!cfg.wish.is_empty());
    assert!(cfg.wish_specs().is_ok());
}
