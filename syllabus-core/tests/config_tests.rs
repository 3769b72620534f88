//! Config error-message, parsing, and validation integration tests.

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use rstest::rstest;
use syllabus_core::{
    config, paths, ConfigError, ConflictPolicy, HierarchyRule, RemoteConfig, SyncConfig,
};

fn write_config(root: &assert_fs::TempDir, yaml: &str) {
    root.child(".syllabus/config.yaml")
        .write_str(yaml)
        .expect("write config");
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_returns_not_found() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(root.path()).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("syllabus init"));
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    write_config(&root, ": : corrupt : yaml : !!!\n  - broken: [unclosed");

    let err = config::load_at(root.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn hierarchy_is_required() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    write_config(&root, "version: 1\nremote:\n  backend: memory\n");

    let err = config::load_at(root.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("hierarchy"), "got: {err}");
}

#[test]
fn unknown_policy_is_a_parse_error() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    write_config(
        &root,
        "version: 1\nhierarchy: flat\npolicy: newest-wins\nremote:\n  backend: memory\n",
    );
    let err = config::load_at(root.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Parsing
// ---------------------------------------------------------------------------

#[test]
fn minimal_config_fills_defaults() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    write_config(
        &root,
        "version: 1\nhierarchy: path-depth\nremote:\n  backend: file\n  path: cms.json\n",
    );
    let cfg = config::load_at(root.path()).expect("load");
    assert_eq!(cfg.hierarchy, HierarchyRule::PathDepth);
    assert_eq!(cfg.policy, None);
    assert_eq!(cfg.workers, 4);
    assert!(cfg.accepts_extension("MD"));
    assert_eq!(cfg.content_root_at(root.path()), root.path().join("content"));
}

#[test]
fn strapi_backend_parses_with_defaults() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    write_config(
        &root,
        "version: 1\nhierarchy: flat\npolicy: manual\nremote:\n  backend: strapi\n  base_url: https://cms.example.org\n  collection: lessons\n",
    );
    let cfg = config::load_at(root.path()).expect("load");
    let RemoteConfig::Strapi(strapi) = cfg.remote else {
        panic!("expected strapi backend");
    };
    assert_eq!(strapi.collection, "lessons");
    assert_eq!(strapi.token_env, "SYLLABUS_CMS_TOKEN");
    assert_eq!(strapi.page_size, 100);
    assert_eq!(cfg.policy, Some(ConflictPolicy::Manual));
}

#[rstest]
#[case("last-writer-wins", ConflictPolicy::LastWriterWins)]
#[case("prefer-local", ConflictPolicy::PreferLocal)]
#[case("prefer-remote", ConflictPolicy::PreferRemote)]
#[case("manual", ConflictPolicy::Manual)]
fn every_policy_parses_from_yaml(#[case] text: &str, #[case] expected: ConflictPolicy) {
    let root = assert_fs::TempDir::new().expect("tempdir");
    write_config(
        &root,
        &format!("version: 1\nhierarchy: flat\npolicy: {text}\nremote:\n  backend: memory\n"),
    );
    let cfg = config::load_at(root.path()).expect("load");
    assert_eq!(cfg.policy, Some(expected));
}

// ---------------------------------------------------------------------------
// 3. Validation
// ---------------------------------------------------------------------------

#[rstest]
#[case("workers: 0\n", "workers")]
#[case("extensions: []\n", "extensions")]
#[case("version: 2\n", "version")]
fn invalid_values_are_rejected(#[case] extra: &str, #[case] needle: &str) {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let base = "hierarchy: flat\nremote:\n  backend: memory\n";
    let version = if extra.starts_with("version") { "" } else { "version: 1\n" };
    write_config(&root, &format!("{version}{base}{extra}"));
    let err = config::load_at(root.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
    assert!(err.to_string().contains(needle), "got: {err}");
}

#[test]
fn init_writes_config_file() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let cfg = SyncConfig::new(RemoteConfig::Memory, HierarchyRule::Flat);
    config::init_at(root.path(), cfg).expect("init");

    root.child(".syllabus/config.yaml")
        .assert(predicate::str::contains("hierarchy: flat"));
    root.child(".syllabus/config.yaml")
        .assert(predicate::str::contains("backend: memory"));
    assert!(paths::config_path(root.path()).exists());
}
