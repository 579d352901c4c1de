//! Broker initialization failures.
//!
//! Every check runs before any plugin is spawned, and the error text names
//! the failing check.

mod support;

use claw_notify::{BrokerConfig, BrokerError, PluginBroker, PluginConfig, ProfileBinding, RunAs};
use nix::unistd::{geteuid, getuid, User};
use support::{install_plugin, shared_plugin_dir, Harness, PLUGIN_NAME};
use tempfile::TempDir;

async fn start_err(config: BrokerConfig) -> BrokerError {
    PluginBroker::start(config)
        .await
        .expect_err("broker should refuse to start")
}

/// A private plugin dir holding a binary with `mode`. Never executed.
fn private_config(harness: &Harness, mode: u32) -> (TempDir, BrokerConfig) {
    let dir = TempDir::new().unwrap();
    install_plugin(dir.path(), mode);
    let config = BrokerConfig {
        plugin_dir: dir.path().to_path_buf(),
        ..harness.config(harness.plugin())
    };
    (dir, config)
}

fn current_user() -> String {
    User::from_uid(getuid()).unwrap().unwrap().name
}

#[tokio::test]
async fn test_world_writable_binary() {
    let harness = Harness::new();
    let (dir, config) = private_config(&harness, 0o722);

    let err = start_err(config).await;

    assert!(err.is_security_violation());
    let expected = format!("{} is world writable", dir.path().join("notification-file").display());
    assert_eq!(err.to_string(), expected);
}

#[tokio::test]
async fn test_group_writable_binary() {
    let harness = Harness::new();
    let (_dir, config) = private_config(&harness, 0o724);

    let err = start_err(config).await;

    assert!(matches!(err, BrokerError::GroupWritable { .. }));
    assert!(err.to_string().ends_with("notification-file is group writable"));
}

#[tokio::test]
async fn test_setgid_binary() {
    let harness = Harness::new();
    let (_dir, config) = private_config(&harness, 0o2755);

    let err = start_err(config).await;

    assert!(matches!(err, BrokerError::SetgidBinary { .. }));
}

#[tokio::test]
async fn test_missing_plugin_dir() {
    let harness = Harness::new();
    let config = BrokerConfig {
        plugin_dir: harness.path().join("does-not-exist"),
        ..harness.config(harness.plugin())
    };

    let err = start_err(config).await;

    assert!(matches!(err, BrokerError::PluginDir { .. }));
    assert!(err.to_string().contains("No such file or directory"));
}

#[tokio::test]
async fn test_missing_binary() {
    let harness = Harness::new();
    let plugin = PluginConfig::new("dummy_default", "dummy");
    let config = harness.config(plugin);

    let err = start_err(config).await;

    assert_eq!(err.to_string(), "binary for plugin dummy_default not found");
}

#[tokio::test]
async fn test_failed_validation_spawns_nothing() {
    let harness = Harness::new();
    let config = harness
        .config(harness.plugin())
        .with_plugin(PluginConfig::new("dummy_default", "dummy"))
        .with_profile(ProfileBinding::new(2, "dummy").with_notification("dummy_default"));

    let err = start_err(config).await;

    assert!(matches!(err, BrokerError::PluginNotFound { .. }));
    // The valid plugin was never started, so it never opened its output.
    assert!(!harness.output().exists());
}

#[tokio::test]
async fn test_only_user_set() {
    let harness = Harness::new();
    let config = harness.config(harness.plugin().with_user(current_user()));

    let err = start_err(config).await;

    assert_eq!(
        err.to_string(),
        format!("plugin {PLUGIN_NAME}: both plugin user and group must be set")
    );
}

#[tokio::test]
async fn test_only_group_set() {
    let harness = Harness::new();
    let config = harness.config(harness.plugin().with_group("nogroup"));

    let err = start_err(config).await;

    assert!(matches!(err, BrokerError::IncompletePrivilegeSpec { .. }));
}

#[tokio::test]
async fn test_root_is_refused() {
    let harness = Harness::new();
    let config = harness.config(harness.plugin().with_user("root").with_group("root"));

    let err = start_err(config).await;

    assert!(matches!(err, BrokerError::RefusedRootExecution { .. }));
    assert!(err.is_security_violation());
}

#[tokio::test]
async fn test_root_broker_without_identity_is_refused() {
    let harness = Harness::new();
    let config = BrokerConfig::new(shared_plugin_dir())
        .with_plugin(harness.plugin())
        .with_profile(ProfileBinding::new(1, "default").with_notification(PLUGIN_NAME));

    let result = PluginBroker::start(config).await;

    if geteuid().is_root() {
        let err = result.expect_err("root broker must not spawn plugins as itself");
        assert!(matches!(err, BrokerError::RefusedRootExecution { .. }));
        assert!(err.is_fatal_at_init());
        assert!(!harness.output().exists());
    } else {
        let broker = result.expect("unprivileged broker may share its identity");
        broker.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_unknown_user() {
    let harness = Harness::new();
    let config = harness.config(harness.plugin().with_user("toto1234").with_group("toto1234"));

    let err = start_err(config).await;

    assert_eq!(err.to_string(), "unknown user 'toto1234'");
}

#[tokio::test]
async fn test_unknown_group_for_known_user() {
    let harness = Harness::new();
    let config = harness.config(
        harness
            .plugin()
            .with_user(current_user())
            .with_group("toto1234"),
    );

    let err = start_err(config).await;

    assert_eq!(err.to_string(), "unknown group 'toto1234'");
}

#[tokio::test]
async fn test_broker_wide_identity_applies_to_plugins() {
    let harness = Harness::new();
    let config = harness
        .config(harness.plugin())
        .with_run_as(RunAs::new("toto1234", "toto1234"));

    let err = start_err(config).await;

    assert!(matches!(err, BrokerError::UnknownIdentity { .. }));
}
