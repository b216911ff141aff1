#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Four-file credential rotation against a real directory.

use std::path::Path;

use sdp_ctrl_client::rotation::{self, RotationStep, RotationTargets};
use sdp_ctrl_client::testing::{MockHandle, MockTransport, write_fixture};
use sdp_ctrl_client::transport::Transport;
use sdp_ctrl_client::{CredentialBundle, SpaKeys};
use sdp_ctrl_core::{ClientConfig, ConfigPaths};

fn targets_in(dir: &Path) -> RotationTargets {
    let path = write_fixture(dir, "", "").unwrap();
    let config =
        ClientConfig::from_toml(&std::fs::read_to_string(&path).unwrap(), &ConfigPaths::new(&path, None))
            .unwrap();
    RotationTargets::from_config(&config)
}

fn snapshot(targets: &RotationTargets) -> Vec<Option<String>> {
    [
        &targets.cert_file,
        &targets.key_file,
        &targets.client_config,
        &targets.helper_config,
    ]
    .iter()
    .map(|p| std::fs::read_to_string(p).ok())
    .collect()
}

fn bundle() -> CredentialBundle {
    CredentialBundle::new("NEW CERT\n", "NEW KEY\n", SpaKeys::new("NEWENC", "NEWHMAC"))
}

fn transport() -> MockTransport {
    MockTransport::new(MockHandle::new(), SpaKeys::new("OLDENC", "OLDHMAC"))
}

#[test]
fn successful_rotation_updates_every_file_and_the_transport() {
    let dir = tempfile::tempdir().unwrap();
    let targets = targets_in(dir.path());
    let mut transport = transport();

    rotation::install(bundle(), &targets, &mut transport).unwrap();

    assert_eq!(std::fs::read_to_string(&targets.cert_file).unwrap(), "NEW CERT\n");
    assert_eq!(std::fs::read_to_string(&targets.key_file).unwrap(), "NEW KEY\n");
    let client = std::fs::read_to_string(&targets.client_config).unwrap();
    assert!(client.contains("encryption_key = \"NEWENC\""));
    assert!(client.contains("hmac_key = \"NEWHMAC\""));
    assert!(client.contains("address = \"ctrl.example.com\""));
    let rc = std::fs::read_to_string(&targets.helper_config).unwrap();
    assert!(rc.contains("KEY_BASE64 NEWENC\n"));
    assert!(rc.contains("HMAC_KEY_BASE64 NEWHMAC\n"));
    assert!(rc.contains("SPA_SERVER ctrl.example.com\n"));
    assert_eq!(transport.spa_keys(), &SpaKeys::new("NEWENC", "NEWHMAC"));

    // The rewritten client config must still load.
    let reloaded = ClientConfig::from_toml(
        &client,
        &ConfigPaths::new(&targets.client_config, None),
    )
    .unwrap();
    assert_eq!(reloaded.spa.encryption_key, "NEWENC");
}

#[test]
fn key_write_failure_restores_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let mut targets = targets_in(dir.path());
    targets.key_file = dir.path().join("missing").join("client.key");
    let before = snapshot(&targets);
    let mut transport = transport();

    let err = rotation::install(bundle(), &targets, &mut transport).unwrap_err();

    assert_eq!(err.step, RotationStep::TlsKey);
    assert_eq!(err.path, targets.key_file);
    assert_eq!(snapshot(&targets), before);
    assert_eq!(transport.spa_keys(), &SpaKeys::new("OLDENC", "OLDHMAC"));
}

#[test]
fn helper_config_failure_rolls_back_three_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut targets = targets_in(dir.path());
    targets.helper_stanza = "sdp".to_string();
    let before = snapshot(&targets);
    let mut transport = transport();

    let err = rotation::install(bundle(), &targets, &mut transport).unwrap_err();

    assert_eq!(err.step, RotationStep::HelperConfigKeys);
    assert!(err.to_string().contains("fwknoprc"));
    assert_eq!(snapshot(&targets), before);
    assert_eq!(transport.spa_keys(), &SpaKeys::new("OLDENC", "OLDHMAC"));
}

#[test]
fn missing_certificate_is_created_and_removed_on_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let targets = targets_in(dir.path());
    std::fs::remove_file(&targets.cert_file).unwrap();
    std::fs::remove_file(&targets.helper_config).unwrap();
    let mut transport = transport();

    let err = rotation::install(bundle(), &targets, &mut transport).unwrap_err();

    assert_eq!(err.step, RotationStep::HelperConfigKeys);
    assert!(!targets.cert_file.exists());
    assert!(!targets.helper_config.exists());
    assert_eq!(
        std::fs::read_to_string(&targets.key_file).unwrap(),
        "OLD KEY\n"
    );
}

#[test]
fn symlinked_certificate_is_written_through() {
    let dir = tempfile::tempdir().unwrap();
    let targets = targets_in(dir.path());
    let real = dir.path().join("real.crt");
    std::fs::rename(&targets.cert_file, &real).unwrap();
    std::os::unix::fs::symlink(&real, &targets.cert_file).unwrap();
    let mut transport = transport();

    rotation::install(bundle(), &targets, &mut transport).unwrap();

    let meta = std::fs::symlink_metadata(&targets.cert_file).unwrap();
    assert!(meta.file_type().is_symlink(), "link is preserved");
    assert_eq!(std::fs::read_to_string(&real).unwrap(), "NEW CERT\n");
}

#[test]
fn rollback_restores_symlinked_certificate_target() {
    let dir = tempfile::tempdir().unwrap();
    let mut targets = targets_in(dir.path());
    let real = dir.path().join("real.crt");
    std::fs::rename(&targets.cert_file, &real).unwrap();
    std::os::unix::fs::symlink(&real, &targets.cert_file).unwrap();
    targets.key_file = dir.path().join("missing").join("client.key");
    let mut transport = transport();

    rotation::install(bundle(), &targets, &mut transport).unwrap_err();

    assert!(
        std::fs::symlink_metadata(&targets.cert_file)
            .unwrap()
            .file_type()
            .is_symlink()
    );
    assert_eq!(std::fs::read_to_string(&real).unwrap(), "OLD CERT\n");
}
