//! Integration tests for the dnslice CLI.

use std::path::{Path, PathBuf};

use dnslice_lib::{ClientErrorKind, Descriptor};

use crate::{
    commands::{load_descriptors, select_descriptor, CommandContext},
    config::Config,
};

const CONFIG: &str = r#"
[dns]
domains = ["example.com", "example.net"]
psk = "s3cr3t"
listen_addr = "127.0.0.1:5353"
ttl = 60

[publish]
files = ["a.txt"]

[client]
max_rounds = 8
"#;

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, content).expect("Config should be written");
    path
}

fn publish_fixture(dir: &Path) -> (Config, Vec<Descriptor>) {
    let config = Config::load(&write_config(dir, CONFIG)).expect("Config should load");
    let first = dir.join("first.txt");
    let second = dir.join("second.txt");
    std::fs::write(&first, b"hello world".repeat(500)).expect("File should be written");
    std::fs::write(&second, b"another file").expect("File should be written");

    let ctx = CommandContext::new(&config).expect("Context should build");
    let state = ctx.build_state(&[first, second]).expect("State should build");
    let descriptors = state
        .items()
        .iter()
        .map(|item| Descriptor::new(item, state.config()))
        .collect();
    (config, descriptors)
}

#[test]
fn test_config_loading() {
    let dir = tempfile::tempdir().expect("Temp dir should be created");
    let config = Config::load(&write_config(dir.path(), CONFIG)).expect("Config should load");

    assert_eq!(config.dns.domains, ["example.com", "example.net"]);
    assert_eq!(config.dns.ttl, 60);
    assert_eq!(config.dns.response_label, "r-x");
    assert_eq!(config.publish.files, [PathBuf::from("a.txt")]);
    assert_eq!(config.client.max_rounds, 8);
    assert_eq!(config.client.request_timeout_ms, 5_000);
    assert!(!format!("{config:?}").contains("s3cr3t"));
}

#[test]
fn test_config_errors() {
    let dir = tempfile::tempdir().expect("Temp dir should be created");
    let missing = Config::load(&dir.path().join("missing.toml")).expect_err("Missing file should fail");
    assert_eq!(missing.reason.as_str(), "unreadable_file");

    let broken = Config::load(&write_config(dir.path(), "[dns\n")).expect_err("Bad TOML should fail");
    assert_eq!(broken.reason.as_str(), "invalid_config");

    let config = Config::load(&write_config(dir.path(), "[dns]\npsk = \"x\"\n")).expect("Config should load");
    assert!(CommandContext::new(&config).is_err(), "No domains should fail");
}

#[test]
fn test_files_override() {
    let dir = tempfile::tempdir().expect("Temp dir should be created");
    let config = Config::load(&write_config(dir.path(), CONFIG)).expect("Config should load");
    let ctx = CommandContext::new(&config).expect("Context should build");

    assert_eq!(ctx.files(&[]), [PathBuf::from("a.txt")]);
    let overrides = [PathBuf::from("b.txt")];
    assert_eq!(ctx.files(&overrides), overrides);
    assert!(ctx.build_state(&[]).is_err());
    assert!(ctx.build_state(&[dir.path().join("nope.txt")]).is_err());
}

#[test]
fn test_descriptor_files() {
    let dir = tempfile::tempdir().expect("Temp dir should be created");
    let (_config, descriptors) = publish_fixture(dir.path());
    assert_eq!(descriptors.len(), 2);

    let json_path = dir.path().join("descriptors.json");
    std::fs::write(
        &json_path,
        serde_json::to_string_pretty(&descriptors).expect("Should serialize"),
    )
    .expect("Descriptors should be written");
    assert_eq!(load_descriptors(&json_path).expect("JSON should load"), descriptors);

    let records_path = dir.path().join("descriptors.txt");
    let records: String = descriptors.iter().map(|d| format!("{d}\n")).collect();
    std::fs::write(&records_path, records).expect("Records should be written");
    assert_eq!(load_descriptors(&records_path).expect("Records should load"), descriptors);
}

#[test]
fn test_descriptor_selection() {
    let dir = tempfile::tempdir().expect("Temp dir should be created");
    let (_config, descriptors) = publish_fixture(dir.path());

    let err = select_descriptor(descriptors.clone(), None).expect_err("Two files are ambiguous");
    assert_eq!(err.kind, ClientErrorKind::Usage);
    assert_eq!(err.reason, "ambiguous_descriptor");

    let wanted = descriptors[1].file_id.clone();
    let picked = select_descriptor(descriptors.clone(), Some(&wanted)).expect("Should select");
    assert_eq!(picked, descriptors[1]);

    let err = select_descriptor(descriptors, Some("0000000000000000")).expect_err("Unknown id");
    assert_eq!(err.reason, "descriptor_not_found");
}
