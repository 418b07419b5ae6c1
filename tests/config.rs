use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::TimeDelta;
use serde_json::json;

use dts::config::{Config, ConfigLoader, DEFAULT_QUEUE_CAPACITY};
use dts::error::DtsError;

fn write_config(dir: &tempfile::TempDir, value: serde_json::Value) -> String {
    let path = dir.path().join("dts.json");
    fs::write(&path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn resolve_reads_service_and_simulation_sections() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let path = write_config(
        &dir,
        json!({
            "schema_version": 1,
            "service": {
                "name": "dts-west",
                "data_dir": data.to_string_lossy(),
                "poll_interval_ms": 250,
                "retention_hours": 48,
                "manifest_endpoint": "manifests"
            },
            "repositories": [
                {"name": "jdp", "root": "/srv/jdp", "endpoint": "jdp-disk",
                 "tiers": {"tape": "jdp-tape"}, "staging_delay_ms": 500},
                {"name": "kbase", "root": "/srv/kbase", "endpoint": "kbase-disk",
                 "users": {"0000-0002-1825-0097": "alice"}}
            ],
            "endpoints": [
                {"name": "jdp-disk", "root": "/srv/jdp"},
                {"name": "jdp-tape", "root": "/srv/jdp", "transfer_delay_ms": 1000},
                {"name": "kbase-disk", "root": "/srv/kbase"},
                {"name": "manifests", "root": "/srv/manifests"}
            ]
        }),
    );

    let resolved = ConfigLoader::resolve(Some(path.as_str())).unwrap();
    let engine = &resolved.engine;
    assert_eq!(engine.instance_name.as_str(), "dts-west");
    assert_eq!(engine.poll_interval, Duration::from_millis(250));
    assert_eq!(engine.retention, TimeDelta::hours(48));
    assert_eq!(engine.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    assert_eq!(engine.manifest_endpoint.as_deref(), Some("manifests"));
    assert!(engine.manifest_dir.ends_with("data/manifests"));
    assert!(
        engine
            .snapshot_store()
            .path()
            .as_str()
            .ends_with("dts-west.snapshot.json")
    );

    let registry = resolved.simulation.build_registry().unwrap();
    assert!(registry.repository("jdp").is_ok());
    assert!(registry.has_endpoint("jdp-tape"));
    assert_eq!(registry.default_endpoint("kbase").unwrap(), "kbase-disk");
}

#[test]
fn explicit_missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, DtsError::ConfigRead(_));
}

#[test]
fn malformed_json_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dts.json");
    fs::write(&path, "{\"service\": ").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, DtsError::ConfigParse(_));
}

#[test]
fn invalid_instance_name_is_rejected() {
    let config: Config = serde_json::from_value(json!({
        "service": {"name": "../etc", "data_dir": "/tmp/dts"}
    }))
    .unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, DtsError::InvalidRepositoryName(_));
}

#[test]
fn undefined_manifest_endpoint_is_rejected() {
    let config: Config = serde_json::from_value(json!({
        "service": {"data_dir": "/tmp/dts", "manifest_endpoint": "manifests"}
    }))
    .unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, DtsError::ConfigParse(_));
}

#[test]
fn zero_poll_interval_is_rejected() {
    let config: Config = serde_json::from_value(json!({
        "service": {"data_dir": "/tmp/dts", "poll_interval_ms": 0}
    }))
    .unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(DtsError::ConfigParse(_))
    );
}
