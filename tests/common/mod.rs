#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use dts::backend::Registry;
use dts::config::EngineConfig;
use dts::domain::{Instruction, Instructions, Specification, User};
use dts::sim::{self, SimEndpointConfig, SimRepositoryConfig};

pub const USER: &str = "0000-0002-1825-0097";
pub const LOCAL_USER: &str = "alice";

/// Scratch layout with a source repository (disk and tape tiers), a
/// destination repository and a manifest endpoint, all backed by temp dirs.
pub struct Fixture {
    _temp: TempDir,
    pub root: Utf8PathBuf,
    pub config: EngineConfig,
    pub repositories: Vec<SimRepositoryConfig>,
    pub endpoints: Vec<SimEndpointConfig>,
}

impl Fixture {
    pub fn new(staging_delay_ms: u64, transfer_delay_ms: u64) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source_root = root.join("source");
        fs::create_dir_all(source_root.join("tape")).unwrap();
        for id in ["1", "2", "3"] {
            fs::write(source_root.join(id), format!("file {id}")).unwrap();
        }
        fs::write(source_root.join("tape/4"), b"archived on tape").unwrap();
        fs::create_dir_all(root.join("destination")).unwrap();

        let config = EngineConfig::new(root.join("state"))
            .with_poll_interval(Duration::from_millis(10))
            .with_manifest_endpoint("manifests");

        let mut tiers = BTreeMap::new();
        tiers.insert("tape".to_string(), "source-tape".to_string());
        let mut users = BTreeMap::new();
        users.insert(USER.to_string(), LOCAL_USER.to_string());
        let repositories = vec![
            SimRepositoryConfig {
                name: "src".to_string(),
                root: source_root.clone(),
                endpoint: "source-disk".to_string(),
                tiers,
                staging_delay_ms,
                users: BTreeMap::new(),
            },
            SimRepositoryConfig {
                name: "dst".to_string(),
                root: root.join("destination"),
                endpoint: "destination-disk".to_string(),
                tiers: BTreeMap::new(),
                staging_delay_ms: 0,
                users,
            },
        ];
        let endpoints = vec![
            endpoint("source-disk", &source_root, transfer_delay_ms),
            endpoint("source-tape", &source_root, transfer_delay_ms),
            endpoint("destination-disk", &root.join("destination"), transfer_delay_ms),
            endpoint("manifests", &config.manifest_dir, 0),
        ];

        Self {
            _temp: temp,
            root,
            config,
            repositories,
            endpoints,
        }
    }

    /// A fresh registry; backends keep no state beyond what is saved.
    pub fn registry(&self) -> Registry {
        sim::build_registry(&self.repositories, &self.endpoints).unwrap()
    }

    pub fn source_root(&self) -> Utf8PathBuf {
        self.root.join("source")
    }

    pub fn destination_root(&self) -> Utf8PathBuf {
        self.root.join("destination")
    }

    pub fn write_zip(&self, id: &str, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(self.source_root().join(id)).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }
}

fn endpoint(name: &str, root: &Utf8Path, transfer_delay_ms: u64) -> SimEndpointConfig {
    SimEndpointConfig {
        name: name.to_string(),
        root: root.to_path_buf(),
        transfer_delay_ms,
    }
}

pub fn spec(file_ids: &[&str]) -> Specification {
    spec_with(file_ids, Vec::new())
}

pub fn spec_with(file_ids: &[&str], instructions: Vec<Instruction>) -> Specification {
    Specification {
        source: "src".to_string(),
        destination: "dst".to_string(),
        file_ids: file_ids.iter().map(|id| id.to_string()).collect(),
        description: "test transfer".to_string(),
        instructions: Instructions::new(instructions),
        user: User {
            id: USER.to_string(),
            name: Some("Alice".to_string()),
            email: None,
        },
    }
}
