use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::TimeDelta;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::backend::Registry;
use crate::domain::RepositoryName;
use crate::error::DtsError;
use crate::sim::{self, SimEndpointConfig, SimRepositoryConfig};
use crate::snapshot::SnapshotStore;

pub const DEFAULT_INSTANCE: &str = "dts";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RETENTION_HOURS: i64 = 24 * 7;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Everything an engine instance needs; constructed directly in tests.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub instance_name: RepositoryName,
    pub data_dir: Utf8PathBuf,
    pub manifest_dir: Utf8PathBuf,
    pub poll_interval: Duration,
    pub retention: TimeDelta,
    pub queue_capacity: usize,
    /// Local endpoint that serves the manifest directory, for `push_manifest`.
    pub manifest_endpoint: Option<String>,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<Utf8PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            instance_name: RepositoryName::default(),
            manifest_dir: data_dir.join("manifests"),
            data_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retention: TimeDelta::hours(DEFAULT_RETENTION_HOURS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            manifest_endpoint: None,
        }
    }

    pub fn with_instance_name(mut self, name: RepositoryName) -> Self {
        self.instance_name = name;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_manifest_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.manifest_endpoint = Some(endpoint.into());
        self
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.data_dir, &self.instance_name)
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub repositories: Vec<SimRepositoryConfig>,
    #[serde(default)]
    pub endpoints: Vec<SimEndpointConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: Option<String>,
    pub data_dir: Option<Utf8PathBuf>,
    pub manifest_dir: Option<Utf8PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub retention_hours: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub manifest_endpoint: Option<String>,
}

/// Backends the CLI builds its registry from.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    pub repositories: Vec<SimRepositoryConfig>,
    pub endpoints: Vec<SimEndpointConfig>,
}

impl SimulationConfig {
    pub fn build_registry(&self) -> Result<Registry, DtsError> {
        sim::build_registry(&self.repositories, &self.endpoints)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub engine: EngineConfig,
    pub simulation: SimulationConfig,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DtsError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("dts.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(DtsError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| DtsError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| DtsError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, DtsError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let service = config.service;

        let data_dir = match service.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        let mut engine = EngineConfig::new(data_dir);
        if let Some(name) = service.name {
            engine.instance_name = name.parse()?;
        }
        if let Some(dir) = service.manifest_dir {
            engine.manifest_dir = dir;
        }
        if let Some(ms) = service.poll_interval_ms {
            if ms == 0 {
                return Err(DtsError::ConfigParse(
                    "poll_interval_ms must be positive".to_string(),
                ));
            }
            engine.poll_interval = Duration::from_millis(ms);
        }
        if let Some(hours) = service.retention_hours {
            engine.retention = i64::try_from(hours)
                .ok()
                .and_then(TimeDelta::try_hours)
                .ok_or_else(|| {
                    DtsError::ConfigParse(format!("retention_hours {hours} is out of range"))
                })?;
        }
        if let Some(capacity) = service.queue_capacity {
            engine.queue_capacity = capacity.max(1);
        }
        engine.manifest_endpoint = service.manifest_endpoint;

        let endpoint_names: BTreeSet<&str> =
            config.endpoints.iter().map(|ep| ep.name.as_str()).collect();
        if endpoint_names.len() != config.endpoints.len() {
            return Err(DtsError::ConfigParse("duplicate endpoint name".to_string()));
        }
        for repository in &config.repositories {
            repository.name.parse::<RepositoryName>()?;
            let referenced = std::iter::once(&repository.endpoint).chain(repository.tiers.values());
            for endpoint in referenced {
                if !endpoint_names.contains(endpoint.as_str()) {
                    return Err(DtsError::ConfigParse(format!(
                        "repository {} uses undefined endpoint {endpoint}",
                        repository.name
                    )));
                }
            }
        }
        if let Some(endpoint) = &engine.manifest_endpoint {
            if !endpoint_names.contains(endpoint.as_str()) {
                return Err(DtsError::ConfigParse(format!(
                    "manifest endpoint {endpoint} is not defined"
                )));
            }
        }

        Ok(ResolvedConfig {
            schema_version,
            engine,
            simulation: SimulationConfig {
                repositories: config.repositories,
                endpoints: config.endpoints,
            },
        })
    }
}

pub fn default_data_dir() -> Result<Utf8PathBuf, DtsError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("dts")).ok())
        .ok_or_else(|| DtsError::Filesystem("unable to resolve data directory".to_string()))
}
