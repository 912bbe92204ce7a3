use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const STORE_PATH_ENV: &str = "PACS_EDGE_DB";

const DEFAULT_ENDPOINT_TIMEOUT_S: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config validation failed: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub edge: EdgeConfig,
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub fault_injection: FaultConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    pub ae_title: String,
    pub port: u16,
    pub data_root: PathBuf,
    pub log_path: PathBuf,
    pub store_path: PathBuf,
    #[serde(default)]
    pub allowed_calling_aets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwarderMode {
    Dummy,
    Archive,
    Workers,
    Gateway,
    Parallel,
}

impl ForwarderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwarderMode::Dummy => "dummy",
            ForwarderMode::Archive => "archive",
            ForwarderMode::Workers => "workers",
            ForwarderMode::Gateway => "gateway",
            ForwarderMode::Parallel => "parallel",
        }
    }

    pub fn requires_workers(&self) -> bool {
        matches!(
            self,
            ForwarderMode::Workers | ForwarderMode::Gateway | ForwarderMode::Parallel
        )
    }

    pub fn requires_archive(&self) -> bool {
        matches!(
            self,
            ForwarderMode::Archive | ForwarderMode::Gateway | ForwarderMode::Parallel
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    pub mode: ForwarderMode,
    pub max_retries: u32,
    pub backoff_base_seconds: u64,
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub archive: Option<Endpoint>,
    #[serde(default)]
    pub workers: Vec<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ae_title: String,
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_s: u64,
}

fn default_endpoint_timeout() -> u64 {
    DEFAULT_ENDPOINT_TIMEOUT_S
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FaultConfig {
    #[serde(default)]
    pub reject_all: bool,
    #[serde(default)]
    pub disk_full: bool,
    #[serde(default)]
    pub io_delay_ms: u64,
    #[serde(default)]
    pub random_fail_rate: f64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            reject_all: false,
            disk_full: false,
            io_delay_ms: 0,
            random_fail_rate: 0.0,
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.edge.ae_title.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "`edge.ae_title` must be non-empty".to_string(),
            ));
        }
        if self.forwarder.max_retries < 1 {
            return Err(ConfigError::Invalid(
                "`forwarder.max_retries` must be >= 1".to_string(),
            ));
        }
        if self.forwarder.mode.requires_workers() && self.forwarder.workers.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "mode `{}` enabled but no worker targets configured",
                self.forwarder.mode.as_str()
            )));
        }
        if self.forwarder.mode.requires_archive() && self.forwarder.archive.is_none() {
            return Err(ConfigError::Invalid(format!(
                "mode `{}` enabled but no archive endpoint configured",
                self.forwarder.mode.as_str()
            )));
        }
        if !(0.0..=1.0).contains(&self.fault_injection.random_fail_rate) {
            return Err(ConfigError::Invalid(
                "`fault_injection.random_fail_rate` must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective durable-store location; the environment override wins.
    pub fn store_path(&self) -> PathBuf {
        match std::env::var(STORE_PATH_ENV) {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => self.edge.store_path.clone(),
        }
    }
}

impl FaultConfig {
    /// Lenient read of the `fault_injection` section. Operators edit this
    /// section while the gateway is running; an unreadable or absent section
    /// degrades to all faults off rather than blocking traffic.
    pub fn load_lenient(path: &Path) -> FaultConfig {
        let Ok(raw) = fs::read_to_string(path) else {
            return FaultConfig::default();
        };
        let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(&raw) else {
            return FaultConfig::default();
        };
        let Some(section) = doc.get("fault_injection") else {
            return FaultConfig::default();
        };
        let mut faults: FaultConfig =
            serde_yaml::from_value(section.clone()).unwrap_or_default();
        faults.random_fail_rate = faults.random_fail_rate.clamp(0.0, 1.0);
        faults
    }
}

/// Merge `updates` into the `fault_injection` mapping of the YAML file,
/// leaving every other section untouched.
pub fn update_fault_section(
    path: &Path,
    updates: &[(&str, serde_yaml::Value)],
) -> Result<(), ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut doc: serde_yaml::Value =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| ConfigError::Invalid("config root must be a mapping".to_string()))?;
    let key = serde_yaml::Value::from("fault_injection");
    if !root.contains_key(&key) {
        root.insert(
            key.clone(),
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        );
    }
    let section = root
        .get_mut(&key)
        .and_then(|v| v.as_mapping_mut())
        .ok_or_else(|| {
            ConfigError::Invalid("`fault_injection` must be a mapping".to_string())
        })?;
    for (name, value) in updates {
        section.insert(serde_yaml::Value::from(*name), value.clone());
    }

    let encoded = serde_yaml::to_string(&doc).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    write_atomic(path, encoded.as_bytes()).map_err(|source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("config"),
        std::process::id(),
    );
    let tmp_path = parent.join(tmp_name);
    {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}
