use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Deadline applied to every launcher and persistence call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(common::DEFAULT_SOCKET_PATH)
}

fn default_db_path() -> PathBuf {
    PathBuf::from(common::DEFAULT_DB_PATH)
}

fn default_request_timeout() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            db_path: default_db_path(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
    pub jobs_output: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            jobs_output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: u32,
    pub work_dir: Option<PathBuf>,
}

fn default_max_concurrent() -> u32 {
    10
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent(),
            work_dir: None,
        }
    }
}

/// A named pipeline jobs can reference instead of carrying a transform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineDef {
    pub name: String,
    pub transform: common::Transform,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineDef>,
}

/// A config file merged over the base one. Only the fields it sets apply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverlay {
    #[serde(default)]
    pub server: ServerOverlay,
    #[serde(default)]
    pub logging: LoggingOverlay,
    #[serde(default)]
    pub launcher: LauncherOverlay,
    #[serde(default)]
    pub pipelines: Vec<PipelineDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerOverlay {
    pub socket_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingOverlay {
    pub level: Option<String>,
    pub output: Option<PathBuf>,
    pub jobs_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LauncherOverlay {
    pub max_concurrent_jobs: Option<u32>,
    pub work_dir: Option<PathBuf>,
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
}

/// Detect file type by extension and load
fn read_any<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    match ext {
        "yaml" | "yml" => read_yaml(path),
        "toml" => read_toml(path),
        _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        read_yaml(path)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        read_any(path)
    }

    /// Apply the fields `overlay` sets; everything else keeps its value.
    pub fn merge(&mut self, overlay: ConfigOverlay) {
        let ConfigOverlay {
            server,
            logging,
            launcher,
            pipelines,
        } = overlay;

        if let Some(socket_path) = server.socket_path {
            self.server.socket_path = socket_path;
        }
        if let Some(db_path) = server.db_path {
            self.server.db_path = db_path;
        }
        if let Some(timeout) = server.request_timeout_ms {
            self.server.request_timeout_ms = timeout;
        }

        if let Some(level) = logging.level {
            self.logging.level = level;
        }
        if logging.output.is_some() {
            self.logging.output = logging.output;
        }
        if logging.jobs_output.is_some() {
            self.logging.jobs_output = logging.jobs_output;
        }

        if let Some(max) = launcher.max_concurrent_jobs {
            self.launcher.max_concurrent_jobs = max;
        }
        if launcher.work_dir.is_some() {
            self.launcher.work_dir = launcher.work_dir;
        }

        // Pipelines - later definitions replace earlier ones with the same name
        for pipeline in pipelines {
            self.pipelines.retain(|p| p.name != pipeline.name);
            self.pipelines.push(pipeline);
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.server.request_timeout_ms)
    }
}

impl ConfigOverlay {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_any(path)
    }
}
