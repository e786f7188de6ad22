use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";
// The sandbox defaults mirror `SandboxSettings::default()` in the sandbox capsule, which this
// crate does not depend on. `default_config_matches_controller_defaults` in the runtime pins them.
pub const DEFAULT_IMAGE: &str = "python:3.11-slim";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RUNTIME: &str = "docker";
pub const DEFAULT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_PIDS_LIMIT: u32 = 64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            cors_origins: vec![DEFAULT_CORS_ORIGIN.to_string()],
        }
    }
}

/// Sandbox knobs. Network isolation is always on and deliberately not configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub image: String,
    pub timeout_secs: u64,
    pub runtime: String,
    pub memory_bytes: u64,
    pub pids_limit: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            runtime: DEFAULT_RUNTIME.to_string(),
            memory_bytes: DEFAULT_MEMORY_BYTES,
            pids_limit: DEFAULT_PIDS_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub server: ServerSettings,
    pub sandbox: SandboxConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;

        if self.sandbox.image.trim().is_empty() {
            return Err(invalid("sandbox.image", "must not be empty"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(invalid("sandbox.timeoutSecs", "must be a positive number of seconds"));
        }
        if self.sandbox.runtime.trim().is_empty() {
            return Err(invalid("sandbox.runtime", "must name a container runtime binary"));
        }
        // Docker refuses memory limits below 6 MiB.
        if self.sandbox.memory_bytes < 6 * 1024 * 1024 {
            return Err(invalid("sandbox.memoryBytes", "must be at least 6 MiB"));
        }
        if self.sandbox.pids_limit == 0 {
            return Err(invalid("sandbox.pidsLimit", "must be positive"));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid("server.bindAddr", &e.to_string()))
    }
}

/// Resolves [`RuntimeConfig`]: defaults, then an optional JSON file, then environment overrides.
pub struct ConfigManager {
    config_path: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl ConfigManager {
    /// Reads overrides from the process environment; the file comes from `CONFIG_PATH` if set.
    pub fn new() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        let config_path = env.get("CONFIG_PATH").map(PathBuf::from);
        Self { config_path, env }
    }

    pub fn with_env(config_path: Option<PathBuf>, env: HashMap<String, String>) -> Self {
        Self { config_path, env }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    #[instrument(skip(self))]
    pub fn load(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut config = match &self.config_path {
            Some(path) => load_config_file(path)?,
            None => RuntimeConfig::default(),
        };

        self.apply_env(&mut config)?;
        config.validate()?;

        debug!(?config, "resolved runtime config");
        Ok(config)
    }

    fn apply_env(&self, config: &mut RuntimeConfig) -> Result<(), ConfigError> {
        if let Some(addr) = self.var("BIND_ADDR") {
            config.server.bind_addr = addr;
        }
        if let Some(port) = self.var("PORT") {
            let port: u16 = parse("PORT", &port)?;
            let mut addr = config.socket_addr()?;
            addr.set_port(port);
            config.server.bind_addr = addr.to_string();
        }
        if let Some(origins) = self.var("CORS_ORIGINS") {
            config.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(image) = self.var("PY_IMAGE") {
            config.sandbox.image = image;
        }
        if let Some(timeout) = self.var("RUN_TIMEOUT_SEC") {
            config.sandbox.timeout_secs = parse("RUN_TIMEOUT_SEC", &timeout)?;
        }
        if let Some(runtime) = self.var("SANDBOX_RUNTIME") {
            config.sandbox.runtime = runtime;
        }
        if let Some(memory) = self.var("SANDBOX_MEMORY_BYTES") {
            config.sandbox.memory_bytes = parse("SANDBOX_MEMORY_BYTES", &memory)?;
        }
        if let Some(pids) = self.var("SANDBOX_PIDS_LIMIT") {
            config.sandbox.pids_limit = parse("SANDBOX_PIDS_LIMIT", &pids)?;
        }
        Ok(())
    }

    fn var(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn load_config_file(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    debug!("Loading config from: {:?}", path);

    if !path.exists() {
        return Err(ConfigError::ConfigFileNotFound {
            path: path.to_string_lossy().to_string(),
        });
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read config file: {}", e),
    })?;

    serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
        message: e.to_string(),
    })
}

fn parse<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| invalid(field, &e.to_string()))
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}
