//! TOML-backed configuration.
//!
//! Loaded once at boot from `Embers.toml` or `embers.toml` in the working
//! directory (first one found wins; neither present falls back to
//! defaults), then handed to every module and plugin's context so they can
//! pull their own scoped table out by name.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    /// Allow multiple acceptors to share this port (`SO_REUSEPORT`).
    #[serde(default)]
    pub shared: bool,
    /// Apply `content-encoding` where negotiable. Not implemented by the
    /// core writer yet; carried as a recognized option for embedders that
    /// wrap the response pipeline with their own compressor.
    #[serde(default)]
    pub enable_compression: bool,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    num_cpus::get()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            workers: default_workers(),
            max_body_bytes: None,
            idle_timeout_secs: None,
            shared: false,
            enable_compression: false,
        }
    }
}

/// Top-level document shape of `Embers.toml`. `modules` and `plugins` are
/// free-form tables keyed by module/plugin name; each entry is deserialized
/// on demand into whatever shape the caller asks for.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub modules: HashMap<String, toml::Value>,
    #[serde(default)]
    pub plugins: HashMap<String, toml::Value>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|err| Error::MalformedBody(err.to_string()))
    }

    /// Tries `Embers.toml` then `embers.toml` in the current directory;
    /// falls back to an all-defaults `Config` if neither exists or either
    /// fails to parse.
    pub fn load_default() -> Self {
        for path in &["Embers.toml", "embers.toml"] {
            if Path::new(path).exists() {
                match Self::from_file(path) {
                    Ok(config) => {
                        println!("[CONFIG] loaded configuration from {}", path);
                        return config;
                    }
                    Err(err) => {
                        eprintln!("[CONFIG] error loading {}: {}", path, err);
                    }
                }
            }
        }

        println!("[CONFIG] using default configuration");
        Self::default()
    }

    /// Deserialize a named module's table into `T`. `None` if the module
    /// has no entry in `[modules.<name>]` or it doesn't deserialize as `T`.
    pub fn module_config<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        self.modules.get(name).and_then(|value| T::deserialize(value.clone()).ok())
    }

    /// Same as [`Config::module_config`] but over `[plugins.<name>]`.
    pub fn plugin_config<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        self.plugins.get(name).and_then(|value| T::deserialize(value.clone()).ok())
    }

    pub fn plugin_config_raw(&self, name: &str) -> Option<&toml::Value> {
        self.plugins.get(name)
    }

    pub fn module_config_raw(&self, name: &str) -> Option<&toml::Value> {
        self.modules.get(name)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.address, self.server.port)
    }
}

static CONFIG: std::sync::OnceLock<RwLock<Config>> = std::sync::OnceLock::new();

pub fn config() -> &'static RwLock<Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::load_default()))
}

/// Replace the global configuration with the contents of `path`, overriding
/// whatever `load_default` picked up.
pub async fn init_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let cfg = Config::from_file(path)?;
    *config().write().await = cfg;
    Ok(())
}

pub async fn get_config() -> Config {
    config().read().await.clone()
}
