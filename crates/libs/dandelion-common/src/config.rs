use std::env;
use std::path::Path;

use config::{Config, File};
use serde::Deserialize;

/// Server configuration, one section per subsystem.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoreConfig {
    pub address: String,
    pub port: u16,
    /// Base URL advertised to UI clients, empty for relative paths.
    #[serde(default)]
    pub public_url: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9012,
            public_url: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RepositoryConfig {
    /// Local clone directory. Created (and fetched) on first start.
    pub path: String,
    pub remote_url: String,
    /// Optional HTTP(S) proxy used for fetches.
    #[serde(default)]
    pub proxy: String,
    /// Basic/token auth for HTTP remotes. SSH remotes use `ssh_key_path`.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Defaults to `$HOME/.ssh/id_rsa` when empty.
    #[serde(default)]
    pub ssh_key_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/dandelion.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Root directory for `<app_id>/<commit_id>.zip` artifacts.
    pub path: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: "data/archive".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BusConfig {
    #[serde(default)]
    pub enabled: bool,
    /// redis:// connection URL.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_bus_topic")]
    pub topic: String,
}

fn default_bus_topic() -> String {
    "dandelion-events".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Use the in-cluster service account instead of a kubeconfig file.
    #[serde(default)]
    pub in_cluster: bool,
    #[serde(default)]
    pub config: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistryConfig {
    /// One of `registry`, `harbor`, `rider`, `nyx`.
    #[serde(default = "default_registry_kind")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_registry_kind() -> String {
    "registry".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    /// Deployment events are mirrored here as JSON POSTs. Empty disables.
    #[serde(default)]
    pub url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            repository: RepositoryConfig::default(),
            database: DatabaseConfig::default(),
            archive: ArchiveConfig::default(),
            bus: BusConfig::default(),
            kubernetes: KubernetesConfig::default(),
            registry: RegistryConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an explicit file, with `PORT`/`HOST` env
    /// overrides on top.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder().add_source(File::from(path));

        if let Ok(port) = env::var("PORT") {
            if let Ok(p) = port.parse::<i64>() {
                builder = builder.set_override("core.port", p)?;
            }
        }
        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("core.address", host)?;
        }

        builder.build()?.try_deserialize()
    }
}
