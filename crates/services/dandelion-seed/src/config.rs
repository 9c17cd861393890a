use std::path::Path;

use config::{Config, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct SeedConfig {
    pub dandelion: DandelionSection,
    #[serde(default)]
    pub api: ApiSection,
    /// Ordered list of managed app sections; reconciled in order.
    #[serde(default)]
    pub configs: Vec<AppSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DandelionSection {
    /// Base URL of the control plane, e.g. `http://127.0.0.1:9012`.
    pub url: String,
}

/// The agent's own HTTP endpoint (health + manual check trigger).
#[derive(Debug, Deserialize, Clone)]
pub struct ApiSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_address")]
    pub address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    9013
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_api_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub app_id: String,
    /// Directory the app's files live under.
    pub path: String,
    /// `user` or `user:group` applied to synced files.
    #[serde(default)]
    pub chown: String,
    /// Octal mode string, e.g. `0644`.
    #[serde(default)]
    pub chmod: String,
    /// Files under `path` parsed for version/host/instance_id metadata.
    #[serde(default)]
    pub meta_files: Vec<String>,
    /// Command run after a successful resync.
    #[serde(default)]
    pub exec_reload: String,
}

impl SeedConfig {
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_seed_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            concat!(
                "dandelion:\n",
                "  url: http://127.0.0.1:9012\n",
                "configs:\n",
                "  - app_id: app1\n",
                "    path: /etc/app1\n",
                "    chown: root\n",
                "    chmod: \"0644\"\n",
                "    meta_files: [app.conf]\n",
                "    exec_reload: systemctl reload app1\n",
            )
        )
        .unwrap();

        let conf = SeedConfig::load(&path).unwrap();
        assert_eq!(conf.dandelion.url, "http://127.0.0.1:9012");
        assert_eq!(conf.configs.len(), 1);
        assert_eq!(conf.configs[0].app_id, "app1");
        assert_eq!(conf.configs[0].chmod, "0644");
        assert!(!conf.api.enabled);
    }
}
