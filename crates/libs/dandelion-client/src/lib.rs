//! REST client for the dandelion control plane, used by the fleet agent.
//!
//! Every JSON endpoint answers the `{code, info}` envelope; `code = 0` is
//! success and anything else carries a message in `info`.

use std::path::Path;

use dandelion_core::model::release::Release;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const USER_AGENT: &str = concat!("dandelion-cli/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid server url: {0}")]
    BadUrl(String),

    /// Non-zero `code` in a response envelope.
    #[error("server error {code}: {message}")]
    Api { code: i64, message: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// The identity an agent matches with, read from its metadata files.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub app_id: String,
    pub host: String,
    pub instance_id: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    info: serde_json::Value,
}

pub struct DandelionClient {
    base_url: String,
    http: reqwest::Client,
}

impl DandelionClient {
    pub fn new(url: &str) -> Result<Self> {
        let base_url = url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ClientError::BadUrl(base_url));
        }
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { base_url, http })
    }

    /// The websocket endpoint for the push channel.
    pub fn push_url(&self) -> String {
        let ws = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            let rest = self.base_url.trim_start_matches("http://");
            format!("ws://{rest}")
        };
        format!("{ws}/connect/push")
    }

    async fn get_info(&self, uri: &str, query: &[(&str, &str)]) -> Result<serde_json::Value> {
        debug!(uri = %uri, "GET");
        let resp = self
            .http
            .get(format!("{}{uri}", self.base_url))
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await?;
        let envelope: ApiResponse = resp.json().await?;
        if envelope.code != 0 {
            return Err(ClientError::Api {
                code: envelope.code,
                message: envelope
                    .info
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| envelope.info.to_string()),
            });
        }
        Ok(envelope.info)
    }

    /// Resolve the best matching release for this instance.
    pub async fn match_release(&self, config: &ClientConfig) -> Result<Release> {
        #[derive(Deserialize)]
        struct Info {
            config: Release,
        }

        let uri = format!("/api/v1/match/{}", config.app_id);
        let info = self
            .get_info(
                &uri,
                &[
                    ("version", config.version.as_str()),
                    ("host", config.host.as_str()),
                    ("instance_id", config.instance_id.as_str()),
                ],
            )
            .await?;
        let info: Info = serde_json::from_value(info)?;
        Ok(info.config)
    }

    /// List the files of a commit tree (non-dot only).
    pub async fn list_files(&self, app_id: &str, commit_id: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Info {
            #[serde(default)]
            files: Vec<String>,
        }

        let uri = format!("/api/v1/list/{app_id}/tree/{commit_id}");
        let info = self.get_info(&uri, &[]).await?;
        let info: Info = serde_json::from_value(info)?;
        Ok(info.files)
    }

    /// Download one file of a commit tree to a local path, creating parent
    /// directories as needed.
    pub async fn download(
        &self,
        app_id: &str,
        commit_id: &str,
        remote_path: &str,
        file_path: &Path,
    ) -> Result<()> {
        let uri = format!("/api/v1/list/{app_id}/tree/{commit_id}/{remote_path}");
        debug!(uri = %uri, "GET");
        let resp = self
            .http
            .get(format!("{}{uri}", self.base_url))
            .send()
            .await?;

        if !resp.status().is_success() {
            let code = resp.status().as_u16() as i64;
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiResponse>(&body)
                .map(|e| e.info.as_str().map(str::to_string).unwrap_or(body.clone()))
                .unwrap_or(body);
            return Err(ClientError::Api { code, message });
        }

        let body = resp.bytes().await?;
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(file_path, &body).await?;
        Ok(())
    }

    /// Download the zip archive of a commit to a local path.
    pub async fn download_archive(
        &self,
        app_id: &str,
        commit_id: &str,
        dest: &Path,
    ) -> Result<()> {
        let uri = format!("/api/v1/archive/{app_id}/{commit_id}.zip");
        debug!(uri = %uri, "GET");
        let resp = self
            .http
            .get(format!("{}{uri}", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::Api {
                code: resp.status().as_u16() as i64,
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let body = resp.bytes().await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &body).await?;
        Ok(())
    }
}
