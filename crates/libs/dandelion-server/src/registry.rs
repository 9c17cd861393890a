//! Container registry adapters.
//!
//! Four services answer "which tags exist for this image": a plain v2
//! registry, Harbor, Rider and Nyx. They differ in auth, URL shape and
//! response schema; all hide behind [`RegistryClient::list_tags`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use dandelion_common::config::RegistryConfig;

use crate::error::{Result, ServerError};

/// Nyx bearer tokens live this long before a proactive refresh.
const NYX_TOKEN_TTL: Duration = Duration::from_secs(8 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTagsResponse {
    pub name: String,
    pub tags: Vec<String>,
}

struct NyxToken {
    token: String,
    fetched: Instant,
}

pub struct RegistryClient {
    conf: RegistryConfig,
    http: reqwest::Client,
    nyx_token: Mutex<Option<NyxToken>>,
}

impl RegistryClient {
    pub fn new(conf: &RegistryConfig) -> Self {
        Self {
            conf: conf.clone(),
            http: reqwest::Client::new(),
            nyx_token: Mutex::new(None),
        }
    }

    /// Hostname of the registry endpoint, used to assemble image refs.
    pub fn host(&self) -> Result<String> {
        let url = reqwest::Url::parse(&self.conf.endpoint)
            .map_err(|e| ServerError::Internal(format!("registry endpoint error: {e}")))?;
        Ok(url.host_str().unwrap_or_default().to_string())
    }

    pub async fn list_tags(&self, catalog: &str) -> Result<ListTagsResponse> {
        let mut tags = match self.conf.kind.as_str() {
            "harbor" => self.harbor_list_tags(catalog).await?,
            "rider" => self.rider_list_tags(catalog).await?,
            "nyx" => self.nyx_list_tags(catalog).await?,
            _ => self.registry_list_tags(catalog).await?,
        };
        tags.tags.sort_by(|a, b| {
            // descending, numeric-aware on the dash suffix
            if less_dash_version(a, b) {
                std::cmp::Ordering::Greater
            } else if less_dash_version(b, a) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        });
        Ok(tags)
    }

    /// Plain v2 registry: `GET /v2/<catalog>/tags/list` with basic auth.
    async fn registry_list_tags(&self, catalog: &str) -> Result<ListTagsResponse> {
        let url = format!("{}/v2/{catalog}/tags/list", self.conf.endpoint);
        debug!(url = %url, "registry list tags");
        let mut req = self.http.get(&url);
        if !self.conf.username.is_empty() {
            req = req.basic_auth(&self.conf.username, Some(&self.conf.password));
        }
        let resp = registry_error(req.send().await)?;
        Ok(registry_error(resp.json::<ListTagsResponse>().await)?)
    }

    /// Harbor: tag objects under `/api/repositories/<catalog>/tags`.
    async fn harbor_list_tags(&self, catalog: &str) -> Result<ListTagsResponse> {
        #[derive(Deserialize)]
        struct HarborTag {
            name: String,
        }

        let url = format!("{}/api/repositories/{catalog}/tags", self.conf.endpoint);
        debug!(url = %url, "harbor list tags");
        let mut req = self.http.get(&url);
        if !self.conf.username.is_empty() {
            req = req.basic_auth(&self.conf.username, Some(&self.conf.password));
        }
        let resp = registry_error(req.send().await)?;
        let tags: Vec<HarborTag> = registry_error(resp.json().await)?;
        Ok(ListTagsResponse {
            name: catalog.to_string(),
            tags: tags.into_iter().map(|t| t.name).collect(),
        })
    }

    /// Rider: `GET /api/v1/repositories/<catalog>/tags` answering the
    /// `{name, tags}` shape inside a `data` wrapper.
    async fn rider_list_tags(&self, catalog: &str) -> Result<ListTagsResponse> {
        #[derive(Deserialize)]
        struct RiderResponse {
            data: ListTagsResponse,
        }

        let url = format!("{}/api/v1/repositories/{catalog}/tags", self.conf.endpoint);
        debug!(url = %url, "rider list tags");
        let resp = registry_error(self.http.get(&url).send().await)?;
        let body: RiderResponse = registry_error(resp.json().await)?;
        Ok(body.data)
    }

    /// Nyx: a v2-shaped API behind a bearer token. The token is cached for
    /// eight hours and refreshed once on an auth-failed response.
    async fn nyx_list_tags(&self, catalog: &str) -> Result<ListTagsResponse> {
        let token = self.nyx_auth(false).await?;
        let url = format!("{}/v2/{catalog}/tags/list", self.conf.endpoint);
        debug!(url = %url, "nyx list tags");
        let resp = registry_error(self.http.get(&url).bearer_auth(&token).send().await)?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let token = self.nyx_auth(true).await?;
            let resp =
                registry_error(self.http.get(&url).bearer_auth(&token).send().await)?;
            return Ok(registry_error(resp.json().await)?);
        }
        Ok(registry_error(resp.json().await)?)
    }

    async fn nyx_auth(&self, force: bool) -> Result<String> {
        let mut cached = self.nyx_token.lock().await;
        if !force {
            if let Some(t) = cached.as_ref() {
                if t.fetched.elapsed() < NYX_TOKEN_TTL {
                    return Ok(t.token.clone());
                }
            }
        }

        #[derive(Deserialize)]
        struct AuthResponse {
            token: String,
        }

        let url = format!("{}/auth", self.conf.endpoint);
        let resp = registry_error(
            self.http
                .post(&url)
                .json(&serde_json::json!({
                    "username": self.conf.username,
                    "password": self.conf.password,
                }))
                .send()
                .await,
        )?;
        let auth: AuthResponse = registry_error(resp.json().await)?;
        *cached = Some(NyxToken {
            token: auth.token.clone(),
            fetched: Instant::now(),
        });
        Ok(auth.token)
    }
}

fn registry_error<T>(res: std::result::Result<T, reqwest::Error>) -> Result<T> {
    res.map_err(|e| ServerError::Internal(format!("registry request error: {e}")))
}

/// Ordering helper for image tags: base versions compare as strings, equal
/// bases compare their dash suffixes numerically so `1.2.3-11` outranks
/// `1.2.3-2`. Non-numeric suffixes never outrank anything.
pub fn less_dash_version(a: &str, b: &str) -> bool {
    let (base_a, suffix_a) = split_dash(a);
    let (base_b, suffix_b) = split_dash(b);

    if base_a != base_b {
        return base_a < base_b;
    }

    match (suffix_a, suffix_b) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(sa), Some(sb)) => match (sa.parse::<u64>(), sb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => na < nb,
            _ => false,
        },
    }
}

fn split_dash(v: &str) -> (&str, Option<&str>) {
    match v.split_once('-') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (v, None),
    }
}
