//! Outbound webhook mirror for deployment events.

use serde::Serialize;

use dandelion_common::config::WebhookConfig;

#[derive(Debug, Serialize)]
struct EventMetadata {
    host: String,
    instance_id: String,
}

#[derive(Debug, Serialize)]
struct Event<'a, T: Serialize> {
    metadata: &'a EventMetadata,
    event: &'a T,
}

pub struct WebhookClient {
    url: String,
    metadata: EventMetadata,
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new(conf: &WebhookConfig) -> Self {
        let host = std::env::var("NODE_NAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| default_hostname());
        let instance_id = std::env::var("INSTANCE_ID").unwrap_or_else(|_| host.clone());
        Self {
            url: conf.url.clone(),
            metadata: EventMetadata { host, instance_id },
            http: reqwest::Client::new(),
        }
    }

    /// POST the event as JSON. An empty URL disables the mirror.
    pub async fn send<T: Serialize>(&self, event: &T) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Ok(());
        }

        let body = Event {
            metadata: &self.metadata,
            event,
        };
        let res = self.http.post(&self.url).json(&body).send().await?;
        if !res.status().is_success() {
            anyhow::bail!("webhook response status {}", res.status().as_u16());
        }
        Ok(())
    }
}

fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
