//! Kubernetes adapter: a narrow facade over deployments plus the REST
//! handlers that broker mutations.
//!
//! Only deployments carrying the `dandelion.to/managed` label may be
//! mutated through here. Read-modify-write updates retry on optimistic
//! locking conflicts with exponential backoff. Every mutation spawns a
//! deployment watcher that streams progress events (see [`crate::events`]).

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Form, Path, State};
use axum::response::Response;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use dandelion_common::config::AppConfig;

use crate::AppState;
use crate::error::{Result, ServerError, succeed};
use crate::events::{DeploymentStatusView, EventHub, POLL_INTERVAL, WATCH_TIMEOUT, Watcher};
use crate::registry::RegistryClient;
use crate::webhook::WebhookClient;

/// Deployments must carry this label to be mutable through dandelion.
pub const MANAGED_LABEL: &str = "dandelion.to/managed";
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

pub struct KubeContext {
    pub deployments: Api<Deployment>,
    pub replicasets: Api<ReplicaSet>,
    pub registry: RegistryClient,
    pub webhook: WebhookClient,
    pub events: EventHub,
}

impl KubeContext {
    pub async fn init(conf: &AppConfig) -> anyhow::Result<Self> {
        let client = if conf.kubernetes.in_cluster || conf.kubernetes.config.is_empty() {
            kube::Client::try_default().await?
        } else {
            let kubeconfig = kube::config::Kubeconfig::read_from(&conf.kubernetes.config)?;
            let config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?;
            kube::Client::try_from(config)?
        };

        let namespace = conf.kubernetes.namespace.clone();
        Ok(Self {
            deployments: Api::namespaced(client.clone(), &namespace),
            replicasets: Api::namespaced(client, &namespace),
            registry: RegistryClient::new(&conf.registry),
            webhook: WebhookClient::new(&conf.webhook),
            events: EventHub::new(),
        })
    }
}

fn kube_ctx(state: &AppState) -> Result<&Arc<KubeContext>> {
    state
        .kube
        .as_ref()
        .ok_or_else(|| ServerError::Internal("kubernetes is not enabled".to_string()))
}

fn kube_err(context: &str, e: kube::Error) -> ServerError {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => ServerError::NotFound(format!("{context}: {e}")),
        _ => ServerError::Internal(format!("{context}: {e}")),
    }
}

fn ensure_managed(dp: &Deployment) -> Result<()> {
    let managed = dp
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(MANAGED_LABEL));
    if managed {
        Ok(())
    } else {
        Err(ServerError::Forbidden(
            "deployment is not managed by dandelion".to_string(),
        ))
    }
}

fn revision_of(dp: &Deployment) -> i64 {
    dp.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_ANNOTATION))
        .and_then(|r| r.parse().ok())
        .unwrap_or(0)
}

fn status_view(dp: &Deployment) -> DeploymentStatusView {
    let status = dp.status.as_ref();
    DeploymentStatusView {
        replicas: dp.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
        updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
        available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
        observed_generation: status.and_then(|s| s.observed_generation).unwrap_or(0),
        generation: dp.metadata.generation.unwrap_or(0),
    }
}

/// Retry a read-modify-write on optimistic-locking conflicts, backing off
/// exponentially. Other errors surface immediately.
async fn retry_on_conflict<T>(
    mut op: impl FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = kube::Result<T>> + Send>>,
) -> kube::Result<T> {
    let mut delay = Duration::from_millis(100);
    let mut attempts = 0;
    loop {
        match op().await {
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}

/// Spawn the progress watcher for a just-issued mutation.
fn spawn_watcher(kube: Arc<KubeContext>, name: String, action: &str) {
    let action = action.to_string();
    tokio::spawn(async move {
        let mut watcher = Watcher::new(&name, &action, WATCH_TIMEOUT);
        info!(deployment = %name, action = %action, "deployment watcher started");
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let dp = match kube.deployments.get(&name).await {
                Ok(dp) => dp,
                Err(e) => {
                    warn!(deployment = %name, error = %e, "deployment poll failed");
                    continue;
                }
            };
            let (event, done) = watcher.observe(status_view(&dp), Instant::now());
            if let Some(event) = &event {
                kube.events.broadcast(event).await;
                if let Err(e) = kube.webhook.send(event).await {
                    error!(deployment = %name, error = %e, "webhook mirror failed");
                }
            }
            if done {
                info!(deployment = %name, action = %action, "deployment watcher finished");
                break;
            }
        }
    });
}

#[derive(Debug, Serialize)]
struct DeploymentSummary {
    name: String,
    image: String,
    replicas: i32,
    revision: i64,
}

/// `GET /api/v1/kube/deployments`
///
/// Only deployments carrying the managed label are listed; everything else
/// in the namespace stays invisible through this surface.
pub async fn kube_list_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let kube = kube_ctx(&state)?;
    let list = kube
        .deployments
        .list(&ListParams::default().labels(MANAGED_LABEL))
        .await
        .map_err(|e| kube_err("deployment list error", e))?;

    let deployments: Vec<DeploymentSummary> = list
        .items
        .iter()
        .map(|dp| {
            let image = dp
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|ps| ps.containers.first())
                .and_then(|c| c.image.clone())
                .unwrap_or_default();
            DeploymentSummary {
                name: dp.metadata.name.clone().unwrap_or_default(),
                image,
                replicas: dp.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
                revision: revision_of(dp),
            }
        })
        .collect();

    Ok(succeed(json!({ "deployments": deployments })))
}

#[derive(Debug, Deserialize)]
pub struct SetTagForm {
    #[serde(default)]
    version_tag: String,
}

/// `POST /api/v1/kube/deployments/{deployment}/setversiontag`
pub async fn kube_set_version_tag_handler(
    State(state): State<AppState>,
    Path(deployment): Path<String>,
    Form(form): Form<SetTagForm>,
) -> Result<Json<serde_json::Value>> {
    if form.version_tag.is_empty() {
        return Err(ServerError::Params);
    }
    let kube = kube_ctx(&state)?;

    let current = kube
        .deployments
        .get(&deployment)
        .await
        .map_err(|e| kube_err("deployment get error", e))?;
    ensure_managed(&current)?;

    let host = kube.registry.host()?;
    let image = format!("{host}/{deployment}:{}", form.version_tag);

    retry_on_conflict(|| {
        let kube = Arc::clone(kube);
        let deployment = deployment.clone();
        let image = image.clone();
        Box::pin(async move {
            let mut dp = kube.deployments.get(&deployment).await?;
            if let Some(spec) = dp.spec.as_mut() {
                if let Some(pod_spec) = spec.template.spec.as_mut() {
                    if let Some(container) = pod_spec.containers.first_mut() {
                        container.image = Some(image.clone());
                    }
                }
            }
            kube.deployments
                .replace(&deployment, &PostParams::default(), &dp)
                .await
        })
    })
    .await
    .map_err(|e| kube_err("deployment set-image error", e))?;

    spawn_watcher(Arc::clone(kube), deployment, "setversiontag");
    Ok(succeed(json!({ "ok": 1 })))
}

/// `POST /api/v1/kube/deployments/{deployment}/rollback`
///
/// Re-applies the pod template of the previous revision's ReplicaSet, the
/// same way `kubectl rollout undo` does.
pub async fn kube_rollback_handler(
    State(state): State<AppState>,
    Path(deployment): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let kube = kube_ctx(&state)?;

    let dp = kube
        .deployments
        .get(&deployment)
        .await
        .map_err(|e| kube_err("deployment get error", e))?;
    ensure_managed(&dp)?;

    let revision = revision_of(&dp);
    if revision <= 1 {
        return Err(ServerError::BadRequest(
            "deployment no enough revision".to_string(),
        ));
    }

    let selector = dp
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();

    let replicasets = kube
        .replicasets
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| kube_err("replicaset list error", e))?;

    let target = replicasets
        .items
        .into_iter()
        .filter(|rs| {
            rs.metadata
                .owner_references
                .as_ref()
                .is_some_and(|owners| owners.iter().any(|o| o.name == deployment))
        })
        .find(|rs| {
            rs.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REVISION_ANNOTATION))
                .and_then(|r| r.parse::<i64>().ok())
                == Some(revision - 1)
        })
        .ok_or_else(|| {
            ServerError::Internal("previous revision replicaset not found".to_string())
        })?;

    let mut template = target
        .spec
        .and_then(|s| s.template)
        .ok_or_else(|| ServerError::Internal("replicaset has no pod template".to_string()))?;
    if let Some(labels) = template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
        labels.remove("pod-template-hash");
    }

    retry_on_conflict(|| {
        let kube = Arc::clone(kube);
        let deployment = deployment.clone();
        let template = template.clone();
        Box::pin(async move {
            let mut dp = kube.deployments.get(&deployment).await?;
            if let Some(spec) = dp.spec.as_mut() {
                spec.template = template.clone();
            }
            kube.deployments
                .replace(&deployment, &PostParams::default(), &dp)
                .await
        })
    })
    .await
    .map_err(|e| kube_err("deployment rollback error", e))?;

    spawn_watcher(Arc::clone(kube), deployment, "rollback");
    Ok(succeed(json!({ "ok": 1 })))
}

/// `POST /api/v1/kube/deployments/{deployment}/restart`
pub async fn kube_restart_handler(
    State(state): State<AppState>,
    Path(deployment): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let kube = kube_ctx(&state)?;

    let dp = kube
        .deployments
        .get(&deployment)
        .await
        .map_err(|e| kube_err("deployment get error", e))?;
    ensure_managed(&dp)?;

    let patch = json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: Utc::now().to_rfc3339(),
                    }
                }
            }
        }
    });
    kube.deployments
        .patch(&deployment, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| kube_err("deployment restart error", e))?;

    spawn_watcher(Arc::clone(kube), deployment, "restart");
    Ok(succeed(json!({ "ok": 1 })))
}

#[derive(Debug, Deserialize)]
pub struct SetReplicasForm {
    replicas: i32,
}

/// `POST /api/v1/kube/deployments/{deployment}/setreplicas`
pub async fn kube_set_replicas_handler(
    State(state): State<AppState>,
    Path(deployment): Path<String>,
    Form(form): Form<SetReplicasForm>,
) -> Result<Json<serde_json::Value>> {
    if form.replicas < 0 {
        return Err(ServerError::Params);
    }
    let kube = kube_ctx(&state)?;

    let dp = kube
        .deployments
        .get(&deployment)
        .await
        .map_err(|e| kube_err("deployment get error", e))?;
    ensure_managed(&dp)?;

    let patch = json!({ "spec": { "replicas": form.replicas } });
    kube.deployments
        .patch(&deployment, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| kube_err("deployment scale error", e))?;

    spawn_watcher(Arc::clone(kube), deployment, "setreplicas");
    Ok(succeed(json!({ "ok": 1 })))
}

/// `GET /api/v1/kube/deployments/{deployment}/tags`
pub async fn kube_list_tags_handler(
    State(state): State<AppState>,
    Path(deployment): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let kube = kube_ctx(&state)?;

    let dp = kube
        .deployments
        .get(&deployment)
        .await
        .map_err(|e| kube_err("deployment get error", e))?;
    ensure_managed(&dp)?;

    let tags = kube.registry.list_tags(&deployment).await?;
    Ok(succeed(tags))
}

/// `GET /events/kube/{deployment}` — long-lived subscriber channel.
pub async fn kube_events_handler(
    State(state): State<AppState>,
    Path(deployment): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let kube = Arc::clone(kube_ctx(&state)?);
    Ok(ws.on_upgrade(move |socket| async move {
        kube.events.serve(deployment, socket).await;
    }))
}
