//! REST handlers for the release catalog and content store.

use axum::Json;
use axum::extract::{Form, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use dandelion_core::model::instance::InstanceStatusBmc;
use dandelion_core::model::release::ReleaseBmc;
use dandelion_core::notify::{NotifyEvent, NotifyMessage};

use crate::AppState;
use crate::error::{Result, ServerError, succeed};

/// `GET /`
pub async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "code": 0, "info": "Welcome to dandelion." }))
}

/// `GET /health` — also proves the repository lock is not wedged.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let _repo = state.mm.repo.lock().await;
    succeed("success")
}

async fn sync_response(state: &AppState) -> Result<Json<serde_json::Value>> {
    let mut repo = state.mm.repo.lock().await;
    let head = repo.head().map_err(ServerError::Core)?;
    let app_ids = repo.app_ids().map_err(ServerError::Core)?;
    Ok(succeed(json!({ "app_ids": app_ids, "head": head })))
}

/// `POST /api/v1/sync` — fetch all remote heads.
pub async fn sync_all_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    {
        let mut repo = state.mm.repo.lock().await;
        repo.sync_branches().map_err(ServerError::Core)?;
        repo.branches(true).map_err(ServerError::Core)?;
    }
    sync_response(&state).await
}

/// `POST /api/v1/sync/{app_id}` — pull only this app's branches.
pub async fn sync_app_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    {
        let mut repo = state.mm.repo.lock().await;
        let branches = repo.branches(false).map_err(ServerError::Core)?;
        for branch in branches
            .iter()
            .filter(|b| dandelion_core::store::repo::app_id_of(b) == app_id)
        {
            repo.pull(branch).map_err(ServerError::Core)?;
        }
    }
    sync_response(&state).await
}

/// `GET /api/v1/list`
pub async fn list_apps_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let mut repo = state.mm.repo.lock().await;
    let app_ids = repo.app_ids().map_err(ServerError::Core)?;
    Ok(succeed(json!({ "app_ids": app_ids })))
}

/// `GET /api/v1/list/{app_id}/configs`
pub async fn list_configs_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let configs = ReleaseBmc::list_active(&state.mm, &app_id).await?;
    Ok(succeed(json!({ "app_id": app_id, "configs": configs })))
}

/// `GET /api/v1/list/{app_id}/commits`
pub async fn list_commits_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let commits = {
        let mut repo = state.mm.repo.lock().await;
        repo.commits_for_app(&app_id).map_err(ServerError::Core)?
    };
    Ok(succeed(json!({ "app_id": app_id, "commits": commits })))
}

/// `GET /api/v1/list/{app_id}/instances`
pub async fn list_instances_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let instances = InstanceStatusBmc::list_active(&state.mm, &app_id).await?;
    Ok(succeed(json!({ "app_id": app_id, "instances": instances })))
}

/// `GET /api/v1/list/{app_id}/tree/{commit_id}`
pub async fn list_files_handler(
    State(state): State<AppState>,
    Path((app_id, commit_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    let files: Vec<String> = {
        let repo = state.mm.repo.lock().await;
        repo.tree_files(&commit_id)
            .map_err(ServerError::Core)?
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    };
    Ok(succeed(json!({
        "app_id": app_id,
        "commit_id": commit_id,
        "files": files,
    })))
}

/// `GET /api/v1/list/{app_id}/tree/{commit_id}/{*path}` — raw file bytes.
pub async fn get_file_handler(
    State(state): State<AppState>,
    Path((_app_id, commit_id, path)): Path<(String, String, String)>,
) -> Result<Response> {
    let content = {
        let repo = state.mm.repo.lock().await;
        repo.read_file(&commit_id, &path).map_err(ServerError::Core)?
    };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        content,
    )
        .into_response())
}

/// `GET /api/v1/archive/{app_id}/{commit_id}.zip`
pub async fn get_archive_handler(
    State(state): State<AppState>,
    Path((app_id, commit_file)): Path<(String, String)>,
) -> Result<Response> {
    let Some(commit_id) = commit_file.strip_suffix(".zip") else {
        return Err(ServerError::BadRequest("unsupported archive type".to_string()));
    };

    let path = state
        .mm
        .archive
        .get_or_build(&state.mm.repo, &app_id, commit_id)
        .await?;
    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| ServerError::Internal(format!("read archive file error: {e}")))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct PublishForm {
    #[serde(default)]
    version: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    commit_id: String,
}

/// `POST /api/v1/publish/{app_id}`
pub async fn publish_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Form(form): Form<PublishForm>,
) -> Result<Json<serde_json::Value>> {
    if form.version.is_empty()
        || form.host.is_empty()
        || form.instance_id.is_empty()
        || form.commit_id.is_empty()
    {
        return Err(ServerError::Params);
    }

    let (commit, release) = ReleaseBmc::publish(
        &state.mm,
        &app_id,
        &form.version,
        &form.host,
        &form.instance_id,
        &form.commit_id,
    )
    .await?;

    info!(app_id = %app_id, id = release.id, commit_id = %release.commit_id, "release published");
    metrics::counter!("dandelion_publish_total").increment(1);
    state
        .notify(NotifyMessage::with_release(NotifyEvent::Publish, release.clone()))
        .await;

    Ok(succeed(json!({
        "app_id": app_id,
        "commit": commit,
        "config": release,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RollbackForm {
    #[serde(default)]
    id: i64,
}

/// `POST /api/v1/rollback/{app_id}`
pub async fn rollback_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Form(form): Form<RollbackForm>,
) -> Result<Json<serde_json::Value>> {
    if form.id <= 0 {
        return Err(ServerError::Params);
    }

    let release = ReleaseBmc::rollback(&state.mm, &app_id, form.id).await?;

    info!(app_id = %app_id, id = release.id, "release rolled back");
    state
        .notify(NotifyMessage::with_release(NotifyEvent::Rollback, release.clone()))
        .await;

    Ok(succeed(json!({ "app_id": app_id, "config": release })))
}

#[derive(Debug, Deserialize)]
pub struct MatchQuery {
    #[serde(default)]
    version: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    instance_id: String,
}

/// `GET /api/v1/match/{app_id}`
pub async fn match_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Query(query): Query<MatchQuery>,
) -> Result<Json<serde_json::Value>> {
    let release = ReleaseBmc::match_release(
        &state.mm,
        &app_id,
        &query.version,
        &query.host,
        &query.instance_id,
    )
    .await?;
    Ok(succeed(json!({ "app_id": app_id, "config": release })))
}

/// `POST /api/v1/check/{app_id}` — broadcast a re-reconcile request.
pub async fn check_handler(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.notify(NotifyMessage::check(app_id.clone())).await;
    Ok(succeed(json!({ "app_id": app_id })))
}
