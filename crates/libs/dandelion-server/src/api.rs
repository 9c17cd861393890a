//! Route table.

use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::handlers::{access, appconfig};
use crate::{kube, push};

pub fn routes(state: AppState) -> Router {
    let mut api = Router::new()
        .route("/sync", post(appconfig::sync_all_handler))
        .route("/sync/{app_id}", post(appconfig::sync_app_handler))
        .route("/list", get(appconfig::list_apps_handler))
        .route("/list/{app_id}/configs", get(appconfig::list_configs_handler))
        .route("/list/{app_id}/commits", get(appconfig::list_commits_handler))
        .route("/list/{app_id}/instances", get(appconfig::list_instances_handler))
        .route("/list/{app_id}/tree/{commit_id}", get(appconfig::list_files_handler))
        .route(
            "/list/{app_id}/tree/{commit_id}/{*path}",
            get(appconfig::get_file_handler),
        )
        .route("/archive/{app_id}/{commit_id}", get(appconfig::get_archive_handler))
        .route("/publish/{app_id}", post(appconfig::publish_handler))
        .route("/rollback/{app_id}", post(appconfig::rollback_handler))
        .route("/match/{app_id}", get(appconfig::match_handler))
        .route("/check/{app_id}", post(appconfig::check_handler))
        .route("/access/check", get(access::access_check_handler));

    if state.kube.is_some() {
        api = api
            .route("/kube/deployments", get(kube::kube_list_handler))
            .route(
                "/kube/deployments/{deployment}/setversiontag",
                post(kube::kube_set_version_tag_handler),
            )
            .route(
                "/kube/deployments/{deployment}/rollback",
                post(kube::kube_rollback_handler),
            )
            .route(
                "/kube/deployments/{deployment}/restart",
                post(kube::kube_restart_handler),
            )
            .route(
                "/kube/deployments/{deployment}/setreplicas",
                post(kube::kube_set_replicas_handler),
            )
            .route(
                "/kube/deployments/{deployment}/tags",
                get(kube::kube_list_tags_handler),
            );
    }

    let mut app = Router::new()
        .route("/", get(appconfig::root_handler))
        .route("/health", get(appconfig::health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/connect/push", get(push::ws_push_handler))
        .nest("/api/v1", api);

    if state.kube.is_some() {
        app = app.route("/events/kube/{deployment}", get(kube::kube_events_handler));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_handle.render()
}
