#![allow(clippy::unwrap_used)]

//! Registry adapter tests against small in-process mock registries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dandelion_common::config::RegistryConfig;
use dandelion_server::registry::RegistryClient;
use serde_json::json;

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

fn conf(kind: &str, endpoint: &str) -> RegistryConfig {
    RegistryConfig {
        kind: kind.to_string(),
        endpoint: endpoint.to_string(),
        username: "user".to_string(),
        password: "secret".to_string(),
    }
}

#[tokio::test]
async fn test_plain_registry_lists_and_sorts_tags() {
    let router = Router::new().route(
        "/v2/{catalog}/tags/list",
        get(|Path(catalog): Path<String>, headers: HeaderMap| async move {
            // basic auth must be forwarded
            assert!(
                headers
                    .get("authorization")
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .starts_with("Basic ")
            );
            Json(json!({
                "name": catalog,
                "tags": ["1.2.2", "1.2.3-2", "1.2.3-11", "1.2.3"],
            }))
        }),
    );
    let endpoint = spawn(router).await;

    let client = RegistryClient::new(&conf("registry", &endpoint));
    let tags = client.list_tags("web").await.unwrap();
    assert_eq!(tags.name, "web");
    assert_eq!(tags.tags, ["1.2.3-11", "1.2.3-2", "1.2.3", "1.2.2"]);
}

#[tokio::test]
async fn test_harbor_tag_objects() {
    let router = Router::new().route(
        "/api/repositories/{catalog}/tags",
        get(|| async {
            Json(json!([
                { "name": "2.0.0", "digest": "sha256:aa" },
                { "name": "2.1.0", "digest": "sha256:bb" },
            ]))
        }),
    );
    let endpoint = spawn(router).await;

    let client = RegistryClient::new(&conf("harbor", &endpoint));
    let tags = client.list_tags("library/web").await.unwrap();
    assert_eq!(tags.tags, ["2.1.0", "2.0.0"]);
}

#[tokio::test]
async fn test_rider_data_wrapper() {
    let router = Router::new().route(
        "/api/v1/repositories/{catalog}/tags",
        get(|Path(catalog): Path<String>| async move {
            Json(json!({ "data": { "name": catalog, "tags": ["1.0", "1.1"] } }))
        }),
    );
    let endpoint = spawn(router).await;

    let client = RegistryClient::new(&conf("rider", &endpoint));
    let tags = client.list_tags("web").await.unwrap();
    assert_eq!(tags.name, "web");
    assert_eq!(tags.tags, ["1.1", "1.0"]);
}

struct NyxState {
    auth_calls: AtomicU32,
}

#[tokio::test]
async fn test_nyx_refreshes_token_on_auth_failure() {
    // the first issued token is immediately considered invalid by the tag
    // endpoint, forcing one re-auth
    let state = Arc::new(NyxState {
        auth_calls: AtomicU32::new(0),
    });

    let router = Router::new()
        .route(
            "/auth",
            post(|State(state): State<Arc<NyxState>>| async move {
                let n = state.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
                Json(json!({ "token": format!("token-{n}"), "expires_in": 28800 }))
            }),
        )
        .route(
            "/v2/{catalog}/tags/list",
            get(
                |State(_): State<Arc<NyxState>>, headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if auth == "Bearer token-2" {
                        Json(json!({ "name": "web", "tags": ["3.0"] })).into_response()
                    } else {
                        StatusCode::UNAUTHORIZED.into_response()
                    }
                },
            ),
        )
        .with_state(Arc::clone(&state));
    let endpoint = spawn(router).await;

    let client = RegistryClient::new(&conf("nyx", &endpoint));
    let tags = client.list_tags("web").await.unwrap();
    assert_eq!(tags.tags, ["3.0"]);
    assert_eq!(state.auth_calls.load(Ordering::SeqCst), 2);

    // the refreshed token is cached for the next call
    let tags = client.list_tags("web").await.unwrap();
    assert_eq!(tags.tags, ["3.0"]);
    assert_eq!(state.auth_calls.load(Ordering::SeqCst), 2);
}
