#![allow(clippy::unwrap_used)]

//! End-to-end handler tests driving the router with in-process requests.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{TestApp, test_app as make_app};
use http_body_util::BodyExt;
use tower::ServiceExt;

async fn test_app() -> TestApp {
    make_app(&[("app.conf", "key = 1\n"), ("conf/extra.conf", "x = y\n")]).await
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn form_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_root_and_health() {
    let app = test_app().await;

    let res = app
        .router
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["info"], "Welcome to dandelion.");

    let res = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_publish_match_rollback_flow() {
    let app = test_app().await;

    // publish
    let res = app
        .router
        .clone()
        .oneshot(form_post(
            "/api/v1/publish/app1",
            &format!(
                "version=1.0&host=web-*&instance_id=*&commit_id={}",
                app.commit_id
            ),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["code"], 0);
    let config = &body["info"]["config"];
    assert_eq!(config["commit_id"], app.commit_id.as_str());
    let md5sum = config["md5sum"].as_str().unwrap();
    assert_eq!(md5sum.len(), 32);
    assert!(md5sum.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    let id = config["id"].as_i64().unwrap();

    // match hits for a covered host
    let res = app
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/match/app1?version=1.0&host=web-01&instance_id=x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["info"]["config"]["commit_id"], app.commit_id.as_str());

    // glob does not cover db hosts
    let res = app
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/match/app1?version=1.0&host=db-01&instance_id=x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = body_json(res).await;
    assert_eq!(body["code"], 404);

    // rollback hides the release from match
    let res = app
        .router
        .clone()
        .oneshot(form_post("/api/v1/rollback/app1", &format!("id={id}")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/match/app1?version=1.0&host=web-01&instance_id=x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_publish_validates_params() {
    let app = test_app().await;

    // missing fields
    let res = app
        .router
        .clone()
        .oneshot(form_post("/api/v1/publish/app1", "version=1.0"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert_eq!(body["code"], 400);
    assert_eq!(body["info"], "Params error");

    // invalid glob
    let res = app
        .router
        .clone()
        .oneshot(form_post(
            "/api/v1/publish/app1",
            &format!("version=1.0&host=[web&instance_id=*&commit_id={}", app.commit_id),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert_eq!(body["info"], "Params error");
}

#[tokio::test]
async fn test_tree_file_and_archive_endpoints() {
    let app = test_app().await;
    let commit = &app.commit_id;

    let res = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/list/app1/tree/{commit}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    let files: Vec<String> = body["info"]["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(files, ["app.conf", "conf/extra.conf"]);

    let res = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/list/app1/tree/{commit}/conf/extra.conf"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"x = y\n");

    // missing file is a 404 envelope
    let res = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/list/app1/tree/{commit}/missing.conf"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    // archive round-trip
    let res = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/archive/app1/{commit}.zip"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..2], b"PK");

    // non-zip suffix is rejected
    let res = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/archive/app1/{commit}.tar"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_and_check_endpoints() {
    let app = test_app().await;

    let res = app
        .router
        .clone()
        .oneshot(Request::get("/api/v1/list").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(res).await;
    assert_eq!(body["info"]["app_ids"], serde_json::json!(["app1"]));

    let res = app
        .router
        .clone()
        .oneshot(
            Request::post("/api/v1/check/app1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["info"]["app_id"], "app1");

    let res = app
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/list/app1/commits")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(res).await;
    let commits = body["info"]["commits"].as_array().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0]["author"]["name"], "Tester");
}
