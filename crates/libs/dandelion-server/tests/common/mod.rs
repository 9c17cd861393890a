//! Shared harness: a bare origin repository, a synced clone, a fresh
//! database and an `AppState` ready to route requests.

#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use dandelion_common::config::{AppConfig, RepositoryConfig};
use dandelion_core::ModelManager;
use dandelion_core::bus::NoopBus;
use dandelion_core::store::new_db_pool;
use dandelion_core::store::repo::RepoStore;
use dandelion_server::push::PushHub;
use dandelion_server::{AppState, api};
use git2::{Oid, Repository};
use tempfile::TempDir;

pub fn build_tree(repo: &Repository, entries: &[(Vec<&str>, &str)]) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    let mut dirs: BTreeMap<&str, Vec<(Vec<&str>, &str)>> = BTreeMap::new();
    for (parts, content) in entries {
        if parts.len() == 1 {
            let oid = repo.blob(content.as_bytes()).unwrap();
            builder.insert(parts[0], oid, 0o100644).unwrap();
        } else {
            dirs.entry(parts[0])
                .or_default()
                .push((parts[1..].to_vec(), content));
        }
    }
    for (dir, sub) in dirs {
        let oid = build_tree(repo, &sub);
        builder.insert(dir, oid, 0o040000).unwrap();
    }
    builder.write().unwrap()
}

pub fn commit_files(repo: &Repository, branch: &str, files: &[(&str, &str)]) -> String {
    let entries: Vec<(Vec<&str>, &str)> = files
        .iter()
        .map(|(path, content)| (path.split('/').collect(), *content))
        .collect();
    let tree = repo.find_tree(build_tree(repo, &entries)).unwrap();
    let sig = git2::Signature::now("Tester", "tester@example.com").unwrap();
    let parent = repo
        .find_reference(&format!("refs/heads/{branch}"))
        .ok()
        .and_then(|r| r.target())
        .map(|oid| repo.find_commit(oid).unwrap());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(
        Some(&format!("refs/heads/{branch}")),
        &sig,
        &sig,
        "seed",
        &tree,
        &parents,
    )
    .unwrap()
    .to_string()
}

pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub router: Router,
    pub commit_id: String,
}

pub async fn test_app(files: &[(&str, &str)]) -> TestApp {
    let dir = TempDir::new().unwrap();
    let origin_path = dir.path().join("origin");
    let origin = Repository::init_bare(&origin_path).unwrap();
    let commit_id = commit_files(&origin, "app1", files);

    let repo_conf = RepositoryConfig {
        path: dir.path().join("clone").display().to_string(),
        remote_url: origin_path.display().to_string(),
        ..RepositoryConfig::default()
    };
    let store = RepoStore::open_or_init(&repo_conf).unwrap();
    let db = new_db_pool(&dir.path().join("dandelion.db")).await.unwrap();
    let archive_root = dir.path().join("archive").display().to_string();
    let mm = ModelManager::new_for_test(db, store, &archive_root, Arc::new(AppConfig::default()));

    let state = AppState {
        mm,
        hub: Arc::new(PushHub::new()),
        bus: Arc::new(NoopBus),
        kube: None,
        metrics_handle: dandelion_server::test_metrics_handle(),
        start_time: Instant::now(),
    };

    TestApp {
        dir,
        state: state.clone(),
        router: api::routes(state),
        commit_id,
    }
}

/// Serve the router on an ephemeral port, returning its base URL.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}
