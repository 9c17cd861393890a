//! Shared test harness: a bare "remote" repository built object-by-object,
//! a local clone synced from it, and a fresh database.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use dandelion_common::config::{AppConfig, RepositoryConfig};
use dandelion_core::ModelManager;
use dandelion_core::store::new_db_pool;
use dandelion_core::store::repo::RepoStore;
use git2::{Oid, Repository};
use tempfile::TempDir;

/// Write a commit onto `branch` of `repo` whose tree contains exactly
/// `files` (path → content; paths may be nested). Returns the commit id.
pub fn commit_files(repo: &Repository, branch: &str, files: &[(&str, &str)], msg: &str) -> String {
    let entries: Vec<(Vec<&str>, &str)> = files
        .iter()
        .map(|(path, content)| (path.split('/').collect(), *content))
        .collect();
    let tree_oid = build_tree(repo, &entries);
    let tree = repo.find_tree(tree_oid).unwrap();
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
        msg,
        &tree,
        &parents,
    )
    .unwrap()
    .to_string()
}

fn build_tree(repo: &Repository, entries: &[(Vec<&str>, &str)]) -> Oid {
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

pub struct TestEnv {
    /// Keeps the temp tree alive for the duration of the test.
    #[allow(dead_code)]
    pub dir: TempDir,
    pub origin: Repository,
    pub mm: ModelManager,
}

/// Build an origin repository with the given branches, clone it, and wire a
/// `ModelManager` around the clone plus a fresh database.
pub async fn test_env(branches: &[(&str, &[(&str, &str)])]) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let origin_path = dir.path().join("origin");
    let origin = Repository::init_bare(&origin_path).unwrap();
    for (branch, files) in branches {
        commit_files(&origin, branch, files, &format!("seed {branch}"));
    }

    let clone_path = dir.path().join("clone");
    let repo_conf = RepositoryConfig {
        path: clone_path.display().to_string(),
        remote_url: origin_path.display().to_string(),
        ..RepositoryConfig::default()
    };
    let store = RepoStore::open_or_init(&repo_conf).unwrap();

    let db = new_db_pool(&dir.path().join("dandelion.db")).await.unwrap();
    let archive_root = dir.path().join("archive").display().to_string();
    let mm = ModelManager::new_for_test(db, store, &archive_root, Arc::new(AppConfig::default()));

    TestEnv { dir, origin, mm }
}
