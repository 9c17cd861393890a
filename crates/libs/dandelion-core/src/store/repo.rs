//! Git-backed content store.
//!
//! Wraps a plain local clone whose branches mirror the remote. Branch names
//! encode app ownership: `app1` or `app1/staging` both belong to app `app1`
//! (the first path segment is the app id). Files whose basename starts with
//! a dot are invisible to hashing, listing and archiving.
//!
//! The store is not internally synchronized; callers share it behind the
//! process-wide repository mutex owned by [`crate::ModelManager`], because a
//! plain clone has a single working tree.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use dandelion_common::config::RepositoryConfig;
use git2::{BranchType, Oid, Repository};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Commit author attribution, serialized into commit listings and publish
/// responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
    pub when: DateTime<Utc>,
}

/// A commit as exposed over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub branch: String,
    pub commit_id: String,
    pub message: String,
    pub author: CommitAuthor,
}

/// Reference info for the current HEAD.
#[derive(Debug, Clone, Serialize)]
pub struct HeadInfo {
    pub name: String,
    pub app_id: String,
    pub commit_id: String,
}

/// Extract the app id from a branch name: the first `/`-separated segment.
pub fn app_id_of(branch: &str) -> &str {
    match branch.split_once('/') {
        Some((prefix, _)) => prefix,
        None => branch,
    }
}

pub struct RepoStore {
    repo: Repository,
    conf: RepositoryConfig,
    cached_branches: Option<Vec<String>>,
}

impl RepoStore {
    /// Open the clone at `conf.path`, initializing and fetching it when the
    /// directory is not a repository yet.
    pub fn open_or_init(conf: &RepositoryConfig) -> Result<Self> {
        let path = PathBuf::from(&conf.path);
        let existed = path.join(".git").exists();
        let repo = if existed {
            Repository::open(&path)?
        } else {
            std::fs::create_dir_all(&path)?;
            Repository::init(&path)?
        };

        match repo.find_remote("origin") {
            Ok(remote) => {
                if remote.url() != Some(conf.remote_url.as_str()) {
                    drop(remote);
                    repo.remote_set_url("origin", &conf.remote_url)?;
                }
            }
            Err(_) => {
                repo.remote("origin", &conf.remote_url)?;
            }
        }

        let mut store = Self {
            repo,
            conf: conf.clone(),
            cached_branches: None,
        };

        if !existed {
            info!(path = %conf.path, "fetching new repository clone");
            store.sync_branches()?;
            // point HEAD at some synced branch so head() resolves
            if let Some(branch) = store.branches(true)?.first().cloned() {
                store.repo.set_head(&format!("refs/heads/{branch}"))?;
                let mut co = git2::build::CheckoutBuilder::new();
                co.force();
                store.repo.checkout_head(Some(&mut co))?;
            }
        }

        Ok(store)
    }

    fn fetch_options(&self) -> git2::FetchOptions<'static> {
        let username = self.conf.username.clone();
        let password = self.conf.password.clone();
        let key_path = if self.conf.ssh_key_path.is_empty() {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".ssh").join("id_rsa"))
                .unwrap_or_default()
        } else {
            PathBuf::from(&self.conf.ssh_key_path)
        };

        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            if allowed.contains(git2::CredentialType::SSH_KEY) {
                let user = username_from_url.unwrap_or("git");
                return git2::Cred::ssh_key(user, None, &key_path, None);
            }
            if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT) && !username.is_empty() {
                return git2::Cred::userpass_plaintext(&username, &password);
            }
            git2::Cred::default()
        });
        callbacks.sideband_progress(|data| {
            debug!(progress = %String::from_utf8_lossy(data).trim_end(), "fetch");
            true
        });

        let mut opts = git2::FetchOptions::new();
        opts.remote_callbacks(callbacks);
        if !self.conf.proxy.is_empty() {
            let mut proxy = git2::ProxyOptions::new();
            proxy.url(&self.conf.proxy);
            opts.proxy_options(proxy);
        }
        opts
    }

    /// Fetch all remote heads and mirror each `origin/<name>` into
    /// `refs/heads/<name>`. Invalidates the branch cache on success.
    pub fn sync_branches(&mut self) -> Result<()> {
        {
            let mut remote = self.repo.find_remote("origin")?;
            let mut opts = self.fetch_options();
            remote.fetch(
                &["+refs/heads/*:refs/remotes/origin/*"],
                Some(&mut opts),
                None,
            )?;
        }

        let mut heads = Vec::new();
        {
            let refs = self.repo.references_glob("refs/remotes/origin/*")?;
            for reference in refs {
                let reference = reference?;
                let Some(target) = reference.target() else {
                    continue;
                };
                let Some(name) = reference.name() else {
                    continue;
                };
                let Some(branch) = name.strip_prefix("refs/remotes/origin/") else {
                    continue;
                };
                if branch == "HEAD" {
                    continue;
                }
                heads.push((branch.to_string(), target));
            }
        }
        for (branch, target) in heads {
            debug!(branch = %branch, target = %target, "sync branch");
            self.repo
                .reference(&format!("refs/heads/{branch}"), target, true, "sync branches")?;
        }

        self.cached_branches = None;
        Ok(())
    }

    /// Checkout `branch` and fast-forward it to the remote head. Already
    /// up-to-date is not an error.
    pub fn pull(&mut self, branch: &str) -> Result<()> {
        if self
            .repo
            .find_reference(&format!("refs/heads/{branch}"))
            .is_err()
        {
            return Err(Error::BranchNotFound(branch.to_string()));
        }
        {
            let mut remote = self.repo.find_remote("origin")?;
            let mut opts = self.fetch_options();
            let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
            remote.fetch(&[refspec.as_str()], Some(&mut opts), None)?;
        }

        let target = self
            .repo
            .find_reference(&format!("refs/remotes/origin/{branch}"))
            .ok()
            .and_then(|r| r.target())
            .ok_or_else(|| Error::BranchNotFound(branch.to_string()))?;

        self.repo
            .reference(&format!("refs/heads/{branch}"), target, true, "pull: fast-forward")?;
        self.repo.set_head(&format!("refs/heads/{branch}"))?;
        let mut co = git2::build::CheckoutBuilder::new();
        co.force();
        self.repo.checkout_head(Some(&mut co))?;
        Ok(())
    }

    /// Local branch names, cached between syncs.
    pub fn branches(&mut self, force: bool) -> Result<Vec<String>> {
        if force || self.cached_branches.is_none() {
            let mut names = Vec::new();
            for branch in self.repo.branches(Some(BranchType::Local))? {
                let (branch, _) = branch?;
                if let Some(name) = branch.name()? {
                    names.push(name.to_string());
                }
            }
            names.sort();
            self.cached_branches = Some(names);
        }
        Ok(self.cached_branches.clone().unwrap_or_default())
    }

    /// Distinct app ids across local branches, in branch order.
    pub fn app_ids(&mut self) -> Result<Vec<String>> {
        let branches = self.branches(false)?;
        let mut app_ids: Vec<String> = Vec::new();
        for branch in &branches {
            let app_id = app_id_of(branch);
            if !app_ids.iter().any(|a| a == app_id) {
                app_ids.push(app_id.to_string());
            }
        }
        Ok(app_ids)
    }

    pub fn head(&self) -> Result<HeadInfo> {
        let head = self.repo.head()?;
        let short = head.shorthand().unwrap_or_default().to_string();
        Ok(HeadInfo {
            name: head.name().unwrap_or_default().to_string(),
            app_id: app_id_of(&short).to_string(),
            commit_id: head
                .target()
                .map(|oid| oid.to_string())
                .unwrap_or_default(),
        })
    }

    fn find_commit(&self, commit_id: &str) -> Result<git2::Commit<'_>> {
        let oid =
            Oid::from_str(commit_id).map_err(|_| Error::CommitNotFound(commit_id.to_string()))?;
        self.repo
            .find_commit(oid)
            .map_err(|e| match e.code() {
                git2::ErrorCode::NotFound => Error::CommitNotFound(commit_id.to_string()),
                _ => Error::Git2(e),
            })
    }

    /// Resolve a commit and attach the branch label the caller is working
    /// under (the API reports commits per app branch).
    pub fn commit_info(&self, branch: &str, commit_id: &str) -> Result<CommitInfo> {
        let commit = self.find_commit(commit_id)?;
        Ok(to_commit_info(branch, &commit))
    }

    /// All commits reachable from this app's branches, newest author date
    /// first when several branches contribute.
    pub fn commits_for_app(&mut self, app_id: &str) -> Result<Vec<CommitInfo>> {
        let branches = self.branches(false)?;
        let mut commits = Vec::new();
        let mut branch_count = 0;

        for branch in branches.iter().filter(|b| app_id_of(b) == app_id) {
            branch_count += 1;
            let tip = self
                .repo
                .find_reference(&format!("refs/heads/{branch}"))?
                .target()
                .ok_or_else(|| Error::BranchNotFound(branch.clone()))?;
            let mut walk = self.repo.revwalk()?;
            walk.push(tip)?;
            for oid in walk {
                let commit = self.repo.find_commit(oid?)?;
                commits.push(to_commit_info(branch, &commit));
            }
        }

        if branch_count > 1 {
            commits.sort_by(|a, b| b.author.when.cmp(&a.author.when));
        }
        Ok(commits)
    }

    /// Non-dot blobs of the commit tree, in tree iteration order.
    pub fn tree_files(&self, commit_id: &str) -> Result<Vec<(String, Oid)>> {
        let commit = self.find_commit(commit_id)?;
        let tree = commit.tree()?;
        let mut files = Vec::new();
        self.collect_blobs(&tree, "", &mut files)?;
        Ok(files)
    }

    fn collect_blobs(
        &self,
        tree: &git2::Tree<'_>,
        prefix: &str,
        out: &mut Vec<(String, Oid)>,
    ) -> Result<()> {
        for entry in tree.iter() {
            let Some(name) = entry.name() else {
                continue;
            };
            match entry.kind() {
                Some(git2::ObjectType::Tree) => {
                    let sub = self.repo.find_tree(entry.id())?;
                    let prefix = format!("{prefix}{name}/");
                    self.collect_blobs(&sub, &prefix, out)?;
                }
                Some(git2::ObjectType::Blob) => {
                    if name.starts_with('.') {
                        // dot files are invisible to clients
                        continue;
                    }
                    out.push((format!("{prefix}{name}"), entry.id()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn blob_content(&self, oid: Oid) -> Result<Vec<u8>> {
        Ok(self.repo.find_blob(oid)?.content().to_vec())
    }

    /// MD5 of the concatenated non-dot file contents, in tree iteration
    /// order. The agent recomputes this over its on-disk copy; any mismatch
    /// means dirty.
    pub fn md5sum_tree(&self, commit_id: &str) -> Result<String> {
        let mut ctx = md5::Context::new();
        for (_, oid) in self.tree_files(commit_id)? {
            ctx.consume(self.repo.find_blob(oid)?.content());
        }
        Ok(format!("{:x}", ctx.compute()))
    }

    /// Raw bytes of one file in the commit tree.
    pub fn read_file(&self, commit_id: &str, path: &str) -> Result<Vec<u8>> {
        let commit = self.find_commit(commit_id)?;
        let tree = commit.tree()?;
        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| Error::FileNotFound(path.to_string()))?;
        let blob = self
            .repo
            .find_blob(entry.id())
            .map_err(|_| Error::FileNotFound(path.to_string()))?;
        Ok(blob.content().to_vec())
    }
}

fn to_commit_info(branch: &str, commit: &git2::Commit<'_>) -> CommitInfo {
    let author = commit.author();
    let when = Utc
        .timestamp_opt(author.when().seconds(), 0)
        .single()
        .unwrap_or_default();
    CommitInfo {
        branch: branch.to_string(),
        commit_id: commit.id().to_string(),
        message: commit.message().unwrap_or_default().to_string(),
        author: CommitAuthor {
            name: author.name().unwrap_or_default().to_string(),
            email: author.email().unwrap_or_default().to_string(),
            when,
        },
    }
}
