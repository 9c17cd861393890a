//! Release catalog.
//!
//! A release pins an app to a commit, gated by a `(version, host glob,
//! instance glob)` triple. Publish computes the tree hash under the
//! repository lock and inserts an active row; rollback flips the row
//! inactive; match resolves the newest active row whose globs cover the
//! requesting instance.

use chrono::Utc;
use glob::Pattern;
use libsql::params;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::store::repo::CommitInfo;

/// One release row. `host` and `instance_id` hold shell-style globs
/// (`*`, `?`, `[…]`), compiled at publish and again at match time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: i64,
    pub app_id: String,
    /// 1 = active, 0 = rolled back.
    pub status: i64,
    pub version: String,
    pub host: String,
    pub instance_id: String,
    pub commit_id: String,
    pub md5sum: String,
    pub author: String,
    pub created_time: i64,
    pub updated_time: i64,
}

pub struct ReleaseBmc;

impl ReleaseBmc {
    /// Publish a release for `app_id`. Preconditions: both globs compile and
    /// the commit resolves in the repository. The tree hash covers every
    /// non-dot file in iteration order; the agent recomputes the same sum.
    pub async fn publish(
        mm: &ModelManager,
        app_id: &str,
        version: &str,
        host: &str,
        instance_id: &str,
        commit_id: &str,
    ) -> Result<(CommitInfo, Release)> {
        Pattern::new(host)?;
        Pattern::new(instance_id)?;

        let (commit, md5sum) = {
            let repo = mm.repo.lock().await;
            let commit = repo.commit_info(app_id, commit_id)?;
            let md5sum = repo.md5sum_tree(commit_id)?;
            (commit, md5sum)
        };

        let now = Utc::now().timestamp();
        let mut release = Release {
            id: 0,
            app_id: app_id.to_string(),
            status: 1,
            version: version.to_string(),
            host: host.to_string(),
            instance_id: instance_id.to_string(),
            commit_id: commit.commit_id.clone(),
            md5sum,
            author: commit.author.name.clone(),
            created_time: now,
            updated_time: now,
        };

        let stmt = mm
            .db()
            .prepare(
                "INSERT INTO dandelion_app_configs \
                 (app_id, status, version, host, instance_id, commit_id, md5sum, author, created_time, updated_time) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .await?;
        let mut rows = stmt
            .query(params![
                release.app_id.clone(),
                release.status,
                release.version.clone(),
                release.host.clone(),
                release.instance_id.clone(),
                release.commit_id.clone(),
                release.md5sum.clone(),
                release.author.clone(),
                release.created_time,
                release.updated_time,
            ])
            .await?;

        release.id = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => return Err(Error::InvalidInput("insert returned no id".into())),
        };

        Ok((commit, release))
    }

    /// Roll back release `id`. The row must be active and belong to
    /// `app_id`; the returned value is the row as it stood before the
    /// update (notifications carry it).
    pub async fn rollback(mm: &ModelManager, app_id: &str, id: i64) -> Result<Release> {
        let stmt = mm
            .db()
            .prepare(
                "SELECT id, app_id, status, version, host, instance_id, commit_id, md5sum, author, created_time, updated_time \
                 FROM dandelion_app_configs WHERE id = ? AND status = 1",
            )
            .await?;
        let mut rows = stmt.query(params![id]).await?;
        let release = match rows.next().await? {
            Some(row) => release_from_row(&row)?,
            None => return Err(Error::ReleaseNotFound(id)),
        };

        if release.app_id != app_id {
            return Err(Error::AppMismatch {
                app_id: app_id.to_string(),
                id,
            });
        }

        let now = Utc::now().timestamp();
        mm.db()
            .execute(
                "UPDATE dandelion_app_configs SET status = 0, updated_time = ? WHERE id = ?",
                params![now, id],
            )
            .await?;

        Ok(release)
    }

    /// Resolve the release an instance deserves: among active rows with
    /// stored `version <= version` (lexicographic TEXT compare), newest
    /// `created_time` first, return the first whose globs match. Rows with
    /// invalid globs are skipped with a warning.
    pub async fn match_release(
        mm: &ModelManager,
        app_id: &str,
        version: &str,
        host: &str,
        instance_id: &str,
    ) -> Result<Release> {
        let stmt = mm
            .db()
            .prepare(
                "SELECT id, app_id, status, version, host, instance_id, commit_id, md5sum, author, created_time, updated_time \
                 FROM dandelion_app_configs \
                 WHERE app_id = ? AND status = 1 AND version <= ? \
                 ORDER BY created_time DESC",
            )
            .await?;
        let mut rows = stmt
            .query(params![app_id.to_string(), version.to_string()])
            .await?;

        while let Some(row) = rows.next().await? {
            let release = release_from_row(&row)?;
            let (host_glob, instance_glob) =
                match (Pattern::new(&release.host), Pattern::new(&release.instance_id)) {
                    (Ok(h), Ok(i)) => (h, i),
                    _ => {
                        warn!(id = release.id, "release host or instance_id glob compile failed");
                        continue;
                    }
                };
            if host_glob.matches(host) && instance_glob.matches(instance_id) {
                return Ok(release);
            }
        }

        Err(Error::NoMatchingRelease)
    }

    /// All active releases for an app, newest first.
    pub async fn list_active(mm: &ModelManager, app_id: &str) -> Result<Vec<Release>> {
        let stmt = mm
            .db()
            .prepare(
                "SELECT id, app_id, status, version, host, instance_id, commit_id, md5sum, author, created_time, updated_time \
                 FROM dandelion_app_configs \
                 WHERE app_id = ? AND status = 1 \
                 ORDER BY created_time DESC",
            )
            .await?;
        let mut rows = stmt.query(params![app_id.to_string()]).await?;

        let mut releases = Vec::new();
        while let Some(row) = rows.next().await? {
            releases.push(release_from_row(&row)?);
        }
        Ok(releases)
    }
}

fn release_from_row(row: &libsql::Row) -> Result<Release> {
    Ok(Release {
        id: row.get(0)?,
        app_id: row.get(1)?,
        status: row.get(2)?,
        version: row.get(3)?,
        host: row.get(4)?,
        instance_id: row.get(5)?,
        commit_id: row.get(6)?,
        md5sum: row.get(7)?,
        author: row.get(8)?,
        created_time: row.get(9)?,
        updated_time: row.get(10)?,
    })
}
