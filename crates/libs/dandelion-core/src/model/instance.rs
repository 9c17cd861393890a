//! Fleet instance status.
//!
//! One row per `(app_id, host, instance_id)`. Agents report transitions over
//! the push channel; heartbeats only bump `updated_time`. The server never
//! stores `offline` — it derives it at read time from heartbeat age.

use chrono::Utc;
use libsql::params;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::model::ModelManager;

/// Instance status codes, stored and transmitted as integers.
pub mod state {
    pub const OFFLINE: i64 = 0;
    pub const CHECKING: i64 = 1;
    pub const SYNCING: i64 = 2;
    pub const SUCCESS: i64 = 3;
    pub const ERROR: i64 = 4;
}

/// Instances older than this are reported `offline`.
const OFFLINE_AFTER_SECS: i64 = 5 * 60;
/// Instance listings only show rows active within the last day.
const ACTIVE_WINDOW_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(skip_serializing, default)]
    pub id: i64,
    pub app_id: String,
    pub host: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub config_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_id: String,
    pub status: i64,
    #[serde(default)]
    pub created_time: i64,
    #[serde(default)]
    pub updated_time: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

pub struct InstanceStatusBmc;

impl InstanceStatusBmc {
    /// Upsert from a `status` push message. Inserts on first sight; on
    /// subsequent reports, rewrites `config_id`/`commit_id` only when one of
    /// them changed, otherwise touches just `status` and `updated_time`.
    pub async fn upsert_status(mm: &ModelManager, payload: &InstanceStatus) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "SELECT id, config_id, commit_id, status FROM dandelion_app_instances \
                 WHERE app_id = ? AND host = ? AND instance_id = ? LIMIT 1",
            )
            .await?;
        let mut rows = stmt
            .query(params![
                payload.app_id.clone(),
                payload.host.clone(),
                payload.instance_id.clone(),
            ])
            .await?;

        let now = Utc::now().timestamp();
        match rows.next().await? {
            None => {
                db.execute(
                    "INSERT INTO dandelion_app_instances \
                     (app_id, host, instance_id, config_id, commit_id, status, created_time, updated_time) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        payload.app_id.clone(),
                        payload.host.clone(),
                        payload.instance_id.clone(),
                        payload.config_id,
                        payload.commit_id.clone(),
                        payload.status,
                        now,
                        now,
                    ],
                )
                .await?;
            }
            Some(row) => {
                let id: i64 = row.get(0)?;
                let config_id: i64 = row.get(1)?;
                let commit_id: String = row.get(2)?;
                if config_id != payload.config_id || commit_id != payload.commit_id {
                    db.execute(
                        "UPDATE dandelion_app_instances \
                         SET config_id = ?, commit_id = ?, status = ?, updated_time = ? WHERE id = ?",
                        params![
                            payload.config_id,
                            payload.commit_id.clone(),
                            payload.status,
                            now,
                            id,
                        ],
                    )
                    .await?;
                } else {
                    db.execute(
                        "UPDATE dandelion_app_instances SET status = ?, updated_time = ? WHERE id = ?",
                        params![payload.status, now, id],
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Heartbeat refresh for already-known rows. Rows that do not exist yet
    /// are left for the next `status` message to create.
    pub async fn refresh_ping(mm: &ModelManager, statuses: &[InstanceStatus]) -> Result<()> {
        let now = Utc::now().timestamp();
        for s in statuses {
            mm.db()
                .execute(
                    "UPDATE dandelion_app_instances \
                     SET config_id = ?, commit_id = ?, status = ?, updated_time = ? \
                     WHERE app_id = ? AND host = ? AND instance_id = ?",
                    params![
                        s.config_id,
                        s.commit_id.clone(),
                        s.status,
                        now,
                        s.app_id.clone(),
                        s.host.clone(),
                        s.instance_id.clone(),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Instances seen in the last 24h, newest first. Rows whose heartbeat is
    /// older than five minutes are reported `offline` without touching
    /// storage.
    pub async fn list_active(mm: &ModelManager, app_id: &str) -> Result<Vec<InstanceStatus>> {
        let since = Utc::now().timestamp() - ACTIVE_WINDOW_SECS;
        let stmt = mm
            .db()
            .prepare(
                "SELECT id, app_id, host, instance_id, config_id, commit_id, status, created_time, updated_time \
                 FROM dandelion_app_instances \
                 WHERE app_id = ? AND updated_time >= ? \
                 ORDER BY updated_time DESC",
            )
            .await?;
        let mut rows = stmt.query(params![app_id.to_string(), since]).await?;

        let offline_before = Utc::now().timestamp() - OFFLINE_AFTER_SECS;
        let mut statuses = Vec::new();
        while let Some(row) = rows.next().await? {
            let mut status = InstanceStatus {
                id: row.get(0)?,
                app_id: row.get(1)?,
                host: row.get(2)?,
                instance_id: row.get(3)?,
                config_id: row.get(4)?,
                commit_id: row.get(5)?,
                status: row.get(6)?,
                created_time: row.get(7)?,
                updated_time: row.get(8)?,
            };
            if status.updated_time < offline_before {
                status.status = state::OFFLINE;
            }
            statuses.push(status);
        }
        Ok(statuses)
    }
}
