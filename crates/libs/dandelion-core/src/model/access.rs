//! CIDR admission cache.
//!
//! The `dandelion_accesscheck` table holds allow-entries; the checker keeps
//! a parsed copy for five minutes. A failed reload while a valid cache
//! exists keeps serving the cache; invalid CIDRs are dropped with a warning.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use libsql::params;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::Result;
use crate::model::ModelManager;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CheckerState {
    items: Option<Vec<IpNetwork>>,
    expires: Instant,
}

pub struct AccessChecker {
    state: Mutex<CheckerState>,
}

impl AccessChecker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CheckerState {
                items: None,
                expires: Instant::now(),
            }),
        }
    }

    /// Whether `ip` falls inside any enabled allow-entry, reloading the
    /// cache when it is stale.
    pub async fn allow_ip(&self, mm: &ModelManager, ip: IpAddr) -> Result<bool> {
        let mut state = self.state.lock().await;

        let stale = state.items.is_none() || Instant::now() > state.expires;
        if stale {
            match load_items(mm).await {
                Ok(items) => {
                    state.items = Some(items);
                    state.expires = Instant::now() + CACHE_TTL;
                }
                Err(e) if state.items.is_some() => {
                    // soft-fail: keep serving the previous table
                    error!(error = %e, "access check reload failed, serving cached entries");
                }
                Err(e) => return Err(e),
            }
        }

        let items = state.items.as_deref().unwrap_or_default();
        Ok(items.iter().any(|net| net.contains(ip)))
    }
}

impl Default for AccessChecker {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_items(mm: &ModelManager) -> Result<Vec<IpNetwork>> {
    let stmt = mm
        .db()
        .prepare("SELECT id, ip_cidr FROM dandelion_accesscheck WHERE type = 1 AND status = 1 ORDER BY id ASC")
        .await?;
    let mut rows = stmt.query(params![]).await?;

    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        let id: i64 = row.get(0)?;
        let cidr: String = row.get(1)?;
        match cidr.parse::<IpNetwork>() {
            Ok(net) => items.push(net),
            Err(_) => warn!(id, cidr = %cidr, "invalid ip cidr, entry dropped"),
        }
    }
    Ok(items)
}
