//! Model layer: stateless controllers over the database plus the shared
//! service bundle.
//!
//! Each entity pairs a serializable data struct with a `*Bmc` controller of
//! async methods:
//!
//! | BMC | Description |
//! |-----|-------------|
//! | `release::ReleaseBmc` | Release catalog: publish / rollback / match / list |
//! | `instance::InstanceStatusBmc` | Fleet instance heartbeats and status |
//! | `access::AccessChecker` | CIDR admission cache |
//!
//! The [`ModelManager`] bundles what the original kept in process globals:
//! database connection, repository store (behind the process-wide repo
//! mutex), archive cache and configuration.

pub mod access;
pub mod instance;
pub mod release;

use std::sync::Arc;

use dandelion_common::config::AppConfig;
use tokio::sync::Mutex;

use crate::Result;
use crate::store::archive::ArchiveCache;
use crate::store::repo::RepoStore;
use crate::store::{self, Db};

#[derive(Clone)]
pub struct ModelManager {
    pub(crate) db: Db,
    /// Serializes every repository operation. The clone has a single working
    /// tree, so even reads go through here.
    pub repo: Arc<Mutex<RepoStore>>,
    pub archive: Arc<ArchiveCache>,
    pub app_config: Arc<AppConfig>,
    access: Arc<access::AccessChecker>,
}

impl ModelManager {
    /// Constructor
    pub async fn new(app_config: Arc<AppConfig>) -> Result<Self> {
        let db = store::new_db_pool(std::path::Path::new(&app_config.database.path)).await?;
        let repo = RepoStore::open_or_init(&app_config.repository)?;
        let archive = ArchiveCache::new(&app_config.archive.path);

        Ok(ModelManager {
            db,
            repo: Arc::new(Mutex::new(repo)),
            archive: Arc::new(archive),
            app_config,
            access: Arc::new(access::AccessChecker::new()),
        })
    }

    /// Constructor for tests with an already-open database and repository.
    pub fn new_for_test(db: Db, repo: RepoStore, archive_root: &str, app_config: Arc<AppConfig>) -> Self {
        ModelManager {
            db,
            repo: Arc::new(Mutex::new(repo)),
            archive: Arc::new(ArchiveCache::new(archive_root)),
            app_config,
            access: Arc::new(access::AccessChecker::new()),
        }
    }

    /// Returns the db connection reference.
    /// (Only for the model layer)
    pub(in crate::model) fn db(&self) -> &Db {
        &self.db
    }

    /// Returns the db connection for integration tests.
    pub fn db_for_test(&self) -> &Db {
        &self.db
    }

    pub fn access_checker(&self) -> &access::AccessChecker {
        &self.access
    }

    /// Health check - verify database connectivity
    pub async fn health_check(&self) -> Result<bool> {
        let stmt = self.db.prepare("SELECT 1").await?;
        let mut rows = stmt.query(()).await?;
        Ok(rows.next().await?.is_some())
    }
}
