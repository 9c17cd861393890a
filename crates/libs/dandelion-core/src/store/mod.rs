//! Low-level storage: the libsql database, the Git content store and the
//! archive cache.
//!
//! The database is a single SQLite file configured for concurrent access
//! (WAL, busy timeout). Migrations are embedded and idempotent.

use std::path::Path;

use libsql::{Builder, Connection};

use crate::Result;

/// Type alias for database connections.
pub type Db = Connection;

/// Per-commit zip archive cache.
pub mod archive;
/// Git-backed content store.
pub mod repo;

/// Open (or create) the database at `db_path` and apply migrations.
pub async fn new_db_pool(db_path: &Path) -> Result<Db> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Builder::new_local(db_path).build().await?;
    let conn = db.connect()?;

    // WAL mode: concurrent reads during writes; generous busy timeout so
    // status upserts from many agents queue instead of failing.
    let _ = conn.execute("PRAGMA journal_mode=WAL;", ()).await;
    let _ = conn.execute("PRAGMA busy_timeout=30000;", ()).await;
    let _ = conn.execute("PRAGMA synchronous=NORMAL;", ()).await;

    let migrations = [include_str!("../../../../../migrations/001_initial_schema.sql")];
    for migration in &migrations {
        conn.execute_batch(migration).await?;
    }

    Ok(conn)
}
