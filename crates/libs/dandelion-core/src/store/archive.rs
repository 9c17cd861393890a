//! Per-commit zip archive cache.
//!
//! Artifacts live at `<root>/<app_id>/<commit_id>.zip` and contain every
//! non-dot file of the commit tree, deflated, with entry mtimes set to the
//! commit author time. Builds are exclusive; reads are shared. A build runs
//! while holding the write lock and then the repository lock, writing to a
//! temp name and renaming so readers never observe a half-written archive.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, Timelike};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::Result;
use crate::store::repo::RepoStore;

pub struct ArchiveCache {
    root: PathBuf,
    lock: RwLock<()>,
}

impl ArchiveCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
        }
    }

    /// Deterministic artifact location for a `(app_id, commit_id)` pair.
    pub fn archive_path(&self, app_id: &str, commit_id: &str) -> PathBuf {
        self.root.join(app_id).join(format!("{commit_id}.zip"))
    }

    /// Return the archive path, building the artifact first when absent.
    ///
    /// Lock protocol: shared read to probe, exclusive write to build (with a
    /// re-check after acquiring it, so concurrent requests build only once),
    /// and the repository mutex only inside the write section.
    pub async fn get_or_build(
        &self,
        repo: &Arc<Mutex<RepoStore>>,
        app_id: &str,
        commit_id: &str,
    ) -> Result<PathBuf> {
        let path = self.archive_path(app_id, commit_id);

        {
            let _read = self.lock.read().await;
            if path.is_file() {
                return Ok(path);
            }
        }

        let _write = self.lock.write().await;
        if path.is_file() {
            // another request built it while we waited
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(app_id = %app_id, commit_id = %commit_id, "building archive");
        let repo = repo.lock().await;
        build_zip(&repo, app_id, commit_id, &path)?;
        Ok(path)
    }
}

fn build_zip(repo: &RepoStore, app_id: &str, commit_id: &str, dest: &Path) -> Result<()> {
    let commit = repo.commit_info(app_id, commit_id)?;
    let when = commit.author.when;

    let mut options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    if let Ok(mtime) = zip::DateTime::from_date_and_time(
        when.year() as u16,
        when.month() as u8,
        when.day() as u8,
        when.hour() as u8,
        when.minute() as u8,
        when.second() as u8,
    ) {
        options = options.last_modified_time(mtime);
    }

    // temp name in the same directory so the rename is atomic
    let tmp = dest.with_extension(format!("zip.tmp-{}", std::process::id()));
    let result = (|| -> Result<()> {
        let file = std::fs::File::create(&tmp)?;
        let mut writer = zip::ZipWriter::new(file);
        for (name, oid) in repo.tree_files(commit_id)? {
            writer.start_file(name, options)?;
            writer.write_all(&repo.blob_content(oid)?)?;
        }
        writer.finish()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            std::fs::rename(&tmp, dest)?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}
