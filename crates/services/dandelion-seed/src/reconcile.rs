//! The reconcile loop: make on-disk files equal to the matched release.
//!
//! For each configured app section the agent reads its metadata identity,
//! asks the server which release it deserves, hash-checks the local copy
//! and, when dirty, pulls the commit archive and rewrites only the files
//! whose per-file hash disagrees. A reload command runs after every resync.
//!
//! A per-app lock serializes reconciles of the same app; one app failing
//! never aborts the process.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;

use dandelion_client::{ClientConfig, DandelionClient};
use dandelion_core::model::instance::{InstanceStatus, state};
use dandelion_core::model::release::Release;
use dandelion_core::notify::NotifyMessage;
use regex::Regex;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

use crate::config::{AppSection, SeedConfig};

/// A path the release expects to be a file is a directory locally. Fatal
/// for that app; reconcile cannot proceed.
#[derive(Debug, thiserror::Error)]
#[error("config file is occupied by the directory")]
pub struct FileOccupiedByDir;

static METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)] // the pattern is a literal
    Regex::new(r#""?(version|host|instance_id)"?\s*[=:]\s*"?(\S+?)["\s$]"#)
        .expect("metadata regex")
});

fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Read the matching identity from the app's metadata files. Last match
/// wins; absent keys fall back to env vars and the hostname.
pub async fn read_metadata(
    app_id: &str,
    app_path: &str,
    meta_files: &[String],
) -> anyhow::Result<ClientConfig> {
    let hostname = default_hostname();
    let mut cfg = ClientConfig {
        app_id: app_id.to_string(),
        host: std::env::var("NODE_NAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| hostname.clone()),
        instance_id: std::env::var("INSTANCE_ID").unwrap_or(hostname),
        version: "0".to_string(),
    };

    for meta_file in meta_files {
        let path = Path::new(app_path).join(meta_file);
        let data = tokio::fs::read_to_string(&path).await?;
        for capture in METADATA_RE.captures_iter(&data) {
            let value = capture[2].to_string();
            match &capture[1] {
                "host" => cfg.host = value,
                "instance_id" => cfg.instance_id = value,
                "version" => cfg.version = value,
                _ => {}
            }
        }
    }

    debug!(app_id = %app_id, host = %cfg.host, instance_id = %cfg.instance_id, version = %cfg.version, "client config");
    Ok(cfg)
}

pub struct Agent {
    pub conf: Arc<SeedConfig>,
    pub client: DandelionClient,
    app_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    last_status: Mutex<HashMap<String, InstanceStatus>>,
    status_tx: Mutex<Option<mpsc::Sender<InstanceStatus>>>,
}

impl Agent {
    pub fn new(conf: Arc<SeedConfig>) -> anyhow::Result<Self> {
        let client = DandelionClient::new(&conf.dandelion.url)?;
        Ok(Self {
            conf,
            client,
            app_locks: Mutex::new(HashMap::new()),
            last_status: Mutex::new(HashMap::new()),
            status_tx: Mutex::new(None),
        })
    }

    /// Attach (or detach) the channel carrying status reports to the push
    /// connection. Recreated on every reconnect.
    pub async fn set_status_channel(&self, tx: Option<mpsc::Sender<InstanceStatus>>) {
        *self.status_tx.lock().await = tx;
    }

    /// Last-reported status per app, for heartbeats.
    pub async fn last_statuses(&self) -> Vec<InstanceStatus> {
        self.last_status.lock().await.values().cloned().collect()
    }

    async fn set_status(
        &self,
        identity: &ClientConfig,
        status_code: i64,
        release: Option<&Release>,
    ) {
        let status = InstanceStatus {
            id: 0,
            app_id: identity.app_id.clone(),
            host: identity.host.clone(),
            instance_id: identity.instance_id.clone(),
            config_id: release.map(|r| r.id).unwrap_or_default(),
            commit_id: release.map(|r| r.commit_id.clone()).unwrap_or_default(),
            status: status_code,
            created_time: 0,
            updated_time: 0,
        };
        self.last_status
            .lock()
            .await
            .insert(identity.app_id.clone(), status.clone());
        let tx = self.status_tx.lock().await;
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(status).await;
        }
    }

    async fn app_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.app_locks.lock().await;
        Arc::clone(locks.entry(app_id.to_string()).or_default())
    }

    /// Reconcile one app section. Always reports a terminal success/error
    /// status so the server can tell "reconciling" from "silent".
    pub async fn check_app(&self, section: &AppSection) -> anyhow::Result<()> {
        let lock = self.app_lock(&section.app_id).await;
        let _guard = lock.lock().await;

        debug!(app_id = %section.app_id, "checking");
        let identity =
            read_metadata(&section.app_id, &section.path, &section.meta_files).await?;

        self.set_status(&identity, state::CHECKING, None).await;

        let result = self.reconcile(section, &identity).await;
        match &result {
            Ok(release) => {
                self.set_status(&identity, state::SUCCESS, Some(release)).await;
            }
            Err(e) => {
                error!(app_id = %section.app_id, error = %e, "reconcile failed");
                self.set_status(&identity, state::ERROR, None).await;
            }
        }
        result.map(|_| ())
    }

    async fn reconcile(
        &self,
        section: &AppSection,
        identity: &ClientConfig,
    ) -> anyhow::Result<Release> {
        let release = self.client.match_release(identity).await?;
        let files = self
            .client
            .list_files(&release.app_id, &release.commit_id)
            .await?;

        let dirty = self.is_dirty(section, &release, &files).await?;
        if dirty {
            self.set_status(identity, state::SYNCING, Some(&release)).await;
            self.resync(section, &release, &files).await?;
        }
        Ok(release)
    }

    /// Concatenated-MD5 comparison against the release hash. A missing file
    /// short-circuits to dirty; a directory in a file's place is fatal.
    async fn is_dirty(
        &self,
        section: &AppSection,
        release: &Release,
        files: &[String],
    ) -> anyhow::Result<bool> {
        let mut ctx = md5::Context::new();
        for file in files {
            let path = Path::new(&section.path).join(file);
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!(app_id = %release.app_id, file = %file, "config file lost");
                    return Ok(true);
                }
                Err(e) => return Err(e.into()),
            };
            if meta.is_dir() {
                return Err(FileOccupiedByDir.into());
            }
            ctx.consume(tokio::fs::read(&path).await?);
        }

        let md5sum = format!("{:x}", ctx.compute());
        if md5sum != release.md5sum {
            info!(
                app_id = %release.app_id,
                local = %md5sum,
                expected = %release.md5sum,
                "config md5sum mismatch"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Pull the commit archive and rewrite out-of-date files. Files whose
    /// per-file hash already matches are left untouched (their mtimes do
    /// not move); rewritten files take the archive entry's mtime.
    async fn resync(
        &self,
        section: &AppSection,
        release: &Release,
        files: &[String],
    ) -> anyhow::Result<()> {
        info!(app_id = %release.app_id, commit_id = %release.commit_id, "resyncing config files");

        let archive_path = std::env::temp_dir().join(format!(
            "dandelion-seed-{}-{}.zip",
            release.app_id, release.commit_id
        ));
        self.client
            .download_archive(&release.app_id, &release.commit_id, &archive_path)
            .await?;

        let ownership = Ownership::resolve(section)?;
        let result = self.apply_archive(section, files, &archive_path, &ownership);
        let _ = tokio::fs::remove_file(&archive_path).await;
        result?;

        if !section.exec_reload.is_empty() {
            run_reload(&section.app_id, &section.exec_reload).await?;
        }
        Ok(())
    }

    fn apply_archive(
        &self,
        section: &AppSection,
        files: &[String],
        archive_path: &Path,
        ownership: &Ownership,
    ) -> anyhow::Result<()> {
        let archive = std::fs::File::open(archive_path)?;
        let mut zip = zip::ZipArchive::new(archive)?;

        for file in files {
            let target = Path::new(&section.path).join(file);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut entry = zip.by_name(file)?;
            let mut content = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut content)?;

            let needs_write = match std::fs::read(&target) {
                Ok(local) => {
                    format!("{:x}", md5::compute(&local)) != format!("{:x}", md5::compute(&content))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                Err(e) => return Err(e.into()),
            };

            if needs_write {
                let mtime = entry_mtime(entry.last_modified());
                write_atomic(&target, &content)?;
                if let Some(mtime) = mtime {
                    let dest = std::fs::File::options().write(true).open(&target)?;
                    let times = std::fs::FileTimes::new().set_modified(mtime);
                    let _ = dest.set_times(times);
                }
                debug!(file = %file, "rewritten");
            }

            ownership.apply(&target)?;
        }
        Ok(())
    }

    /// Reconcile every configured section, in order. Failures log and move
    /// on; the first error is surfaced for `--sync-only` exit codes.
    pub async fn check_all(&self) -> anyhow::Result<()> {
        let mut first_err = None;
        for section in &self.conf.configs {
            if let Err(e) = self.check_app(section).await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// React to a push notification: re-reconcile every section for the
    /// message's app.
    pub async fn handle_notify(&self, msg: &NotifyMessage) {
        info!(event = ?msg.event, app_id = %msg.app_id, "notification received");
        for section in self.conf.configs.iter().filter(|s| s.app_id == msg.app_id) {
            if let Err(e) = self.check_app(section).await {
                error!(app_id = %msg.app_id, error = %e, "handle notification error");
            }
        }
    }

    /// Whether any section manages this app id.
    pub fn knows_app(&self, app_id: &str) -> bool {
        self.conf.configs.iter().any(|s| s.app_id == app_id)
    }
}

/// Write via a temp file in the target directory, then rename over.
fn write_atomic(target: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp: PathBuf = target.with_extension("dandelion-tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, target)
}

fn entry_mtime(dt: Option<zip::DateTime>) -> Option<std::time::SystemTime> {
    let dt = dt?;
    let date = chrono::NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?;
    let naive = date.and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?;
    let secs = naive.and_utc().timestamp();
    if secs < 0 {
        return None;
    }
    Some(std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs as u64))
}

/// Resolved chown/chmod settings for a section.
struct Ownership {
    #[cfg(unix)]
    uid: Option<nix::unistd::Uid>,
    #[cfg(unix)]
    gid: Option<nix::unistd::Gid>,
    mode: Option<u32>,
}

impl Ownership {
    fn resolve(section: &AppSection) -> anyhow::Result<Self> {
        let mode = if section.chmod.is_empty() {
            None
        } else {
            Some(u32::from_str_radix(&section.chmod, 8)?)
        };

        #[cfg(unix)]
        {
            let (uid, gid) = if section.chown.is_empty() {
                (None, None)
            } else {
                let mut parts = section.chown.splitn(2, ':');
                let user_name = parts.next().unwrap_or_default();
                let user = nix::unistd::User::from_name(user_name)?
                    .ok_or_else(|| anyhow::anyhow!("unknown user '{user_name}'"))?;
                let gid = match parts.next() {
                    Some(group_name) => {
                        let group = nix::unistd::Group::from_name(group_name)?
                            .ok_or_else(|| anyhow::anyhow!("unknown group '{group_name}'"))?;
                        group.gid
                    }
                    None => user.gid,
                };
                (Some(user.uid), Some(gid))
            };
            Ok(Self { uid, gid, mode })
        }

        #[cfg(not(unix))]
        Ok(Self { mode })
    }

    fn apply(&self, path: &Path) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            if self.uid.is_some() {
                nix::unistd::chown(path, self.uid, self.gid)?;
            }
            if let Some(mode) = self.mode {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
            }
        }
        #[cfg(not(unix))]
        let _ = (path, self.mode);
        Ok(())
    }
}

async fn run_reload(app_id: &str, command: &str) -> anyhow::Result<()> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    let Some((program, args)) = parts.split_first() else {
        return Ok(());
    };

    let output = tokio::process::Command::new(program).args(args).output().await?;
    if output.stdout.is_empty() {
        info!(app_id = %app_id, "exec reload");
    } else {
        info!(app_id = %app_id, output = %String::from_utf8_lossy(&output.stdout), "exec reload");
    }
    if !output.status.success() {
        anyhow::bail!("reload command exited with {}", output.status);
    }
    Ok(())
}
