//! Disposable per-request build directories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DIR_PREFIX: &str = "apk-build-";

/// Owns the removals scheduled by dropped workspaces.
///
/// [`Reaper::shutdown`] cuts every pending grace period short and waits
/// until each scheduled removal has run, so no directory outlives the
/// process.
#[derive(Debug, Clone, Default)]
pub struct Reaper {
    tasks: TaskTracker,
    expedite: CancellationToken,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn shutdown(&self) {
        self.expedite.cancel();
        self.tasks.close();
        info!(pending = self.tasks.len(), "Waiting for workspace removals");
        self.tasks.wait().await;
    }
}

/// A uniquely named directory owned by exactly one request.
///
/// Dropping the value schedules removal of the whole tree. Whatever path a
/// request takes (rejection after creation, failed build, finished or
/// aborted download) the directory goes away with it.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    root: PathBuf,
    cleanup_grace: Duration,
    reaper: Reaper,
}

impl Workspace {
    /// Create `<parent>/apk-build-<uuid>`.
    pub fn create(parent: &Path, cleanup_grace: Duration, reaper: &Reaper) -> io::Result<Self> {
        fs::create_dir_all(parent)?;
        // The launcher is spawned by path from inside the workspace, so keep it absolute.
        let parent = fs::canonicalize(parent)?;
        let id = Uuid::new_v4();
        let root = parent.join(format!("{DIR_PREFIX}{id}"));
        // create_dir (not _all) so a colliding name is an error rather than shared.
        fs::create_dir(&root)?;
        info!(build_id = %id, root = %root.display(), "Workspace created");
        Ok(Self {
            id,
            root,
            cleanup_grace,
            reaper: reaper.clone(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let root = std::mem::take(&mut self.root);
        let id = self.id;
        let grace = self.cleanup_grace;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let expedite = self.reaper.expedite.clone();
                let removal = async move {
                    if !grace.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(grace) => {}
                            _ = expedite.cancelled() => {}
                        }
                    }
                    let result = tokio::fs::remove_dir_all(&root).await;
                    log_removal(id, &root, result);
                };
                self.reaper.tasks.spawn_on(removal, &handle);
            }
            Err(_) => {
                let result = fs::remove_dir_all(&root);
                log_removal(id, &root, result);
            }
        }
    }
}

fn log_removal(id: Uuid, root: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => info!(build_id = %id, "Workspace removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(build_id = %id, "Workspace already gone");
        }
        Err(e) => warn!(build_id = %id, root = %root.display(), error = %e, "Failed to remove workspace"),
    }
}
