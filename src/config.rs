//! Runtime configuration shared by the HTTP layer and the build pipeline.

use crate::gradle::GradleSettings;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_CONCURRENT_BUILDS: usize = 2;
pub const DEFAULT_CLEANUP_GRACE_SECS: u64 = 5;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Parent directory for per-request workspaces.
    pub workspace_root: PathBuf,
    /// Builds allowed to run at once; further requests get 429.
    pub max_concurrent_builds: usize,
    /// Delay between the end of a request and removal of its workspace.
    pub cleanup_grace: Duration,
    pub max_body_bytes: usize,
    pub gradle: GradleSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workspace_root: std::env::temp_dir(),
            max_concurrent_builds: DEFAULT_MAX_CONCURRENT_BUILDS,
            cleanup_grace: Duration::from_secs(DEFAULT_CLEANUP_GRACE_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            gradle: GradleSettings::default(),
        }
    }
}
