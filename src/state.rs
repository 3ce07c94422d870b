//! Shared application state.

use crate::config::ServerConfig;
use crate::gradle::Toolchain;
use crate::workspace::Reaper;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Cloned into every handler. Holds no per-request data; each build owns
/// its workspace exclusively.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub toolchain: Arc<dyn Toolchain>,
    /// One permit per build allowed to run concurrently.
    pub build_slots: Arc<Semaphore>,
    pub reaper: Reaper,
}

impl AppState {
    pub fn new(config: ServerConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        let slots = config.max_concurrent_builds.max(1);
        Self {
            config: Arc::new(config),
            toolchain,
            build_slots: Arc::new(Semaphore::new(slots)),
            reaper: Reaper::new(),
        }
    }
}
