//! apk-forge - HTTP service that compiles Android sources into an APK.
//!
//! Usage:
//!   apk-forge [--port 3000] [--workspace-root /tmp]   # Start HTTP server
//!
//! Every flag can also be set through the environment (`PORT`, ...).

mod config;
mod error;
mod fetch;
mod gradle;
mod http_server;
mod manifest;
mod project;
mod request;
mod state;
mod workspace;

use clap::Parser;
use config::ServerConfig;
use gradle::{GradleSettings, GradleToolchain};
use state::AppState;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "apk-forge")]
#[command(about = "Compile Android sources into an APK over HTTP")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Directory under which per-request workspaces are created
    #[arg(long, env = "APK_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Builds allowed to run at once; extra requests get 429
    #[arg(long, env = "APK_MAX_CONCURRENT_BUILDS", default_value_t = config::DEFAULT_MAX_CONCURRENT_BUILDS)]
    max_concurrent_builds: usize,

    /// Kill a build that runs longer than this
    #[arg(long, env = "APK_BUILD_TIMEOUT_SECS", default_value = "900")]
    build_timeout_secs: u64,

    /// Seconds to wait after a request before deleting its workspace
    #[arg(long, env = "APK_CLEANUP_GRACE_SECS", default_value_t = config::DEFAULT_CLEANUP_GRACE_SECS)]
    cleanup_grace_secs: u64,

    /// Where the Gradle wrapper jar is downloaded from
    #[arg(long, env = "GRADLE_WRAPPER_JAR_URL", default_value = gradle::DEFAULT_WRAPPER_JAR_URL)]
    wrapper_jar_url: String,

    /// Give up on a wrapper jar download after this many seconds
    #[arg(long, env = "APK_FETCH_TIMEOUT_SECS", default_value = "120")]
    fetch_timeout_secs: u64,

    /// Redirect hops allowed while fetching the wrapper jar
    #[arg(long, env = "APK_MAX_REDIRECTS", default_value = "5")]
    max_redirects: usize,

    /// GRADLE_OPTS passed to the build
    #[arg(long, env = "APK_GRADLE_OPTS", default_value = gradle::DEFAULT_GRADLE_OPTS)]
    gradle_opts: String,

    /// Largest accepted request body in bytes
    #[arg(long, env = "APK_MAX_BODY_BYTES", default_value_t = config::DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            workspace_root: self.workspace_root.unwrap_or_else(std::env::temp_dir),
            max_concurrent_builds: self.max_concurrent_builds,
            cleanup_grace: Duration::from_secs(self.cleanup_grace_secs),
            max_body_bytes: self.max_body_bytes,
            gradle: GradleSettings {
                wrapper_jar_url: self.wrapper_jar_url,
                max_redirects: self.max_redirects,
                fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
                build_timeout: Duration::from_secs(self.build_timeout_secs),
                gradle_opts: self.gradle_opts,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();
    info!(
        port = config.port,
        workspace_root = %config.workspace_root.display(),
        max_concurrent_builds = config.max_concurrent_builds,
        build_timeout = ?config.gradle.build_timeout,
        "Configuration loaded"
    );

    let client = match fetch::client(config.gradle.fetch_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build HTTP client");
            exit(1);
        }
    };
    let toolchain = Arc::new(GradleToolchain::new(client, config.gradle.clone()));
    let state = AppState::new(config, toolchain);

    if let Err(e) = http_server::run_server(state).await {
        error!(error = %e, "Server error");
        exit(1);
    }
}
