//! Gradle wrapper bootstrap and build invocation.

use crate::fetch::{self, FetchError};
use futures_util::future::BoxFuture;
use reqwest::Client;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

pub const DEFAULT_WRAPPER_JAR_URL: &str =
    "https://raw.githubusercontent.com/gradle/gradle/v7.5.1/gradle/wrapper/gradle-wrapper.jar";
pub const DEFAULT_GRADLE_OPTS: &str = "-Xmx512m -Dorg.gradle.daemon=false";
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Where AGP leaves the release APK, relative to the project root.
pub const ARTIFACT_DIR: &str = "app/build/outputs/apk/release";
/// Unsigned output first; a signed name only appears if the sources add a signing config.
pub const ARTIFACT_NAMES: [&str; 2] = ["app-release-unsigned.apk", "app-release.apk"];

const LAUNCHER: &str = "gradlew";
const LAUNCHER_SCRIPT: &str = include_str!("templates/gradlew");
const WRAPPER_DIR: &str = "gradle/wrapper";
const WRAPPER_PROPERTIES: &str = include_str!("templates/gradle-wrapper.properties");

const GRADLE_ARGS: [&str; 6] = [
    "assembleRelease",
    "--no-daemon",
    "--no-build-cache",
    "--no-parallel",
    "--max-workers=1",
    "--console=plain",
];

const SPAWN_ATTEMPTS: u32 = 3;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct GradleSettings {
    pub wrapper_jar_url: String,
    pub max_redirects: usize,
    /// Per-request bound on the wrapper jar download.
    pub fetch_timeout: Duration,
    pub build_timeout: Duration,
    /// Exported as `GRADLE_OPTS` on top of the inherited environment.
    pub gradle_opts: String,
}

impl Default for GradleSettings {
    fn default() -> Self {
        Self {
            wrapper_jar_url: DEFAULT_WRAPPER_JAR_URL.to_string(),
            max_redirects: 5,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            build_timeout: Duration::from_secs(900),
            gradle_opts: DEFAULT_GRADLE_OPTS.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to prepare {what}: {source}")]
    Bootstrap {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to fetch Gradle wrapper: {0}")]
    Fetch(#[from] FetchError),
    #[error("failed to start Gradle: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed waiting for Gradle: {0}")]
    Wait(#[source] io::Error),
    #[error("Gradle build failed ({}):\n{stderr}", describe_exit(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("Gradle build timed out after {after:?}:\n{stderr}")]
    TimedOut { after: Duration, stderr: String },
    #[error("artifact not found after build in {}", .dir.display())]
    ArtifactMissing { dir: PathBuf },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Something that turns a materialized project directory into an APK.
pub trait Toolchain: Send + Sync {
    /// Build the project and return the path of the produced artifact.
    fn assemble<'a>(&'a self, project_dir: &'a Path) -> BoxFuture<'a, Result<PathBuf, BuildError>>;
}

/// Runs the real Gradle wrapper, bootstrapped fresh into every project.
pub struct GradleToolchain {
    client: Client,
    settings: GradleSettings,
}

impl GradleToolchain {
    pub fn new(client: Client, settings: GradleSettings) -> Self {
        Self { client, settings }
    }

    /// Write the launcher script and wrapper properties, then fetch the
    /// wrapper jar. Each step must succeed before Gradle can be started.
    pub async fn bootstrap(&self, project_dir: &Path) -> Result<(), BuildError> {
        let launcher = project_dir.join(LAUNCHER);
        tokio::fs::write(&launcher, LAUNCHER_SCRIPT)
            .await
            .map_err(|source| BuildError::Bootstrap {
                what: "launcher script",
                source,
            })?;
        make_executable(&launcher)
            .await
            .map_err(|source| BuildError::Bootstrap {
                what: "launcher permissions",
                source,
            })?;

        let wrapper_dir = project_dir.join(WRAPPER_DIR);
        tokio::fs::create_dir_all(&wrapper_dir)
            .await
            .map_err(|source| BuildError::Bootstrap {
                what: "wrapper directory",
                source,
            })?;
        tokio::fs::write(wrapper_dir.join("gradle-wrapper.properties"), WRAPPER_PROPERTIES)
            .await
            .map_err(|source| BuildError::Bootstrap {
                what: "wrapper properties",
                source,
            })?;

        fetch::download(
            &self.client,
            &self.settings.wrapper_jar_url,
            &wrapper_dir.join("gradle-wrapper.jar"),
            self.settings.max_redirects,
        )
        .await?;

        info!("Gradle wrapper bootstrapped");
        Ok(())
    }

    /// Run `gradlew assembleRelease` in `project_dir` and resolve the outcome.
    pub async fn invoke(&self, project_dir: &Path) -> Result<PathBuf, BuildError> {
        let started = Instant::now();
        let mut child = spawn_launcher(project_dir, &self.settings.gradle_opts).await?;
        let group = ProcessGroup::of(&child);
        info!(pid = ?child.id(), args = ?GRADLE_ARGS, "Gradle started");

        let stdout = tokio::spawn(
            collect_output(child.stdout.take(), OutputStream::Stdout).in_current_span(),
        );
        let stderr = tokio::spawn(
            collect_output(child.stderr.take(), OutputStream::Stderr).in_current_span(),
        );

        let status = match tokio::time::timeout(self.settings.build_timeout, child.wait()).await {
            Ok(status) => status.map_err(BuildError::Wait)?,
            Err(_) => {
                warn!(
                    timeout = ?self.settings.build_timeout,
                    "Gradle timed out, killing process group"
                );
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill Gradle");
                }
                drain(stdout).await;
                return Err(BuildError::TimedOut {
                    after: self.settings.build_timeout,
                    stderr: drain(stderr).await,
                });
            }
        };
        drain(stdout).await;
        let stderr = drain(stderr).await;
        let elapsed = started.elapsed();

        if !status.success() {
            error!(exit_code = ?status.code(), ?elapsed, "Gradle build failed");
            return Err(BuildError::Failed {
                exit_code: status.code(),
                stderr,
            });
        }

        match find_artifact(project_dir).await {
            Some(artifact) => {
                info!(artifact = %artifact.display(), ?elapsed, "Gradle build succeeded");
                Ok(artifact)
            }
            None => {
                error!(?elapsed, "Gradle exited cleanly but produced no artifact");
                Err(BuildError::ArtifactMissing {
                    dir: project_dir.join(ARTIFACT_DIR),
                })
            }
        }
    }
}

impl Toolchain for GradleToolchain {
    fn assemble<'a>(&'a self, project_dir: &'a Path) -> BoxFuture<'a, Result<PathBuf, BuildError>> {
        Box::pin(async move {
            self.bootstrap(project_dir).await?;
            self.invoke(project_dir).await
        })
    }
}

async fn spawn_launcher(project_dir: &Path, gradle_opts: &str) -> Result<Child, BuildError> {
    let mut attempt = 1;
    loop {
        let mut command = Command::new(project_dir.join(LAUNCHER));
        command
            .args(GRADLE_ARGS)
            .current_dir(project_dir)
            .env("GRADLE_OPTS", gradle_opts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        match command.spawn() {
            Ok(child) => return Ok(child),
            // ETXTBSY: another thread forked while the launcher was still open for writing.
            Err(e) if is_text_file_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                warn!(attempt, "Launcher busy, retrying spawn");
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(BuildError::Spawn(e)),
        }
    }
}

#[cfg(unix)]
fn is_text_file_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
}

#[cfg(not(unix))]
fn is_text_file_busy(_: &io::Error) -> bool {
    false
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_: &Path) -> io::Result<()> {
    Ok(())
}

/// The process group led by the launcher.
///
/// Dropping it SIGKILLs every member, including daemons and workers the
/// launcher forked, whether the build finished, timed out or was cancelled
/// along with its request.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { leader: child.id() }
    }

    #[cfg(unix)]
    fn kill(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.leader.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        match kill(Pid::from_raw(-pgid), Signal::SIGKILL) {
            // Nothing left in the group.
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid, error = %e, "Failed to signal Gradle process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) {
        let _ = self.leader;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Forward each line to the log and keep the whole text.
async fn collect_output<R>(reader: Option<R>, stream: OutputStream) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim_end();
                match stream {
                    OutputStream::Stdout => info!(target: "gradle", "{trimmed}"),
                    OutputStream::Stderr => warn!(target: "gradle", "{trimmed}"),
                }
                collected.push_str(&text);
            }
            Err(e) => {
                warn!(?stream, error = %e, "Stopped reading Gradle output");
                break;
            }
        }
    }
    collected
}

async fn drain(task: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            warn!("Gradle output still open after exit, giving up on it");
            String::new()
        }
    }
}

async fn find_artifact(project_dir: &Path) -> Option<PathBuf> {
    let dir = project_dir.join(ARTIFACT_DIR);
    for name in ARTIFACT_NAMES {
        let candidate = dir.join(name);
        if let Ok(meta) = tokio::fs::metadata(&candidate).await {
            if meta.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}
