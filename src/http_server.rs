//! HTTP server implementation using Axum.

use crate::error::ApiError;
use crate::project;
use crate::request::CompileRequest;
use crate::state::AppState;
use crate::workspace::Workspace;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, info_span, Instrument};

const APK_CONTENT_TYPE: &str = "application/vnd.android.package-archive";
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

/// Build the router with all routes and layers.
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/compile-apk", post(compile_apk))
        // Health check
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until Ctrl-C or SIGTERM, then finish removing every
/// workspace before returning.
pub async fn run_server(state: AppState) -> io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    serve(listener, state, shutdown_signal()).await
}

async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    signal: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let reaper = state.reaper.clone();
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(signal)
        .await;
    reaper.shutdown().await;
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        message: "APK compile service is running",
    })
}

/// A body that is not a JSON object, including one sent without a JSON
/// content type, is rejected with "Invalid request body"; the missing-files
/// error is reserved for well-formed requests that lack a source.
async fn compile_apk(
    State(state): State<AppState>,
    payload: Result<Json<CompileRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidBody(e.body_text()))?;
    let sources = request.validate()?;

    let permit = state
        .build_slots
        .clone()
        .try_acquire_owned()
        .map_err(|_| ApiError::Busy {
            limit: state.config.max_concurrent_builds,
        })?;

    let workspace = tokio::task::spawn_blocking({
        let parent = state.config.workspace_root.clone();
        let grace = state.config.cleanup_grace;
        let reaper = state.reaper.clone();
        move || Workspace::create(&parent, grace, &reaper)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(ApiError::Workspace)?;

    let span = info_span!("build", build_id = %workspace.id(), app_name = %sources.app_name);
    async move {
        info!("POST /compile-apk - building");
        let app_name = sources.app_name.clone();

        let root = workspace.path().to_path_buf();
        tokio::task::spawn_blocking(move || project::materialize(&root, &sources))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(ApiError::Materialize)?;

        let artifact = state.toolchain.assemble(workspace.path()).await?;
        drop(permit);

        artifact_response(&app_name, &artifact, workspace).await
    }
    .instrument(span)
    .await
}

/// Respond with the artifact streamed from disk. The body owns the
/// workspace, so it is removed once the last chunk is out or the client
/// goes away.
async fn artifact_response(
    app_name: &str,
    artifact: &Path,
    workspace: Workspace,
) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(artifact)
        .await
        .map_err(ApiError::Artifact)?;
    let len = file.metadata().await.map_err(ApiError::Artifact)?.len();
    let build_id = workspace.id().to_string();
    info!(bytes = len, "Sending artifact");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, APK_CONTENT_TYPE)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.apk\"", download_name(app_name)),
        )
        .header(header::CONTENT_LENGTH, len)
        .header("x-build-id", build_id)
        .body(Body::from_stream(artifact_stream(file, workspace)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn artifact_stream(
    file: tokio::fs::File,
    workspace: Workspace,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    futures_util::stream::try_unfold((file, workspace), |(mut file, workspace)| async move {
        let mut buf = vec![0u8; STREAM_CHUNK];
        match file.read(&mut buf).await {
            Ok(0) => {
                info!(build_id = %workspace.id(), "Artifact sent");
                Ok(None)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), (file, workspace))))
            }
            Err(e) => {
                error!(build_id = %workspace.id(), error = %e, "Failed to stream artifact");
                Err(e)
            }
        }
    })
}

/// File name safe to embed in a quoted `Content-Disposition` parameter.
fn download_name(app_name: &str) -> String {
    app_name
        .chars()
        .map(|c| match c {
            '"' | '\\' | '/' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::fetch::{
        self,
        tests::{spawn_fake_repository, spawn_silent_listener, test_client},
    };
    use crate::gradle::{
        BuildError, GradleSettings, GradleToolchain, Toolchain, ARTIFACT_DIR, ARTIFACT_NAMES,
    };
    use crate::workspace::tests::wait_for_removal;
    use axum::http::Request;
    use futures_util::future::BoxFuture;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    const DUMMY_APK: &[u8] = b"PK\x03\x04dummy-apk-contents";

    enum Outcome {
        Succeed,
        Fail { exit_code: i32, stderr: &'static str },
    }

    /// Stands in for Gradle: checks the project exists, then writes a dummy
    /// artifact or fails the way a real build would.
    struct ScriptedToolchain {
        outcome: Outcome,
        calls: AtomicUsize,
    }

    impl ScriptedToolchain {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Toolchain for ScriptedToolchain {
        fn assemble<'a>(
            &'a self,
            project_dir: &'a Path,
        ) -> BoxFuture<'a, Result<PathBuf, BuildError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                assert!(project_dir.join("app/src/main/AndroidManifest.xml").is_file());
                assert!(project_dir
                    .join("app/src/main/java/com/example/demo/MainActivity.java")
                    .is_file());
                match self.outcome {
                    Outcome::Succeed => {
                        let dir = project_dir.join(ARTIFACT_DIR);
                        tokio::fs::create_dir_all(&dir).await.unwrap();
                        let artifact = dir.join(ARTIFACT_NAMES[0]);
                        tokio::fs::write(&artifact, DUMMY_APK).await.unwrap();
                        Ok(artifact)
                    }
                    Outcome::Fail { exit_code, stderr } => Err(BuildError::Failed {
                        exit_code: Some(exit_code),
                        stderr: stderr.to_string(),
                    }),
                }
            })
        }
    }

    /// Blocks inside the build until released.
    struct GatedToolchain {
        entered: Notify,
        release: Notify,
    }

    impl Toolchain for GatedToolchain {
        fn assemble<'a>(
            &'a self,
            project_dir: &'a Path,
        ) -> BoxFuture<'a, Result<PathBuf, BuildError>> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                let dir = project_dir.join(ARTIFACT_DIR);
                tokio::fs::create_dir_all(&dir).await.unwrap();
                let artifact = dir.join(ARTIFACT_NAMES[0]);
                tokio::fs::write(&artifact, DUMMY_APK).await.unwrap();
                Ok(artifact)
            })
        }
    }

    fn test_state(toolchain: Arc<dyn Toolchain>, workspace_root: &Path) -> AppState {
        let config = ServerConfig {
            workspace_root: workspace_root.to_path_buf(),
            cleanup_grace: Duration::ZERO,
            max_concurrent_builds: 1,
            ..ServerConfig::default()
        };
        AppState::new(config, toolchain)
    }

    fn demo_payload() -> Value {
        json!({
            "manifest": r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.demo"><application android:label="@string/app_name"/></manifest>"#,
            "mainActivity": "package com.example.demo;\npublic class MainActivity extends android.app.Activity {}\n",
            "layout": r#"<LinearLayout xmlns:android="http://schemas.android.com/apk/res/android"/>"#,
            "appName": "DemoApp"
        })
    }

    fn compile_request(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/compile-apk")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    async fn wait_until_empty(dir: &Path) -> bool {
        for _ in 0..250 {
            if entries(dir) == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let root = tempfile::tempdir().unwrap();
        let app = router(test_state(ScriptedToolchain::new(Outcome::Succeed), root.path()));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "OK");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn missing_sources_are_rejected_without_workspace() {
        let root = tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new(Outcome::Succeed);
        let app = router(test_state(toolchain.clone(), root.path()));

        for field in ["manifest", "mainActivity", "layout"] {
            let mut payload = demo_payload();
            payload.as_object_mut().unwrap().remove(field);

            let response = app
                .clone()
                .oneshot(compile_request(payload.to_string()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "without {field}");
            assert_eq!(
                json_body(response).await,
                json!({"error": "Missing required files: manifest, mainActivity, or layout"})
            );
        }

        assert_eq!(entries(root.path()), 0);
        assert_eq!(toolchain.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let root = tempfile::tempdir().unwrap();
        let app = router(test_state(ScriptedToolchain::new(Outcome::Succeed), root.path()));

        let response = app
            .oneshot(compile_request("{not json".to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Invalid request body");
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn body_without_json_content_type_is_invalid() {
        let root = tempfile::tempdir().unwrap();
        let app = router(test_state(ScriptedToolchain::new(Outcome::Succeed), root.path()));
        let request = Request::builder()
            .method("POST")
            .uri("/compile-apk")
            .body(Body::from(demo_payload().to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Invalid request body");
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn successful_build_streams_named_artifact() {
        let root = tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new(Outcome::Succeed);
        let app = router(test_state(toolchain.clone(), root.path()));

        let response = app
            .oneshot(compile_request(demo_payload().to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"DemoApp.apk\""
        );
        assert_eq!(response.headers()[header::CONTENT_TYPE], APK_CONTENT_TYPE);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            DUMMY_APK.len().to_string().as_str()
        );
        assert!(response.headers().contains_key("x-build-id"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], DUMMY_APK);
        assert_eq!(toolchain.calls.load(Ordering::SeqCst), 1);
        assert!(wait_until_empty(root.path()).await);
    }

    #[tokio::test]
    async fn default_app_name_names_the_download() {
        let root = tempfile::tempdir().unwrap();
        let app = router(test_state(ScriptedToolchain::new(Outcome::Succeed), root.path()));
        let mut payload = demo_payload();
        payload.as_object_mut().unwrap().remove("appName");

        let response = app.oneshot(compile_request(payload.to_string())).await.unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"MyApp.apk\""
        );
    }

    #[tokio::test]
    async fn build_failure_reports_stderr_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new(Outcome::Fail {
            exit_code: 1,
            stderr: "duplicate resource",
        });
        let app = router(test_state(toolchain, root.path()));

        let response = app
            .oneshot(compile_request(demo_payload().to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "APK compilation failed");
        assert!(body["details"].as_str().unwrap().contains("duplicate resource"));
        assert!(wait_until_empty(root.path()).await);
    }

    #[tokio::test]
    async fn wrapper_fetch_failure_is_500_and_workspace_is_removed() {
        let repo = spawn_fake_repository().await;
        let root = tempfile::tempdir().unwrap();
        let settings = GradleSettings {
            wrapper_jar_url: format!("http://{repo}/missing"),
            ..GradleSettings::default()
        };
        let toolchain = Arc::new(GradleToolchain::new(test_client(), settings));
        let app = router(test_state(toolchain, root.path()));

        let response = app
            .oneshot(compile_request(demo_payload().to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let details = json_body(response).await["details"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(details.contains("failed to fetch Gradle wrapper"));
        assert!(details.contains("404"));
        assert!(wait_until_empty(root.path()).await);
    }

    #[tokio::test]
    async fn stalled_wrapper_host_releases_build_slot() {
        let silent = spawn_silent_listener().await;
        let root = tempfile::tempdir().unwrap();
        let settings = GradleSettings {
            wrapper_jar_url: format!("http://{silent}/gradle-wrapper.jar"),
            fetch_timeout: Duration::from_millis(300),
            ..GradleSettings::default()
        };
        let client = fetch::client(settings.fetch_timeout).unwrap();
        let toolchain = Arc::new(GradleToolchain::new(client, settings));
        let app = router(test_state(toolchain, root.path()));

        for attempt in ["first", "second"] {
            let response = tokio::time::timeout(
                Duration::from_secs(10),
                app.clone()
                    .oneshot(compile_request(demo_payload().to_string())),
            )
            .await
            .unwrap_or_else(|_| panic!("{attempt} request hung"))
            .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::INTERNAL_SERVER_ERROR,
                "{attempt} request"
            );
        }
        assert!(wait_until_empty(root.path()).await);
    }

    #[tokio::test]
    async fn saturated_build_slots_return_429() {
        let root = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(GatedToolchain {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let app = router(test_state(toolchain.clone(), root.path()));

        let first = tokio::spawn(
            app.clone()
                .oneshot(compile_request(demo_payload().to_string())),
        );
        toolchain.entered.notified().await;

        let second = app
            .clone()
            .oneshot(compile_request(demo_payload().to_string()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(second).await["error"], "Too many concurrent builds");
        // Only the first request's workspace exists.
        assert_eq!(entries(root.path()), 1);

        toolchain.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body = axum::body::to_bytes(first.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], DUMMY_APK);
        assert!(wait_until_empty(root.path()).await);
    }

    #[tokio::test]
    async fn dropped_response_body_still_removes_workspace() {
        let root = tempfile::tempdir().unwrap();
        let app = router(test_state(ScriptedToolchain::new(Outcome::Succeed), root.path()));

        let response = app
            .oneshot(compile_request(demo_payload().to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()["x-build-id"].to_str().unwrap().to_string();
        let workspace = std::fs::canonicalize(root.path())
            .unwrap()
            .join(format!("apk-build-{id}"));
        assert!(workspace.exists());

        // Client went away before reading anything.
        drop(response);
        assert!(wait_for_removal(&workspace, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn shutdown_removes_workspaces_still_in_grace_period() {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            workspace_root: root.path().to_path_buf(),
            cleanup_grace: Duration::from_secs(60),
            ..ServerConfig::default()
        };
        let state = AppState::new(config, ScriptedToolchain::new(Outcome::Succeed));

        let response = router(state.clone())
            .oneshot(compile_request(demo_payload().to_string()))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], DUMMY_APK);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entries(root.path()), 1);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), serve(listener, state, async {}))
            .await
            .expect("shutdown should not wait out the grace period")
            .unwrap();
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn download_name_strips_header_breaking_characters() {
        assert_eq!(download_name("DemoApp"), "DemoApp");
        assert_eq!(download_name("My App"), "My App");
        assert_eq!(download_name("a\"b\\c/d"), "a_b_c_d");
        assert_eq!(download_name("caf\u{e9}\n"), "caf__");
    }
}
