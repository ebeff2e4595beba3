use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::{Multipart, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bollard::Docker;
use judge_core::{CompletionHandler, Dispatcher, DispatcherConfig, DispatcherStatus, SandboxResult};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

#[derive(Clone)]
struct ApiConfig {
    shared_token: String,
    backend_base_url: String,
    backup_dir: PathBuf,
    bind_addr: SocketAddr,
    /// Same staging root the dispatcher was configured with
    /// (`DispatcherConfig::base_dir`), so ingress and the dispatcher agree
    /// on where a submission directory lives.
    base_dir: PathBuf,
}

impl ApiConfig {
    fn from_env(base_dir: PathBuf) -> Result<Self> {
        let shared_token = std::env::var("JUDGE_SHARED_TOKEN")
            .context("JUDGE_SHARED_TOKEN must be set")?;
        let backend_base_url = std::env::var("JUDGE_BACKEND_URL")
            .context("JUDGE_BACKEND_URL must be set")?;
        let backup_dir = std::env::var("JUDGE_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/backup"));
        let bind_addr: SocketAddr = std::env::var("JUDGE_API_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("invalid JUDGE_API_ADDR")?;
        Ok(Self {
            shared_token,
            backend_base_url,
            backup_dir,
            bind_addr,
            base_dir,
        })
    }
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    config: Arc<ApiConfig>,
}

/// Posts a finished [`SandboxResult`] to the backend and disposes of the
/// submission directory based on the outcome.
struct BackendCompletion {
    client: reqwest::Client,
    config: Arc<ApiConfig>,
}

#[async_trait]
impl CompletionHandler for BackendCompletion {
    async fn complete(&self, submission_id: &str, submission_dir: &Path, result: &SandboxResult) -> bool {
        let delivered = self.post_completion(submission_id, result).await;

        if delivered {
            if let Err(err) = tokio::fs::remove_dir_all(submission_dir).await {
                warn!(submission_id, error = %err, "failed to clean up delivered submission directory");
            }
        } else {
            let backup_dir = self.config.backup_dir.join(format!(
                "{}_{}",
                submission_id,
                chrono::Local::now().format("%Y-%m-%d_%H:%M:%S")
            ));
            if let Some(parent) = backup_dir.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(err) = tokio::fs::rename(submission_dir, &backup_dir).await {
                warn!(submission_id, error = %err, "failed to back up undelivered submission directory");
            }
        }

        delivered
    }
}

impl BackendCompletion {
    async fn post_completion(&self, submission_id: &str, result: &SandboxResult) -> bool {
        let mut form = reqwest::multipart::Form::new()
            .text("status", format!("{:?}", result.status))
            .text("stdout", result.stdout.clone())
            .text("stderr", result.stderr.clone())
            .text("timed_out", result.timed_out.to_string());

        if let Some(exit_code) = result.exit_code {
            form = form.text("exit_code", exit_code.to_string());
        }
        if let Some(verdict) = result.oj_verdict {
            form = form.text("oj_verdict", format!("{:?}", verdict));
        }
        for file in &result.files {
            let part = reqwest::multipart::Part::bytes(file.bytes.clone()).file_name(file.name.clone());
            form = form.part("files[]", part);
        }

        let url = format!(
            "{}/submission/{}/complete",
            self.config.backend_base_url.trim_end_matches('/'),
            submission_id
        );

        match self.client.put(&url).multipart(form).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(submission_id, status = %response.status(), "backend rejected completion callback");
                false
            }
            Err(err) => {
                warn!(submission_id, error = %err, "failed to reach backend completion endpoint");
                false
            }
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<judge_core::DispatchError> for ApiError {
    fn from(err: judge_core::DispatchError) -> Self {
        // spec.md §7: NotFound/DuplicatedSubmissionId -> 400, QueueFull -> 500.
        let status = match err {
            judge_core::DispatchError::NotFound(_) => StatusCode::BAD_REQUEST,
            judge_core::DispatchError::DuplicatedSubmissionId(_) => StatusCode::BAD_REQUEST,
            judge_core::DispatchError::QueueFull => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Unauthenticated callers get only the coarse `load` ratio; a valid
/// shared token unlocks the full dispatcher snapshot.
#[derive(Serialize)]
struct StatusResponse {
    load: f64,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    detail: Option<DispatcherStatus>,
}

async fn handle_status(State(state): State<AppState>, headers: HeaderMap) -> Json<StatusResponse> {
    let status = state.dispatcher.status();
    let load = if status.queue_capacity == 0 {
        0.0
    } else {
        status.queue_len as f64 / status.queue_capacity as f64
    };

    let presented_token = headers
        .get("x-judge-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let detail = judge_core::security::tokens_match(presented_token, &state.config.shared_token)
        .then_some(status);

    Json(StatusResponse { load, detail })
}

/// Accepts a submission: `token`, `src` (renamed to `main.py`), any number
/// of `attachments[]`, and an optional `testcase` zip archive unpacked
/// into the submission directory.
async fn handle_submit(
    State(state): State<AppState>,
    AxumPath(submission_id): AxumPath<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    let presented_token = headers
        .get("x-judge-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !judge_core::security::tokens_match(presented_token, &state.config.shared_token) {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "invalid token"));
    }

    let submission_dir = state.config.base_dir.join(&submission_id);
    tokio::fs::create_dir_all(&submission_dir)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "src" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
                tokio::fs::write(submission_dir.join("main.py"), &bytes)
                    .await
                    .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
            }
            "testcase" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
                extract_testcase(&submission_dir, &bytes)
                    .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
            }
            "attachments[]" => {
                let file_name = field
                    .file_name()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| "attachment".to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
                tokio::fs::write(submission_dir.join(sanitize_file_name(&file_name)), &bytes)
                    .await
                    .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
            }
            _ => continue,
        }
    }

    state.dispatcher.handle(&submission_id)?;
    Ok(StatusCode::OK)
}

fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string())
}

fn extract_testcase(submission_dir: &Path, archive_bytes: &[u8]) -> anyhow::Result<()> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(archive_bytes))?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(enclosed) = entry.enclosed_name() else {
            continue;
        };
        let out_path = submission_dir.join(enclosed);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping ingress server");
}

#[tokio::main]
async fn main() -> Result<()> {
    judge_core::telemetry::init_telemetry(judge_core::telemetry::TelemetryOptions::default())?;

    let dispatcher_config = DispatcherConfig::load("dispatcher.json")?;
    let config = Arc::new(ApiConfig::from_env(dispatcher_config.base_dir.clone())?);
    let docker = Docker::connect_with_local_defaults().context("failed to connect to the Docker daemon")?;

    let completion = Arc::new(BackendCompletion {
        client: reqwest::Client::new(),
        config: Arc::clone(&config),
    });
    let dispatcher = Dispatcher::new(dispatcher_config, docker, completion);
    dispatcher.start();

    let state = AppState {
        dispatcher: Arc::clone(&dispatcher),
        config: Arc::clone(&config),
    };

    let app = Router::new()
        .route("/status", get(handle_status))
        .route("/:id", post(handle_submit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %config.bind_addr, "judge ingress listening");
    let listener = TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.graceful_shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use judge_core::{SandboxFile, SandboxStatus};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn success_result() -> SandboxResult {
        SandboxResult {
            status: SandboxStatus::Success,
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            files: vec![SandboxFile {
                name: "out.txt".to_string(),
                bytes: b"payload".to_vec(),
            }],
            error: None,
            exit_code: Some(0),
            timed_out: false,
            oj_verdict: None,
        }
    }

    fn completion_for(server: &MockServer, backup_dir: &Path) -> BackendCompletion {
        BackendCompletion {
            client: reqwest::Client::new(),
            config: Arc::new(ApiConfig {
                shared_token: "secret".to_string(),
                backend_base_url: server.uri(),
                backup_dir: backup_dir.to_path_buf(),
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                base_dir: PathBuf::from("submissions"),
            }),
        }
    }

    #[tokio::test]
    async fn successful_backend_response_cleans_up_submission_dir() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/submission/sub-1/complete"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let staging = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let submission_dir = staging.path().join("sub-1");
        std::fs::create_dir_all(&submission_dir).unwrap();

        let completion = completion_for(&server, backup.path());
        let delivered = completion
            .complete("sub-1", &submission_dir, &success_result())
            .await;

        assert!(delivered);
        assert!(!submission_dir.exists());
    }

    #[tokio::test]
    async fn failed_backend_response_backs_up_submission_dir() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/submission/sub-2/complete"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let staging = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let submission_dir = staging.path().join("sub-2");
        std::fs::create_dir_all(&submission_dir).unwrap();

        let completion = completion_for(&server, backup.path());
        let delivered = completion
            .complete("sub-2", &submission_dir, &success_result())
            .await;

        assert!(!delivered);
        assert!(!submission_dir.exists());
        let backed_up = std::fs::read_dir(backup.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|entry| entry.file_name().to_string_lossy().starts_with("sub-2_"));
        assert!(backed_up);
    }

    #[test]
    fn sanitize_file_name_strips_directory_components() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("plain.txt"), "plain.txt");
    }
}
