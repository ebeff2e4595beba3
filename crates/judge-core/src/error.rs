use thiserror::Error;

/// Errors `Dispatcher::handle` can surface to a caller.
///
/// Everything else that can go wrong lives inside a `SandboxResult` as a
/// status, never as an exception that crosses the dispatcher boundary.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("submission {0} not found")]
    NotFound(String),
    #[error("submission {0} is already queued or running")]
    DuplicatedSubmissionId(String),
    #[error("task queue is full; retry once a slot frees up")]
    QueueFull,
}

/// Errors internal to config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read dispatcher config {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid dispatcher config {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
