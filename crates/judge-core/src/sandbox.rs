//! One-shot isolated execution of a single submission directory.
//!
//! Mirrors `original_source/sandbox.py`'s lifecycle
//! `CREATED -> STARTED -> WAITED -> HARVESTED -> REMOVED`, against the
//! Docker Engine API (`bollard`) rather than a CLI subprocess, since the
//! original talks to the Engine API through the `docker` Python SDK.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogsOptions,
    RemoveContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;

/// Fixed advisory returned to the caller in place of real output once an
/// output-size cap has been exceeded. Verbatim from the original system.
const STDOUT_STDERR_OLE_ADVISORY: &str = "執行失敗: 輸出大小超過系統限制，無法評測！";
const FILE_OLE_ADVISORY: &str = "執行失敗: 輸出檔案大小超過系統限制，無法評測！";

const SANDBOX_WORKDIR: &str = "/sandbox";

/// Immutable description of one sandbox run. Built once, consumed by `run`.
#[derive(Debug, Clone)]
pub struct SandboxInvocation {
    pub time_limit_ms: u64,
    pub mem_limit_kb: u64,
    pub output_size_limit_bytes: u64,
    pub file_size_limit_bytes: u64,
    pub host_src_dir: PathBuf,
    pub container_src_dir: PathBuf,
    pub ignores: HashSet<String>,
    /// Set when the submission directory has an `input` file (the original
    /// system's "is_OJ" mode): stdin is redirected from it and stdout is
    /// diffed against a stored `output` file after the run.
    pub oj_input_file: Option<PathBuf>,
}

impl SandboxInvocation {
    fn command(&self) -> String {
        match &self.oj_input_file {
            Some(_) => "python3 main.py < input".to_string(),
            None => "python3 main.py".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    Success,
    OutputLimitExceed,
    JudgerError,
}

/// One retained output file: a name and its bytes, not an open handle, so a
/// sandbox run can never leak file descriptors into the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Verdict from comparing stdout against a stored `output` file in OJ mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OjVerdict {
    Accepted,
    WrongAnswer,
    OutputLimitExceeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxResult {
    pub status: SandboxStatus,
    pub stdout: String,
    pub stderr: String,
    pub files: Vec<SandboxFile>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub oj_verdict: Option<OjVerdict>,
}

impl SandboxResult {
    fn judger_error(error: impl Into<String>) -> Self {
        Self {
            status: SandboxStatus::JudgerError,
            stdout: String::new(),
            stderr: String::new(),
            files: Vec::new(),
            error: Some(error.into()),
            exit_code: None,
            timed_out: false,
            oj_verdict: None,
        }
    }
}

/// Single-shot Docker sandbox. Each instance performs exactly one container
/// lifecycle; instances must not be reused.
pub struct Sandbox {
    docker: Docker,
    image: String,
    invocation: SandboxInvocation,
}

impl Sandbox {
    pub fn new(docker: Docker, image: impl Into<String>, invocation: SandboxInvocation) -> Self {
        Self {
            docker,
            image: image.into(),
            invocation,
        }
    }

    #[tracing::instrument(skip(self), fields(image = %self.image))]
    pub async fn run(self) -> SandboxResult {
        let start = Instant::now();

        let container_id = match self.create_container().await {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "failed to create sandbox container");
                let result = SandboxResult::judger_error(err.to_string());
                metrics::record_sandbox_run("judger_error", start.elapsed().as_millis() as u64);
                return result;
            }
        };

        let result = self.run_created_container(&container_id).await;

        if let Err(err) = self
            .docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container_id, error = %err, "failed to force-remove sandbox container");
        }

        let status_label = match result.status {
            SandboxStatus::Success => "success",
            SandboxStatus::OutputLimitExceed => "output_limit_exceed",
            SandboxStatus::JudgerError => "judger_error",
        };
        metrics::record_sandbox_run(status_label, start.elapsed().as_millis() as u64);
        info!(
            container_id,
            status = status_label,
            timed_out = result.timed_out,
            duration_ms = start.elapsed().as_millis() as u64,
            "sandbox run finished"
        );

        result
    }

    async fn create_container(&self) -> Result<String, DockerError> {
        let bind = format!(
            "{}:{}:rw",
            self.invocation.host_src_dir.display(),
            SANDBOX_WORKDIR
        );

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                self.invocation.command(),
            ]),
            working_dir: Some(SANDBOX_WORKDIR.to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                memory: Some((self.invocation.mem_limit_kb * 1024) as i64),
                network_mode: Some("none".to_string()),
                pids_limit: Some(8),
                nano_cpus: Some(1_000_000_000),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions::<String> {
            name: String::new(),
            platform: None,
        };
        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    /// Runs the STARTED/WAITED/HARVESTED stages. Always returns a result;
    /// the caller removes the container regardless of what comes back.
    async fn run_created_container(&self, container_id: &str) -> SandboxResult {
        if let Err(err) = self.docker.start_container::<String>(container_id, None).await {
            warn!(container_id, error = %err, "failed to start sandbox container");
            return SandboxResult::judger_error(err.to_string());
        }

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(container_id, Some(wait_options));

        let (timed_out, exit_code, wait_error) = match tokio::time::timeout(
            Duration::from_millis(self.invocation.time_limit_ms),
            wait_stream.next(),
        )
        .await
        {
            Ok(Some(Ok(response))) => (false, Some(response.status_code), response.error.and_then(|e| e.message)),
            Ok(Some(Err(err))) => {
                warn!(container_id, error = %err, "docker wait API error");
                return SandboxResult::judger_error(err.to_string());
            }
            Ok(None) => (false, None, None),
            Err(_elapsed) => {
                debug!(container_id, "sandbox wait deadline reached, harvesting best-effort");
                (true, None, None)
            }
        };

        self.harvest(container_id, timed_out, exit_code, wait_error)
            .await
    }

    async fn harvest(
        &self,
        container_id: &str,
        timed_out: bool,
        exit_code: Option<i64>,
        error: Option<String>,
    ) -> SandboxResult {
        let stdout_bytes = match self.collect_logs(container_id, true, false).await {
            Ok(bytes) => bytes,
            Err(err) => return SandboxResult::judger_error(err.to_string()),
        };
        let stderr_bytes = match self.collect_logs(container_id, false, true).await {
            Ok(bytes) => bytes,
            Err(err) => return SandboxResult::judger_error(err.to_string()),
        };

        let limit = self.invocation.output_size_limit_bytes as usize;
        if stdout_bytes.len() > limit || stderr_bytes.len() > limit {
            return SandboxResult {
                status: SandboxStatus::OutputLimitExceed,
                stdout: String::new(),
                stderr: STDOUT_STDERR_OLE_ADVISORY.to_string(),
                files: Vec::new(),
                error,
                exit_code,
                timed_out,
                oj_verdict: Some(OjVerdict::OutputLimitExceeded)
                    .filter(|_| self.invocation.oj_input_file.is_some()),
            };
        }

        let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

        let files = match self.extract_files(container_id).await {
            Ok(files) => files,
            Err(ExtractError::OutputLimitExceed) => {
                return SandboxResult {
                    status: SandboxStatus::OutputLimitExceed,
                    stdout: String::new(),
                    stderr: FILE_OLE_ADVISORY.to_string(),
                    files: Vec::new(),
                    error,
                    exit_code,
                    timed_out,
                    oj_verdict: Some(OjVerdict::OutputLimitExceeded)
                        .filter(|_| self.invocation.oj_input_file.is_some()),
                };
            }
            Err(ExtractError::Docker(err)) => return SandboxResult::judger_error(err.to_string()),
            Err(ExtractError::Io(err)) => return SandboxResult::judger_error(err.to_string()),
        };

        let oj_verdict = self.compare_oj_output(&stdout);

        SandboxResult {
            status: SandboxStatus::Success,
            stdout,
            stderr,
            files,
            error,
            exit_code,
            timed_out,
            oj_verdict,
        }
    }

    async fn collect_logs(
        &self,
        container_id: &str,
        stdout: bool,
        stderr: bool,
    ) -> Result<Vec<u8>, DockerError> {
        let options = LogsOptions::<String> {
            stdout,
            stderr,
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_id, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?.into_bytes());
        }
        Ok(buf)
    }

    async fn extract_files(&self, container_id: &str) -> Result<Vec<SandboxFile>, ExtractError> {
        let options = DownloadFromContainerOptions {
            path: SANDBOX_WORKDIR.to_string(),
        };
        let mut stream = self.docker.download_from_container(container_id, Some(options));
        let mut archive_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive_bytes.extend_from_slice(&chunk?);
        }

        let total_size: u64 = tar::Archive::new(Cursor::new(&archive_bytes))
            .entries()?
            .filter_map(Result::ok)
            .map(|entry| entry.header().size().unwrap_or(0))
            .sum();
        if total_size > self.invocation.file_size_limit_bytes {
            return Err(ExtractError::OutputLimitExceed);
        }

        let extract_dir = std::env::temp_dir().join(format!("judge-sandbox-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&extract_dir)?;
        tar::Archive::new(Cursor::new(&archive_bytes)).unpack(&extract_dir)?;

        let sandbox_dir = extract_dir.join("sandbox");
        let mut files = Vec::new();
        if sandbox_dir.is_dir() {
            for entry in std::fs::read_dir(&sandbox_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if self.invocation.ignores.contains(&name) {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    continue;
                }
                files.push(SandboxFile {
                    bytes: std::fs::read(&path)?,
                    name,
                });
            }
        }

        std::fs::remove_dir_all(&extract_dir).ok();
        debug!(container_id, count = files.len(), "extracted sandbox files");
        Ok(files)
    }

    /// Compares `stdout` against a stored `output` file, line-stripped, the
    /// way `original_source/sandbox.py`'s `is_OJ` mode does.
    fn compare_oj_output(&self, stdout: &str) -> Option<OjVerdict> {
        self.invocation.oj_input_file.as_ref()?;
        let output_path = self.invocation.container_src_dir.join("output");
        let expected = std::fs::read_to_string(&output_path).ok()?;
        Some(if strip_lines(&expected) == strip_lines(stdout) {
            OjVerdict::Accepted
        } else {
            OjVerdict::WrongAnswer
        })
    }
}

/// Strip trailing whitespace per line and drop trailing blank lines, as the
/// original `Sandbox.strip` classmethod does.
fn strip_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.lines().map(|line| line.trim_end()).collect();
    while matches!(lines.last(), Some(&"")) {
        lines.pop();
    }
    lines
}

#[derive(Debug, thiserror::Error)]
enum ExtractError {
    #[error("archive exceeded the file size limit")]
    OutputLimitExceed,
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_lines_drops_trailing_blank_lines_and_whitespace() {
        let text = "hello \nworld\t\n\n\n";
        assert_eq!(strip_lines(text), vec!["hello", "world"]);
    }

    #[test]
    fn strip_lines_empty_input() {
        assert!(strip_lines("").is_empty());
    }

    #[test]
    fn command_redirects_stdin_in_oj_mode() {
        let invocation = SandboxInvocation {
            time_limit_ms: 1000,
            mem_limit_kb: 1000,
            output_size_limit_bytes: 10,
            file_size_limit_bytes: 10,
            host_src_dir: PathBuf::from("/tmp/a"),
            container_src_dir: PathBuf::from("/tmp/a"),
            ignores: HashSet::new(),
            oj_input_file: Some(PathBuf::from("/tmp/a/input")),
        };
        assert_eq!(invocation.command(), "python3 main.py < input");
    }

    #[test]
    fn command_plain_without_oj_mode() {
        let invocation = SandboxInvocation {
            time_limit_ms: 1000,
            mem_limit_kb: 1000,
            output_size_limit_bytes: 10,
            file_size_limit_bytes: 10,
            host_src_dir: PathBuf::from("/tmp/a"),
            container_src_dir: PathBuf::from("/tmp/a"),
            ignores: HashSet::new(),
            oj_input_file: None,
        };
        assert_eq!(invocation.command(), "python3 main.py");
    }
}
