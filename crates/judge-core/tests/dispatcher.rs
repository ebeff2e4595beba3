//! Full dispatcher lifecycle against a real Docker daemon.
//!
//! Skipped by default; set `JUDGE_SANDBOX_TESTS=1` to run it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use judge_core::{CompletionHandler, Dispatcher, DispatcherConfig, SandboxResult, SandboxStatus};
use tokio::sync::Mutex;

struct CollectingCompletion {
    results: Mutex<Vec<(String, SandboxStatus)>>,
}

#[async_trait]
impl CompletionHandler for CollectingCompletion {
    async fn complete(&self, submission_id: &str, _dir: &Path, result: &SandboxResult) -> bool {
        self.results
            .lock()
            .await
            .push((submission_id.to_string(), result.status));
        true
    }
}

fn sandbox_tests_enabled() -> bool {
    std::env::var("JUDGE_SANDBOX_TESTS")
        .map(|val| val == "1" || val.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[tokio::test]
async fn dispatcher_runs_a_submission_end_to_end() {
    if !sandbox_tests_enabled() {
        eprintln!("JUDGE_SANDBOX_TESTS not enabled; skipping dispatcher integration test");
        return;
    }

    let base_dir = tempfile::tempdir().unwrap();
    let submission_dir: PathBuf = base_dir.path().join("sub-1");
    std::fs::create_dir_all(&submission_dir).unwrap();
    std::fs::write(submission_dir.join("main.py"), b"print('ok')\n").unwrap();

    let image = std::env::var("JUDGE_SANDBOX_IMAGE").unwrap_or_else(|_| "python:3.11-slim".to_string());
    let config = DispatcherConfig {
        base_dir: base_dir.path().to_path_buf(),
        host_dir: base_dir.path().to_path_buf(),
        queue_size: 4,
        max_container_count: 2,
        image,
    };

    let docker = Docker::connect_with_local_defaults().expect("docker daemon reachable");
    let completion = Arc::new(CollectingCompletion {
        results: Mutex::new(Vec::new()),
    });
    let dispatcher = Dispatcher::new(config, docker, Arc::clone(&completion));
    dispatcher.start();

    dispatcher.handle("sub-1").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    loop {
        if !completion.results.lock().await.is_empty() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "submission did not complete in time");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let results = completion.results.lock().await;
    assert_eq!(results[0].0, "sub-1");
    assert_eq!(results[0].1, SandboxStatus::Success);

    dispatcher.graceful_shutdown().await;
}
