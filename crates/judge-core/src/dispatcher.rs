//! Bounded-concurrency scheduler over [`crate::sandbox::Sandbox`].
//!
//! One in-flight id set, one bounded FIFO queue, one container-slot
//! ceiling. The container-slot permit is acquired in the single control
//! loop, before a worker is ever spawned, so the number of containers
//! alive at once is always `<= max_container_count` -- no `+1` overshoot
//! window.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use dashmap::DashSet;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{error, info, warn};

use crate::audit::{self, SubmissionEvent};
use crate::config::DispatcherConfig;
use crate::metrics;
use crate::sandbox::{Sandbox, SandboxInvocation, SandboxResult};
use crate::error::DispatchError;

const DEFAULT_TIME_LIMIT_MS: u64 = 10_000;
const DEFAULT_MEM_LIMIT_KB: u64 = 128_000;
const DEFAULT_FILE_SIZE_LIMIT_BYTES: u64 = 64_000_000;
const DEFAULT_OUTPUT_SIZE_LIMIT_BYTES: u64 = 4_096;

/// Delivers a finished [`SandboxResult`] to whatever sits outside
/// `judge-core` (the backend completion callback) and decides what
/// happens to the submission directory afterwards.
///
/// Returning `true` means the result was accepted by the backend; the
/// dispatcher's caller is then expected to have deleted
/// `submission_dir`. Returning `false` means delivery failed and the
/// implementer is expected to have preserved `submission_dir` (e.g. by
/// moving it into a backup location) for a later retry.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn complete(&self, submission_id: &str, submission_dir: &Path, result: &SandboxResult) -> bool;
}

/// Snapshot of dispatcher state, for the `/status` ingress endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherStatus {
    pub running: bool,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub in_flight_count: usize,
    pub in_flight_ids: Vec<String>,
    pub container_count: usize,
    pub max_container_count: usize,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    docker: Docker,
    completion: Arc<dyn CompletionHandler>,
    in_flight: Arc<DashSet<String>>,
    sender: mpsc::Sender<String>,
    receiver: tokio::sync::Mutex<Option<mpsc::Receiver<String>>>,
    container_slots: Arc<Semaphore>,
    shutdown: Arc<Notify>,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        docker: Docker,
        completion: Arc<dyn CompletionHandler>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.queue_size);
        let container_slots = Arc::new(Semaphore::new(config.max_container_count));
        Arc::new(Self {
            config,
            docker,
            completion,
            in_flight: Arc::new(DashSet::new()),
            sender,
            receiver: tokio::sync::Mutex::new(Some(receiver)),
            container_slots,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Enqueue a submission id for execution.
    ///
    /// Rejects a submission already in flight or queued, and rejects a
    /// full queue without blocking the caller.
    pub fn handle(&self, submission_id: &str) -> Result<(), DispatchError> {
        let submission_dir = self.config.base_dir.join(submission_id);
        if !submission_dir.is_dir() {
            return Err(DispatchError::NotFound(submission_id.to_string()));
        }

        if !self.in_flight.insert(submission_id.to_string()) {
            metrics::record_rejection("duplicate");
            return Err(DispatchError::DuplicatedSubmissionId(submission_id.to_string()));
        }

        if let Err(err) = self.sender.try_send(submission_id.to_string()) {
            self.in_flight.remove(submission_id);
            metrics::record_rejection("queue_full");
            warn!(submission_id, error = %err, "dispatcher queue rejected submission");
            return Err(DispatchError::QueueFull);
        }

        audit::record(submission_id, SubmissionEvent::Enqueued, None);
        Ok(())
    }

    pub fn status(&self) -> DispatcherStatus {
        let capacity = self.sender.max_capacity();
        DispatcherStatus {
            running: self.running.load(Ordering::SeqCst),
            queue_len: capacity.saturating_sub(self.sender.capacity()),
            queue_capacity: capacity,
            in_flight_count: self.in_flight.len(),
            in_flight_ids: self.in_flight.iter().map(|id| id.clone()).collect(),
            container_count: self.config.max_container_count - self.container_slots.available_permits(),
            max_container_count: self.config.max_container_count,
        }
    }

    /// Start the scheduling loop as a background task. A no-op if already
    /// running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let receiver = match self.receiver.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(receiver) = receiver else {
            warn!("dispatcher start() called with no queue receiver available");
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.control_loop(receiver).await });
    }

    /// Signal the scheduling loop to stop accepting new work and return
    /// once it has drained.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.notify_one();
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    async fn control_loop(self: Arc<Self>, mut receiver: mpsc::Receiver<String>) {
        info!(
            image = %self.config.image,
            max_container_count = self.config.max_container_count,
            queue_size = self.config.queue_size,
            "dispatcher control loop started"
        );

        loop {
            // Cheap when the image is already present; invoked every
            // iteration so an image removed mid-run gets re-pulled.
            if let Err(err) = self.ensure_image().await {
                error!(error = %err, "failed to ensure sandbox image is present");
            }

            let submission_id = tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                next = receiver.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = match Arc::clone(&self.container_slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.run_submission(submission_id, permit).await;
            });
        }

        self.running.store(false, Ordering::SeqCst);
        info!("dispatcher control loop stopped");
    }

    async fn ensure_image(&self) -> Result<(), bollard::errors::Error> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }
        info!(image = %self.config.image, "pulling sandbox image");
        let options = CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn run_submission(&self, submission_id: String, permit: tokio::sync::OwnedSemaphorePermit) {
        audit::record(&submission_id, SubmissionEvent::Started, None);

        let submission_dir = self.config.base_dir.join(&submission_id);
        let host_dir = self.config.host_dir.join(&submission_id);
        let ignores = existing_basenames(&submission_dir);
        let oj_input_file = submission_dir.join("input");
        let oj_input_file = oj_input_file.is_file().then_some(oj_input_file);

        let invocation = SandboxInvocation {
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            mem_limit_kb: DEFAULT_MEM_LIMIT_KB,
            output_size_limit_bytes: DEFAULT_OUTPUT_SIZE_LIMIT_BYTES,
            file_size_limit_bytes: DEFAULT_FILE_SIZE_LIMIT_BYTES,
            host_src_dir: host_dir,
            container_src_dir: submission_dir.clone(),
            ignores,
            oj_input_file,
        };

        let sandbox = Sandbox::new(self.docker.clone(), self.config.image.clone(), invocation);
        let result = sandbox.run().await;

        // The slot is held for container-creation..container-removal only;
        // release it before the (possibly slow) backend callback so a new
        // container can start while this one's result is still in flight.
        drop(permit);

        audit::record(
            &submission_id,
            SubmissionEvent::Finished,
            Some(format!("status={:?}", result.status)),
        );

        let delivered = self
            .completion
            .complete(&submission_id, &submission_dir, &result)
            .await;

        audit::record(
            &submission_id,
            if delivered {
                SubmissionEvent::CleanedUp
            } else {
                SubmissionEvent::BackedUp
            },
            None,
        );

        self.in_flight.remove(&submission_id);
    }
}

/// Basenames present in `dir` before a run plus the interpreter's cache
/// directory, so the sandbox's harvested file list only ever contains
/// genuinely new output.
fn existing_basenames(dir: &Path) -> HashSet<String> {
    let mut names: HashSet<String> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.insert("__pycache__".to_string());
    names
}
