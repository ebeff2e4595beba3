use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

struct JudgeMetrics {
    sandbox_runs: Counter<u64>,
    sandbox_duration_ms: Histogram<f64>,
    queue_rejections: Counter<u64>,
}

static METRICS: OnceCell<JudgeMetrics> = OnceCell::new();

fn handles() -> &'static JudgeMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("judge.dispatcher");
        JudgeMetrics {
            sandbox_runs: meter
                .u64_counter("sandbox_runs_total")
                .with_description("Total sandbox executions by status")
                .init(),
            sandbox_duration_ms: meter
                .f64_histogram("sandbox_duration_ms")
                .with_description("Sandbox runtime in milliseconds")
                .init(),
            queue_rejections: meter
                .u64_counter("dispatcher_queue_rejections_total")
                .with_description("Submissions rejected for a full queue or a duplicate id")
                .init(),
        }
    })
}

/// Record a completed sandbox execution.
pub fn record_sandbox_run(status: &str, duration_ms: u64) {
    let metrics = handles();
    let attrs = [KeyValue::new("status", status.to_string())];
    metrics.sandbox_runs.add(1, &attrs);
    metrics.sandbox_duration_ms.record(duration_ms as f64, &attrs);
}

/// Record a rejection at the `Dispatcher::handle` boundary.
pub fn record_rejection(reason: &str) {
    let metrics = handles();
    metrics
        .queue_rejections
        .add(1, &[KeyValue::new("reason", reason.to_string())]);
}
