use std::time::Duration;

use tracing::info;

use crate::registry::FlowKind;

/// Emit a telemetry log for a completed flow run.
pub fn record_flow_run(flow: FlowKind, duration: Duration, success: bool, rows: usize) {
    let duration_ms = duration.as_millis().min(u128::from(u64::MAX)) as u64;
    info!(
        target: "pipelines::telemetry",
        event = "flow_run",
        flow = flow.as_str(),
        success,
        rows,
        duration_ms,
    );
}

/// Emit a telemetry log when the fetcher recovers from, or gives up on, a failed batch.
pub fn record_batch_recovery(scope: &str, kind: &'static str, batch_len: usize) {
    info!(
        target: "pipelines::telemetry",
        event = "batch_recovery",
        scope,
        kind,
        batch_len,
    );
}
