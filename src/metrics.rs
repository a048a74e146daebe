//! Metrics instrumentation for ensemble-dns.
//!
//! All metrics are prefixed with `ensemble.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record the outcome of one FSM step.
pub fn record_step(process: &str, outcome: StepResult, duration: std::time::Duration) {
    let outcome_str = match outcome {
        StepResult::Advanced => "advanced",
        StepResult::Blocked => "blocked",
        StepResult::Stopped => "stopped",
        StepResult::Idle => "idle",
    };

    counter!("ensemble.fsm.step.count", "process" => process.to_string(), "outcome" => outcome_str)
        .increment(1);
    histogram!("ensemble.fsm.step.duration.seconds", "process" => process.to_string())
        .record(duration.as_secs_f64());
}

/// Step outcome type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum StepResult {
    /// The zone advanced to the transition's target state.
    Advanced,
    /// Precondition or action did not hold; state unchanged.
    Blocked,
    /// Unrecoverable; the zone was marked stop.
    Stopped,
    /// Nothing to do (no process, or already at stop).
    Idle,
}

/// Record one auto-push pass over the zone list.
pub fn record_push_pass(zones: usize, duration: std::time::Duration) {
    counter!("ensemble.push.pass.count").increment(1);
    gauge!("ensemble.push.pass.zones").set(zones as f64);
    histogram!("ensemble.push.pass.duration.seconds").record(duration.as_secs_f64());
}

/// Record a signer op completing through a rate-limited lane.
pub fn record_op(transport: &str, lane: &'static str, result: OpResult) {
    let result_str = match result {
        OpResult::Success => "success",
        OpResult::Error => "error",
    };

    counter!("ensemble.op.count", "transport" => transport.to_string(), "lane" => lane, "result" => result_str)
        .increment(1);
}

/// Signer op result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum OpResult {
    /// Op completed and the response slot was written with a success.
    Success,
    /// Op completed with a transport/protocol error.
    Error,
}

/// Record a throttle hold imposed by the remote end.
pub fn record_throttle(transport: &str, lane: &'static str, hold_secs: u64) {
    counter!("ensemble.op.throttle.count", "transport" => transport.to_string(), "lane" => lane)
        .increment(1);
    histogram!("ensemble.op.throttle.hold.seconds", "transport" => transport.to_string())
        .record(hold_secs as f64);
}

/// Record lane queue depth at a tick.
pub fn record_lane_depth(transport: &str, lane: &'static str, depth: usize) {
    gauge!("ensemble.op.queue.depth", "transport" => transport.to_string(), "lane" => lane)
        .set(depth as f64);
}

/// Record store entity counts (call periodically).
pub fn record_state_counts(zones: usize, signers: usize, groups: usize) {
    gauge!("ensemble.state.zones.count").set(zones as f64);
    gauge!("ensemble.state.signers.count").set(signers as f64);
    gauge!("ensemble.state.groups.count").set(groups as f64);
}

/// Record how many zones sit in each FSM status.
pub fn record_zone_status_counts(ok: usize, blocked: usize, stopped: usize) {
    gauge!("ensemble.state.zones.ok").set(ok as f64);
    gauge!("ensemble.state.zones.blocked").set(blocked as f64);
    gauge!("ensemble.state.zones.stopped").set(stopped as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
