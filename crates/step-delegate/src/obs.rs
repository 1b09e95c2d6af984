//! Structured observability hooks for step lifecycle events.
//!
//! Emission functions for lifecycle records: initializing, finished,
//! sub get var, image fetched, policy denied, event save failures.
//! Component spans come from `BuildStepDelegate::start_span`.
//!
//! Events are emitted at `info!` level unless noted (configurable via
//! `RUST_LOG` or `STEP_DELEGATE_LOG_LEVEL`).

use tracing::{debug, error, info, warn};

pub fn emit_initializing(plan_id: &str) {
    info!(event = "step.initializing", plan_id = %plan_id);
}

pub fn emit_starting(plan_id: &str) {
    debug!(event = "step.starting", plan_id = %plan_id);
}

pub fn emit_finished(plan_id: &str, succeeded: bool) {
    info!(event = "step.finished", plan_id = %plan_id, succeeded = succeeded);
}

/// Emit event: a nested var source fetch is about to run.
pub fn emit_sub_get_var(plan_id: &str, sub_plan_id: &str, var_source: &str) {
    info!(
        event = "step.sub_get_var",
        plan_id = %plan_id,
        sub_plan_id = %sub_plan_id,
        var_source = %var_source,
    );
}

pub fn emit_image_fetched(plan_id: &str, resource_cache_id: i64, privileged: bool) {
    info!(
        event = "image.fetched",
        plan_id = %plan_id,
        resource_cache_id = resource_cache_id,
        privileged = privileged,
    );
}

/// Emit event: the policy engine refused an action (warning level).
pub fn emit_policy_denied(plan_id: &str, action: &str, reasons: &[String]) {
    warn!(
        event = "policy.denied",
        plan_id = %plan_id,
        action = %action,
        reasons = ?reasons,
    );
}

/// Emit event: a lifecycle event could not be persisted (error level).
///
/// `phase` names the lifecycle call, e.g. "initialize" or "finish".
pub fn emit_event_save_failed(plan_id: &str, phase: &str, err: &dyn std::fmt::Display) {
    error!(
        event = "step.event_save_failed",
        plan_id = %plan_id,
        phase = %phase,
        error = %err,
    );
}

/// Emit event: an output stream failed to flush on close (warning level).
pub fn emit_stream_close_failed(plan_id: &str, channel: &str, err: &dyn std::fmt::Display) {
    warn!(
        event = "step.stream_close_failed",
        plan_id = %plan_id,
        channel = %channel,
        error = %err,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_without_subscriber() {
        emit_initializing("test-plan-id");
        emit_finished("test-plan-id", true);
    }
}
