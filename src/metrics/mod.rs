//! Prometheus metrics for the orchestrator
//!
//! Tracks registry status counts, lane occupancy, per-site run outcomes and
//! durations, and denied admissions.
//!
//! Call `init_metrics()` once at application startup to register everything.
//! If initialization never happens (tests, library use), every recording
//! function is a no-op.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

use crate::models::TaskCounts;

// ============================================================================
// Metrics Storage
// ============================================================================

struct OrchestratorMetrics {
    tasks_pending: Gauge,
    tasks_running: Gauge,
    tasks_paused: Gauge,
    tasks_completed: Gauge,
    tasks_failed: Gauge,
    lanes_occupied: Gauge,
    runs_total: CounterVec,
    run_duration: HistogramVec,
    admissions_denied: Counter,
}

static METRICS: OnceLock<OrchestratorMetrics> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Register all orchestrator metrics with the default registry. Idempotent;
/// a registration failure leaves metrics disabled rather than aborting.
pub fn init_metrics() {
    if METRICS.get().is_some() {
        return;
    }

    let build = || -> Result<OrchestratorMetrics, prometheus::Error> {
        Ok(OrchestratorMetrics {
            tasks_pending: register_gauge!("predio_tasks_pending", "Tasks in pending")?,
            tasks_running: register_gauge!("predio_tasks_running", "Tasks in running")?,
            tasks_paused: register_gauge!("predio_tasks_paused", "Tasks in paused")?,
            tasks_completed: register_gauge!("predio_tasks_completed", "Tasks in completed")?,
            tasks_failed: register_gauge!("predio_tasks_failed", "Tasks in failed")?,
            lanes_occupied: register_gauge!(
                "predio_lanes_occupied",
                "Site lanes currently holding a running task"
            )?,
            runs_total: register_counter_vec!(
                "predio_runs_total",
                "Execution attempts by site and outcome",
                &["site", "outcome"]
            )?,
            run_duration: register_histogram_vec!(
                "predio_run_duration_seconds",
                "Execution attempt duration by site",
                &["site"],
                vec![30.0, 120.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0]
            )?,
            admissions_denied: register_counter!(
                "predio_admissions_denied_total",
                "Admission checks denied by the resource monitor"
            )?,
        })
    };

    match build() {
        Ok(metrics) => {
            let _ = METRICS.set(metrics);
            tracing::debug!("orchestrator metrics registered");
        }
        Err(e) => {
            tracing::warn!(error = %e, "metrics registration failed, metrics disabled");
        }
    }
}

// ============================================================================
// Recording
// ============================================================================

/// Update the per-status task gauges
pub fn set_task_counts(counts: &TaskCounts) {
    if let Some(m) = METRICS.get() {
        m.tasks_pending.set(counts.pending as f64);
        m.tasks_running.set(counts.running as f64);
        m.tasks_paused.set(counts.paused as f64);
        m.tasks_completed.set(counts.completed as f64);
        m.tasks_failed.set(counts.failed as f64);
    }
}

/// Update the occupied-lane gauge
pub fn set_lane_occupancy(occupied: usize) {
    if let Some(m) = METRICS.get() {
        m.lanes_occupied.set(occupied as f64);
    }
}

/// Record one finished execution attempt
pub fn record_run(site: &str, success: bool, duration_secs: f64) {
    if let Some(m) = METRICS.get() {
        let outcome = if success { "success" } else { "failure" };
        m.runs_total.with_label_values(&[site, outcome]).inc();
        m.run_duration
            .with_label_values(&[site])
            .observe(duration_secs);
    }
}

/// Record one denied admission
pub fn record_admission_denied() {
    if let Some(m) = METRICS.get() {
        m.admissions_denied.inc();
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn export_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // both tests touch the process-global prometheus registry

    #[test]
    #[serial]
    fn test_noop_before_init() {
        // must not panic without init_metrics()
        set_task_counts(&TaskCounts::default());
        set_lane_occupancy(3);
        record_run("mitula", true, 42.0);
        record_admission_denied();
    }

    #[test]
    #[serial]
    fn test_init_and_export() {
        init_metrics();
        init_metrics(); // idempotent

        set_task_counts(&TaskCounts {
            pending: 4,
            running: 2,
            paused: 0,
            completed: 1,
            failed: 0,
        });
        set_lane_occupancy(2);
        record_run("inmuebles24", true, 310.0);
        record_run("inmuebles24", false, 12.0);

        let text = export_text();
        assert!(text.contains("predio_tasks_pending"));
        assert!(text.contains("predio_lanes_occupied"));
        assert!(text.contains("predio_runs_total"));
    }
}
