//! Pipeline metrics, exported in Prometheus format.
//!
//! Counters and histograms are registered lazily by the `metrics` macros;
//! helpers below keep the names in one place.

use std::net::SocketAddr;

pub fn init_metrics() {
    let port: u16 = std::env::var("BANKPIPE_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => {
            println!(
                "[metrics] Prometheus exporter listening on http://{}/metrics",
                addr
            );
        }
        Err(e) => {
            println!(
                "[metrics] Prometheus exporter install failed (possibly already installed): {}",
                e
            );
        }
    }
}

pub fn run_started() {
    ::metrics::counter!("bankpipe_runs_started_total").increment(1);
}

pub fn run_completed(status: &str) {
    ::metrics::counter!(format!("bankpipe_runs_{}_total", status.replace('-', "_"))).increment(1);
}

pub fn run_paused(phase: &str) {
    ::metrics::counter!("bankpipe_runs_paused_total").increment(1);
    ::metrics::counter!(format!("bankpipe_{}_pauses_total", metric_phase(phase))).increment(1);
}

pub fn run_failed(phase: &str) {
    ::metrics::counter!("bankpipe_runs_failed_total").increment(1);
    ::metrics::counter!(format!("bankpipe_{}_failures_total", metric_phase(phase))).increment(1);
}

pub fn stage_completed(phase: &str, duration_secs: f64) {
    ::metrics::counter!(format!("bankpipe_{}_completed_total", metric_phase(phase))).increment(1);
    ::metrics::histogram!(format!("bankpipe_{}_duration_seconds", metric_phase(phase)))
        .record(duration_secs);
}

pub fn records_extracted(count: u64) {
    ::metrics::counter!("bankpipe_records_extracted_total").increment(count);
}

pub fn records_rejected(count: u64) {
    ::metrics::counter!("bankpipe_records_rejected_total").increment(count);
}

pub fn records_created(count: u64) {
    ::metrics::counter!("bankpipe_records_created_total").increment(count);
}

pub fn external_call(kind: &str, success: bool) {
    let suffix = if success { "success" } else { "failure" };
    ::metrics::counter!(format!("bankpipe_external_{}_{}_total", kind, suffix)).increment(1);
}

fn metric_phase(phase: &str) -> String {
    phase.replace('-', "_")
}
