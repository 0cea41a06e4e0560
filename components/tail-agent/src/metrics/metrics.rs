// External crates
use hdrhistogram::Histogram as HdrHistogram;
use lazy_static::lazy_static;
use prometheus::{
    Gauge, HistogramVec, IntCounterVec, IntGaugeVec, register_gauge, register_histogram_vec,
    register_int_counter_vec, register_int_gauge_vec,
};
use std::sync::Mutex;
use std::time::Duration;

/// Record one monitor tick in both the prometheus histogram and the
/// process-wide p99 tracker.
pub fn observe_tick(project: &str, elapsed: Duration) {
    TICK_DURATION_SECONDS
        .with_label_values(&[project])
        .observe(elapsed.as_secs_f64());

    let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    if let Ok(mut latencies) = TICK_LATENCY_US.lock() {
        if let Some(histogram) = latencies.as_mut() {
            histogram.saturating_record(micros.max(1));
            P99_TICK_LATENCY_MS.set(histogram.value_at_quantile(0.99) as f64 / 1000.0);
        }
    }
}

lazy_static! {
    // ======== Tailing Metrics ========

    pub static ref LINES_FORWARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tail_agent_lines_forwarded_total",
        "Lines parsed and handed to the sink",
        &["project"]
    ).unwrap();

    pub static ref MALFORMED_LINES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tail_agent_malformed_lines_total",
        "Lines skipped because they could not be parsed",
        &["project"]
    ).unwrap();

    pub static ref SINK_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tail_agent_sink_failures_total",
        "Entries the sink failed to accept",
        &["project"]
    ).unwrap();

    pub static ref FILE_SWITCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tail_agent_file_switches_total",
        "Times a project switched to a newer log file",
        &["project"]
    ).unwrap();

    pub static ref TRUNCATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tail_agent_truncations_total",
        "Times a tracked file shrank below its tracked offset",
        &["project"]
    ).unwrap();

    /// Offset of the file each project currently follows
    pub static ref TRACKED_OFFSET_BYTES: IntGaugeVec = register_int_gauge_vec!(
        "tail_agent_tracked_offset_bytes",
        "Byte offset consumed in the current file",
        &["project"]
    ).unwrap();

    // ======== Position Persistence Metrics ========

    pub static ref POSITION_FLUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tail_agent_position_flushes_total",
        "Cached positions written to the backing store",
        &["project"]
    ).unwrap();

    pub static ref POSITION_FLUSH_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tail_agent_position_flush_failures_total",
        "Cached positions that failed to reach the backing store",
        &["project"]
    ).unwrap();

    pub static ref POSITION_SAVE_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tail_agent_position_save_failures_total",
        "Position updates rejected by the store",
        &["project"]
    ).unwrap();

    // ======== Loop Latency Metrics ========

    pub static ref TICK_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "tail_agent_tick_duration_seconds",
        "Histogram of monitor tick durations in seconds",
        &["project"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    /// P99 tick latency across all projects (milliseconds)
    pub static ref P99_TICK_LATENCY_MS: Gauge = register_gauge!(
        "tail_agent_p99_tick_latency_ms",
        "99th percentile monitor tick latency (milliseconds)"
    ).unwrap();

    /// Backing data for `P99_TICK_LATENCY_MS`, 1us to 1h at 3 significant digits
    static ref TICK_LATENCY_US: Mutex<Option<HdrHistogram<u64>>> =
        Mutex::new(HdrHistogram::new_with_bounds(1, 3_600_000_000, 3).ok());

    // ======== System Resource Metrics ========

    pub static ref MEMORY_BYTES: Gauge = register_gauge!(
        "tail_agent_memory_bytes",
        "Resident memory usage in bytes"
    ).unwrap();

    pub static ref CPU_PERCENT: Gauge = register_gauge!(
        "tail_agent_cpu_percent",
        "Process CPU usage percentage"
    ).unwrap();

    // ======== Lifecycle Metrics ========

    pub static ref STARTUP_DURATION_SECONDS: Gauge = register_gauge!(
        "tail_agent_startup_duration_seconds",
        "Time from process start until every monitor loop was spawned (seconds)"
    ).unwrap();
}
