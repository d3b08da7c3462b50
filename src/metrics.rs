use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;
use std::time::{Duration, Instant};

use crate::bdos;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Counter for instructions executed across all sessions
    pub static ref CPU_INSTRUCTIONS_TOTAL: Counter = Counter::new(
        "cpu_instructions_total", "Total number of 8080 instructions executed"
    ).expect("Failed to create CPU instructions counter");

    /// Counter for CPU cycles executed
    pub static ref CPU_CYCLES_TOTAL: Counter = Counter::new(
        "cpu_cycles_total", "Total number of 8080 cycles executed"
    ).expect("Failed to create CPU cycles counter");

    /// Histogram for the wall time of one run request
    pub static ref RUN_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("run_duration_seconds", "Time spent executing one run request")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
    ).expect("Failed to create run duration histogram");

    /// Counter for BDOS calls by function
    pub static ref BDOS_CALLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("bdos_calls_total", "Total number of BDOS calls by function"),
        &["function", "name"]
    ).expect("Failed to create BDOS calls counter");

    /// Counter for assembler runs by result
    pub static ref ASSEMBLIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("assemblies_total", "Total number of assembler runs"),
        &["result"]
    ).expect("Failed to create assemblies counter");

    /// Counter for API requests by endpoint and method
    pub static ref API_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("api_requests_total", "Total number of API requests"),
        &["method", "endpoint", "status"]
    ).expect("Failed to create API requests counter");

    /// Histogram for API request duration
    pub static ref API_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("api_request_duration_seconds", "API request duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "endpoint"]
    ).expect("Failed to create API request duration histogram");

    /// Gauge for live sessions
    pub static ref ACTIVE_SESSIONS: Gauge = Gauge::new(
        "active_sessions_total", "Number of live emulator sessions"
    ).expect("Failed to create active sessions gauge");

    /// Counter for sessions removed by the expiry sweep
    pub static ref EXPIRED_SESSIONS_TOTAL: Counter = Counter::new(
        "expired_sessions_total", "Total number of sessions removed after inactivity"
    ).expect("Failed to create expired sessions counter");
}

static INIT: Once = Once::new();

/// Register every metric with the global registry. Safe to call repeatedly.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(CPU_INSTRUCTIONS_TOTAL.clone()))
            .expect("Failed to register CPU instructions counter");

        REGISTRY
            .register(Box::new(CPU_CYCLES_TOTAL.clone()))
            .expect("Failed to register CPU cycles counter");

        REGISTRY
            .register(Box::new(RUN_DURATION.clone()))
            .expect("Failed to register run duration histogram");

        REGISTRY
            .register(Box::new(BDOS_CALLS_TOTAL.clone()))
            .expect("Failed to register BDOS calls counter");

        REGISTRY
            .register(Box::new(ASSEMBLIES_TOTAL.clone()))
            .expect("Failed to register assemblies counter");

        REGISTRY
            .register(Box::new(API_REQUESTS_TOTAL.clone()))
            .expect("Failed to register API requests counter");

        REGISTRY
            .register(Box::new(API_REQUEST_DURATION.clone()))
            .expect("Failed to register API request duration histogram");

        REGISTRY
            .register(Box::new(ACTIVE_SESSIONS.clone()))
            .expect("Failed to register active sessions gauge");

        REGISTRY
            .register(Box::new(EXPIRED_SESSIONS_TOTAL.clone()))
            .expect("Failed to register expired sessions counter");
    });
}

/// Record the totals of one run
pub fn record_execution(instructions: u64, cycles: u64, duration: Duration) {
    CPU_INSTRUCTIONS_TOTAL.inc_by(instructions as f64);
    CPU_CYCLES_TOTAL.inc_by(cycles as f64);
    RUN_DURATION.observe(duration.as_secs_f64());
}

/// Record a BDOS call
pub fn record_bdos_call(function: u8) {
    BDOS_CALLS_TOTAL
        .with_label_values(&[&function.to_string(), bdos::function::name(function)])
        .inc();
}

pub fn record_assembly(ok: bool) {
    ASSEMBLIES_TOTAL
        .with_label_values(&[if ok { "ok" } else { "error" }])
        .inc();
}

/// Record an API request
pub fn record_api_request(method: &str, endpoint: &str, status: u16, duration: Duration) {
    API_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();

    API_REQUEST_DURATION
        .with_label_values(&[method, endpoint])
        .observe(duration.as_secs_f64());
}

/// Update session count
pub fn set_active_sessions(count: usize) {
    ACTIVE_SESSIONS.set(count as f64);
}

pub fn record_expired_sessions(count: usize) {
    EXPIRED_SESSIONS_TOTAL.inc_by(count as f64);
}

/// Render the registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_render_includes_recorded_metrics() {
        init_metrics();
        record_bdos_call(9);
        record_execution(4, 25, Duration::from_micros(10));

        let text = render().unwrap();

        assert!(text.contains("bdos_calls_total"));
        assert!(text.contains("name=\"print string\""));
        assert!(text.contains("cpu_cycles_total"));
    }
}
