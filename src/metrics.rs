use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Metric names emitted on the downstream data path. Each is tagged with
/// either `listener=<name>` or `proxy=<name>` depending on the scope.
pub const CONNECTION_TOTAL: &str = "connection_total";
pub const CONNECTION_DESTROY: &str = "connection_destroy";
pub const CONNECTION_ACTIVE: &str = "connection_active";
pub const BYTES_READ_TOTAL: &str = "bytes_read_total";
pub const BYTES_READ_BUFFERED: &str = "bytes_read_buffered";
pub const BYTES_WRITE_TOTAL: &str = "bytes_write_total";
pub const BYTES_WRITE_BUFFERED: &str = "bytes_write_buffered";
pub const REQUEST_TOTAL: &str = "request_total";
pub const REQUEST_ACTIVE: &str = "request_active";
pub const REQUEST_RESET: &str = "request_reset";
pub const REQUEST_TIME: &str = "request_time";
pub const REQUEST_TIME_TOTAL: &str = "request_time_total";
pub const PROCESS_TIME: &str = "process_time";
pub const PROCESS_TIME_TOTAL: &str = "process_time_total";
pub const REQUEST_FAILED: &str = "request_failed";

/// Install the Prometheus recorder and describe every metric once.
/// Returns the handle the admin surface renders from.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!(CONNECTION_TOTAL, "Total accepted or dialed connections");
    describe_counter!(CONNECTION_DESTROY, "Total destroyed connections");
    describe_gauge!(CONNECTION_ACTIVE, "Currently active connections");
    describe_counter!(BYTES_READ_TOTAL, "Total bytes read from sockets");
    describe_gauge!(BYTES_READ_BUFFERED, "Bytes sitting in read buffers");
    describe_counter!(BYTES_WRITE_TOTAL, "Total bytes written to sockets");
    describe_gauge!(BYTES_WRITE_BUFFERED, "Bytes sitting in write buffers");
    describe_counter!(REQUEST_TOTAL, "Total requests received");
    describe_gauge!(REQUEST_ACTIVE, "Requests currently in flight");
    describe_counter!(REQUEST_RESET, "Requests terminated by reset");
    describe_histogram!(REQUEST_TIME, "Wall time per request in milliseconds");
    describe_counter!(REQUEST_TIME_TOTAL, "Accumulated request wall time in milliseconds");
    describe_histogram!(PROCESS_TIME, "Proxy processing time per request in milliseconds");
    describe_counter!(PROCESS_TIME_TOTAL, "Accumulated processing time in milliseconds");
    describe_counter!(REQUEST_FAILED, "Requests that terminated with a failure flag");
}

/// Scope for downstream stats: a listener or a proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Listener,
    Proxy,
}

impl Scope {
    fn key(self) -> &'static str {
        match self {
            Scope::Listener => "listener",
            Scope::Proxy => "proxy",
        }
    }
}

/// Downstream stats bound to one scope tag, cheap to clone and share.
#[derive(Debug, Clone)]
pub struct DownstreamStats {
    key: &'static str,
    name: String,
}

impl DownstreamStats {
    pub fn new(scope: Scope, name: &str) -> Self {
        Self {
            key: scope.key(),
            name: name.to_string(),
        }
    }

    pub fn connection_total(&self) {
        counter!(CONNECTION_TOTAL, self.key => self.name.clone()).increment(1);
        gauge!(CONNECTION_ACTIVE, self.key => self.name.clone()).increment(1.0);
    }

    pub fn connection_destroy(&self) {
        counter!(CONNECTION_DESTROY, self.key => self.name.clone()).increment(1);
        gauge!(CONNECTION_ACTIVE, self.key => self.name.clone()).decrement(1.0);
    }

    pub fn bytes_read(&self, n: u64) {
        counter!(BYTES_READ_TOTAL, self.key => self.name.clone()).increment(n);
    }

    pub fn bytes_read_buffered(&self, n: f64) {
        gauge!(BYTES_READ_BUFFERED, self.key => self.name.clone()).set(n);
    }

    pub fn bytes_write(&self, n: u64) {
        counter!(BYTES_WRITE_TOTAL, self.key => self.name.clone()).increment(n);
    }

    pub fn bytes_write_buffered(&self, n: f64) {
        gauge!(BYTES_WRITE_BUFFERED, self.key => self.name.clone()).set(n);
    }

    pub fn request_total(&self) {
        counter!(REQUEST_TOTAL, self.key => self.name.clone()).increment(1);
        gauge!(REQUEST_ACTIVE, self.key => self.name.clone()).increment(1.0);
    }

    pub fn request_done(&self) {
        gauge!(REQUEST_ACTIVE, self.key => self.name.clone()).decrement(1.0);
    }

    pub fn request_reset(&self) {
        counter!(REQUEST_RESET, self.key => self.name.clone()).increment(1);
    }

    pub fn request_failed(&self) {
        counter!(REQUEST_FAILED, self.key => self.name.clone()).increment(1);
    }

    pub fn request_time(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        histogram!(REQUEST_TIME, self.key => self.name.clone()).record(ms);
        counter!(REQUEST_TIME_TOTAL, self.key => self.name.clone()).increment(ms as u64);
    }

    pub fn process_time(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        histogram!(PROCESS_TIME, self.key => self.name.clone()).record(ms);
        counter!(PROCESS_TIME_TOTAL, self.key => self.name.clone()).increment(ms as u64);
    }
}
