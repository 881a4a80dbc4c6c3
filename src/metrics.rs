//! Lock-free runtime metrics and the Prometheus scrape endpoint.
//!
//! Three primitive kinds: counters (atomic u64), gauges (atomic i64), and
//! bucketed histograms. Histogram sums are kept as integer microseconds so
//! observation stays a pair of atomic adds; conversion to seconds happens
//! only at render time. Each histogram owns its buckets directly; the
//! registry holds handles, never interior pointers.
//!
//! Labeled counters and gauges keep a child per label-value tuple; child
//! creation is serialized by a single mutex, but increments on a child handle
//! stay lock-free.

use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::error::{Code, Result, Status};
use crate::{log_info_globally, log_warn_globally};

/// Default histogram buckets in seconds, tuned for bus and lifecycle
/// latencies.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Content type of the Prometheus text exposition format.
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Monotonically increasing counter.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge that can move in both directions.
#[derive(Clone, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.add(-1);
    }

    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Bucketed histogram with a fixed-point sum.
#[derive(Clone)]
pub struct Histogram(Arc<HistogramInner>);

struct HistogramInner {
    /// Upper bounds, ascending. One count cell per bound; `+Inf` is derived
    /// from the total count at render time.
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum of observations in integer microseconds.
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(bounds: &[f64]) -> Self {
        Histogram(Arc::new(HistogramInner {
            bounds: bounds.to_vec(),
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }))
    }

    pub fn observe(&self, value: f64) {
        if let Some(index) = self.0.bounds.iter().position(|bound| value <= *bound) {
            self.0.buckets[index].fetch_add(1, Ordering::Relaxed);
        }
        self.0.count.fetch_add(1, Ordering::Relaxed);
        let micros = (value.max(0.0) * MICROS_PER_SECOND).round() as u64;
        self.0.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.0.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.0.sum_micros.load(Ordering::Relaxed) as f64 / MICROS_PER_SECOND
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram::with_buckets(&DEFAULT_BUCKETS)
    }
}

/// Counter family keyed by label values.
#[derive(Clone)]
pub struct LabeledCounter(Arc<LabeledInner<Counter>>);

/// Gauge family keyed by label values.
#[derive(Clone)]
pub struct LabeledGauge(Arc<LabeledInner<Gauge>>);

struct LabeledInner<T> {
    label_names: Vec<&'static str>,
    children: SyncMutex<BTreeMap<Vec<String>, T>>,
}

impl<T: Clone + Default> LabeledInner<T> {
    fn with_values(&self, values: &[&str]) -> T {
        let key: Vec<String> = values.iter().map(|value| String::from(*value)).collect();
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        children.entry(key).or_default().clone()
    }
}

impl LabeledCounter {
    pub fn with_values(&self, values: &[&str]) -> Counter {
        self.0.with_values(values)
    }
}

impl LabeledGauge {
    pub fn with_values(&self, values: &[&str]) -> Gauge {
        self.0.with_values(values)
    }
}

enum Metric {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
    LabeledCounter(LabeledCounter),
    LabeledGauge(LabeledGauge),
}

struct Family {
    name: &'static str,
    help: &'static str,
    metric: Metric,
}

/// Registry of metric families, rendered in registration order.
#[derive(Clone, Default)]
pub struct Registry(Arc<SyncMutex<Vec<Family>>>);

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    fn register(&self, name: &'static str, help: &'static str, metric: Metric) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Family { name, help, metric });
    }

    pub fn counter(&self, name: &'static str, help: &'static str) -> Counter {
        let counter = Counter::default();
        self.register(name, help, Metric::Counter(counter.clone()));
        counter
    }

    pub fn gauge(&self, name: &'static str, help: &'static str) -> Gauge {
        let gauge = Gauge::default();
        self.register(name, help, Metric::Gauge(gauge.clone()));
        gauge
    }

    pub fn histogram(
        &self,
        name: &'static str,
        help: &'static str,
        bounds: &[f64],
    ) -> Histogram {
        let histogram = Histogram::with_buckets(bounds);
        self.register(name, help, Metric::Histogram(histogram.clone()));
        histogram
    }

    pub fn labeled_counter(
        &self,
        name: &'static str,
        help: &'static str,
        label_names: &[&'static str],
    ) -> LabeledCounter {
        let counter = LabeledCounter(Arc::new(LabeledInner {
            label_names: label_names.to_vec(),
            children: SyncMutex::new(BTreeMap::new()),
        }));
        self.register(name, help, Metric::LabeledCounter(counter.clone()));
        counter
    }

    pub fn labeled_gauge(
        &self,
        name: &'static str,
        help: &'static str,
        label_names: &[&'static str],
    ) -> LabeledGauge {
        let gauge = LabeledGauge(Arc::new(LabeledInner {
            label_names: label_names.to_vec(),
            children: SyncMutex::new(BTreeMap::new()),
        }));
        self.register(name, help, Metric::LabeledGauge(gauge.clone()));
        gauge
    }

    /// Render the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let families = self
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = String::new();
        for family in families.iter() {
            let _ = writeln!(out, "# HELP {} {}", family.name, family.help);
            match &family.metric {
                Metric::Counter(counter) => {
                    let _ = writeln!(out, "# TYPE {} counter", family.name);
                    let _ = writeln!(out, "{} {}", family.name, counter.get());
                }
                Metric::Gauge(gauge) => {
                    let _ = writeln!(out, "# TYPE {} gauge", family.name);
                    let _ = writeln!(out, "{} {}", family.name, gauge.get());
                }
                Metric::Histogram(histogram) => {
                    let _ = writeln!(out, "# TYPE {} histogram", family.name);
                    let mut cumulative = 0u64;
                    for (bound, bucket) in histogram
                        .0
                        .bounds
                        .iter()
                        .zip(histogram.0.buckets.iter())
                    {
                        cumulative += bucket.load(Ordering::Relaxed);
                        let _ = writeln!(
                            out,
                            "{}_bucket{{le=\"{}\"}} {}",
                            family.name, bound, cumulative,
                        );
                    }
                    let _ = writeln!(
                        out,
                        "{}_bucket{{le=\"+Inf\"}} {}",
                        family.name,
                        histogram.count(),
                    );
                    let _ = writeln!(out, "{}_sum {}", family.name, histogram.sum_seconds());
                    let _ = writeln!(out, "{}_count {}", family.name, histogram.count());
                }
                Metric::LabeledCounter(counter) => {
                    let _ = writeln!(out, "# TYPE {} counter", family.name);
                    render_labeled(&mut out, family.name, &counter.0, |child| {
                        child.get().to_string()
                    });
                }
                Metric::LabeledGauge(gauge) => {
                    let _ = writeln!(out, "# TYPE {} gauge", family.name);
                    render_labeled(&mut out, family.name, &gauge.0, |child| {
                        child.get().to_string()
                    });
                }
            }
        }
        out
    }
}

fn render_labeled<T: Clone + Default>(
    out: &mut String,
    name: &str,
    inner: &LabeledInner<T>,
    value: impl Fn(&T) -> String,
) {
    let children = inner
        .children
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for (values, child) in children.iter() {
        let labels: Vec<String> = inner
            .label_names
            .iter()
            .zip(values.iter())
            .map(|(name, value)| format!("{name}=\"{value}\""))
            .collect();
        let _ = writeln!(out, "{}{{{}}} {}", name, labels.join(","), value(child));
    }
}

/// The runtime's metric handles, registered once at startup.
#[derive(Clone)]
pub struct RuntimeMetrics {
    pub registry: Registry,
    pub pods_created_total: Counter,
    pub pods_running: Gauge,
    pub containers_created_total: Counter,
    pub containers_running: Gauge,
    pub image_pulls_total: Counter,
    pub image_fetches_total: Counter,
    pub image_pull_duration_seconds: Histogram,
    pub exec_sessions_total: Counter,
    pub bus_job_duration_seconds: Histogram,
    /// 1 when the runtime accepts requests; drives `/readyz`.
    pub runtime_ready: Gauge,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        RuntimeMetrics {
            pods_created_total: registry
                .counter("pods_created_total", "Pod sandboxes created since start."),
            pods_running: registry.gauge("pods_running", "Pod sandboxes currently ready."),
            containers_created_total: registry
                .counter("containers_created_total", "Containers created since start."),
            containers_running: registry
                .gauge("containers_running", "Containers currently running."),
            image_pulls_total: registry
                .counter("image_pulls_total", "PullImage requests served."),
            image_fetches_total: registry.counter(
                "image_fetches_total",
                "Pulls that invoked the external fetcher.",
            ),
            image_pull_duration_seconds: registry.histogram(
                "image_pull_duration_seconds",
                "Wall time of completed image pulls.",
                &DEFAULT_BUCKETS,
            ),
            exec_sessions_total: registry
                .counter("exec_sessions_total", "Streaming sessions prepared."),
            bus_job_duration_seconds: registry.histogram(
                "bus_job_duration_seconds",
                "Wall time of service-manager jobs.",
                &DEFAULT_BUCKETS,
            ),
            runtime_ready: registry
                .gauge("runtime_ready", "1 once the runtime accepts requests."),
            registry,
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        RuntimeMetrics::new()
    }
}

/// Serve `/metrics`, `/healthz`, and `/readyz` until `shutdown` completes.
/// Every response closes its connection.
pub async fn serve(
    port: u16,
    registry: Registry,
    ready: Gauge,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(address)
        .await
        .map_err(|error| Status::new(Code::Unavailable, format!("metrics-bind: {error}")))?;
    log_info_globally!(port = port, "Metrics endpoint listening");

    tokio::pin!(shutdown);
    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, _peer) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                log_warn_globally!("Metrics accept failed: {error}");
                continue;
            }
        };

        let registry = registry.clone();
        let ready = ready.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |request| {
                let registry = registry.clone();
                let ready = ready.clone();
                async move { Ok::<_, std::convert::Infallible>(route(request, &registry, &ready)) }
            });
            let result = hyper::server::conn::http1::Builder::new()
                // Connection: close after every response.
                .keep_alive(false)
                .serve_connection(TokioIo::new(stream), service)
                .await;
            if let Err(error) = result {
                log_warn_globally!("Metrics connection error: {error}");
            }
        });
    }
}

fn route<B>(request: Request<B>, registry: &Registry, ready: &Gauge) -> Response<Full<Bytes>> {
    if request.method() != Method::GET {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }
    match request.uri().path() {
        "/metrics" => {
            let body = registry.render();
            response_with_type(StatusCode::OK, METRICS_CONTENT_TYPE, body)
        }
        "/healthz" => response_with_type(
            StatusCode::OK,
            "application/json",
            String::from("{\"status\":\"ok\"}"),
        ),
        "/readyz" => {
            if ready.get() == 1 {
                response_with_type(
                    StatusCode::OK,
                    "application/json",
                    String::from("{\"status\":\"ready\"}"),
                )
            } else {
                response_with_type(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "application/json",
                    String::from("{\"status\":\"not ready\"}"),
                )
            }
        }
        _ => plain_response(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    response_with_type(status, "text/plain", String::from(body))
}

fn response_with_type(
    status: StatusCode,
    content_type: &str,
    body: String,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header(hyper::header::CONNECTION, "close")
        .body(Full::new(Bytes::from(body)))
        // Infallible for the static header set above.
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_gauge_arithmetic() {
        let metrics = RuntimeMetrics::new();
        metrics.pods_created_total.inc();
        metrics.pods_running.set(5);

        assert_eq!(metrics.pods_created_total.get(), 1);
        assert_eq!(metrics.pods_running.get(), 5);

        metrics.pods_running.dec();
        assert_eq!(metrics.pods_running.get(), 4);
    }

    #[test]
    fn render_contains_expected_lines() {
        let metrics = RuntimeMetrics::new();
        metrics.pods_created_total.inc();
        metrics.pods_running.set(5);

        let rendered = metrics.registry.render();
        assert!(rendered.contains("pods_created_total 1"));
        assert!(rendered.contains("pods_running 5"));
        assert!(rendered.contains("# TYPE pods_created_total counter"));
        assert!(rendered.contains("# HELP pods_running"));
    }

    #[test]
    fn histogram_count_and_sum() {
        let histogram = Histogram::with_buckets(&DEFAULT_BUCKETS);
        let observations = [0.004, 0.02, 0.3, 7.5, 42.0];
        for value in observations {
            histogram.observe(value);
        }

        assert_eq!(histogram.count(), observations.len() as u64);
        let expected: f64 = observations.iter().sum();
        // Fixed-point storage rounds each observation to the microsecond.
        assert!((histogram.sum_seconds() - expected).abs() < 1e-5);
    }

    #[test]
    fn histogram_renders_cumulative_buckets() {
        let registry = Registry::new();
        let histogram = registry.histogram("latency_seconds", "Test.", &[0.1, 1.0]);
        histogram.observe(0.05);
        histogram.observe(0.5);
        histogram.observe(10.0);

        let rendered = registry.render();
        assert!(rendered.contains("latency_seconds_bucket{le=\"0.1\"} 1"));
        assert!(rendered.contains("latency_seconds_bucket{le=\"1\"} 2"));
        assert!(rendered.contains("latency_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(rendered.contains("latency_seconds_count 3"));
    }

    #[test]
    fn labeled_counters_key_by_value_tuple() {
        let registry = Registry::new();
        let family = registry.labeled_counter("ops_total", "Test.", &["op"]);
        family.with_values(&["start"]).inc();
        family.with_values(&["start"]).inc();
        family.with_values(&["stop"]).inc();

        let rendered = registry.render();
        assert!(rendered.contains("ops_total{op=\"start\"} 2"));
        assert!(rendered.contains("ops_total{op=\"stop\"} 1"));
    }
}
