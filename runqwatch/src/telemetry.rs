//! OpenTelemetry metrics export.
//!
//! Export is enabled only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; every
//! `record_*` helper is a no-op otherwise.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use runqwatch_common::DropReason;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use crate::cgroup::PreemptionType;
use crate::probes::Workload;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<RunqMetrics> = OnceLock::new();

/// Kept for graceful shutdown.
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Read by the `active_probes` gauge callback.
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct RunqMetrics {
    pub runq_latency_ns: Histogram<u64>,
    pub runq_preemption_events: Counter<u64>,
    pub runq_dropped_samples: Counter<u64>,
    pub runq_implausible_latency_events: Counter<u64>,
}

impl RunqMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            runq_latency_ns: meter
                .u64_histogram("runq_latency_ns")
                .with_description("Time a task waited on the run queue before running")
                .with_unit("ns")
                .build(),
            runq_preemption_events: meter
                .u64_counter("runq_preemption_events")
                .with_description("Context switches onto a task that waited on the run queue")
                .with_unit("events")
                .build(),
            runq_dropped_samples: meter
                .u64_counter("runq_dropped_samples")
                .with_description("Run queue samples dropped in the kernel, by reason")
                .with_unit("events")
                .build(),
            runq_implausible_latency_events: meter
                .u64_counter("runq_implausible_latency_events")
                .with_description("Samples discarded for exceeding the latency sanity bound")
                .with_unit("events")
                .build(),
        }
    }
}

/// Priority:
/// 1. OTEL_EXPORTER_OTLP_ENDPOINT environment variable (injected from Helm values)
/// 2. If not set, metrics are disabled (no default fallback)
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Configures metrics export to an OTLP collector via gRPC.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "runqwatch"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("runqwatch");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently active eBPF probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(RunqMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static RunqMetrics> {
    METRICS.get()
}

pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

fn workload_attrs(workload: &Workload, cgroup_id: u64) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("cgroup_id", cgroup_id as i64)];
    if let Some(path) = &workload.cgroup_path {
        attrs.push(KeyValue::new("cgroup", path.clone()));
    }
    if let Some(container) = &workload.container_id {
        attrs.push(KeyValue::new("container_id", container.clone()));
    }
    if let Some(pod) = &workload.pod_name {
        attrs.push(KeyValue::new("pod", pod.clone()));
    }
    if let Some(namespace) = &workload.namespace {
        attrs.push(KeyValue::new("namespace", namespace.clone()));
    }
    if let Some(service) = &workload.service {
        attrs.push(KeyValue::new("service", service.clone()));
    }
    attrs
}

// === Scheduler metric helpers ===

pub fn record_runq_latency(
    latency_ns: u64,
    preemption: PreemptionType,
    workload: &Workload,
    cgroup_id: u64,
) {
    if let Some(m) = metrics() {
        let mut attrs = workload_attrs(workload, cgroup_id);
        m.runq_latency_ns.record(latency_ns, &attrs);

        attrs.push(KeyValue::new("preemption_type", preemption.as_str()));
        m.runq_preemption_events.add(1, &attrs);
    }
}

pub fn record_dropped_samples(reason: DropReason, count: u64) {
    if count == 0 {
        return;
    }
    if let Some(m) = metrics() {
        m.runq_dropped_samples
            .add(count, &[KeyValue::new("reason", reason.name())]);
    }
}

pub fn record_implausible_latency() {
    if let Some(m) = metrics() {
        m.runq_implausible_latency_events.add(1, &[]);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider.
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
