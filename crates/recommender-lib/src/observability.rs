//! Observability infrastructure for the recommender
//!
//! Provides:
//! - Prometheus metrics (registry sizes, sample outcomes, GC passes)
//! - Structured JSON logging of recommender events with tracing

use crate::model::{ClusterState, GcReport, ResourceName, VpaId};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for GC pass durations (in seconds)
const GC_DURATION_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RecommenderMetricsInner> = OnceLock::new();

struct RecommenderMetricsInner {
    registry: Registry,
    aggregate_states: IntGauge,
    pods: IntGauge,
    containers: IntGauge,
    vpas: IntGauge,
    vpas_missing_recommendation: IntGauge,
    samples: IntCounterVec,
    ooms_recorded: IntCounter,
    aggregates_collected: IntCounter,
    gc_duration_seconds: Histogram,
}

impl RecommenderMetricsInner {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let aggregate_states = IntGauge::new(
            "vpa_recommender_aggregate_container_states",
            "Number of aggregate container states being tracked",
        )?;
        let pods = IntGauge::new("vpa_recommender_pods", "Number of pods being tracked")?;
        let containers = IntGauge::new(
            "vpa_recommender_containers",
            "Number of containers being tracked",
        )?;
        let vpas = IntGauge::new("vpa_recommender_vpa_objects", "Number of VPA objects")?;
        let vpas_missing_recommendation = IntGauge::new(
            "vpa_recommender_vpas_missing_recommendation",
            "Number of VPA objects currently without a recommendation",
        )?;
        let samples = IntCounterVec::new(
            Opts::new(
                "vpa_recommender_samples_total",
                "Usage samples received, by resource and outcome",
            ),
            &["resource", "outcome"],
        )?;
        let ooms_recorded = IntCounter::new(
            "vpa_recommender_ooms_recorded_total",
            "OOM events turned into memory samples",
        )?;
        let aggregates_collected = IntCounter::new(
            "vpa_recommender_aggregates_collected_total",
            "Aggregate container states removed by garbage collection",
        )?;
        let gc_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "vpa_recommender_gc_duration_seconds",
                "Time spent in a garbage collection pass",
            )
            .buckets(GC_DURATION_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(aggregate_states.clone()))?;
        registry.register(Box::new(pods.clone()))?;
        registry.register(Box::new(containers.clone()))?;
        registry.register(Box::new(vpas.clone()))?;
        registry.register(Box::new(vpas_missing_recommendation.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(ooms_recorded.clone()))?;
        registry.register(Box::new(aggregates_collected.clone()))?;
        registry.register(Box::new(gc_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            aggregate_states,
            pods,
            containers,
            vpas,
            vpas_missing_recommendation,
            samples,
            ooms_recorded,
            aggregates_collected,
            gc_duration_seconds,
        })
    }
}

/// Recommender metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone, Copy)]
pub struct RecommenderMetrics {
    inner: &'static RecommenderMetricsInner,
}

impl RecommenderMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> prometheus::Result<Self> {
        if let Some(inner) = GLOBAL_METRICS.get() {
            return Ok(Self { inner });
        }
        let created = RecommenderMetricsInner::new()?;
        Ok(Self {
            inner: GLOBAL_METRICS.get_or_init(|| created),
        })
    }

    /// Refresh the registry size gauges from the cluster state
    pub fn observe_cluster(&self, cluster: &ClusterState) {
        self.inner.aggregate_states.set(cluster.aggregate_count() as i64);
        self.inner.pods.set(cluster.pod_count() as i64);
        self.inner.containers.set(cluster.container_count() as i64);
        self.inner.vpas.set(cluster.vpa_count() as i64);
        self.inner
            .vpas_missing_recommendation
            .set(cluster.empty_vpa_count() as i64);
    }

    /// Count a sample as accepted or dropped
    pub fn record_sample(&self, resource: ResourceName, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.inner
            .samples
            .with_label_values(&[resource.as_str(), outcome])
            .inc();
    }

    pub fn sample_count(&self, resource: ResourceName, accepted: bool) -> u64 {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.inner
            .samples
            .with_label_values(&[resource.as_str(), outcome])
            .get()
    }

    pub fn inc_ooms_recorded(&self) {
        self.inner.ooms_recorded.inc();
    }

    /// Record the outcome of a garbage collection pass
    pub fn observe_gc(&self, report: &GcReport, duration_secs: f64) {
        self.inner.gc_duration_seconds.observe(duration_secs);
        self.inner
            .aggregates_collected
            .inc_by(report.aggregates_removed as u64);
        self.inner
            .aggregate_states
            .set(report.aggregates_remaining as i64);
    }

    /// Encode all metrics in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Structured logger for recommender events
///
/// Provides consistent JSON-formatted logging for lifecycle, GC and
/// recommendation staleness events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Log recommender startup
    pub fn log_startup(&self, version: &str, gc_interval_secs: u64, api_port: u16) {
        info!(
            event = "recommender_started",
            instance = %self.instance,
            version = %version,
            gc_interval_secs = gc_interval_secs,
            api_port = api_port,
            "VPA recommender started"
        );
    }

    /// Log recommender shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "recommender_shutdown",
            instance = %self.instance,
            reason = %reason,
            "VPA recommender shutting down"
        );
    }

    /// Log a garbage collection pass
    pub fn log_gc(&self, report: &GcReport, duration_secs: f64) {
        info!(
            event = "aggregates_garbage_collected",
            instance = %self.instance,
            removed = report.aggregates_removed,
            remaining = report.aggregates_remaining,
            label_sets_pruned = report.label_sets_pruned,
            duration_secs = duration_secs,
            "Garbage collection pass finished"
        );
    }

    /// Log a VPA that has gone too long without a recommendation
    pub fn log_missing_recommendation(&self, vpa: &VpaId, missing_for_secs: i64) {
        warn!(
            event = "recommendation_missing",
            instance = %self.instance,
            namespace = %vpa.namespace,
            vpa = %vpa.vpa_name,
            missing_for_secs = missing_for_secs,
            "VPA is missing a recommendation"
        );
    }

    /// Log an OOM event that could not be recorded
    pub fn log_oom_rejected(&self, container: &str, reason: &str) {
        warn!(
            event = "oom_rejected",
            instance = %self.instance,
            container = %container,
            reason = %reason,
            "OOM event discarded"
        );
    }
}
