//! Aggregated usage of a group of containers
//!
//! Containers with the same namespace, container name and pod labels pool
//! their samples into one [`AggregateContainerState`]. CPU usage goes into a
//! decaying histogram weighted by the container's request; memory goes into
//! a decaying histogram of per-window peaks.

use super::config::{AggregationContext, MIN_SAMPLE_WEIGHT};
use super::{
    ContainerResourcePolicy, ContainerScalingMode, ContainerUsageSample, LabelSet, Labels,
    ModelError, ResourceName, Resources, Result, UpdateMode, DEFAULT_CONTROLLED_RESOURCES,
};
use crate::histogram::{DecayingHistogram, HistogramCheckpoint};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Tag of the checkpoint format produced by [`AggregateContainerState::save_to_checkpoint`]
pub const SUPPORTED_CHECKPOINT_VERSION: &str = "v3";

/// Identity of a group of containers whose usage is pooled
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateStateKey {
    namespace: String,
    container_name: String,
    labels: LabelSet,
}

impl AggregateStateKey {
    pub fn new(
        namespace: impl Into<String>,
        container_name: impl Into<String>,
        labels: LabelSet,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            container_name: container_name.into(),
            labels,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn labels(&self) -> &Labels {
        self.labels.labels()
    }

    pub fn label_set(&self) -> &LabelSet {
        &self.labels
    }
}

impl fmt::Display for AggregateStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{{{}}}",
            self.namespace, self.container_name, self.labels
        )
    }
}

/// Sink for the samples of one container
///
/// Implemented by the lock-guarded [`AggregateContainerState`]; test doubles
/// and checkpoint-restore paths can provide their own implementation.
pub trait ContainerStateAggregator: Send + Sync {
    /// Add a sample to the underlying distributions
    fn add_sample(&self, sample: &ContainerUsageSample);

    /// Reverse an earlier `add_sample` of an identical sample.
    /// The caller must have added that exact sample once.
    fn subtract_sample(&self, sample: &ContainerUsageSample);

    fn last_recommendation(&self) -> Resources;

    fn needs_recommendation(&self) -> bool;

    fn update_mode(&self) -> Option<UpdateMode>;
}

/// Aggregate shared between the registry, VPAs and containers
pub type SharedAggregateState = Arc<Mutex<AggregateContainerState>>;

#[derive(Debug, Clone)]
pub struct AggregateContainerState {
    context: Arc<AggregationContext>,
    /// Distribution of CPU usage, in cores
    pub aggregate_cpu_usage: DecayingHistogram,
    /// Distribution of per-window memory peaks, in bytes
    pub aggregate_memory_peaks: DecayingHistogram,
    /// Start of the earliest CPU sample
    pub first_sample_start: Option<DateTime<Utc>>,
    /// Start of the latest CPU sample
    pub last_sample_start: Option<DateTime<Utc>>,
    /// Number of CPU samples aggregated
    pub total_samples_count: u64,
    pub creation_time: DateTime<Utc>,
    pub last_recommendation: Resources,
    pub is_under_vpa: bool,
    pub update_mode: Option<UpdateMode>,
    pub scaling_mode: Option<ContainerScalingMode>,
    pub controlled_resources: Option<Vec<ResourceName>>,
}

impl AggregateContainerState {
    pub fn new(context: Arc<AggregationContext>, creation_time: DateTime<Utc>) -> Self {
        let aggregate_cpu_usage = DecayingHistogram::new(
            context.cpu_histogram_options.clone(),
            context.config.cpu_histogram_decay_half_life(),
        );
        let aggregate_memory_peaks = DecayingHistogram::new(
            context.memory_histogram_options.clone(),
            context.config.memory_histogram_decay_half_life(),
        );
        Self {
            context,
            aggregate_cpu_usage,
            aggregate_memory_peaks,
            first_sample_start: None,
            last_sample_start: None,
            total_samples_count: 0,
            creation_time,
            last_recommendation: Resources::new(),
            is_under_vpa: false,
            update_mode: None,
            scaling_mode: None,
            controlled_resources: None,
        }
    }

    pub fn shared(self) -> SharedAggregateState {
        Arc::new(Mutex::new(self))
    }

    pub fn add_sample(&mut self, sample: &ContainerUsageSample) {
        match sample.resource {
            ResourceName::Cpu => self.add_cpu_sample(sample),
            ResourceName::Memory => self.aggregate_memory_peaks.add_sample(
                sample.usage.as_bytes(),
                1.0,
                sample.measure_start,
            ),
        }
    }

    /// Take back a sample added earlier with the same values
    ///
    /// For CPU this reverses the histogram weight and the sample count only.
    /// `first_sample_start` and `last_sample_start` are bounds on what has been
    /// observed and keep their values.
    pub fn subtract_sample(&mut self, sample: &ContainerUsageSample) {
        match sample.resource {
            ResourceName::Cpu => {
                self.aggregate_cpu_usage.subtract_sample(
                    sample.usage.as_cores(),
                    cpu_sample_weight(sample),
                    sample.measure_start,
                );
                self.total_samples_count = self.total_samples_count.saturating_sub(1);
            }
            ResourceName::Memory => self.aggregate_memory_peaks.subtract_sample(
                sample.usage.as_bytes(),
                1.0,
                sample.measure_start,
            ),
        }
    }

    fn add_cpu_sample(&mut self, sample: &ContainerUsageSample) {
        // Weighting by request makes history recorded under a smaller
        // request count less once the request grows.
        self.aggregate_cpu_usage.add_sample(
            sample.usage.as_cores(),
            cpu_sample_weight(sample),
            sample.measure_start,
        );
        if self.last_sample_start.map_or(true, |last| sample.measure_start > last) {
            self.last_sample_start = Some(sample.measure_start);
        }
        if self.first_sample_start.map_or(true, |first| sample.measure_start < first) {
            self.first_sample_start = Some(sample.measure_start);
        }
        self.total_samples_count += 1;
    }

    /// Fold another aggregate's history into this one
    pub fn merge(&mut self, other: &AggregateContainerState) -> Result<()> {
        self.aggregate_cpu_usage.merge(&other.aggregate_cpu_usage)?;
        self.aggregate_memory_peaks.merge(&other.aggregate_memory_peaks)?;
        if let Some(other_first) = other.first_sample_start {
            if self.first_sample_start.map_or(true, |first| other_first < first) {
                self.first_sample_start = Some(other_first);
            }
        }
        if let Some(other_last) = other.last_sample_start {
            if self.last_sample_start.map_or(true, |last| other_last > last) {
                self.last_sample_start = Some(other_last);
            }
        }
        self.total_samples_count += other.total_samples_count;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples_count == 0
    }

    /// True when the aggregate has not seen a CPU sample (or, if it never
    /// had one, was created) at least `threshold` ago
    pub fn is_expired(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        let since = self.last_sample_start.unwrap_or(self.creation_time);
        now - since >= threshold
    }

    pub fn controlled_resources(&self) -> Vec<ResourceName> {
        self.controlled_resources
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTROLLED_RESOURCES.to_vec())
    }

    pub fn needs_recommendation(&self) -> bool {
        self.is_under_vpa
            && self
                .scaling_mode
                .is_some_and(|mode| mode != ContainerScalingMode::Off)
    }

    /// Apply the container policy of the governing VPA
    pub fn update_from_policy(&mut self, policy: Option<&ContainerResourcePolicy>) {
        self.scaling_mode = Some(
            policy
                .and_then(|p| p.mode)
                .unwrap_or(ContainerScalingMode::Auto),
        );
        self.controlled_resources = Some(
            policy
                .and_then(|p| p.controlled_resources.clone())
                .unwrap_or_else(|| DEFAULT_CONTROLLED_RESOURCES.to_vec()),
        );
    }

    /// Forget everything the last governing VPA set
    pub fn mark_not_autoscaled(&mut self) {
        self.is_under_vpa = false;
        self.last_recommendation = Resources::new();
        self.update_mode = None;
        self.scaling_mode = None;
        self.controlled_resources = None;
    }

    /// Empty aggregate sharing this one's configuration
    pub fn empty_like(&self, creation_time: DateTime<Utc>) -> Self {
        Self::new(self.context.clone(), creation_time)
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            cpu_usage: self.aggregate_cpu_usage.clone(),
            memory_peaks: self.aggregate_memory_peaks.clone(),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples_count,
            creation_time: self.creation_time,
            is_under_vpa: self.is_under_vpa,
            update_mode: self.update_mode,
        }
    }

    pub fn save_to_checkpoint(&self, now: DateTime<Utc>) -> AggregateStateCheckpoint {
        AggregateStateCheckpoint {
            last_update_time: now,
            version: SUPPORTED_CHECKPOINT_VERSION.to_string(),
            cpu_histogram: self.aggregate_cpu_usage.save_to_checkpoint(),
            memory_histogram: self.aggregate_memory_peaks.save_to_checkpoint(),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples_count,
        }
    }

    /// Seed the histograms and counters from a persisted checkpoint
    pub fn load_from_checkpoint(&mut self, checkpoint: &AggregateStateCheckpoint) -> Result<()> {
        if checkpoint.version != SUPPORTED_CHECKPOINT_VERSION {
            return Err(ModelError::UnsupportedCheckpointVersion {
                found: checkpoint.version.clone(),
                expected: SUPPORTED_CHECKPOINT_VERSION.to_string(),
            });
        }
        self.total_samples_count = checkpoint.total_samples_count;
        self.first_sample_start = checkpoint.first_sample_start;
        self.last_sample_start = checkpoint.last_sample_start;
        self.aggregate_memory_peaks
            .load_from_checkpoint(&checkpoint.memory_histogram)?;
        self.aggregate_cpu_usage
            .load_from_checkpoint(&checkpoint.cpu_histogram)?;
        Ok(())
    }
}

fn cpu_sample_weight(sample: &ContainerUsageSample) -> f64 {
    sample.request.as_cores().max(MIN_SAMPLE_WEIGHT)
}

impl ContainerStateAggregator for Mutex<AggregateContainerState> {
    fn add_sample(&self, sample: &ContainerUsageSample) {
        self.lock().add_sample(sample);
    }

    fn subtract_sample(&self, sample: &ContainerUsageSample) {
        self.lock().subtract_sample(sample);
    }

    fn last_recommendation(&self) -> Resources {
        self.lock().last_recommendation.clone()
    }

    fn needs_recommendation(&self) -> bool {
        self.lock().needs_recommendation()
    }

    fn update_mode(&self) -> Option<UpdateMode> {
        self.lock().update_mode
    }
}

/// Point-in-time copy of an aggregate for the recommendation pass
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    cpu_usage: DecayingHistogram,
    memory_peaks: DecayingHistogram,
    pub first_sample_start: Option<DateTime<Utc>>,
    pub last_sample_start: Option<DateTime<Utc>>,
    pub total_samples_count: u64,
    pub creation_time: DateTime<Utc>,
    pub is_under_vpa: bool,
    pub update_mode: Option<UpdateMode>,
}

impl AggregateSnapshot {
    /// CPU usage in cores at `percentile` (0.0-1.0)
    pub fn cpu_percentile(&self, percentile: f64) -> f64 {
        self.cpu_usage.percentile(percentile)
    }

    /// Memory peak in bytes at `percentile` (0.0-1.0)
    pub fn memory_percentile(&self, percentile: f64) -> f64 {
        self.memory_peaks.percentile(percentile)
    }

    pub fn cpu_histogram(&self) -> &DecayingHistogram {
        &self.cpu_usage
    }

    pub fn memory_histogram(&self) -> &DecayingHistogram {
        &self.memory_peaks
    }
}

/// Serializable aggregate contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStateCheckpoint {
    pub last_update_time: DateTime<Utc>,
    pub version: String,
    pub cpu_histogram: HistogramCheckpoint,
    pub memory_histogram: HistogramCheckpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_sample_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sample_start: Option<DateTime<Utc>>,
    pub total_samples_count: u64,
}

/// Merge a set of aggregates per container name into fresh aggregates
pub fn aggregate_state_by_container_name<'a, I>(
    aggregates: I,
    context: &Arc<AggregationContext>,
    now: DateTime<Utc>,
) -> Result<HashMap<String, AggregateContainerState>>
where
    I: IntoIterator<Item = (&'a AggregateStateKey, &'a SharedAggregateState)>,
{
    let mut by_container: HashMap<String, AggregateContainerState> = HashMap::new();
    for (key, aggregate) in aggregates {
        let merged = by_container
            .entry(key.container_name().to_string())
            .or_insert_with(|| AggregateContainerState::new(context.clone(), now));
        merged.merge(&aggregate.lock())?;
    }
    Ok(by_container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AggregationsConfig, ResourceAmount};
    use chrono::{Duration, TimeZone};

    fn context() -> Arc<AggregationContext> {
        AggregationContext::new(AggregationsConfig::default()).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn cpu(millicores: i64, at: DateTime<Utc>) -> ContainerUsageSample {
        ContainerUsageSample::new(
            ResourceName::Cpu,
            ResourceAmount(millicores),
            ResourceAmount(1000),
            at,
        )
    }

    fn memory(bytes: i64, at: DateTime<Utc>) -> ContainerUsageSample {
        ContainerUsageSample::new(
            ResourceName::Memory,
            ResourceAmount(bytes),
            ResourceAmount(0),
            at,
        )
    }

    #[test]
    fn test_cpu_samples_update_counters() {
        let mut state = AggregateContainerState::new(context(), t0());
        state.add_sample(&cpu(100, t0() + Duration::minutes(1)));
        state.add_sample(&cpu(200, t0()));

        assert_eq!(state.total_samples_count, 2);
        assert_eq!(state.first_sample_start, Some(t0()));
        assert_eq!(state.last_sample_start, Some(t0() + Duration::minutes(1)));
        assert!(!state.aggregate_cpu_usage.is_empty());
    }

    #[test]
    fn test_memory_samples_leave_counters_alone() {
        let mut state = AggregateContainerState::new(context(), t0());
        state.add_sample(&memory(200 << 20, t0()));

        assert_eq!(state.total_samples_count, 0);
        assert!(state.first_sample_start.is_none());
        assert!(state.last_sample_start.is_none());
        assert!(!state.aggregate_memory_peaks.is_empty());
    }

    #[test]
    fn test_p90_grows_with_larger_sample() {
        let mut state = AggregateContainerState::new(context(), t0());
        state.add_sample(&cpu(100, t0()));
        let after_first = state.snapshot().cpu_percentile(0.9);
        state.add_sample(&cpu(150, t0() + Duration::seconds(60)));
        let after_second = state.snapshot().cpu_percentile(0.9);

        assert!(after_first >= 0.1);
        assert!(after_second > after_first);
    }

    #[test]
    fn test_subtract_memory_peak_is_exact_inverse() {
        let mut state = AggregateContainerState::new(context(), t0());
        state.add_sample(&memory(100 << 20, t0()));
        let weight = state.aggregate_memory_peaks.total_weight();
        let p50 = state.snapshot().memory_percentile(0.5);

        let peak = memory(300 << 20, t0() + Duration::hours(30));
        state.add_sample(&peak);
        state.subtract_sample(&peak);

        assert!((state.aggregate_memory_peaks.total_weight() - weight).abs() < 1e-9);
        assert_eq!(state.snapshot().memory_percentile(0.5), p50);
        assert_eq!(state.snapshot().memory_percentile(1.0), p50);
    }

    #[test]
    fn test_subtract_cpu_sample_restores_histogram() {
        let mut state = AggregateContainerState::new(context(), t0());
        state.add_sample(&cpu(100, t0()));
        let p95 = state.snapshot().cpu_percentile(0.95);

        let sample = cpu(900, t0() + Duration::minutes(1));
        state.add_sample(&sample);
        state.subtract_sample(&sample);

        assert_eq!(state.total_samples_count, 1);
        assert_eq!(state.snapshot().cpu_percentile(0.95), p95);
        assert_eq!(state.first_sample_start, Some(t0()));
        assert_eq!(state.last_sample_start, Some(t0() + Duration::minutes(1)));
    }

    #[test]
    fn test_merge_combines_history() {
        let mut a = AggregateContainerState::new(context(), t0());
        a.add_sample(&cpu(100, t0() + Duration::minutes(5)));
        let mut b = AggregateContainerState::new(context(), t0());
        b.add_sample(&cpu(400, t0()));
        b.add_sample(&cpu(400, t0() + Duration::minutes(10)));

        a.merge(&b).unwrap();
        assert_eq!(a.total_samples_count, 3);
        assert_eq!(a.first_sample_start, Some(t0()));
        assert_eq!(a.last_sample_start, Some(t0() + Duration::minutes(10)));
        assert!(a.snapshot().cpu_percentile(0.9) > 0.4);
    }

    #[test]
    fn test_policy_and_recommendation_flags() {
        let mut state = AggregateContainerState::new(context(), t0());
        assert!(!state.needs_recommendation());
        assert_eq!(state.controlled_resources(), DEFAULT_CONTROLLED_RESOURCES.to_vec());

        state.is_under_vpa = true;
        state.update_from_policy(None);
        assert_eq!(state.scaling_mode, Some(ContainerScalingMode::Auto));
        assert!(state.needs_recommendation());

        state.update_from_policy(Some(&ContainerResourcePolicy {
            container_name: "app".into(),
            mode: Some(ContainerScalingMode::Off),
            controlled_resources: Some(vec![ResourceName::Memory]),
        }));
        assert!(!state.needs_recommendation());
        assert_eq!(state.controlled_resources(), vec![ResourceName::Memory]);

        state.mark_not_autoscaled();
        assert!(!state.is_under_vpa);
        assert!(state.scaling_mode.is_none());
        assert!(state.update_mode.is_none());
    }

    #[test]
    fn test_expiry_uses_creation_time_when_empty() {
        let threshold = Duration::days(8);
        let mut state = AggregateContainerState::new(context(), t0());
        assert!(!state.is_expired(t0() + Duration::days(7), threshold));
        assert!(state.is_expired(t0() + Duration::days(8), threshold));

        state.add_sample(&cpu(100, t0() + Duration::days(5)));
        assert!(!state.is_expired(t0() + Duration::days(8), threshold));
        assert!(state.is_expired(t0() + Duration::days(13), threshold));
    }

    #[test]
    fn test_checkpoint_round_trip_through_json() {
        let mut state = AggregateContainerState::new(context(), t0());
        state.add_sample(&cpu(250, t0()));
        state.add_sample(&memory(512 << 20, t0()));

        let checkpoint = state.save_to_checkpoint(t0() + Duration::hours(1));
        let json = serde_json::to_string(&checkpoint).unwrap();
        let decoded: AggregateStateCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.version, SUPPORTED_CHECKPOINT_VERSION);

        let mut restored = AggregateContainerState::new(context(), t0());
        restored.load_from_checkpoint(&decoded).unwrap();
        assert_eq!(restored.total_samples_count, 1);
        assert_eq!(restored.last_sample_start, Some(t0()));
        assert_eq!(
            restored.snapshot().cpu_percentile(0.5),
            state.snapshot().cpu_percentile(0.5)
        );
        assert_eq!(
            restored.snapshot().memory_percentile(0.5),
            state.snapshot().memory_percentile(0.5)
        );
    }

    #[test]
    fn test_checkpoint_version_mismatch() {
        let state = AggregateContainerState::new(context(), t0());
        let mut checkpoint = state.save_to_checkpoint(t0());
        checkpoint.version = "v1".to_string();

        let mut target = AggregateContainerState::new(context(), t0());
        assert!(matches!(
            target.load_from_checkpoint(&checkpoint),
            Err(ModelError::UnsupportedCheckpointVersion { .. })
        ));
    }

    #[test]
    fn test_aggregate_state_by_container_name() {
        let mut labels_a = Labels::new();
        labels_a.insert("app".into(), "a".into());
        let mut labels_b = Labels::new();
        labels_b.insert("app".into(), "b".into());

        let key_a = AggregateStateKey::new("ns", "web", LabelSet::new(labels_a));
        let key_b = AggregateStateKey::new("ns", "web", LabelSet::new(labels_b.clone()));
        let key_c = AggregateStateKey::new("ns", "sidecar", LabelSet::new(labels_b));

        let mut aggregates = HashMap::new();
        for key in [&key_a, &key_b, &key_c] {
            let mut state = AggregateContainerState::new(context(), t0());
            state.add_sample(&cpu(100, t0()));
            aggregates.insert(key.clone(), state.shared());
        }

        let merged = aggregate_state_by_container_name(&aggregates, &context(), t0()).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["web"].total_samples_count, 2);
        assert_eq!(merged["sidecar"].total_samples_count, 1);
    }

    #[test]
    fn test_shared_state_implements_aggregator() {
        let shared = AggregateContainerState::new(context(), t0()).shared();
        let aggregator: Arc<dyn ContainerStateAggregator> = shared.clone();
        aggregator.add_sample(&cpu(100, t0()));
        assert_eq!(shared.lock().total_samples_count, 1);
        assert!(aggregator.last_recommendation().is_empty());
        assert!(aggregator.update_mode().is_none());
    }
}
