//! Registry of pods, VPAs and aggregates
//!
//! `ClusterState` is the single owner of every aggregate. Sample ingestion
//! only needs `&ClusterState` (per-container and per-aggregate locks cover the
//! hot path); anything that changes the shape of the registry needs `&mut`.
//!
//! A VPA pools an aggregate when it lives in the same namespace, its selector
//! matches the aggregate's labels and at least one live container currently
//! feeds it. Membership is recomputed for a namespace whenever pods or VPAs in
//! it change. Garbage collection keeps any aggregate a registered container
//! points at, whatever the phase of its pod.

use super::aggregation::{
    AggregateContainerState, AggregateSnapshot, AggregateStateCheckpoint, AggregateStateKey,
    SharedAggregateState,
};
use super::config::AggregationContext;
use super::container::ContainerState;
use super::labels::{LabelSet, LabelSetCache, Labels, PodSelector};
use super::vpa::Vpa;
use super::{
    ContainerId, ContainerUsageSampleWithKey, ModelError, PodId, PodPhase, ResourceAmount,
    Resources, Result, VpaId, VpaObject,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How long a VPA may go without a recommendation before it is reported again
pub const RECOMMENDATION_MISSING_MAX_SECS: i64 = 30 * 60;

pub struct PodState {
    pub id: PodId,
    labels: LabelSet,
    pub phase: PodPhase,
    containers: HashMap<String, Mutex<ContainerState>>,
}

impl PodState {
    pub fn labels(&self) -> &Labels {
        self.labels.labels()
    }

    pub fn label_set(&self) -> &LabelSet {
        &self.labels
    }

    pub fn container_names(&self) -> impl Iterator<Item = &str> {
        self.containers.keys().map(String::as_str)
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    fn aggregate_key(&self, container_name: &str) -> AggregateStateKey {
        AggregateStateKey::new(&self.id.namespace, container_name, self.labels.clone())
    }
}

/// Outcome of one garbage collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub aggregates_removed: usize,
    pub aggregates_remaining: usize,
    pub label_sets_pruned: usize,
}

pub struct ClusterState {
    pods: HashMap<PodId, PodState>,
    vpas: HashMap<VpaId, Vpa>,
    /// First time each VPA was seen without a recommendation
    empty_vpas: HashMap<VpaId, DateTime<Utc>>,
    observed_vpas: Vec<VpaObject>,
    aggregate_states: HashMap<AggregateStateKey, SharedAggregateState>,
    label_set_cache: LabelSetCache,
    last_gc: Option<DateTime<Utc>>,
    gc_interval: Duration,
    context: Arc<AggregationContext>,
}

impl ClusterState {
    pub fn new(context: Arc<AggregationContext>, gc_interval: Duration) -> Self {
        Self {
            pods: HashMap::new(),
            vpas: HashMap::new(),
            empty_vpas: HashMap::new(),
            observed_vpas: Vec::new(),
            aggregate_states: HashMap::new(),
            label_set_cache: LabelSetCache::new(),
            last_gc: None,
            gc_interval,
            context,
        }
    }

    pub fn context(&self) -> &Arc<AggregationContext> {
        &self.context
    }

    pub fn gc_interval(&self) -> Duration {
        self.gc_interval
    }

    // ---- Pods and containers ----

    /// Register a pod or update its labels and phase
    ///
    /// A label change moves every container of the pod to the aggregate of
    /// its new key. History already recorded stays with the old aggregate.
    pub fn add_or_update_pod(
        &mut self,
        id: PodId,
        labels: &Labels,
        phase: PodPhase,
        now: DateTime<Utc>,
    ) {
        let namespace = id.namespace.clone();
        let new_labels = self.label_set_cache.intern(labels);

        match self.pods.get_mut(&id) {
            None => {
                debug!(pod = %id, labels = %new_labels, "Adding pod");
                self.pods.insert(
                    id.clone(),
                    PodState {
                        id,
                        labels: new_labels,
                        phase,
                        containers: HashMap::new(),
                    },
                );
            }
            Some(pod) => {
                pod.phase = phase;
                if pod.labels != new_labels {
                    debug!(
                        pod = %pod.id,
                        old_labels = %pod.labels,
                        new_labels = %new_labels,
                        "Pod labels changed, moving containers to new aggregates"
                    );
                    pod.labels = new_labels;
                    for (name, container) in pod.containers.iter_mut() {
                        let key = AggregateStateKey::new(
                            &pod.id.namespace,
                            name.as_str(),
                            pod.labels.clone(),
                        );
                        let aggregate = Self::find_or_create_aggregate(
                            &mut self.aggregate_states,
                            &self.context,
                            key,
                            now,
                        );
                        container.get_mut().set_aggregator(aggregate);
                    }
                }
            }
        }

        self.recompute_vpa_membership(&namespace);
    }

    pub fn delete_pod(&mut self, id: &PodId) -> Result<()> {
        if self.pods.remove(id).is_none() {
            return Err(ModelError::PodNotFound(id.clone()));
        }
        debug!(pod = %id, "Deleted pod");
        self.recompute_vpa_membership(&id.namespace);
        Ok(())
    }

    /// Register a container of a known pod or update its requests
    pub fn add_or_update_container(
        &mut self,
        id: &ContainerId,
        request: Resources,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let pod = self
            .pods
            .get_mut(&id.pod_id)
            .ok_or_else(|| ModelError::PodNotFound(id.pod_id.clone()))?;

        if let Some(container) = pod.containers.get_mut(&id.container_name) {
            container.get_mut().request = request;
            return Ok(());
        }

        let aggregate = Self::find_or_create_aggregate(
            &mut self.aggregate_states,
            &self.context,
            pod.aggregate_key(&id.container_name),
            now,
        );
        pod.containers.insert(
            id.container_name.clone(),
            Mutex::new(ContainerState::new(request, aggregate, self.context.clone())),
        );
        debug!(container = %id, "Added container");

        self.recompute_vpa_membership(&id.pod_id.namespace);
        Ok(())
    }

    /// Forget a container that is no longer part of its pod
    pub fn delete_container(&mut self, id: &ContainerId) -> Result<()> {
        let pod = self
            .pods
            .get_mut(&id.pod_id)
            .ok_or_else(|| ModelError::PodNotFound(id.pod_id.clone()))?;
        if pod.containers.remove(&id.container_name).is_none() {
            return Err(ModelError::ContainerNotFound(id.clone()));
        }
        debug!(container = %id, "Deleted container");

        self.recompute_vpa_membership(&id.pod_id.namespace);
        Ok(())
    }

    /// Route a usage sample to its container
    ///
    /// `Ok(false)` means the sample was stale, duplicate or invalid and was
    /// dropped.
    pub fn add_sample(&self, sample: &ContainerUsageSampleWithKey) -> Result<bool> {
        let mut container = self.locate_container(&sample.container)?;
        Ok(container.add_sample(&sample.sample))
    }

    pub fn record_oom(
        &self,
        id: &ContainerId,
        timestamp: DateTime<Utc>,
        requested_memory: ResourceAmount,
    ) -> Result<()> {
        self.locate_container(id)?
            .record_oom(timestamp, requested_memory)
    }

    /// Lock and return a container's state
    pub fn container(&self, id: &ContainerId) -> Option<MutexGuard<'_, ContainerState>> {
        self.locate_container(id).ok()
    }

    fn locate_container(&self, id: &ContainerId) -> Result<MutexGuard<'_, ContainerState>> {
        let pod = self
            .pods
            .get(&id.pod_id)
            .ok_or_else(|| ModelError::PodNotFound(id.pod_id.clone()))?;
        let container = pod
            .containers
            .get(&id.container_name)
            .ok_or_else(|| ModelError::ContainerNotFound(id.clone()))?;
        Ok(container.lock())
    }

    pub fn pod(&self, id: &PodId) -> Option<&PodState> {
        self.pods.get(id)
    }

    pub fn pods(&self) -> impl Iterator<Item = &PodState> {
        self.pods.values()
    }

    fn find_or_create_aggregate(
        aggregates: &mut HashMap<AggregateStateKey, SharedAggregateState>,
        context: &Arc<AggregationContext>,
        key: AggregateStateKey,
        now: DateTime<Utc>,
    ) -> SharedAggregateState {
        aggregates
            .entry(key)
            .or_insert_with_key(|key| {
                debug!(aggregate = %key, "Created aggregate");
                AggregateContainerState::new(context.clone(), now).shared()
            })
            .clone()
    }

    /// Keys fed by containers of pods that are still running
    fn live_keys(&self, namespace: &str) -> HashSet<AggregateStateKey> {
        self.pods
            .values()
            .filter(|pod| pod.phase.is_active() && pod.id.namespace == namespace)
            .flat_map(|pod| pod.container_names().map(|name| pod.aggregate_key(name)))
            .collect()
    }

    /// Keys of every registered container, terminated pods included
    fn referenced_keys(&self) -> HashSet<AggregateStateKey> {
        self.pods
            .values()
            .flat_map(|pod| pod.container_names().map(|name| pod.aggregate_key(name)))
            .collect()
    }

    // ---- VPAs ----

    /// Create or refresh a VPA from its API object
    ///
    /// A changed selector replaces the VPA so that membership is rebuilt
    /// from scratch.
    pub fn add_or_update_vpa(&mut self, object: &VpaObject, selector: Arc<dyn PodSelector>) {
        let id = object.id();
        let selector_changed = self
            .vpas
            .get(&id)
            .is_some_and(|vpa| vpa.pod_selector.fingerprint() != selector.fingerprint());
        if selector_changed {
            info!(vpa = %id, "VPA selector changed, recreating");
            self.release_vpa(&id);
        }

        let vpa = self.vpas.entry(id.clone()).or_insert_with(|| {
            debug!(vpa = %id, selector = ?selector, "Adding VPA");
            Vpa::new(
                id.clone(),
                selector,
                object.creation_timestamp,
                self.context.clone(),
            )
        });
        vpa.target_ref = object.target_ref.clone();
        vpa.annotations = object.annotations.clone();
        vpa.conditions = object.conditions.as_slice().into();
        vpa.recommendation = object.recommendation.clone();
        vpa.is_v1beta1_api = object.is_v1beta1_api;
        vpa.set_update_mode(object.update_mode);
        vpa.set_resource_policy(object.resource_policy.clone());

        self.recompute_vpa_membership(&id.namespace);
    }

    pub fn delete_vpa(&mut self, id: &VpaId) -> Result<()> {
        if !self.release_vpa(id) {
            return Err(ModelError::VpaNotFound(id.clone()));
        }
        self.empty_vpas.remove(id);
        debug!(vpa = %id, "Deleted VPA");
        Ok(())
    }

    /// Remove a VPA and clear policy flags on aggregates nobody else pools
    fn release_vpa(&mut self, id: &VpaId) -> bool {
        let Some(mut vpa) = self.vpas.remove(id) else {
            return false;
        };
        let keys: Vec<AggregateStateKey> = vpa.aggregation_keys().cloned().collect();
        for key in keys {
            if let Some(state) = vpa.delete_aggregation(&key) {
                if !self.vpas.values().any(|other| other.uses_aggregation(&key)) {
                    state.lock().mark_not_autoscaled();
                }
            }
        }
        true
    }

    pub fn vpa(&self, id: &VpaId) -> Option<&Vpa> {
        self.vpas.get(id)
    }

    pub fn vpa_mut(&mut self, id: &VpaId) -> Option<&mut Vpa> {
        self.vpas.get_mut(id)
    }

    pub fn vpas(&self) -> impl Iterator<Item = &Vpa> {
        self.vpas.values()
    }

    /// Bring VPA pools of one namespace in line with the live containers
    pub fn recompute_vpa_membership(&mut self, namespace: &str) {
        let live = self.live_keys(namespace);
        let mut released: Vec<(AggregateStateKey, SharedAggregateState)> = Vec::new();

        for vpa in self
            .vpas
            .values_mut()
            .filter(|vpa| vpa.id.namespace == namespace)
        {
            let stale: Vec<AggregateStateKey> = vpa
                .aggregation_keys()
                .filter(|key| !live.contains(*key) || !vpa.matches_aggregation(key))
                .cloned()
                .collect();
            for key in stale {
                if let Some(state) = vpa.delete_aggregation(&key) {
                    debug!(vpa = %vpa.id, aggregate = %key, "VPA released aggregate");
                    released.push((key, state));
                }
            }

            for key in &live {
                if let Some(state) = self.aggregate_states.get(key) {
                    if vpa.use_aggregation_if_matching(key, state) {
                        debug!(vpa = %vpa.id, aggregate = %key, "VPA pooled aggregate");
                    }
                }
            }

            vpa.pod_count = self
                .pods
                .values()
                .filter(|pod| {
                    pod.id.namespace == namespace
                        && pod.phase.is_active()
                        && vpa.pod_selector.matches(pod.labels())
                })
                .count();
        }

        for (key, state) in released {
            if !self.vpas.values().any(|vpa| vpa.uses_aggregation(&key)) {
                state.lock().mark_not_autoscaled();
            }
        }
    }

    /// Recompute membership for every namespace that has a VPA
    pub fn recompute_all_vpa_memberships(&mut self) {
        let namespaces: HashSet<String> =
            self.vpas.keys().map(|id| id.namespace.clone()).collect();
        for namespace in namespaces {
            self.recompute_vpa_membership(&namespace);
        }
    }

    /// Live pods selected by a VPA
    pub fn get_matching_pods(&self, id: &VpaId) -> Result<Vec<PodId>> {
        let vpa = self
            .vpas
            .get(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        let mut pods: Vec<PodId> = self
            .pods
            .values()
            .filter(|pod| {
                pod.id.namespace == id.namespace
                    && pod.phase.is_active()
                    && vpa.pod_selector.matches(pod.labels())
            })
            .map(|pod| pod.id.clone())
            .collect();
        pods.sort();
        Ok(pods)
    }

    /// Track VPAs without a recommendation
    ///
    /// Returns how long the VPA has gone without one when that exceeds
    /// [`RECOMMENDATION_MISSING_MAX_SECS`]; the clock then restarts so the
    /// next report comes one period later.
    pub fn record_recommendation(
        &mut self,
        id: &VpaId,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>> {
        let vpa = self
            .vpas
            .get(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        if vpa.has_recommendation() {
            self.empty_vpas.remove(id);
            return Ok(None);
        }

        match self.empty_vpas.get(id).copied() {
            None => {
                self.empty_vpas.insert(id.clone(), now);
                Ok(None)
            }
            Some(since) if now - since > Duration::seconds(RECOMMENDATION_MISSING_MAX_SECS) => {
                self.empty_vpas.insert(id.clone(), now);
                let missing_for = now - since;
                warn!(
                    vpa = %id,
                    missing_for_secs = missing_for.num_seconds(),
                    "VPA is missing a recommendation"
                );
                Ok(Some(missing_for))
            }
            Some(_) => Ok(None),
        }
    }

    pub fn empty_vpa_count(&self) -> usize {
        self.empty_vpas.len()
    }

    pub fn set_observed_vpas(&mut self, observed: Vec<VpaObject>) {
        self.observed_vpas = observed;
    }

    pub fn observed_vpas(&self) -> &[VpaObject] {
        &self.observed_vpas
    }

    // ---- Checkpoints ----

    /// Seed a VPA's initial history for one container
    pub fn load_checkpoint(
        &mut self,
        id: &VpaId,
        container_name: &str,
        checkpoint: &AggregateStateCheckpoint,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let vpa = self
            .vpas
            .get_mut(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        let mut state = AggregateContainerState::new(self.context.clone(), now);
        state.load_from_checkpoint(checkpoint)?;
        vpa.containers_initial_aggregate_state
            .insert(container_name.to_string(), state);
        Ok(())
    }

    /// Checkpoints of a VPA's pooled history, one per container name
    pub fn vpa_checkpoints(
        &mut self,
        id: &VpaId,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, AggregateStateCheckpoint)>> {
        let vpa = self
            .vpas
            .get_mut(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        let mut checkpoints: Vec<(String, AggregateStateCheckpoint)> = vpa
            .aggregate_state_by_container_name(now)?
            .into_iter()
            .map(|(name, state)| (name, state.save_to_checkpoint(now)))
            .collect();
        checkpoints.sort_by(|a, b| a.0.cmp(&b.0));
        vpa.checkpoint_written = Some(now);
        Ok(checkpoints)
    }

    // ---- Aggregates ----

    pub fn aggregate_state(&self, key: &AggregateStateKey) -> Option<&SharedAggregateState> {
        self.aggregate_states.get(key)
    }

    pub fn aggregate_states(
        &self,
    ) -> impl Iterator<Item = (&AggregateStateKey, &SharedAggregateState)> {
        self.aggregate_states.iter()
    }

    /// Copy every aggregate, locking one at a time
    pub fn aggregate_snapshots(&self) -> Vec<(AggregateStateKey, AggregateSnapshot)> {
        self.aggregate_states
            .iter()
            .map(|(key, state)| (key.clone(), state.lock().snapshot()))
            .collect()
    }

    /// Run [`Self::garbage_collect`] unless the last pass was under one interval ago
    pub fn rate_limited_garbage_collect(&mut self, now: DateTime<Utc>) -> Option<GcReport> {
        if self
            .last_gc
            .is_some_and(|last| now - last < self.gc_interval)
        {
            return None;
        }
        self.last_gc = Some(now);
        Some(self.garbage_collect(now))
    }

    /// Drop aggregates nobody uses that have gone stale, then unused label sets
    pub fn garbage_collect(&mut self, now: DateTime<Utc>) -> GcReport {
        let threshold = self
            .context
            .config
            .memory_aggregation_window_length()
            .max(self.gc_interval);
        let referenced = self.referenced_keys();
        let pooled: HashSet<AggregateStateKey> = self
            .vpas
            .values()
            .flat_map(|vpa| vpa.aggregation_keys().cloned())
            .collect();

        let before = self.aggregate_states.len();
        self.aggregate_states.retain(|key, state| {
            let keep = referenced.contains(key)
                || pooled.contains(key)
                || !state.lock().is_expired(now, threshold);
            if !keep {
                debug!(aggregate = %key, "Garbage collecting aggregate");
            }
            keep
        });
        let aggregates_removed = before - self.aggregate_states.len();

        let in_use: HashSet<&str> = self
            .pods
            .values()
            .map(|pod| pod.labels.fingerprint())
            .chain(
                self.aggregate_states
                    .keys()
                    .map(|key| key.label_set().fingerprint()),
            )
            .collect();
        let label_sets_pruned = self.label_set_cache.retain_in_use(&in_use);

        let report = GcReport {
            aggregates_removed,
            aggregates_remaining: self.aggregate_states.len(),
            label_sets_pruned,
        };
        info!(
            removed = report.aggregates_removed,
            remaining = report.aggregates_remaining,
            label_sets_pruned = report.label_sets_pruned,
            "Garbage collected aggregates"
        );
        report
    }

    pub fn last_gc(&self) -> Option<DateTime<Utc>> {
        self.last_gc
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn container_count(&self) -> usize {
        self.pods.values().map(PodState::container_count).sum()
    }

    pub fn vpa_count(&self) -> usize {
        self.vpas.len()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregate_states.len()
    }

    pub fn label_set_count(&self) -> usize {
        self.label_set_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AggregationsConfig, ContainerUsageSample, LabelSelector, ResourceName, UpdateMode,
    };
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn cluster() -> ClusterState {
        let context = AggregationContext::new(AggregationsConfig::default()).unwrap();
        ClusterState::new(context, Duration::hours(1))
    }

    fn labels(app: &str) -> Labels {
        Labels::from([("app".to_string(), app.to_string())])
    }

    fn vpa_object(name: &str) -> VpaObject {
        VpaObject {
            namespace: "ns".into(),
            name: name.into(),
            creation_timestamp: t0(),
            annotations: Default::default(),
            target_ref: None,
            update_mode: Some(UpdateMode::Auto),
            resource_policy: None,
            conditions: vec![],
            recommendation: None,
            is_v1beta1_api: false,
        }
    }

    fn cpu_sample(container: &ContainerId, at: DateTime<Utc>) -> ContainerUsageSampleWithKey {
        ContainerUsageSampleWithKey {
            container: container.clone(),
            sample: ContainerUsageSample::new(
                ResourceName::Cpu,
                ResourceAmount(100),
                ResourceAmount(100),
                at,
            ),
        }
    }

    #[test]
    fn test_add_container_requires_pod() {
        let mut cluster = cluster();
        let id = ContainerId::new(PodId::new("ns", "pod"), "app");
        assert!(matches!(
            cluster.add_or_update_container(&id, Resources::new(), t0()),
            Err(ModelError::PodNotFound(_))
        ));
    }

    #[test]
    fn test_deleted_container_releases_aggregate() {
        let mut cluster = cluster();
        let pod = PodId::new("ns", "pod");
        cluster.add_or_update_pod(pod.clone(), &labels("foo"), PodPhase::Running, t0());
        let sidecar = ContainerId::new(pod.clone(), "sidecar");
        cluster
            .add_or_update_container(&sidecar, Resources::new(), t0())
            .unwrap();

        cluster.delete_container(&sidecar).unwrap();
        assert_eq!(cluster.container_count(), 0);
        assert!(matches!(
            cluster.add_sample(&cpu_sample(&sidecar, t0())),
            Err(ModelError::ContainerNotFound(_))
        ));
        assert!(matches!(
            cluster.delete_container(&sidecar),
            Err(ModelError::ContainerNotFound(_))
        ));

        let report = cluster.garbage_collect(t0() + Duration::days(9));
        assert_eq!(report.aggregates_removed, 1);
    }

    #[test]
    fn test_sample_to_unknown_container() {
        let mut cluster = cluster();
        let pod = PodId::new("ns", "pod");
        cluster.add_or_update_pod(pod.clone(), &labels("foo"), PodPhase::Running, t0());
        let id = ContainerId::new(pod, "missing");
        assert!(matches!(
            cluster.add_sample(&cpu_sample(&id, t0())),
            Err(ModelError::ContainerNotFound(_))
        ));
    }

    #[test]
    fn test_samples_reach_aggregate() {
        let mut cluster = cluster();
        let pod = PodId::new("ns", "pod");
        let id = ContainerId::new(pod.clone(), "app");
        cluster.add_or_update_pod(pod, &labels("foo"), PodPhase::Running, t0());
        cluster
            .add_or_update_container(&id, Resources::new(), t0())
            .unwrap();

        assert!(cluster.add_sample(&cpu_sample(&id, t0())).unwrap());
        assert!(!cluster.add_sample(&cpu_sample(&id, t0())).unwrap());

        let snapshots = cluster.aggregate_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].1.total_samples_count, 1);
        assert_eq!(cluster.container(&id).unwrap().last_cpu_sample_start, Some(t0()));
    }

    #[test]
    fn test_containers_with_same_key_share_aggregate() {
        let mut cluster = cluster();
        for name in ["pod-a", "pod-b"] {
            let pod = PodId::new("ns", name);
            cluster.add_or_update_pod(pod.clone(), &labels("foo"), PodPhase::Running, t0());
            cluster
                .add_or_update_container(
                    &ContainerId::new(pod, "app"),
                    Resources::new(),
                    t0(),
                )
                .unwrap();
        }
        assert_eq!(cluster.aggregate_count(), 1);
        assert_eq!(cluster.container_count(), 2);
        assert_eq!(cluster.label_set_count(), 1);
    }

    #[test]
    fn test_vpa_lifecycle() {
        let mut cluster = cluster();
        let pod = PodId::new("ns", "pod");
        let id = ContainerId::new(pod.clone(), "app");
        cluster.add_or_update_pod(pod.clone(), &labels("foo"), PodPhase::Running, t0());
        cluster
            .add_or_update_container(&id, Resources::new(), t0())
            .unwrap();

        let object = vpa_object("web");
        cluster.add_or_update_vpa(
            &object,
            Arc::new(LabelSelector::from_labels([("app", "foo")])),
        );

        let vpa = cluster.vpa(&object.id()).unwrap();
        assert_eq!(vpa.aggregation_count(), 1);
        assert_eq!(vpa.pod_count, 1);
        assert_eq!(cluster.get_matching_pods(&object.id()).unwrap(), vec![pod]);

        let (_, aggregate) = cluster.aggregate_states().next().unwrap();
        assert!(aggregate.lock().is_under_vpa);
        assert_eq!(aggregate.lock().update_mode, Some(UpdateMode::Auto));

        cluster.delete_vpa(&object.id()).unwrap();
        let (_, aggregate) = cluster.aggregate_states().next().unwrap();
        assert!(!aggregate.lock().is_under_vpa);
        assert!(matches!(
            cluster.delete_vpa(&object.id()),
            Err(ModelError::VpaNotFound(_))
        ));
    }

    #[test]
    fn test_aggregate_stays_under_vpa_while_another_pools_it() {
        let mut cluster = cluster();
        let pod = PodId::new("ns", "pod");
        cluster.add_or_update_pod(pod.clone(), &labels("foo"), PodPhase::Running, t0());
        cluster
            .add_or_update_container(&ContainerId::new(pod, "app"), Resources::new(), t0())
            .unwrap();

        let selector = Arc::new(LabelSelector::from_labels([("app", "foo")]));
        cluster.add_or_update_vpa(&vpa_object("first"), selector.clone());
        cluster.add_or_update_vpa(&vpa_object("second"), selector);
        cluster.delete_vpa(&vpa_object("first").id()).unwrap();

        let (_, aggregate) = cluster.aggregate_states().next().unwrap();
        assert!(aggregate.lock().is_under_vpa);
    }

    #[test]
    fn test_record_recommendation_cadence() {
        let mut cluster = cluster();
        let object = vpa_object("web");
        cluster.add_or_update_vpa(&object, Arc::new(LabelSelector::default()));
        let id = object.id();

        assert_eq!(cluster.record_recommendation(&id, t0()).unwrap(), None);
        assert_eq!(
            cluster
                .record_recommendation(&id, t0() + Duration::minutes(20))
                .unwrap(),
            None
        );
        assert_eq!(
            cluster
                .record_recommendation(&id, t0() + Duration::minutes(31))
                .unwrap(),
            Some(Duration::minutes(31))
        );
        // the clock restarted at 31 minutes
        assert_eq!(
            cluster
                .record_recommendation(&id, t0() + Duration::minutes(45))
                .unwrap(),
            None
        );
        assert_eq!(cluster.empty_vpa_count(), 1);
        assert!(cluster
            .record_recommendation(&VpaId::new("ns", "missing"), t0())
            .is_err());
    }

    #[test]
    fn test_observed_vpas_are_stored() {
        let mut cluster = cluster();
        cluster.set_observed_vpas(vec![vpa_object("a"), vpa_object("b")]);
        assert_eq!(cluster.observed_vpas().len(), 2);
        assert_eq!(cluster.observed_vpas()[1].name, "b");
    }
}
