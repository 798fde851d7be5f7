//! VPA objects and the aggregates they pool

use super::aggregation::{
    aggregate_state_by_container_name, AggregateContainerState, AggregateStateKey,
    SharedAggregateState,
};
use super::config::AggregationContext;
use super::{
    PodResourcePolicy, PodSelector, RecommendedPodResources, Result, TargetRef, UpdateMode,
    VpaCondition, VpaConditionType, VpaId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const NO_PODS_MATCHED_REASON: &str = "NoPodsMatched";
const NO_PODS_MATCHED_MESSAGE: &str = "No pods match this VPA object";

/// Status conditions keyed by type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VpaConditions(BTreeMap<VpaConditionType, VpaCondition>);

impl VpaConditions {
    /// Set a condition, keeping the transition time if the status is unchanged
    pub fn set(
        &mut self,
        condition_type: VpaConditionType,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let last_transition_time = match self.0.get(&condition_type) {
            Some(old) if old.status == status => old.last_transition_time,
            _ => Some(now),
        };
        self.0.insert(
            condition_type,
            VpaCondition {
                condition_type,
                status,
                last_transition_time,
                reason: reason.to_string(),
                message: message.to_string(),
            },
        );
    }

    pub fn remove(&mut self, condition_type: VpaConditionType) -> Option<VpaCondition> {
        self.0.remove(&condition_type)
    }

    pub fn get(&self, condition_type: VpaConditionType) -> Option<&VpaCondition> {
        self.0.get(&condition_type)
    }

    pub fn as_list(&self) -> Vec<VpaCondition> {
        self.0.values().cloned().collect()
    }
}

impl From<&[VpaCondition]> for VpaConditions {
    fn from(conditions: &[VpaCondition]) -> Self {
        Self(
            conditions
                .iter()
                .map(|c| (c.condition_type, c.clone()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaStatus {
    pub conditions: Vec<VpaCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendedPodResources>,
}

pub struct Vpa {
    pub id: VpaId,
    pub pod_selector: Arc<dyn PodSelector>,
    pub annotations: BTreeMap<String, String>,
    pub conditions: VpaConditions,
    pub recommendation: Option<RecommendedPodResources>,
    aggregate_container_states: HashMap<AggregateStateKey, SharedAggregateState>,
    resource_policy: Option<PodResourcePolicy>,
    /// Per-container history restored from checkpoints
    pub containers_initial_aggregate_state: HashMap<String, AggregateContainerState>,
    update_mode: Option<UpdateMode>,
    pub created: DateTime<Utc>,
    pub checkpoint_written: Option<DateTime<Utc>>,
    pub is_v1beta1_api: bool,
    pub target_ref: Option<TargetRef>,
    /// Number of live pods matched by the selector
    pub pod_count: usize,
    context: Arc<AggregationContext>,
}

impl Vpa {
    pub fn new(
        id: VpaId,
        pod_selector: Arc<dyn PodSelector>,
        created: DateTime<Utc>,
        context: Arc<AggregationContext>,
    ) -> Self {
        Self {
            id,
            pod_selector,
            annotations: BTreeMap::new(),
            conditions: VpaConditions::default(),
            recommendation: None,
            aggregate_container_states: HashMap::new(),
            resource_policy: None,
            containers_initial_aggregate_state: HashMap::new(),
            update_mode: None,
            created,
            checkpoint_written: None,
            is_v1beta1_api: false,
            target_ref: None,
            pod_count: 0,
            context,
        }
    }

    /// Same namespace and the selector accepts the key's labels
    pub fn matches_aggregation(&self, key: &AggregateStateKey) -> bool {
        self.id.namespace == key.namespace() && self.pod_selector.matches(key.labels())
    }

    /// Start pooling `aggregate` if it matches and is not pooled yet
    pub fn use_aggregation_if_matching(
        &mut self,
        key: &AggregateStateKey,
        aggregate: &SharedAggregateState,
    ) -> bool {
        if self.uses_aggregation(key) || !self.matches_aggregation(key) {
            return false;
        }
        {
            let mut state = aggregate.lock();
            state.is_under_vpa = true;
            state.update_mode = self.update_mode;
            state.update_from_policy(self.container_policy(key.container_name()));
        }
        self.aggregate_container_states
            .insert(key.clone(), aggregate.clone());
        true
    }

    pub fn uses_aggregation(&self, key: &AggregateStateKey) -> bool {
        self.aggregate_container_states.contains_key(key)
    }

    /// Stop pooling `key`, returning the released aggregate
    ///
    /// Policy flags on the aggregate are left as they are; the caller clears
    /// them once no other VPA pools it.
    pub fn delete_aggregation(&mut self, key: &AggregateStateKey) -> Option<SharedAggregateState> {
        self.aggregate_container_states.remove(key)
    }

    pub fn aggregation_keys(&self) -> impl Iterator<Item = &AggregateStateKey> {
        self.aggregate_container_states.keys()
    }

    pub fn aggregations(
        &self,
    ) -> impl Iterator<Item = (&AggregateStateKey, &SharedAggregateState)> {
        self.aggregate_container_states.iter()
    }

    pub fn aggregation_count(&self) -> usize {
        self.aggregate_container_states.len()
    }

    pub fn resource_policy(&self) -> Option<&PodResourcePolicy> {
        self.resource_policy.as_ref()
    }

    pub fn set_resource_policy(&mut self, policy: Option<PodResourcePolicy>) {
        if self.resource_policy == policy {
            return;
        }
        self.resource_policy = policy;
        for (key, aggregate) in &self.aggregate_container_states {
            let policy = self
                .resource_policy
                .as_ref()
                .and_then(|p| p.container_policy(key.container_name()));
            aggregate.lock().update_from_policy(policy);
        }
    }

    pub fn update_mode(&self) -> Option<UpdateMode> {
        self.update_mode
    }

    pub fn set_update_mode(&mut self, update_mode: Option<UpdateMode>) {
        if self.update_mode == update_mode {
            return;
        }
        self.update_mode = update_mode;
        for aggregate in self.aggregate_container_states.values() {
            aggregate.lock().update_mode = update_mode;
        }
    }

    fn container_policy(&self, container_name: &str) -> Option<&super::ContainerResourcePolicy> {
        self.resource_policy
            .as_ref()
            .and_then(|p| p.container_policy(container_name))
    }

    /// Pooled history per container name, checkpointed history folded in
    pub fn aggregate_state_by_container_name(
        &self,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, AggregateContainerState>> {
        let mut by_container = aggregate_state_by_container_name(
            &self.aggregate_container_states,
            &self.context,
            now,
        )?;
        for (container_name, initial) in &self.containers_initial_aggregate_state {
            by_container
                .entry(container_name.clone())
                .or_insert_with(|| AggregateContainerState::new(self.context.clone(), now))
                .merge(initial)?;
        }
        Ok(by_container)
    }

    pub fn has_recommendation(&self) -> bool {
        self.recommendation
            .as_ref()
            .is_some_and(|r| !r.container_recommendations.is_empty())
    }

    /// Store a recommendation and hand uncapped targets to the pooled aggregates
    pub fn update_recommendation(&mut self, recommendation: RecommendedPodResources) {
        for container in &recommendation.container_recommendations {
            for (key, aggregate) in &self.aggregate_container_states {
                if key.container_name() == container.container_name {
                    aggregate.lock().last_recommendation = container.uncapped_target.clone();
                }
            }
        }
        self.recommendation = Some(recommendation);
    }

    pub fn update_conditions(&mut self, pods_matched: bool, now: DateTime<Utc>) {
        let (reason, message) = if pods_matched {
            self.conditions.remove(VpaConditionType::NoPodsMatched);
            ("", "")
        } else {
            self.conditions.set(
                VpaConditionType::NoPodsMatched,
                true,
                NO_PODS_MATCHED_REASON,
                NO_PODS_MATCHED_MESSAGE,
                now,
            );
            (NO_PODS_MATCHED_REASON, NO_PODS_MATCHED_MESSAGE)
        };
        if self.has_recommendation() {
            self.conditions
                .set(VpaConditionType::RecommendationProvided, true, "", "", now);
        } else {
            self.conditions.set(
                VpaConditionType::RecommendationProvided,
                false,
                reason,
                message,
                now,
            );
        }
    }

    pub fn has_matched_pods(&self) -> bool {
        !self
            .conditions
            .get(VpaConditionType::NoPodsMatched)
            .is_some_and(|c| c.status)
    }

    pub fn as_status(&self) -> VpaStatus {
        VpaStatus {
            conditions: self.conditions.as_list(),
            recommendation: self.recommendation.clone(),
        }
    }
}

impl std::fmt::Debug for Vpa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vpa")
            .field("id", &self.id)
            .field("pod_selector", &self.pod_selector)
            .field("aggregations", &self.aggregate_container_states.len())
            .field("update_mode", &self.update_mode)
            .field("pod_count", &self.pod_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AggregationsConfig, ContainerResourcePolicy, ContainerScalingMode,
        ContainerUsageSample, LabelSelector, LabelSet, Labels, RecommendedContainerResources,
        ResourceAmount, ResourceName, Resources,
    };
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn context() -> Arc<AggregationContext> {
        AggregationContext::new(AggregationsConfig::default()).unwrap()
    }

    fn key(namespace: &str, container: &str, app: &str) -> AggregateStateKey {
        let mut labels = Labels::new();
        labels.insert("app".into(), app.into());
        AggregateStateKey::new(namespace, container, LabelSet::new(labels))
    }

    fn vpa(app: &str) -> Vpa {
        Vpa::new(
            VpaId::new("ns", "web"),
            Arc::new(LabelSelector::from_labels([("app", app)])),
            t0(),
            context(),
        )
    }

    fn aggregate() -> SharedAggregateState {
        AggregateContainerState::new(context(), t0()).shared()
    }

    #[test]
    fn test_use_aggregation_requires_match() {
        let mut vpa = vpa("foo");
        let matching = aggregate();
        assert!(vpa.use_aggregation_if_matching(&key("ns", "app", "foo"), &matching));
        assert!(!vpa.use_aggregation_if_matching(&key("ns", "app", "foo"), &matching));
        assert!(!vpa.use_aggregation_if_matching(&key("ns", "app", "bar"), &aggregate()));
        assert!(!vpa.use_aggregation_if_matching(&key("other", "app", "foo"), &aggregate()));

        assert_eq!(vpa.aggregation_count(), 1);
        let state = matching.lock();
        assert!(state.is_under_vpa);
        assert_eq!(state.scaling_mode, Some(ContainerScalingMode::Auto));
    }

    #[test]
    fn test_delete_aggregation_returns_state() {
        let mut vpa = vpa("foo");
        let k = key("ns", "app", "foo");
        let state = aggregate();
        vpa.use_aggregation_if_matching(&k, &state);

        let released = vpa.delete_aggregation(&k).unwrap();
        assert!(Arc::ptr_eq(&released, &state));
        assert!(!vpa.uses_aggregation(&k));
        assert!(vpa.delete_aggregation(&k).is_none());
    }

    #[test]
    fn test_policy_and_update_mode_propagate() {
        let mut vpa = vpa("foo");
        let k = key("ns", "sidecar", "foo");
        let state = aggregate();
        vpa.use_aggregation_if_matching(&k, &state);

        vpa.set_update_mode(Some(UpdateMode::Recreate));
        vpa.set_resource_policy(Some(PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "*".into(),
                mode: Some(ContainerScalingMode::Off),
                controlled_resources: Some(vec![ResourceName::Cpu]),
            }],
        }));

        let state = state.lock();
        assert_eq!(state.update_mode, Some(UpdateMode::Recreate));
        assert_eq!(state.scaling_mode, Some(ContainerScalingMode::Off));
        assert_eq!(state.controlled_resources(), vec![ResourceName::Cpu]);
        assert!(!state.needs_recommendation());
    }

    #[test]
    fn test_update_recommendation_sets_uncapped_target() {
        let mut vpa = vpa("foo");
        let k = key("ns", "app", "foo");
        let state = aggregate();
        vpa.use_aggregation_if_matching(&k, &state);
        assert!(!vpa.has_recommendation());

        let uncapped = Resources::from([(ResourceName::Cpu, ResourceAmount(250))]);
        vpa.update_recommendation(RecommendedPodResources {
            container_recommendations: vec![RecommendedContainerResources {
                container_name: "app".into(),
                target: Resources::from([(ResourceName::Cpu, ResourceAmount(200))]),
                lower_bound: Resources::new(),
                upper_bound: Resources::new(),
                uncapped_target: uncapped.clone(),
            }],
        });

        assert!(vpa.has_recommendation());
        assert_eq!(state.lock().last_recommendation, uncapped);
    }

    #[test]
    fn test_conditions_track_matched_pods() {
        let mut vpa = vpa("foo");
        vpa.update_conditions(false, t0());
        assert!(!vpa.has_matched_pods());
        let provided = vpa
            .conditions
            .get(VpaConditionType::RecommendationProvided)
            .unwrap();
        assert!(!provided.status);
        assert_eq!(provided.reason, NO_PODS_MATCHED_REASON);

        vpa.update_conditions(false, t0() + Duration::hours(1));
        let no_pods = vpa.conditions.get(VpaConditionType::NoPodsMatched).unwrap();
        assert_eq!(no_pods.last_transition_time, Some(t0()));

        vpa.update_conditions(true, t0() + Duration::hours(2));
        assert!(vpa.has_matched_pods());
        let status = vpa.as_status();
        assert_eq!(status.conditions.len(), 1);
        assert!(status.recommendation.is_none());
    }

    #[test]
    fn test_aggregate_state_by_container_name_merges_checkpoint() {
        let mut vpa = vpa("foo");
        let state = aggregate();
        state.lock().add_sample(&ContainerUsageSample::new(
            ResourceName::Cpu,
            ResourceAmount(100),
            ResourceAmount(100),
            t0(),
        ));
        vpa.use_aggregation_if_matching(&key("ns", "app", "foo"), &state);

        let mut restored = AggregateContainerState::new(context(), t0());
        restored.total_samples_count = 10;
        vpa.containers_initial_aggregate_state
            .insert("app".into(), restored.clone());
        vpa.containers_initial_aggregate_state
            .insert("db".into(), restored);

        let merged = vpa.aggregate_state_by_container_name(t0()).unwrap();
        assert_eq!(merged["app"].total_samples_count, 11);
        assert_eq!(merged["db"].total_samples_count, 10);
    }
}
