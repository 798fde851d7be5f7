//! Core value types shared by the cluster state model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::ModelError;

/// Resources tracked by the recommender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
}

impl ResourceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceName::Cpu => "cpu",
            ResourceName::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(ResourceName::Cpu),
            "memory" => Ok(ResourceName::Memory),
            other => Err(ModelError::UnsupportedResource(other.to_string())),
        }
    }
}

/// Resources under control when no policy says otherwise
pub const DEFAULT_CONTROLLED_RESOURCES: [ResourceName; 2] =
    [ResourceName::Cpu, ResourceName::Memory];

/// Amount of a resource: millicores for CPU, bytes for memory
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceAmount(pub i64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);

    pub fn from_cores(cores: f64) -> Self {
        ResourceAmount(saturating_from_f64(cores * 1000.0))
    }

    pub fn from_bytes(bytes: f64) -> Self {
        ResourceAmount(saturating_from_f64(bytes))
    }

    pub fn as_cores(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn as_bytes(&self) -> f64 {
        self.0 as f64
    }

    /// Multiply by `factor`, saturating at the representable range
    pub fn scale(&self, factor: f64) -> Self {
        ResourceAmount(saturating_from_f64(self.0 as f64 * factor))
    }

    pub fn saturating_add(&self, other: ResourceAmount) -> Self {
        ResourceAmount(self.0.saturating_add(other.0))
    }
}

fn saturating_from_f64(value: f64) -> i64 {
    if value.is_nan() {
        0
    } else if value >= i64::MAX as f64 {
        i64::MAX
    } else if value <= i64::MIN as f64 {
        i64::MIN
    } else {
        value as i64
    }
}

/// Amount per resource
pub type Resources = BTreeMap<ResourceName, ResourceAmount>;

/// A single usage measurement for one resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsageSample {
    /// Start of the measurement interval
    pub measure_start: DateTime<Utc>,
    /// Average CPU usage or peak memory usage over the interval
    pub usage: ResourceAmount,
    /// Request of the container at the time of measurement
    pub request: ResourceAmount,
    pub resource: ResourceName,
}

impl ContainerUsageSample {
    pub fn new(
        resource: ResourceName,
        usage: ResourceAmount,
        request: ResourceAmount,
        measure_start: DateTime<Utc>,
    ) -> Self {
        Self {
            measure_start,
            usage,
            request,
            resource,
        }
    }

    pub(crate) fn is_valid(&self, expected: ResourceName) -> bool {
        self.usage >= ResourceAmount::ZERO && self.resource == expected
    }
}

/// A usage sample addressed to a specific container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsageSampleWithKey {
    pub container: ContainerId,
    #[serde(flatten)]
    pub sample: ContainerUsageSample,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub pod_name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    pub pod_id: PodId,
    pub container_name: String,
}

impl ContainerId {
    pub fn new(pod_id: PodId, container_name: impl Into<String>) -> Self {
        Self {
            pod_id,
            container_name: container_name.into(),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod_id, self.container_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VpaId {
    pub namespace: String,
    pub vpa_name: String,
}

impl VpaId {
    pub fn new(namespace: impl Into<String>, vpa_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            vpa_name: vpa_name.into(),
        }
    }
}

impl fmt::Display for VpaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.vpa_name)
    }
}

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Containers of terminated pods no longer contribute samples
    pub fn is_active(&self) -> bool {
        !matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// How recommendations are applied to running pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    Off,
    Initial,
    Recreate,
    Auto,
}

/// Whether a container is autoscaled at all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerScalingMode {
    #[default]
    Auto,
    Off,
}

/// Container name matching every container without an explicit policy
pub const DEFAULT_CONTAINER_RESOURCE_POLICY: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContainerScalingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_resources: Option<Vec<ResourceName>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

impl PodResourcePolicy {
    /// Policy for a container, falling back to the `*` entry
    pub fn container_policy(&self, container_name: &str) -> Option<&ContainerResourcePolicy> {
        self.container_policies
            .iter()
            .find(|p| p.container_name == container_name)
            .or_else(|| {
                self.container_policies
                    .iter()
                    .find(|p| p.container_name == DEFAULT_CONTAINER_RESOURCE_POLICY)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedContainerResources {
    pub container_name: String,
    pub target: Resources,
    #[serde(default)]
    pub lower_bound: Resources,
    #[serde(default)]
    pub upper_bound: Resources,
    #[serde(default)]
    pub uncapped_target: Resources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedPodResources {
    #[serde(default)]
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VpaConditionType {
    RecommendationProvided,
    LowConfidence,
    NoPodsMatched,
    FetchingHistory,
    ConfigUnsupported,
    ConfigDeprecated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaCondition {
    #[serde(rename = "type")]
    pub condition_type: VpaConditionType,
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Workload controller targeted by a VPA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Last observed VPA API object, as delivered by the reconciliation loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaObject {
    pub namespace: String,
    pub name: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
    #[serde(default)]
    pub conditions: Vec<VpaCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendedPodResources>,
    #[serde(default)]
    pub is_v1beta1_api: bool,
}

impl VpaObject {
    pub fn id(&self) -> VpaId {
        VpaId::new(&self.namespace, &self.name)
    }
}
