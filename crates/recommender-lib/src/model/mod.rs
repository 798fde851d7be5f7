//! Cluster state model
//!
//! Tracks pods, containers and VPA objects and pools container usage into
//! aggregates that the recommendation pass reads:
//! - `ContainerState` attributes samples of one container (memory windowing, OOMs)
//! - `AggregateContainerState` holds the decaying CPU and memory-peak histograms
//! - `Vpa` pools the aggregates its selector matches
//! - `ClusterState` owns everything and garbage-collects stale aggregates

mod aggregation;
mod cluster;
mod config;
mod container;
mod error;
mod labels;
mod types;
mod vpa;


pub use aggregation::{
    aggregate_state_by_container_name, AggregateContainerState, AggregateSnapshot,
    AggregateStateCheckpoint, AggregateStateKey, ContainerStateAggregator, SharedAggregateState,
    SUPPORTED_CHECKPOINT_VERSION,
};
pub use cluster::{ClusterState, GcReport, PodState, RECOMMENDATION_MISSING_MAX_SECS};
pub use config::{AggregationContext, AggregationsConfig, MIN_SAMPLE_WEIGHT};
pub use container::ContainerState;
pub use error::{ModelError, Result};
pub use labels::{
    LabelSelector, LabelSet, LabelSetCache, Labels, PodSelector, SelectorOperator,
    SelectorRequirement,
};
pub use types::*;
pub use vpa::{Vpa, VpaConditions, VpaStatus};
