//! Usage histograms
//!
//! This module provides the distribution building blocks used by aggregate
//! container states:
//! - Exponential bucketing options
//! - A plain weighted histogram with percentile queries
//! - A decaying histogram that favours recent samples
//! - Compact checkpoints for persisting histogram contents

mod base;
mod decaying;
mod options;

pub use base::Histogram;
pub use decaying::DecayingHistogram;
pub use options::HistogramOptions;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Bucket weight of the heaviest bucket in a checkpoint
pub const MAX_CHECKPOINT_WEIGHT: u32 = 10_000;

#[derive(Debug, Error)]
pub enum HistogramError {
    #[error("invalid histogram options: {0}")]
    InvalidOptions(String),

    #[error("cannot merge histograms with different bucketing options")]
    IncompatibleOptions,

    #[error("cannot merge decaying histograms with different half-lives")]
    IncompatibleHalfLife,

    #[error("invalid histogram checkpoint: {0}")]
    InvalidCheckpoint(String),
}

/// Serializable histogram contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramCheckpoint {
    /// Reference timestamp of a decaying histogram
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_timestamp: Option<DateTime<Utc>>,
    /// Sum of all bucket weights
    pub total_weight: f64,
    /// Bucket index to weight, normalized to [`MAX_CHECKPOINT_WEIGHT`]
    #[serde(default)]
    pub bucket_weights: BTreeMap<usize, u32>,
}
