//! Errors raised by the cluster state model

use super::{ContainerId, PodId, VpaId};
use crate::histogram::HistogramError;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("pod {0} not found")]
    PodNotFound(PodId),

    #[error("container {0} not found")]
    ContainerNotFound(ContainerId),

    #[error("VPA {0} not found")]
    VpaNotFound(VpaId),

    #[error("unsupported resource: {0}")]
    UnsupportedResource(String),

    #[error("OOM event at {timestamp} discarded, older than the current memory window")]
    OomTooOld { timestamp: DateTime<Utc> },

    #[error("OOM sample rejected")]
    OomSampleRejected,

    #[error("unsupported checkpoint version {found}, expected {expected}")]
    UnsupportedCheckpointVersion { found: String, expected: String },

    #[error(transparent)]
    Histogram(#[from] HistogramError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
