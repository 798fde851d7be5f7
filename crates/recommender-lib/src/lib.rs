//! Recommender library for vertical pod autoscaling
//!
//! This crate provides the core functionality for:
//! - Decaying usage histograms with checkpoints
//! - Per-container sample attribution and memory peak windowing
//! - Aggregation of container usage and VPA membership
//! - Garbage collection of stale aggregates
//! - Metrics and structured logging

pub mod histogram;
pub mod model;
pub mod observability;

pub use histogram::{DecayingHistogram, Histogram, HistogramCheckpoint, HistogramOptions};
pub use model::*;
pub use observability::{RecommenderMetrics, StructuredLogger};
