//! Aggregation parameters
//!
//! Defaults mirror a daily memory peak window retained for eight days and a
//! one-day half-life for both usage histograms.

use crate::histogram::{HistogramError, HistogramOptions};
use chrono::Duration;
use serde::Deserialize;
use std::sync::Arc;

/// Minimal weight of a CPU sample, in cores
pub const MIN_SAMPLE_WEIGHT: f64 = 0.1;

/// Weights below this are treated as zero by the histograms
const EPSILON: f64 = 0.001 * MIN_SAMPLE_WEIGHT;

/// Width ratio between consecutive histogram buckets
const BUCKET_RATIO: f64 = 1.05;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AggregationsConfig {
    /// Length of one memory peak window
    #[serde(default = "default_memory_aggregation_interval")]
    pub memory_aggregation_interval_secs: u64,

    /// Number of memory windows retained before an aggregate goes stale
    #[serde(default = "default_memory_aggregation_interval_count")]
    pub memory_aggregation_interval_count: u32,

    #[serde(default = "default_half_life")]
    pub cpu_histogram_decay_half_life_secs: u64,

    #[serde(default = "default_half_life")]
    pub memory_histogram_decay_half_life_secs: u64,

    /// Multiplier applied to the memory in use when an OOM is recorded
    #[serde(default = "default_oom_bump_up_ratio")]
    pub oom_bump_up_ratio: f64,

    /// Minimum increase applied to the memory in use when an OOM is recorded
    #[serde(default = "default_oom_min_bump_up_bytes")]
    pub oom_min_bump_up_bytes: u64,

    #[serde(default = "default_cpu_histogram_max_cores")]
    pub cpu_histogram_max_cores: f64,

    #[serde(default = "default_cpu_histogram_first_bucket_cores")]
    pub cpu_histogram_first_bucket_cores: f64,

    #[serde(default = "default_memory_histogram_max_bytes")]
    pub memory_histogram_max_bytes: f64,

    #[serde(default = "default_memory_histogram_first_bucket_bytes")]
    pub memory_histogram_first_bucket_bytes: f64,
}

fn default_memory_aggregation_interval() -> u64 {
    24 * 60 * 60
}

fn default_memory_aggregation_interval_count() -> u32 {
    8
}

fn default_half_life() -> u64 {
    24 * 60 * 60
}

fn default_oom_bump_up_ratio() -> f64 {
    1.2
}

fn default_oom_min_bump_up_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_cpu_histogram_max_cores() -> f64 {
    1000.0
}

fn default_cpu_histogram_first_bucket_cores() -> f64 {
    0.01
}

fn default_memory_histogram_max_bytes() -> f64 {
    1e12
}

fn default_memory_histogram_first_bucket_bytes() -> f64 {
    1e7
}

impl Default for AggregationsConfig {
    fn default() -> Self {
        Self {
            memory_aggregation_interval_secs: default_memory_aggregation_interval(),
            memory_aggregation_interval_count: default_memory_aggregation_interval_count(),
            cpu_histogram_decay_half_life_secs: default_half_life(),
            memory_histogram_decay_half_life_secs: default_half_life(),
            oom_bump_up_ratio: default_oom_bump_up_ratio(),
            oom_min_bump_up_bytes: default_oom_min_bump_up_bytes(),
            cpu_histogram_max_cores: default_cpu_histogram_max_cores(),
            cpu_histogram_first_bucket_cores: default_cpu_histogram_first_bucket_cores(),
            memory_histogram_max_bytes: default_memory_histogram_max_bytes(),
            memory_histogram_first_bucket_bytes: default_memory_histogram_first_bucket_bytes(),
        }
    }
}

impl AggregationsConfig {
    pub fn memory_aggregation_interval(&self) -> Duration {
        secs(self.memory_aggregation_interval_secs)
    }

    /// How long an aggregate keeps meaningful history without new samples
    pub fn memory_aggregation_window_length(&self) -> Duration {
        secs(
            self.memory_aggregation_interval_secs
                .saturating_mul(self.memory_aggregation_interval_count as u64),
        )
    }

    pub fn cpu_histogram_decay_half_life(&self) -> Duration {
        secs(self.cpu_histogram_decay_half_life_secs)
    }

    pub fn memory_histogram_decay_half_life(&self) -> Duration {
        secs(self.memory_histogram_decay_half_life_secs)
    }
}

/// Configuration plus the bucketing options built from it, shared by every aggregate
#[derive(Debug)]
pub struct AggregationContext {
    pub config: AggregationsConfig,
    pub cpu_histogram_options: Arc<HistogramOptions>,
    pub memory_histogram_options: Arc<HistogramOptions>,
}

impl AggregationContext {
    pub fn new(config: AggregationsConfig) -> Result<Arc<Self>, HistogramError> {
        if config.memory_aggregation_interval_secs == 0 {
            return Err(HistogramError::InvalidOptions(
                "memory aggregation interval must be positive".to_string(),
            ));
        }
        if config.cpu_histogram_decay_half_life_secs == 0
            || config.memory_histogram_decay_half_life_secs == 0
        {
            return Err(HistogramError::InvalidOptions(
                "histogram half-life must be positive".to_string(),
            ));
        }

        let cpu_histogram_options = HistogramOptions::exponential(
            config.cpu_histogram_max_cores,
            config.cpu_histogram_first_bucket_cores,
            BUCKET_RATIO,
            EPSILON,
        )?;
        let memory_histogram_options = HistogramOptions::exponential(
            config.memory_histogram_max_bytes,
            config.memory_histogram_first_bucket_bytes,
            BUCKET_RATIO,
            EPSILON,
        )?;

        Ok(Arc::new(Self {
            config,
            cpu_histogram_options: Arc::new(cpu_histogram_options),
            memory_histogram_options: Arc::new(memory_histogram_options),
        }))
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(value.min(i64::MAX as u64 / 1000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AggregationsConfig::default();
        assert_eq!(config.memory_aggregation_interval(), Duration::hours(24));
        assert_eq!(config.memory_aggregation_window_length(), Duration::days(8));
        assert_eq!(config.cpu_histogram_decay_half_life(), Duration::hours(24));
        assert_eq!(config.oom_min_bump_up_bytes, 104_857_600);
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: AggregationsConfig =
            serde_json::from_str(r#"{"memory_aggregation_interval_secs": 3600}"#).unwrap();
        assert_eq!(config.memory_aggregation_interval(), Duration::hours(1));
        assert_eq!(config.memory_aggregation_interval_count, 8);
    }

    #[test]
    fn test_context_bucket_counts() {
        let context = AggregationContext::new(AggregationsConfig::default()).unwrap();
        // 0.01 cores first bucket, ratio 1.05 up to 1000 cores
        assert_eq!(context.cpu_histogram_options.num_buckets(), 176);
        assert_eq!(context.memory_histogram_options.num_buckets(), 176);
    }

    #[test]
    fn test_context_rejects_zero_interval() {
        let config = AggregationsConfig {
            memory_aggregation_interval_secs: 0,
            ..Default::default()
        };
        assert!(AggregationContext::new(config).is_err());
    }
}
