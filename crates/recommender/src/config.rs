//! Recommender configuration

use anyhow::Result;
use recommender_lib::AggregationsConfig;
use serde::Deserialize;

/// Recommender configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecommenderConfig {
    /// Instance name reported in logs, from the Kubernetes downward API
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics/ingestion
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Minimum time between garbage collection passes in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Period of the maintenance loop in seconds
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    #[serde(default)]
    pub aggregations: AggregationsConfig,
}

fn default_instance_name() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "vpa-recommender".to_string())
}

fn default_api_port() -> u16 {
    8942
}

fn default_gc_interval() -> u64 {
    60 * 60
}

fn default_maintenance_interval() -> u64 {
    60
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            gc_interval_secs: default_gc_interval(),
            maintenance_interval_secs: default_maintenance_interval(),
            aggregations: AggregationsConfig::default(),
        }
    }
}

impl RecommenderConfig {
    /// Load configuration from `RECOMMENDER_*` environment variables
    ///
    /// Nested aggregation settings use a double underscore, e.g.
    /// `RECOMMENDER_AGGREGATIONS__OOM_BUMP_UP_RATIO`.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("RECOMMENDER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    pub fn gc_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.gc_interval_secs.min(i64::MAX as u64 / 1000) as i64)
    }

    pub fn maintenance_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}
