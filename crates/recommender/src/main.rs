//! VPA Recommender - cluster state and aggregation service
//!
//! This binary hosts the in-memory cluster state model, accepts pods, VPA
//! objects and usage samples over HTTP, and keeps aggregates garbage
//! collected for the recommendation pass.

use anyhow::Result;
use recommender_lib::{AggregationContext, ClusterState, RecommenderMetrics, StructuredLogger};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod maintenance;

const RECOMMENDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting vpa-recommender");

    let config = config::RecommenderConfig::load()?;
    info!(
        instance = %config.instance_name,
        memory_aggregation_interval_secs = config.aggregations.memory_aggregation_interval_secs,
        memory_aggregation_interval_count = config.aggregations.memory_aggregation_interval_count,
        "Recommender configured"
    );

    let context = AggregationContext::new(config.aggregations.clone())?;
    let cluster = Arc::new(RwLock::new(ClusterState::new(
        context,
        config.gc_interval(),
    )));

    let metrics = RecommenderMetrics::new()?;
    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(RECOMMENDER_VERSION, config.gc_interval_secs, config.api_port);

    let maintenance_handle = tokio::spawn(maintenance::run(
        cluster.clone(),
        metrics,
        logger.clone(),
        config.maintenance_interval(),
    ));

    let app_state = Arc::new(api::AppState::new(cluster, metrics, logger.clone()));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = &mut api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(err)) => {
                    error!(error = %err, "API server failed");
                    logger.log_shutdown("API server failed");
                }
                Err(err) => {
                    error!(error = %err, "API server task panicked");
                    logger.log_shutdown("API server task panicked");
                }
            }
        }
    }

    maintenance_handle.abort();
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
