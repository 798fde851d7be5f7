//! Periodic maintenance of the cluster state
//!
//! Each tick refreshes VPA membership and conditions, reports VPAs that have
//! gone without a recommendation and runs the rate-limited garbage collector.

use chrono::{DateTime, Utc};
use recommender_lib::{ClusterState, RecommenderMetrics, StructuredLogger, VpaId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// One maintenance pass over the cluster state
pub fn run_pass(
    cluster: &mut ClusterState,
    metrics: &RecommenderMetrics,
    logger: &StructuredLogger,
    now: DateTime<Utc>,
) {
    cluster.recompute_all_vpa_memberships();

    let vpa_ids: Vec<VpaId> = cluster.vpas().map(|vpa| vpa.id.clone()).collect();
    for id in &vpa_ids {
        if let Some(vpa) = cluster.vpa_mut(id) {
            let pods_matched = vpa.pod_count > 0;
            vpa.update_conditions(pods_matched, now);
        }
        if let Ok(Some(missing_for)) = cluster.record_recommendation(id, now) {
            logger.log_missing_recommendation(id, missing_for.num_seconds());
        }
    }

    let started = Instant::now();
    if let Some(report) = cluster.rate_limited_garbage_collect(now) {
        let duration_secs = started.elapsed().as_secs_f64();
        metrics.observe_gc(&report, duration_secs);
        logger.log_gc(&report, duration_secs);
    }

    metrics.observe_cluster(cluster);
}

/// Run maintenance passes until the task is aborted
pub async fn run(
    cluster: Arc<RwLock<ClusterState>>,
    metrics: RecommenderMetrics,
    logger: StructuredLogger,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let mut cluster = cluster.write().await;
        run_pass(&mut cluster, &metrics, &logger, Utc::now());
        debug!(
            aggregates = cluster.aggregate_count(),
            vpas = cluster.vpa_count(),
            "Maintenance pass finished"
        );
    }
}
