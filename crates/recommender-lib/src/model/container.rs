//! Per-container sample attribution
//!
//! CPU samples are forwarded as they arrive, deduplicated by start time.
//! Memory is reduced to one peak per aggregation window: the first sample of a
//! window is emitted straight away and every later, larger observation in the
//! same window replaces it (subtract old, add new). Emitted peaks carry the
//! window end as their timestamp, so the replacement cancels exactly.
//!
//! When a relabel moves the container to another aggregator, the open window
//! is parked with the aggregator that holds its peak. Moving back before that
//! window ends resumes it, so an aggregator never gets two peaks from one
//! container for the same window.

use super::aggregation::ContainerStateAggregator;
use super::config::AggregationContext;
use super::{ContainerUsageSample, ModelError, ResourceAmount, ResourceName, Resources, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

pub struct ContainerState {
    /// Requests as configured on the pod
    pub request: Resources,
    pub last_cpu_sample_start: Option<DateTime<Utc>>,
    memory_peak: ResourceAmount,
    oom_peak: ResourceAmount,
    /// Exclusive end of the current memory window, `None` until the first sample
    pub window_end: Option<DateTime<Utc>>,
    last_memory_sample_start: Option<DateTime<Utc>>,
    aggregator: Arc<dyn ContainerStateAggregator>,
    /// Windows left open in aggregators this container moved away from
    parked_windows: Vec<ParkedWindow>,
    context: Arc<AggregationContext>,
}

/// Memory window whose peak lives in an aggregator the container no longer feeds
struct ParkedWindow {
    aggregator: Arc<dyn ContainerStateAggregator>,
    window_end: DateTime<Utc>,
    memory_peak: ResourceAmount,
    oom_peak: ResourceAmount,
}

fn same_aggregator(
    a: &Arc<dyn ContainerStateAggregator>,
    b: &Arc<dyn ContainerStateAggregator>,
) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

impl ContainerState {
    pub fn new(
        request: Resources,
        aggregator: Arc<dyn ContainerStateAggregator>,
        context: Arc<AggregationContext>,
    ) -> Self {
        Self {
            request,
            last_cpu_sample_start: None,
            memory_peak: ResourceAmount::ZERO,
            oom_peak: ResourceAmount::ZERO,
            window_end: None,
            last_memory_sample_start: None,
            aggregator,
            parked_windows: Vec::new(),
            context,
        }
    }

    pub fn aggregator(&self) -> &Arc<dyn ContainerStateAggregator> {
        &self.aggregator
    }

    /// Point future samples at another aggregator
    ///
    /// The open window stays with the previous aggregator. The new one resumes
    /// the window it was left with, if any, or starts one with the next memory
    /// sample.
    pub fn set_aggregator(&mut self, aggregator: Arc<dyn ContainerStateAggregator>) {
        if same_aggregator(&self.aggregator, &aggregator) {
            return;
        }

        let previous = std::mem::replace(&mut self.aggregator, aggregator);
        if let Some(window_end) = self.window_end {
            self.parked_windows
                .retain(|parked| !same_aggregator(&parked.aggregator, &previous));
            self.parked_windows.push(ParkedWindow {
                aggregator: previous,
                window_end,
                memory_peak: self.memory_peak,
                oom_peak: self.oom_peak,
            });
        }

        let index = self
            .parked_windows
            .iter()
            .position(|parked| same_aggregator(&parked.aggregator, &self.aggregator));
        let resumed = index.map(|index| self.parked_windows.swap_remove(index));
        match resumed {
            Some(parked) => {
                debug!(window_end = %parked.window_end, "Resumed parked memory window");
                self.window_end = Some(parked.window_end);
                self.memory_peak = parked.memory_peak;
                self.oom_peak = parked.oom_peak;
            }
            None => {
                self.window_end = None;
                self.memory_peak = ResourceAmount::ZERO;
                self.oom_peak = ResourceAmount::ZERO;
            }
        }
    }

    /// Largest memory observation of the current window, OOM estimates included
    pub fn max_memory_peak(&self) -> ResourceAmount {
        self.memory_peak.max(self.oom_peak)
    }

    pub fn memory_peak(&self) -> ResourceAmount {
        self.memory_peak
    }

    pub fn oom_peak(&self) -> ResourceAmount {
        self.oom_peak
    }

    /// Returns false when the sample was rejected as invalid, stale or duplicate
    pub fn add_sample(&mut self, sample: &ContainerUsageSample) -> bool {
        match sample.resource {
            ResourceName::Cpu => self.add_cpu_sample(sample),
            ResourceName::Memory => self.add_memory_sample(sample, false),
        }
    }

    /// Record an OOM-derived memory estimate for the window containing `sample`
    pub fn add_oom_peak(&mut self, sample: &ContainerUsageSample) -> bool {
        self.add_memory_sample(sample, true)
    }

    /// Turn an OOM kill into a memory sample bumped above what was in use
    pub fn record_oom(
        &mut self,
        timestamp: DateTime<Utc>,
        requested_memory: ResourceAmount,
    ) -> Result<()> {
        let interval = self.context.config.memory_aggregation_interval();
        if let Some(window_end) = self.window_end {
            if timestamp < window_end - interval {
                return Err(ModelError::OomTooOld { timestamp });
            }
        }

        let config = &self.context.config;
        let memory_used = requested_memory.max(self.memory_peak);
        let min_bump = ResourceAmount::from_bytes(config.oom_min_bump_up_bytes as f64);
        let memory_needed = memory_used
            .saturating_add(min_bump)
            .max(memory_used.scale(config.oom_bump_up_ratio));

        let sample = ContainerUsageSample::new(
            ResourceName::Memory,
            memory_needed,
            requested_memory,
            timestamp,
        );
        if self.add_oom_peak(&sample) {
            Ok(())
        } else {
            Err(ModelError::OomSampleRejected)
        }
    }

    fn add_cpu_sample(&mut self, sample: &ContainerUsageSample) -> bool {
        if !sample.is_valid(ResourceName::Cpu) {
            return false;
        }
        if self
            .last_cpu_sample_start
            .is_some_and(|last| sample.measure_start <= last)
        {
            return false;
        }
        self.aggregator.add_sample(sample);
        self.last_cpu_sample_start = Some(sample.measure_start);
        true
    }

    fn add_memory_sample(&mut self, sample: &ContainerUsageSample, is_oom: bool) -> bool {
        let ts = sample.measure_start;
        if !sample.is_valid(ResourceName::Memory) {
            return false;
        }
        if !is_oom && self.last_memory_sample_start.is_some_and(|last| ts < last) {
            return false;
        }
        if self.last_memory_sample_start.map_or(true, |last| ts > last) {
            self.last_memory_sample_start = Some(ts);
        }
        self.parked_windows.retain(|parked| ts < parked.window_end);

        let window_end = match self.window_end {
            Some(end) if ts < end => {
                let old_peak = self.max_memory_peak();
                if sample.usage <= old_peak {
                    self.record_peak(sample.usage, is_oom);
                    return true;
                }
                self.aggregator.subtract_sample(&ContainerUsageSample::new(
                    ResourceName::Memory,
                    old_peak,
                    sample.request,
                    end,
                ));
                end
            }
            current => {
                let end = self.next_window_end(current.unwrap_or(ts), ts);
                debug!(
                    window_end = %end,
                    oom = is_oom,
                    "Opened memory aggregation window"
                );
                self.window_end = Some(end);
                self.memory_peak = ResourceAmount::ZERO;
                self.oom_peak = ResourceAmount::ZERO;
                end
            }
        };

        self.aggregator.add_sample(&ContainerUsageSample::new(
            ResourceName::Memory,
            sample.usage,
            sample.request,
            window_end,
        ));
        self.record_peak(sample.usage, is_oom);
        true
    }

    fn record_peak(&mut self, usage: ResourceAmount, is_oom: bool) {
        let peak = if is_oom {
            &mut self.oom_peak
        } else {
            &mut self.memory_peak
        };
        *peak = (*peak).max(usage);
    }

    /// First interval boundary after `ts`, counting from `window_end`
    fn next_window_end(&self, window_end: DateTime<Utc>, ts: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = self
            .context
            .config
            .memory_aggregation_interval()
            .num_milliseconds()
            .max(1);
        let elapsed_ms = (ts - window_end).num_milliseconds().max(0);
        window_end + Duration::milliseconds(elapsed_ms / interval_ms * interval_ms + interval_ms)
    }
}
