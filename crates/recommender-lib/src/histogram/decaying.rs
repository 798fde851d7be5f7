//! Histogram with exponentially decaying sample weights
//!
//! Instead of shrinking old weights over time, each new sample is inflated
//! by `2^((t - reference) / half_life)`. Relative weights are the same, and
//! old samples never need to be touched. When the inflation factor would grow
//! past `2^MAX_DECAY_EXPONENT` the reference timestamp is moved forward and
//! all stored weights are scaled down by the matching power of two.

use super::{Histogram, HistogramCheckpoint, HistogramError, HistogramOptions};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Maximum exponent before the reference timestamp is renormalized
const MAX_DECAY_EXPONENT: i32 = 100;

#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    histogram: Histogram,
    half_life: Duration,
    reference_timestamp: Option<DateTime<Utc>>,
}

impl DecayingHistogram {
    pub fn new(options: Arc<HistogramOptions>, half_life: Duration) -> Self {
        Self {
            histogram: Histogram::new(options),
            half_life,
            reference_timestamp: None,
        }
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn reference_timestamp(&self) -> Option<DateTime<Utc>> {
        self.reference_timestamp
    }

    pub fn add_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        let factor = self.decay_factor(time);
        self.histogram.add_sample(value, weight * factor);
    }

    /// Reverse an earlier [`add_sample`](Self::add_sample) with the same arguments
    pub fn subtract_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        let factor = self.decay_factor(time);
        self.histogram.subtract_sample(value, weight * factor);
    }

    pub fn merge(&mut self, other: &DecayingHistogram) -> Result<(), HistogramError> {
        if self.half_life != other.half_life {
            return Err(HistogramError::IncompatibleHalfLife);
        }
        let Some(other_reference) = other.reference_timestamp else {
            return self.histogram.merge(&other.histogram);
        };

        match self.reference_timestamp {
            Some(reference) if other_reference > reference => {
                self.shift_reference_timestamp(other_reference);
                self.histogram.merge(&other.histogram)
            }
            Some(reference) if other_reference < reference => {
                let mut shifted = other.clone();
                shifted.shift_reference_timestamp(reference);
                self.histogram.merge(&shifted.histogram)
            }
            Some(_) => self.histogram.merge(&other.histogram),
            None => {
                self.reference_timestamp = Some(other_reference);
                self.histogram.merge(&other.histogram)
            }
        }
    }

    pub fn percentile(&self, percentile: f64) -> f64 {
        self.histogram.percentile(percentile)
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Total weight, expressed relative to the reference timestamp
    pub fn total_weight(&self) -> f64 {
        self.histogram.total_weight()
    }

    pub fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = self.histogram.save_to_checkpoint();
        checkpoint.reference_timestamp = self.reference_timestamp;
        checkpoint
    }

    pub fn load_from_checkpoint(
        &mut self,
        checkpoint: &HistogramCheckpoint,
    ) -> Result<(), HistogramError> {
        self.histogram.load_from_checkpoint(checkpoint)?;
        self.reference_timestamp = checkpoint.reference_timestamp;
        Ok(())
    }

    fn decay_factor(&mut self, timestamp: DateTime<Utc>) -> f64 {
        let reference = match self.reference_timestamp {
            Some(reference) => reference,
            None => {
                self.shift_reference_timestamp(timestamp);
                self.reference_timestamp.unwrap_or(timestamp)
            }
        };
        let reference = if timestamp > reference + self.half_life * MAX_DECAY_EXPONENT {
            self.shift_reference_timestamp(timestamp);
            self.reference_timestamp.unwrap_or(timestamp)
        } else {
            reference
        };
        (seconds(timestamp - reference) / seconds(self.half_life)).exp2()
    }

    fn shift_reference_timestamp(&mut self, new_reference: DateTime<Utc>) {
        // Keep the reference aligned to a whole number of half-lives
        let new_reference = round_to(new_reference, self.half_life);
        if let Some(old_reference) = self.reference_timestamp {
            let exponent =
                (seconds(old_reference - new_reference) / seconds(self.half_life)).round() as i32;
            self.histogram.scale(2f64.powi(exponent));
        }
        self.reference_timestamp = Some(new_reference);
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

fn round_to(timestamp: DateTime<Utc>, unit: Duration) -> DateTime<Utc> {
    let unit_ms = unit.num_milliseconds();
    if unit_ms <= 0 {
        return timestamp;
    }
    let ms = timestamp.timestamp_millis();
    let rounded = (ms as f64 / unit_ms as f64).round() as i64 * unit_ms;
    DateTime::from_timestamp_millis(rounded).unwrap_or(timestamp)
}
