//! Plain weighted histogram over exponential buckets

use super::{HistogramCheckpoint, HistogramError, HistogramOptions, MAX_CHECKPOINT_WEIGHT};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Weighted sample distribution
///
/// Tracks the range of non-empty buckets so percentile queries and merges
/// only walk the populated part of the bucket array.
#[derive(Debug, Clone)]
pub struct Histogram {
    options: Arc<HistogramOptions>,
    bucket_weight: Vec<f64>,
    total_weight: f64,
    min_bucket: usize,
    max_bucket: usize,
}

impl Histogram {
    pub fn new(options: Arc<HistogramOptions>) -> Self {
        let num_buckets = options.num_buckets();
        Self {
            options,
            bucket_weight: vec![0.0; num_buckets],
            total_weight: 0.0,
            min_bucket: num_buckets - 1,
            max_bucket: 0,
        }
    }

    pub fn options(&self) -> &Arc<HistogramOptions> {
        &self.options
    }

    pub fn add_sample(&mut self, value: f64, weight: f64) {
        if weight <= 0.0 || !weight.is_finite() {
            return;
        }
        let bucket = self.options.find_bucket(value);
        self.bucket_weight[bucket] += weight;
        self.total_weight += weight;
        if bucket < self.min_bucket && self.bucket_weight[bucket] >= self.options.epsilon() {
            self.min_bucket = bucket;
        }
        if bucket > self.max_bucket && self.bucket_weight[bucket] >= self.options.epsilon() {
            self.max_bucket = bucket;
        }
    }

    /// Remove weight previously added for `value`. Residues below epsilon are zeroed.
    pub fn subtract_sample(&mut self, value: f64, weight: f64) {
        if weight <= 0.0 || !weight.is_finite() {
            return;
        }
        let epsilon = self.options.epsilon();
        let bucket = self.options.find_bucket(value);
        self.bucket_weight[bucket] = safe_subtract(self.bucket_weight[bucket], weight, epsilon);
        self.total_weight = safe_subtract(self.total_weight, weight, epsilon);
        self.update_min_and_max_bucket();
    }

    /// Add all weights of `other`. Both histograms must share bucketing options.
    pub fn merge(&mut self, other: &Histogram) -> Result<(), HistogramError> {
        if self.options != other.options {
            return Err(HistogramError::IncompatibleOptions);
        }
        if other.is_empty() {
            return Ok(());
        }
        for bucket in other.min_bucket..=other.max_bucket {
            self.bucket_weight[bucket] += other.bucket_weight[bucket];
        }
        self.total_weight += other.total_weight;
        self.min_bucket = self.min_bucket.min(other.min_bucket);
        self.max_bucket = self.max_bucket.max(other.max_bucket);
        Ok(())
    }

    /// Approximate value at `percentile` (0.0-1.0).
    ///
    /// Returns the end of the bucket in which the cumulative weight crosses
    /// the threshold, or the start of the last (open-ended) bucket.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = percentile * self.total_weight;
        let mut partial_sum = 0.0;
        let mut bucket = self.min_bucket;
        while bucket < self.max_bucket {
            partial_sum += self.bucket_weight[bucket];
            if partial_sum >= threshold {
                break;
            }
            bucket += 1;
        }
        if bucket < self.options.num_buckets() - 1 {
            self.options.bucket_start(bucket + 1)
        } else {
            self.options.bucket_start(bucket)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_weight[self.min_bucket] < self.options.epsilon()
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Multiply every weight by `factor`
    pub(crate) fn scale(&mut self, factor: f64) {
        if factor < 0.0 {
            return;
        }
        for bucket in self.min_bucket..=self.max_bucket {
            self.bucket_weight[bucket] *= factor;
        }
        self.total_weight *= factor;
        self.update_min_and_max_bucket();
    }

    fn update_min_and_max_bucket(&mut self) {
        let epsilon = self.options.epsilon();
        let last_bucket = self.options.num_buckets() - 1;
        while self.bucket_weight[self.min_bucket] < epsilon && self.min_bucket < last_bucket {
            self.min_bucket += 1;
        }
        while self.bucket_weight[self.max_bucket] < epsilon && self.max_bucket > 0 {
            self.max_bucket -= 1;
        }
    }

    /// Compact representation with bucket weights normalized so the
    /// heaviest bucket maps to [`MAX_CHECKPOINT_WEIGHT`].
    pub fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let mut bucket_weights = BTreeMap::new();
        if !self.is_empty() {
            let max_weight = self.bucket_weight[self.min_bucket..=self.max_bucket]
                .iter()
                .cloned()
                .fold(0.0_f64, f64::max);
            let ratio = MAX_CHECKPOINT_WEIGHT as f64 / max_weight;
            for bucket in self.min_bucket..=self.max_bucket {
                let weight = (self.bucket_weight[bucket] * ratio).round() as u32;
                if weight > 0 {
                    bucket_weights.insert(bucket, weight);
                }
            }
        }

        HistogramCheckpoint {
            reference_timestamp: None,
            total_weight: self.total_weight,
            bucket_weights,
        }
    }

    /// Add the weights stored in `checkpoint`, rescaled to its total weight
    pub fn load_from_checkpoint(
        &mut self,
        checkpoint: &HistogramCheckpoint,
    ) -> Result<(), HistogramError> {
        if checkpoint.total_weight < 0.0 || !checkpoint.total_weight.is_finite() {
            return Err(HistogramError::InvalidCheckpoint(format!(
                "total weight {} is not a non-negative number",
                checkpoint.total_weight
            )));
        }
        let sum: u64 = checkpoint.bucket_weights.values().map(|w| *w as u64).sum();
        if sum == 0 {
            return Ok(());
        }
        let ratio = checkpoint.total_weight / sum as f64;
        let num_buckets = self.options.num_buckets();
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            if bucket >= num_buckets {
                continue;
            }
            self.bucket_weight[bucket] += weight as f64 * ratio;
            if self.bucket_weight[bucket] >= self.options.epsilon() {
                self.min_bucket = self.min_bucket.min(bucket);
                self.max_bucket = self.max_bucket.max(bucket);
            }
        }
        self.total_weight += checkpoint.total_weight;
        Ok(())
    }
}

fn safe_subtract(value: f64, sub: f64, epsilon: f64) -> f64 {
    let result = value - sub;
    if result < epsilon {
        0.0
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram() -> Histogram {
        let options = HistogramOptions::exponential(100.0, 10.0, 2.0, 0.001).unwrap();
        Histogram::new(Arc::new(options))
    }

    #[test]
    fn test_empty_histogram() {
        let h = histogram();
        assert!(h.is_empty());
        assert_eq!(h.percentile(0.5), 0.0);
    }

    #[test]
    fn test_percentile_returns_bucket_end() {
        let mut h = histogram();
        h.add_sample(5.0, 1.0); // bucket 0: [0, 10)
        h.add_sample(15.0, 1.0); // bucket 1: [10, 30)
        h.add_sample(50.0, 2.0); // bucket 2: [30, 70)

        assert_eq!(h.percentile(0.0), 10.0);
        assert_eq!(h.percentile(0.25), 10.0);
        assert_eq!(h.percentile(0.5), 30.0);
        assert_eq!(h.percentile(1.0), 70.0);
    }

    #[test]
    fn test_last_bucket_has_no_upper_bound() {
        let mut h = histogram();
        h.add_sample(1e6, 1.0);
        assert_eq!(h.percentile(0.9), h.options().bucket_start(4));
    }

    #[test]
    fn test_subtract_restores_empty() {
        let mut h = histogram();
        h.add_sample(15.0, 3.0);
        h.subtract_sample(15.0, 3.0);
        assert!(h.is_empty());
        assert_eq!(h.total_weight(), 0.0);
    }

    #[test]
    fn test_subtract_moves_min_and_max() {
        let mut h = histogram();
        h.add_sample(5.0, 1.0);
        h.add_sample(50.0, 1.0);
        h.subtract_sample(5.0, 1.0);
        assert_eq!(h.percentile(0.0), 70.0);
        h.add_sample(5.0, 1.0);
        h.subtract_sample(50.0, 1.0);
        assert_eq!(h.percentile(1.0), 10.0);
    }

    #[test]
    fn test_negative_weight_ignored() {
        let mut h = histogram();
        h.add_sample(5.0, -1.0);
        assert!(h.is_empty());
    }

    #[test]
    fn test_merge() {
        let mut a = histogram();
        let mut b = histogram();
        a.add_sample(5.0, 1.0);
        b.add_sample(50.0, 3.0);
        a.merge(&b).unwrap();
        assert_eq!(a.total_weight(), 4.0);
        assert_eq!(a.percentile(0.5), 70.0);
        assert_eq!(a.percentile(0.1), 10.0);
    }

    #[test]
    fn test_merge_rejects_different_options() {
        let mut a = histogram();
        let options = HistogramOptions::exponential(1000.0, 1.0, 1.5, 0.001).unwrap();
        let b = Histogram::new(Arc::new(options));
        assert!(matches!(a.merge(&b), Err(HistogramError::IncompatibleOptions)));
    }

    #[test]
    fn test_checkpoint_normalizes_weights() {
        let mut h = histogram();
        h.add_sample(5.0, 2.0);
        h.add_sample(15.0, 1.0);
        let checkpoint = h.save_to_checkpoint();
        assert_eq!(checkpoint.total_weight, 3.0);
        assert_eq!(checkpoint.bucket_weights.get(&0), Some(&MAX_CHECKPOINT_WEIGHT));
        assert_eq!(checkpoint.bucket_weights.get(&1), Some(&(MAX_CHECKPOINT_WEIGHT / 2)));

        let mut restored = histogram();
        restored.load_from_checkpoint(&checkpoint).unwrap();
        assert!((restored.total_weight() - 3.0).abs() < 1e-9);
        assert_eq!(restored.percentile(0.5), h.percentile(0.5));
        assert_eq!(restored.percentile(0.9), h.percentile(0.9));
    }

    #[test]
    fn test_load_checkpoint_rejects_negative_weight() {
        let mut h = histogram();
        let checkpoint = HistogramCheckpoint {
            reference_timestamp: None,
            total_weight: -1.0,
            bucket_weights: BTreeMap::new(),
        };
        assert!(h.load_from_checkpoint(&checkpoint).is_err());
    }
}
