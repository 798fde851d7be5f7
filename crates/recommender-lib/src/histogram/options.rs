//! Bucketing scheme for usage histograms
//!
//! Buckets grow exponentially: the first bucket covers `[0, first_bucket_size)`
//! and every following bucket is `ratio` times wider than the previous one.
//! The last bucket has no upper bound.

use super::HistogramError;

/// Exponential bucketing options shared by all histograms of one resource
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramOptions {
    num_buckets: usize,
    first_bucket_size: f64,
    ratio: f64,
    epsilon: f64,
}

impl HistogramOptions {
    /// Create options covering `[0, max_value]`.
    ///
    /// `num_buckets` is the smallest integer such that
    /// `first_bucket_size * (ratio^num_buckets - 1) / (ratio - 1) >= max_value`,
    /// plus one open-ended bucket.
    pub fn exponential(
        max_value: f64,
        first_bucket_size: f64,
        ratio: f64,
        epsilon: f64,
    ) -> Result<Self, HistogramError> {
        if max_value <= 0.0 || first_bucket_size <= 0.0 || ratio <= 1.0 || epsilon <= 0.0 {
            return Err(HistogramError::InvalidOptions(format!(
                "max_value={max_value} first_bucket_size={first_bucket_size} \
                 ratio={ratio} epsilon={epsilon}"
            )));
        }

        let num_buckets = log_base(max_value * (ratio - 1.0) / first_bucket_size + 1.0, ratio)
            .ceil() as usize
            + 1;

        Ok(Self {
            num_buckets,
            first_bucket_size,
            ratio,
            epsilon,
        })
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Weights below epsilon are treated as zero
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Index of the bucket holding `value`. Values past the range land in the last bucket.
    pub fn find_bucket(&self, value: f64) -> usize {
        if value < self.first_bucket_size {
            return 0;
        }
        let scaled = value * (self.ratio - 1.0) / self.first_bucket_size + 1.0;
        let bucket = log_base(scaled, self.ratio) as usize;
        bucket.min(self.num_buckets - 1)
    }

    /// Lower bound of a bucket. Out-of-range indices are clamped to the last bucket.
    pub fn bucket_start(&self, bucket: usize) -> f64 {
        let bucket = bucket.min(self.num_buckets - 1);
        if bucket == 0 {
            return 0.0;
        }
        self.first_bucket_size * (self.ratio.powi(bucket as i32) - 1.0) / (self.ratio - 1.0)
    }
}

fn log_base(x: f64, base: f64) -> f64 {
    x.ln() / base.ln()
}
