//! Adaptive batch sizing.

use super::WorkerConfig;
use super::protocol::WorkerJobConfig;

/// Batch size bounds after applying per-job overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBounds {
    pub base: usize,
    pub min: usize,
    pub max: usize,
}

impl BatchBounds {
    /// Job overrides win; unset or zero values fall back to the worker defaults.
    pub fn resolve(job: &WorkerJobConfig, defaults: &WorkerConfig) -> Self {
        let pick = |value: Option<usize>, fallback: usize| value.filter(|&v| v > 0).unwrap_or(fallback);
        Self {
            base: pick(job.base_batch_size, defaults.base_batch_size),
            min: pick(job.min_batch_size, defaults.min_batch_size),
            max: pick(job.max_batch_size, defaults.max_batch_size),
        }
    }
}

/// Number of papers per batch for a job of `total` papers.
///
/// Small jobs get about ten batches, large jobs about twenty, medium jobs
/// scale with `base`. Image processing overhead shrinks batches by 20%.
/// The result always lies in `[min, max]` (or equals `min` if the bounds
/// are inverted).
pub fn calculate_batch_size(total: usize, bounds: BatchBounds, async_images: bool) -> usize {
    let mut size = if total < 1000 {
        bounds.min.max(total / 10)
    } else if total > 10_000 {
        bounds.max.min(total / 20)
    } else {
        (bounds.base as u128 * total as u128 / 5000) as usize
    };
    if async_images {
        size = (size as f64 * 0.8).round() as usize;
    }
    bounds.min.max(bounds.max.min(size))
}
