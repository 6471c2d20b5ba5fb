//! Small statistics helpers for per-task roll-ups

use statrs::statistics::Statistics;

/// Arithmetic mean; 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() { 0.0 } else { values.mean() }
}

/// Sample standard deviation. Degenerate samples (fewer than two values)
/// yield 0.0 rather than NaN so single-run tasks stay well-formed.
pub fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        values.std_dev()
    }
}

/// Fraction of passing runs; 0.0 when nothing ran.
pub fn pass_rate(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64
    }
}
