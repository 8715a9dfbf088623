use serde::{Deserialize, Serialize};

use crate::spacing::EstimationError;

/// Ordered quantile levels with a designated anchor.
///
/// The anchor is fitted directly on the response scale; every other level is
/// reached by exponentiated spacings walked outward from it. The grid must be
/// strictly increasing and contained in (0, 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileGrid {
    pub alphas: Vec<f64>,
    pub anchor: usize,
}

impl QuantileGrid {
    pub fn new(alphas: Vec<f64>, anchor: usize) -> Result<Self, EstimationError> {
        if alphas.is_empty() {
            return Err(EstimationError::InvalidQuantileGrid(
                "quantile grid is empty".to_string(),
            ));
        }
        for pair in alphas.windows(2) {
            if pair[1] <= pair[0] {
                return Err(EstimationError::InvalidQuantileGrid(format!(
                    "levels must be strictly increasing, got {} then {}",
                    pair[0], pair[1]
                )));
            }
        }
        if alphas.iter().any(|&a| a <= 0.0 || a >= 1.0) {
            return Err(EstimationError::InvalidQuantileGrid(
                "levels must lie strictly inside (0, 1)".to_string(),
            ));
        }
        if anchor >= alphas.len() {
            return Err(EstimationError::InvalidQuantileGrid(format!(
                "anchor index {} out of range for {} levels",
                anchor,
                alphas.len()
            )));
        }
        Ok(Self { alphas, anchor })
    }

    pub fn len(&self) -> usize {
        self.alphas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alphas.is_empty()
    }
}

/// Iteration caps and numerical tolerances for the inner quantile kernel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverControl {
    /// Hard cap on kernel iterations before giving up with a warning.
    pub max_iter: usize,
    /// Convergence threshold on the max-norm coefficient step.
    pub tol: f64,
    /// Floor for the interior smoothing parameter.
    pub smoothing_min: f64,
}

impl Default for SolverControl {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-8,
            smoothing_min: 1e-10,
        }
    }
}

/// Configuration for one spacing walk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpacingOptions {
    /// Floor applied to running residuals before taking logs.
    pub small_floor: f64,
    /// Truncation mode clamps sub-floor residuals to the floor; filtering
    /// mode drops those rows instead. The choice holds for the whole walk.
    pub truncate: bool,
    pub control: SolverControl,
}

impl Default for SpacingOptions {
    fn default() -> Self {
        Self {
            small_floor: 1e-6,
            truncate: false,
            control: SolverControl::default(),
        }
    }
}

/// Configuration for subsampling inference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceOptions {
    /// Subsample fraction M, strictly in (0, 1].
    pub sample_fraction: f64,
    pub replicate_count: usize,
    /// Multiply replicate weights by independent max(Exp(1), 5e-3) draws.
    pub draw_weights: bool,
    /// Square the companion-fit weight to match the least-squares weighting
    /// convention (weights on squared residuals rather than on rows).
    pub square_ols_weights: bool,
    /// Base seed; replicate i derives its stream from `seed + i`.
    pub seed: u64,
    pub spacing: SpacingOptions,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            sample_fraction: 1.0,
            replicate_count: 100,
            draw_weights: true,
            square_ols_weights: false,
            seed: 0,
            spacing: SpacingOptions::default(),
        }
    }
}
