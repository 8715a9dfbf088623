#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod admm;
pub mod faer_ndarray;
pub mod matrix;
pub mod rank;
pub mod solver;
pub mod spacing;
pub mod subsample;
pub mod types;

pub use admm::{AdmmUpdate, admm_gamma_update};
pub use matrix::{DesignMatrix, dense_to_sparse};
pub use rank::{RankRepair, ensure_full_rank, numerical_rank, restore_columns};
pub use solver::{QuantFit, solve_quantile};
pub use spacing::{EstimationError, SpacingResult, quantile_spacing_fit, spacings_to_quantiles};
pub use subsample::{
    ClusterSpec, InferenceResult, ReplicateDiagnostics, subsample_standard_errors,
};
pub use types::{InferenceOptions, QuantileGrid, SolverControl, SpacingOptions};
