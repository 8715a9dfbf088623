use ndarray::{Array1, Array2};

use crate::faer_ndarray::FaerSvd;
use crate::matrix::DesignMatrix;
use crate::spacing::EstimationError;

/// Default tolerance for the SVD rank oracle.
pub const RANK_TOLERANCE: f64 = 1e-9;

/// Numerical rank: singular values above `tol` times the largest one.
pub fn numerical_rank(matrix: &Array2<f64>, tol: f64) -> Result<usize, EstimationError> {
    if matrix.nrows() == 0 || matrix.ncols() == 0 {
        return Ok(0);
    }
    let singular = matrix.singular_values()?;
    let max_sv = singular.iter().cloned().fold(0.0_f64, f64::max);
    if max_sv <= 0.0 || !max_sv.is_finite() {
        return Ok(0);
    }
    let threshold = tol * max_sv;
    Ok(singular.iter().filter(|&&s| s > threshold).count())
}

/// Which columns survived rank repair, in original order.
#[derive(Debug, Clone, PartialEq)]
pub struct RankRepair {
    pub retained: Vec<usize>,
    pub retained_names: Vec<String>,
    pub dropped_names: Vec<String>,
}

impl RankRepair {
    fn full(names: &[String]) -> Self {
        Self {
            retained: (0..names.len()).collect(),
            retained_names: names.to_vec(),
            dropped_names: Vec::new(),
        }
    }
}

/// Reduce a design to full column rank.
///
/// Redundant columns are dropped scanning from the right: the highest-index
/// column whose removal leaves the rank unchanged goes first, repeated until
/// the column count matches the rank. Deterministic for a given input, and
/// keeps early columns (the intercept, conventionally first) preferentially.
pub fn ensure_full_rank(
    design: &DesignMatrix,
    names: &[String],
    tol: f64,
) -> Result<(DesignMatrix, RankRepair), EstimationError> {
    let k = design.ncols();
    if names.len() != k {
        return Err(EstimationError::DimensionMismatch(format!(
            "{} column names for {} design columns",
            names.len(),
            k
        )));
    }
    let target = numerical_rank(design.dense(), tol)?;
    if target == k {
        return Ok((design.clone(), RankRepair::full(names)));
    }
    if target == 0 {
        return Err(EstimationError::InvalidInput(
            "design matrix has rank zero".to_string(),
        ));
    }

    let mut retained: Vec<usize> = (0..k).collect();
    while retained.len() > target {
        let mut dropped_one = false;
        for pos in (0..retained.len()).rev() {
            let mut candidate = retained.clone();
            candidate.remove(pos);
            let sub = design.column_subset(&candidate);
            if numerical_rank(sub.dense(), tol)? == target {
                retained = candidate;
                dropped_one = true;
                break;
            }
        }
        if !dropped_one {
            return Err(EstimationError::InvalidInput(
                "rank repair could not isolate a redundant column".to_string(),
            ));
        }
    }

    let retained_names: Vec<String> = retained.iter().map(|&i| names[i].clone()).collect();
    let dropped_names: Vec<String> = (0..k)
        .filter(|i| !retained.contains(i))
        .map(|i| names[i].clone())
        .collect();
    log::warn!(
        "design is rank deficient ({} of {} columns); dropped: {}",
        target,
        k,
        dropped_names.join(", ")
    );

    let reduced = design.column_subset(&retained);
    Ok((
        reduced,
        RankRepair {
            retained,
            retained_names,
            dropped_names,
        },
    ))
}

/// Re-expand a reduced coefficient row to the full column ordering, zeros at
/// dropped positions.
pub fn restore_columns(
    reduced: &Array1<f64>,
    retained: &[usize],
    full_len: usize,
) -> Array1<f64> {
    debug_assert_eq!(reduced.len(), retained.len());
    let mut out = Array1::<f64>::zeros(full_len);
    for (value, &col) in reduced.iter().zip(retained.iter()) {
        out[col] = *value;
    }
    out
}
