use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::faer_ndarray::FaerLinalgError;
use crate::matrix::DesignMatrix;
use crate::rank::{RANK_TOLERANCE, ensure_full_rank, restore_columns};
use crate::solver::solve_quantile;
use crate::types::{QuantileGrid, SolverControl, SpacingOptions};

#[derive(Debug, Error)]
pub enum EstimationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("invalid quantile grid: {0}")]
    InvalidQuantileGrid(String),

    #[error("sample fraction must lie in (0, 1], got {0}")]
    InvalidSampleFraction(f64),

    #[error("linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),

    #[error("too few successful replicates ({successes} of {requested}) to form a covariance")]
    TooFewReplicates { successes: usize, requested: usize },
}

/// A fitted spacing model over one quantile grid.
///
/// `coefficients` holds one row per grid level in grid order, re-expanded to
/// the full original column set. The anchor row is on the response scale;
/// every other row parametrizes a log-spacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpacingResult {
    pub alphas: Vec<f64>,
    pub anchor: usize,
    pub var_names: Vec<String>,
    pub coefficients: Array2<f64>,
    pub pseudo_r2: Array1<f64>,
    pub converged: Vec<bool>,
    pub iterations: Vec<usize>,
    pub row_counts: Vec<usize>,
    /// Columns that survived rank repair at each level.
    pub retained_names: Vec<Vec<String>>,
}

struct StepRecord {
    coefficients_full: Array1<f64>,
    pseudo_r2: f64,
    converged: bool,
    iterations: usize,
    row_count: usize,
    retained: Vec<usize>,
    retained_names: Vec<String>,
    reduced_coefficients: Array1<f64>,
}

/// Check-function loss `sum w_i * rho_tau(r_i)`.
fn check_loss(residuals: &Array1<f64>, weights: Option<&Array1<f64>>, tau: f64) -> f64 {
    let rho = |r: f64| r * (tau - if r < 0.0 { 1.0 } else { 0.0 });
    match weights {
        Some(w) => residuals
            .iter()
            .zip(w.iter())
            .map(|(&r, &wi)| wi * rho(r))
            .sum(),
        None => residuals.iter().map(|&r| rho(r)).sum(),
    }
}

/// Pseudo-R²: one minus the ratio of the fitted check loss to the loss of an
/// intercept-only fit at the same level.
fn pseudo_r2(
    response: &Array1<f64>,
    fit_residuals: &Array1<f64>,
    weights: Option<&Array1<f64>>,
    tau: f64,
    control: &SolverControl,
) -> Result<f64, EstimationError> {
    let v = check_loss(fit_residuals, weights, tau);
    let intercept = DesignMatrix::from_dense(Array2::ones((response.len(), 1)));
    let base = solve_quantile(&intercept, response, tau, weights, None, control)?;
    let v0 = check_loss(&base.residuals, weights, tau);
    if v0 <= 0.0 {
        return Ok(0.0);
    }
    Ok(1.0 - v / v0)
}

fn slice_rows(vector: &Array1<f64>, rows: &[usize]) -> Array1<f64> {
    Array1::from_iter(rows.iter().map(|&r| vector[r]))
}

/// One spacing regression on the appropriately signed side of the running
/// residual. `signed_residual` is the running residual for the upward walk
/// and its negation for the downward walk, so selection is always `> 0`.
fn fit_spacing_step(
    design: &DesignMatrix,
    var_names: &[String],
    weights: Option<&Array1<f64>>,
    signed_residual: &Array1<f64>,
    tau: f64,
    options: &SpacingOptions,
    warm: Option<&(Vec<usize>, Array1<f64>)>,
) -> Result<StepRecord, EstimationError> {
    let floor = options.small_floor;
    let rows: Vec<usize> = if options.truncate {
        (0..signed_residual.len())
            .filter(|&i| signed_residual[i] > 0.0)
            .collect()
    } else {
        (0..signed_residual.len())
            .filter(|&i| signed_residual[i] > floor)
            .collect()
    };
    if rows.is_empty() {
        return Err(EstimationError::InvalidInput(
            "no rows on the required side of the running residual".to_string(),
        ));
    }

    let log_response = Array1::from_iter(rows.iter().map(|&i| {
        let s = signed_residual[i];
        if options.truncate {
            s.max(floor).ln()
        } else {
            s.ln()
        }
    }));

    let sub_design = design.row_subset(&rows);
    let sub_weights = weights.map(|w| slice_rows(w, &rows));
    let (reduced, repair) = ensure_full_rank(&sub_design, var_names, RANK_TOLERANCE)?;
    if rows.len() < reduced.ncols() {
        return Err(EstimationError::InvalidInput(format!(
            "{} active rows cannot identify {} coefficients",
            rows.len(),
            reduced.ncols()
        )));
    }

    let warm_start = warm.and_then(|(retained, coefs)| {
        if retained == &repair.retained {
            Some(coefs)
        } else {
            None
        }
    });

    let fit = solve_quantile(
        &reduced,
        &log_response,
        tau,
        sub_weights.as_ref(),
        warm_start,
        &options.control,
    )?;

    let r2 = pseudo_r2(
        &log_response,
        &fit.residuals,
        sub_weights.as_ref(),
        tau,
        &options.control,
    )?;

    let coefficients_full = restore_columns(&fit.coefficients, &repair.retained, var_names.len());
    Ok(StepRecord {
        coefficients_full,
        pseudo_r2: r2,
        converged: fit.converged,
        iterations: fit.iterations,
        row_count: rows.len(),
        retained: repair.retained,
        retained_names: repair.retained_names,
        reduced_coefficients: fit.coefficients,
    })
}

/// Fit the full quantile-spacing model.
///
/// The anchor level is fitted directly; the remaining levels are fitted as
/// exponentiated spacings walked outward in both directions, each step
/// re-parametrized to a conditional quantile level and restricted to rows on
/// the correct side of the running residual.
pub fn quantile_spacing_fit(
    response: &Array1<f64>,
    design: &DesignMatrix,
    var_names: &[String],
    grid: &QuantileGrid,
    options: &SpacingOptions,
    start_coefficients: Option<&Array1<f64>>,
    weights: Option<&Array1<f64>>,
) -> Result<SpacingResult, EstimationError> {
    let n = design.nrows();
    let k = design.ncols();
    if response.len() != n {
        return Err(EstimationError::DimensionMismatch(format!(
            "response has {} rows, design has {}",
            response.len(),
            n
        )));
    }
    if var_names.len() != k {
        return Err(EstimationError::DimensionMismatch(format!(
            "{} variable names for {} design columns",
            var_names.len(),
            k
        )));
    }
    if let Some(w) = weights
        && w.len() != n
    {
        return Err(EstimationError::DimensionMismatch(format!(
            "weight vector has {} entries for {} rows",
            w.len(),
            n
        )));
    }
    let p = grid.len();
    let anchor = grid.anchor;
    let alphas = &grid.alphas;

    let mut coefficients = Array2::<f64>::zeros((p, k));
    let mut pseudo = Array1::<f64>::zeros(p);
    let mut converged = vec![false; p];
    let mut iterations = vec![0usize; p];
    let mut row_counts = vec![0usize; p];
    let mut retained_names = vec![Vec::new(); p];

    // Anchor fit on the rank-repaired full design.
    let (reduced, repair) = ensure_full_rank(design, var_names, RANK_TOLERANCE)?;
    let anchor_start = start_coefficients
        .map(|b0| {
            if b0.len() != k {
                return Err(EstimationError::DimensionMismatch(format!(
                    "start coefficients have {} entries for {} columns",
                    b0.len(),
                    k
                )));
            }
            Ok(Array1::from_iter(repair.retained.iter().map(|&i| b0[i])))
        })
        .transpose()?;
    let anchor_fit = solve_quantile(
        &reduced,
        response,
        alphas[anchor],
        weights,
        anchor_start.as_ref(),
        &options.control,
    )?;
    let anchor_full = restore_columns(&anchor_fit.coefficients, &repair.retained, k);
    pseudo[anchor] = pseudo_r2(
        response,
        &anchor_fit.residuals,
        weights,
        alphas[anchor],
        &options.control,
    )?;
    converged[anchor] = anchor_fit.converged;
    iterations[anchor] = anchor_fit.iterations;
    row_counts[anchor] = n;
    retained_names[anchor] = repair.retained_names.clone();
    coefficients.row_mut(anchor).assign(&anchor_full);

    let e0 = response - &design.matvec(&anchor_full);

    // Upward walk: positive side of the running residual.
    let mut residual = e0.clone();
    let mut warm: Option<(Vec<usize>, Array1<f64>)> = None;
    for j in anchor + 1..p {
        let tau = (alphas[j] - alphas[j - 1]) / (1.0 - alphas[j - 1]);
        let record = fit_spacing_step(
            design,
            var_names,
            weights,
            &residual,
            tau,
            options,
            warm.as_ref(),
        )?;
        let spacing = design.matvec(&record.coefficients_full).mapv(f64::exp);
        residual = &residual - &spacing;
        coefficients.row_mut(j).assign(&record.coefficients_full);
        pseudo[j] = record.pseudo_r2;
        converged[j] = record.converged;
        iterations[j] = record.iterations;
        row_counts[j] = record.row_count;
        retained_names[j] = record.retained_names;
        warm = Some((record.retained, record.reduced_coefficients));
    }

    // Downward walk: negative side, walked toward the lower tail.
    let mut residual = e0;
    let mut warm: Option<(Vec<usize>, Array1<f64>)> = None;
    for j in (0..anchor).rev() {
        let tau = (alphas[j + 1] - alphas[j]) / alphas[j + 1];
        let negated = residual.mapv(|e| -e);
        let record = fit_spacing_step(
            design,
            var_names,
            weights,
            &negated,
            tau,
            options,
            warm.as_ref(),
        )?;
        let spacing = design.matvec(&record.coefficients_full).mapv(f64::exp);
        residual = &residual + &spacing;
        coefficients.row_mut(j).assign(&record.coefficients_full);
        pseudo[j] = record.pseudo_r2;
        converged[j] = record.converged;
        iterations[j] = record.iterations;
        row_counts[j] = record.row_count;
        retained_names[j] = record.retained_names;
        warm = Some((record.retained, record.reduced_coefficients));
    }

    Ok(SpacingResult {
        alphas: alphas.clone(),
        anchor,
        var_names: var_names.to_vec(),
        coefficients,
        pseudo_r2: pseudo,
        converged,
        iterations,
        row_counts,
        retained_names,
    })
}

/// Reconstruct fitted quantile values at every grid level.
///
/// The anchor column is the anchor fit itself; each neighbor adds or
/// subtracts an exponentiated spacing, so columns are non-decreasing across
/// the grid for every row regardless of coefficient signs.
pub fn spacings_to_quantiles(
    coefficients: &Array2<f64>,
    design: &DesignMatrix,
    anchor: usize,
) -> Result<Array2<f64>, EstimationError> {
    let p = coefficients.nrows();
    if anchor >= p {
        return Err(EstimationError::InvalidQuantileGrid(format!(
            "anchor index {anchor} out of range for {p} coefficient rows"
        )));
    }
    if coefficients.ncols() != design.ncols() {
        return Err(EstimationError::DimensionMismatch(format!(
            "{} coefficient columns for {} design columns",
            coefficients.ncols(),
            design.ncols()
        )));
    }
    let n = design.nrows();
    let mut out = Array2::<f64>::zeros((n, p));

    let anchor_fit = design.matvec(&coefficients.row(anchor).to_owned());
    out.column_mut(anchor).assign(&anchor_fit);

    for j in anchor + 1..p {
        let spacing = design
            .matvec(&coefficients.row(j).to_owned())
            .mapv(f64::exp);
        let next = &out.column(j - 1).to_owned() + &spacing;
        out.column_mut(j).assign(&next);
    }
    for j in (0..anchor).rev() {
        let spacing = design
            .matvec(&coefficients.row(j).to_owned())
            .mapv(f64::exp);
        let prev = &out.column(j + 1).to_owned() - &spacing;
        out.column_mut(j).assign(&prev);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn spacings_to_quantiles_is_monotone_for_negative_coefficients() {
        // Negative spacing coefficients still exponentiate to positive gaps.
        let coefficients = array![
            [-0.3, -2.0],
            [1.0, 0.5],
            [-1.5, -0.7],
            [0.2, -3.0],
            [-0.1, 0.4]
        ];
        let design = DesignMatrix::from_dense(array![
            [1.0, 0.0],
            [1.0, 0.5],
            [1.0, 1.0],
            [1.0, -2.0],
            [1.0, 3.0],
            [1.0, 0.25]
        ]);
        let q = spacings_to_quantiles(&coefficients, &design, 2).expect("reconstruct");
        assert_eq!(q.dim(), (6, 5));
        for row in 0..6 {
            for j in 1..5 {
                assert!(
                    q[[row, j]] > q[[row, j - 1]],
                    "row {row} not increasing at level {j}"
                );
            }
        }
    }

    #[test]
    fn check_loss_matches_hand_computation() {
        let r = array![1.0, -2.0, 0.5];
        // tau = 0.3: 1.0*0.3 + (-2.0)*(0.3-1.0) + 0.5*0.3
        let got = check_loss(&r, None, 0.3);
        assert!((got - (0.3 + 1.4 + 0.15)).abs() < 1e-12);
        let w = array![2.0, 1.0, 1.0];
        let got_w = check_loss(&r, Some(&w), 0.3);
        assert!((got_w - (0.6 + 1.4 + 0.15)).abs() < 1e-12);
    }

    #[test]
    fn grid_validation_rejects_bad_anchors_and_orderings() {
        assert!(QuantileGrid::new(vec![0.1, 0.5, 0.9], 3).is_err());
        assert!(QuantileGrid::new(vec![0.5, 0.5], 0).is_err());
        assert!(QuantileGrid::new(vec![0.0, 0.5], 0).is_err());
        assert!(QuantileGrid::new(vec![0.1, 0.5, 0.9], 1).is_ok());
    }
}
