use faer::sparse::SparseRowMat;
use ndarray::{Array1, Array2};

use crate::faer_ndarray::solve_spd;
use crate::matrix::DesignMatrix;
use crate::spacing::EstimationError;
use crate::types::SolverControl;

/// Kernel error codes. Zero is success; anything else is carried through the
/// diagnostics rather than raised.
pub const KERNEL_OK: i32 = 0;
pub const KERNEL_MAX_ITER: i32 = 1;

/// One quantile-regression fit.
#[derive(Debug, Clone)]
pub struct QuantFit {
    pub coefficients: Array1<f64>,
    /// Residuals on the original, unweighted scale.
    pub residuals: Array1<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub error_code: i32,
}

/// Weighted quantile regression of `response` on `design` at level `tau`.
///
/// Weights pre-multiply the response and every design row, so sampling and
/// replicate weights enter the check-loss problem by row scaling. Reported
/// residuals are divided back by the weights. A warm start, when given, seeds
/// the kernel; otherwise a ridge-stabilized least-squares start is computed.
///
/// Non-convergence within the iteration budget is not fatal: the fit is
/// returned with `converged = false` and a non-zero `error_code`.
pub fn solve_quantile(
    design: &DesignMatrix,
    response: &Array1<f64>,
    tau: f64,
    weights: Option<&Array1<f64>>,
    warm_start: Option<&Array1<f64>>,
    control: &SolverControl,
) -> Result<QuantFit, EstimationError> {
    let n = design.nrows();
    let k = design.ncols();
    if response.len() != n {
        return Err(EstimationError::DimensionMismatch(format!(
            "response has {} rows, design has {}",
            response.len(),
            n
        )));
    }
    if !(tau > 0.0 && tau < 1.0) {
        return Err(EstimationError::InvalidInput(format!(
            "quantile level must lie in (0, 1), got {tau}"
        )));
    }
    if n == 0 || k == 0 {
        return Err(EstimationError::InvalidInput(
            "empty design passed to quantile solver".to_string(),
        ));
    }
    if let Some(w) = weights {
        if w.len() != n {
            return Err(EstimationError::DimensionMismatch(format!(
                "weight vector has {} entries for {} active rows",
                w.len(),
                n
            )));
        }
        if w.iter().any(|&v| !(v > 0.0) || !v.is_finite()) {
            return Err(EstimationError::InvalidInput(
                "weights must be strictly positive and finite".to_string(),
            ));
        }
    }
    if let Some(b0) = warm_start
        && b0.len() != k
    {
        return Err(EstimationError::DimensionMismatch(format!(
            "warm start has {} coefficients for {} design columns",
            b0.len(),
            k
        )));
    }

    // Row-scale the working problem when weights are present.
    let (working_design, working_response) = match weights {
        Some(w) => (design.scale_rows(w), response * w),
        None => (design.clone(), response.clone()),
    };
    let csr = working_design.to_csr()?;

    let start = match warm_start {
        Some(b0) => b0.clone(),
        None => least_squares_start(&csr, &working_response)?,
    };

    let (coefficients, iterations, converged) =
        fit_kernel(&csr, &working_response, tau, start, control)?;

    if !converged {
        log::warn!(
            "quantile kernel did not converge at tau={tau:.4} within {} iterations",
            control.max_iter
        );
    }

    let mut residuals = &working_response - &csr_matvec(&csr, &coefficients);
    if let Some(w) = weights {
        residuals /= w;
    }

    Ok(QuantFit {
        coefficients,
        residuals,
        converged,
        iterations,
        error_code: if converged { KERNEL_OK } else { KERNEL_MAX_ITER },
    })
}

/// Ridge-stabilized least-squares initial guess.
fn least_squares_start(
    csr: &SparseRowMat<usize, f64>,
    y: &Array1<f64>,
) -> Result<Array1<f64>, EstimationError> {
    let ones = Array1::<f64>::ones(csr.nrows());
    let (gram, xty) = csr_weighted_normal(csr, &ones, y);
    Ok(solve_spd(&gram, &xty)?)
}

/// Smoothed-Newton interior iteration for the check-loss problem.
///
/// Each pass solves the weighted normal equations of the majorizing quadratic
/// at the current residuals, with the smoothing width `delta` halved per
/// iteration down to `smoothing_min`. Convergence requires both a small
/// coefficient step and a fully tightened interior.
fn fit_kernel(
    csr: &SparseRowMat<usize, f64>,
    y: &Array1<f64>,
    tau: f64,
    start: Array1<f64>,
    control: &SolverControl,
) -> Result<(Array1<f64>, usize, bool), EstimationError> {
    let n = csr.nrows();
    let colsum = csr_column_sums(csr);
    let mut beta = start;
    let mut residual = y - &csr_matvec(csr, &beta);

    let mean_abs = residual.iter().map(|r| r.abs()).sum::<f64>() / n as f64;
    let mut delta = (0.1 * mean_abs).max(control.smoothing_min);

    let mut iterations = 0usize;
    let mut converged = false;
    let mut weight_buf = Array1::<f64>::zeros(n);

    while iterations < control.max_iter {
        iterations += 1;

        for (u, &r) in weight_buf.iter_mut().zip(residual.iter()) {
            *u = 1.0 / (2.0 * r.abs().max(delta));
        }
        let (gram, xuy) = csr_weighted_normal(csr, &weight_buf, y);
        let rhs = &xuy + &(&colsum * (tau - 0.5));
        let next = solve_spd(&gram, &rhs)?;

        let step = beta
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        let scale = 1.0 + beta.iter().map(|b| b.abs()).fold(0.0_f64, f64::max);

        beta = next;
        residual = y - &csr_matvec(csr, &beta);

        let interior_tight = delta <= control.smoothing_min * (1.0 + 1e-12);
        if step < control.tol * scale && interior_tight {
            converged = true;
            break;
        }
        delta = (0.5 * delta).max(control.smoothing_min);
    }

    Ok((beta, iterations, converged))
}

pub(crate) fn csr_matvec(m: &SparseRowMat<usize, f64>, v: &Array1<f64>) -> Array1<f64> {
    let (symbolic, values) = m.parts();
    let row_ptr = symbolic.row_ptr();
    let col_idx = symbolic.col_idx();
    let mut out = Array1::<f64>::zeros(m.nrows());
    for row in 0..m.nrows() {
        let mut acc = 0.0_f64;
        for idx in row_ptr[row]..row_ptr[row + 1] {
            acc += values[idx] * v[col_idx[idx]];
        }
        out[row] = acc;
    }
    out
}

fn csr_column_sums(m: &SparseRowMat<usize, f64>) -> Array1<f64> {
    let (symbolic, values) = m.parts();
    let row_ptr = symbolic.row_ptr();
    let col_idx = symbolic.col_idx();
    let mut out = Array1::<f64>::zeros(m.ncols());
    for row in 0..m.nrows() {
        for idx in row_ptr[row]..row_ptr[row + 1] {
            out[col_idx[idx]] += values[idx];
        }
    }
    out
}

/// One-pass accumulation of `X' diag(u) X` and `X' (u ⊙ y)` over CSR rows.
fn csr_weighted_normal(
    m: &SparseRowMat<usize, f64>,
    u: &Array1<f64>,
    y: &Array1<f64>,
) -> (Array2<f64>, Array1<f64>) {
    let k = m.ncols();
    let (symbolic, values) = m.parts();
    let row_ptr = symbolic.row_ptr();
    let col_idx = symbolic.col_idx();
    let mut gram = Array2::<f64>::zeros((k, k));
    let mut xuy = Array1::<f64>::zeros(k);
    for row in 0..m.nrows() {
        let ui = u[row];
        let uy = ui * y[row];
        let lo = row_ptr[row];
        let hi = row_ptr[row + 1];
        for a in lo..hi {
            let ja = col_idx[a];
            let va = values[a];
            xuy[ja] += uy * va;
            let uva = ui * va;
            for b in lo..hi {
                gram[[ja, col_idx[b]]] += uva * values[b];
            }
        }
    }
    (gram, xuy)
}
