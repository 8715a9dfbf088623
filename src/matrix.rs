use faer::sparse::{SparseColMat, SparseRowMat, Triplet};
use ndarray::{Array1, Array2};
use std::sync::{Arc, OnceLock};

use crate::spacing::EstimationError;

pub const SPARSE_ZERO_TOL: f64 = 1e-12;

/// Convert a dense matrix to compressed sparse column form, dropping entries
/// with magnitude at or below `tol`.
pub fn dense_to_sparse(
    matrix: &Array2<f64>,
    tol: f64,
) -> Result<SparseColMat<usize, f64>, EstimationError> {
    let nrows = matrix.nrows();
    let ncols = matrix.ncols();
    let mut triplets = Vec::new();
    for row in 0..nrows {
        for col in 0..ncols {
            let value = matrix[[row, col]];
            if value.abs() > tol {
                triplets.push(Triplet::new(row, col, value));
            }
        }
    }
    SparseColMat::try_new_from_triplets(nrows, ncols, &triplets).map_err(|_| {
        EstimationError::InvalidInput("failed to convert dense matrix to sparse CSC".to_string())
    })
}

/// Regression design: an immutable dense matrix with a lazily built
/// compressed-sparse-row companion for the quantile kernel.
///
/// Row and column subsets are new matrices, never in-place edits, so every
/// subset carries its own CSR cache.
#[derive(Clone)]
pub struct DesignMatrix {
    dense: Arc<Array2<f64>>,
    csr_cache: Arc<OnceLock<Arc<SparseRowMat<usize, f64>>>>,
}

impl DesignMatrix {
    pub fn from_dense(dense: Array2<f64>) -> Self {
        Self {
            dense: Arc::new(dense),
            csr_cache: Arc::new(OnceLock::new()),
        }
    }

    pub fn nrows(&self) -> usize {
        self.dense.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.dense.ncols()
    }

    pub fn dense(&self) -> &Array2<f64> {
        &self.dense
    }

    /// Row-major sparse view of the design, built once and shared.
    pub fn to_csr(&self) -> Result<Arc<SparseRowMat<usize, f64>>, EstimationError> {
        if let Some(cached) = self.csr_cache.get() {
            return Ok(cached.clone());
        }
        let csc = dense_to_sparse(&self.dense, SPARSE_ZERO_TOL)?;
        let csr = csc.as_ref().to_row_major().map_err(|_| {
            EstimationError::InvalidInput("failed to convert CSC design to CSR".to_string())
        })?;
        let arc = Arc::new(csr);
        let _ = self.csr_cache.set(arc.clone());
        Ok(arc)
    }

    /// New design holding the given rows, in the given order.
    pub fn row_subset(&self, rows: &[usize]) -> Self {
        let ncols = self.ncols();
        let mut out = Array2::<f64>::zeros((rows.len(), ncols));
        for (i, &r) in rows.iter().enumerate() {
            out.row_mut(i).assign(&self.dense.row(r));
        }
        Self::from_dense(out)
    }

    /// New design holding the given columns, in the given order.
    pub fn column_subset(&self, cols: &[usize]) -> Self {
        let nrows = self.nrows();
        let mut out = Array2::<f64>::zeros((nrows, cols.len()));
        for (j, &c) in cols.iter().enumerate() {
            out.column_mut(j).assign(&self.dense.column(c));
        }
        Self::from_dense(out)
    }

    /// New design with row i multiplied by `scales[i]`.
    pub fn scale_rows(&self, scales: &Array1<f64>) -> Self {
        debug_assert_eq!(scales.len(), self.nrows());
        let mut out = self.dense.as_ref().clone();
        for (mut row, &s) in out.rows_mut().into_iter().zip(scales.iter()) {
            row *= s;
        }
        Self::from_dense(out)
    }

    pub fn matvec(&self, vector: &Array1<f64>) -> Array1<f64> {
        dense_matvec(&self.dense, vector)
    }
}

#[inline]
fn dense_matvec(matrix: &Array2<f64>, vector: &Array1<f64>) -> Array1<f64> {
    let nrows = matrix.nrows();
    let ncols = matrix.ncols();
    let mut out = Array1::<f64>::zeros(nrows);

    if ncols == 0 || nrows == 0 {
        return out;
    }

    if matrix.is_standard_layout()
        && let (Some(ms), Some(vs), Some(os)) = (
            matrix.as_slice_memory_order(),
            vector.as_slice(),
            out.as_slice_mut(),
        )
    {
        for (i, row) in ms.chunks_exact(ncols).enumerate() {
            let mut acc = 0.0_f64;
            for j in 0..ncols {
                acc += row[j] * vs[j];
            }
            os[i] = acc;
        }
        return out;
    }

    for i in 0..nrows {
        let mut acc = 0.0_f64;
        for j in 0..ncols {
            acc += matrix[[i, j]] * vector[j];
        }
        out[i] = acc;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn csr_round_trips_dense_values() {
        let dense = array![[1.0, 0.0, 2.0], [0.0, 3.0, 0.0]];
        let design = DesignMatrix::from_dense(dense.clone());
        let csr = design.to_csr().expect("csr");
        assert_eq!(csr.nrows(), 2);
        assert_eq!(csr.ncols(), 3);
        let (symbolic, values) = csr.parts();
        let row_ptr = symbolic.row_ptr();
        let col_idx = symbolic.col_idx();
        let mut back = Array2::<f64>::zeros((2, 3));
        for row in 0..2 {
            for idx in row_ptr[row]..row_ptr[row + 1] {
                back[[row, col_idx[idx]]] = values[idx];
            }
        }
        assert_eq!(back, dense);
    }

    #[test]
    fn row_subset_preserves_order() {
        let dense = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let design = DesignMatrix::from_dense(dense);
        let sub = design.row_subset(&[2, 0]);
        assert_eq!(sub.dense(), &array![[5.0, 6.0], [1.0, 2.0]]);
    }

    #[test]
    fn matvec_matches_ndarray_dot() {
        let dense = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let v = array![0.5, -1.0];
        let design = DesignMatrix::from_dense(dense.clone());
        let got = design.matvec(&v);
        let want = dense.dot(&v);
        for i in 0..3 {
            assert!((got[i] - want[i]).abs() < 1e-12);
        }
    }
}
