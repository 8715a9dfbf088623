use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

const MAX_FACTORIZATION_ATTEMPTS: usize = 4;
const BASE_RIDGE: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("symmetric factorization failed after ridge escalation")]
    FactorizationFailed,
}

/// Zero-copy faer view over an ndarray matrix.
///
/// Layouts with non-positive strides can alias or reverse memory traversal,
/// which violates assumptions in faer kernels; those are materialized into a
/// compact owned copy instead.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live
        // ndarray view with positive strides, or from an owned compact copy
        // stored inside this wrapper, which guarantees validity for the
        // returned view lifetime.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

fn mat_to_col_array(mat: MatRef<'_, f64>) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

#[inline]
pub fn col_to_mat(vector: &Array1<f64>) -> Mat<f64> {
    Mat::from_fn(vector.len(), 1, |i, _| vector[i])
}

/// Singular values of a real matrix, descending.
pub trait FaerSvd {
    fn singular_values(&self) -> Result<Array1<f64>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn singular_values(&self) -> Result<Array1<f64>, FaerLinalgError> {
        let view = FaerArrayView::new(self);
        let mat = view.as_ref();
        let (rows, cols) = mat.shape();
        let mut singular = Diag::<f64>::zeros(rows.min(cols));
        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::No,
            ComputeSvdVectors::No,
            par,
            Default::default(),
        ));
        let stack = MemStack::new(&mut mem);
        svd::svd(
            mat,
            singular.as_mut(),
            None,
            None,
            par,
            stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence)?;
        Ok(diag_to_array(singular.as_ref()))
    }
}

fn add_ridge(matrix: &Array2<f64>, ridge: f64) -> Array2<f64> {
    let mut out = matrix.clone();
    for i in 0..out.nrows().min(out.ncols()) {
        out[[i, i]] += ridge;
    }
    out
}

/// Solve a symmetric positive (semi-)definite system.
///
/// LLT first, LDLT fallback, escalating a diagonal ridge when both
/// factorizations reject the matrix.
pub fn solve_spd(matrix: &Array2<f64>, rhs: &Array1<f64>) -> Result<Array1<f64>, FaerLinalgError> {
    let p = matrix.nrows();
    debug_assert_eq!(matrix.ncols(), p);
    debug_assert_eq!(rhs.len(), p);

    let rhs_mat = col_to_mat(rhs);
    let mean_diag = if p == 0 {
        1.0
    } else {
        (0..p).map(|i| matrix[[i, i]].abs()).sum::<f64>() / p as f64
    };

    let mut ridge = 0.0_f64;
    for _ in 0..MAX_FACTORIZATION_ATTEMPTS {
        let working = if ridge > 0.0 {
            add_ridge(matrix, ridge)
        } else {
            matrix.clone()
        };
        let view = FaerArrayView::new(&working);
        let solution = if let Ok(factor) = FaerLlt::new(view.as_ref(), Side::Lower) {
            Some(mat_to_col_array(factor.solve(rhs_mat.as_ref()).as_ref()))
        } else if let Ok(factor) = FaerLdlt::new(view.as_ref(), Side::Lower) {
            Some(mat_to_col_array(factor.solve(rhs_mat.as_ref()).as_ref()))
        } else {
            None
        };
        // A near-singular LDLT can "succeed" with non-finite entries; treat
        // that the same as a factorization failure and escalate the ridge.
        if let Some(x) = solution
            && x.iter().all(|v| v.is_finite())
        {
            return Ok(x);
        }
        ridge = if ridge == 0.0 {
            BASE_RIDGE * mean_diag.max(1.0)
        } else {
            ridge * 100.0
        };
    }
    Err(FaerLinalgError::FactorizationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn singular_values_of_identity_are_ones() {
        let eye = Array2::<f64>::eye(3);
        let sv = eye.singular_values().expect("svd");
        assert_eq!(sv.len(), 3);
        for &s in sv.iter() {
            assert!((s - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn solve_spd_recovers_known_solution() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let x_true = array![1.0, -2.0];
        let b = a.dot(&x_true);
        let x = solve_spd(&a, &b).expect("solve");
        assert!((x[0] - x_true[0]).abs() < 1e-10);
        assert!((x[1] - x_true[1]).abs() < 1e-10);
    }

    #[test]
    fn solve_spd_survives_singular_matrix_via_ridge() {
        // Rank-1 matrix; LLT rejects it, ridge escalation must kick in.
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let b = array![2.0, 2.0];
        let x = solve_spd(&a, &b).expect("ridge-stabilized solve");
        let fitted = a.dot(&x);
        assert!((fitted[0] - 2.0).abs() < 1e-4);
    }
}
