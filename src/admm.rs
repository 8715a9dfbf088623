use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::spacing::EstimationError;

/// Outcome of one ADMM step on the two-way fixed-effect block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmmUpdate {
    pub gamma: Array2<f64>,
    pub converged: bool,
    pub max_change: f64,
}

/// One proximal update of the group-by-time fixed-effect matrix `Gamma`.
///
/// Each (group, time) cell is pulled toward the weighted mean of its paired
/// observations, scaled by `tuning` and damped by the quadratic penalty
/// `nu` on the distance from the current value:
///
/// `gamma' = (tuning * sum(w * paired) + nu * gamma) / (tuning * sum(w) + nu)`
///
/// Cells with no observations keep their current value. Convergence is
/// declared when every element moves by less than `threshold`. Pure function
/// of its inputs; an outer driver calls it repeatedly until convergence or
/// an iteration cap.
pub fn admm_gamma_update(
    gamma: &Array2<f64>,
    paired: &Array1<f64>,
    weights: &Array1<f64>,
    group_index: &[usize],
    time_index: &[usize],
    tuning: f64,
    nu: f64,
    threshold: f64,
) -> Result<AdmmUpdate, EstimationError> {
    let (n_groups, n_times) = gamma.dim();
    let n = paired.len();
    if weights.len() != n || group_index.len() != n || time_index.len() != n {
        return Err(EstimationError::DimensionMismatch(format!(
            "paired block has {} rows; weights/group/time have {}/{}/{}",
            n,
            weights.len(),
            group_index.len(),
            time_index.len()
        )));
    }
    if !(tuning > 0.0) || !(nu > 0.0) || !(threshold > 0.0) {
        return Err(EstimationError::InvalidInput(format!(
            "tuning ({tuning}), penalty ({nu}), and threshold ({threshold}) must be positive"
        )));
    }
    if group_index.iter().any(|&g| g >= n_groups) || time_index.iter().any(|&t| t >= n_times) {
        return Err(EstimationError::InvalidInput(
            "group or time index out of range for the Gamma block".to_string(),
        ));
    }

    let mut weighted_sum = Array2::<f64>::zeros((n_groups, n_times));
    let mut weight_total = Array2::<f64>::zeros((n_groups, n_times));
    for i in 0..n {
        let cell = [group_index[i], time_index[i]];
        weighted_sum[cell] += weights[i] * paired[i];
        weight_total[cell] += weights[i];
    }

    let mut next = Array2::<f64>::zeros((n_groups, n_times));
    let mut max_change = 0.0_f64;
    for g in 0..n_groups {
        for t in 0..n_times {
            let current = gamma[[g, t]];
            let updated = (tuning * weighted_sum[[g, t]] + nu * current)
                / (tuning * weight_total[[g, t]] + nu);
            next[[g, t]] = updated;
            max_change = max_change.max((updated - current).abs());
        }
    }

    Ok(AdmmUpdate {
        gamma: next,
        converged: max_change < threshold,
        max_change,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn repeated_updates_converge_to_weighted_cell_means() {
        // 2 groups x 2 times, every cell observed twice with equal weights.
        let paired = array![1.0, 3.0, 10.0, 14.0, -2.0, -4.0, 0.5, 1.5];
        let weights = Array1::<f64>::ones(8);
        let group_index = [0, 0, 0, 0, 1, 1, 1, 1];
        let time_index = [0, 0, 1, 1, 0, 0, 1, 1];

        let mut gamma = array![[5.0, -5.0], [5.0, -5.0]];
        let mut converged = false;
        for _ in 0..500 {
            let update = admm_gamma_update(
                &gamma,
                &paired,
                &weights,
                &group_index,
                &time_index,
                1.0,
                0.5,
                1e-10,
            )
            .expect("update");
            gamma = update.gamma;
            if update.converged {
                converged = true;
                break;
            }
        }
        assert!(converged, "fixed point not reached within the cap");
        assert_abs_diff_eq!(gamma[[0, 0]], 2.0, epsilon = 1e-7);
        assert_abs_diff_eq!(gamma[[0, 1]], 12.0, epsilon = 1e-7);
        assert_abs_diff_eq!(gamma[[1, 0]], -3.0, epsilon = 1e-7);
        assert_abs_diff_eq!(gamma[[1, 1]], 1.0, epsilon = 1e-7);
    }

    #[test]
    fn empty_cells_keep_their_current_value() {
        let paired = array![4.0];
        let weights = array![1.0];
        let gamma = array![[0.0, 7.5], [1.0, -1.0]];
        let update = admm_gamma_update(&gamma, &paired, &weights, &[0], &[0], 1.0, 1.0, 1e-8)
            .expect("update");
        assert_eq!(update.gamma[[0, 1]], 7.5);
        assert_eq!(update.gamma[[1, 0]], 1.0);
        assert_eq!(update.gamma[[1, 1]], -1.0);
        assert!((update.gamma[[0, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn nonpositive_penalty_is_rejected() {
        let gamma = array![[0.0]];
        let err = admm_gamma_update(
            &gamma,
            &array![1.0],
            &array![1.0],
            &[0],
            &[0],
            1.0,
            0.0,
            1e-8,
        );
        assert!(matches!(err, Err(EstimationError::InvalidInput(_))));
    }
}
