use ndarray::{Array1, Array2};
use qspace::{
    DesignMatrix, QuantileGrid, SpacingOptions, quantile_spacing_fit, spacings_to_quantiles,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Synthetic linear data with noise scale driven by the first regressor.
fn heteroskedastic_data(n: usize, seed: u64) -> (DesignMatrix, Array1<f64>, Vec<String>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).expect("normal params must be valid");

    let mut x = Array2::<f64>::zeros((n, 3));
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let x1: f64 = rng.random::<f64>();
        let x2: f64 = rng.random::<f64>() * 2.0 - 1.0;
        x[[i, 0]] = 1.0;
        x[[i, 1]] = x1;
        x[[i, 2]] = x2;
        let scale = 0.5 + 2.0 * x1;
        y[i] = 1.0 + 2.0 * x1 - 1.0 * x2 + scale * noise.sample(&mut rng);
    }
    let names = vec![
        "intercept".to_string(),
        "x1".to_string(),
        "x2".to_string(),
    ];
    (DesignMatrix::from_dense(x), y, names)
}

#[test]
fn spacing_fit_produces_sane_diagnostics_and_monotone_quantiles() {
    let (design, y, names) = heteroskedastic_data(500, 20260826);
    let grid = QuantileGrid::new(vec![0.1, 0.5, 0.9], 1).expect("grid");
    let options = SpacingOptions::default();

    let fit = quantile_spacing_fit(&y, &design, &names, &grid, &options, None, None)
        .expect("spacing fit");

    assert_eq!(fit.coefficients.dim(), (3, 3));
    assert_eq!(fit.row_counts[1], 500);
    assert!(fit.row_counts[0] > 0 && fit.row_counts[0] < 500);
    assert!(fit.row_counts[2] > 0 && fit.row_counts[2] < 500);
    for (j, r2) in fit.pseudo_r2.iter().enumerate() {
        assert!(
            *r2 > 0.0 && *r2 < 1.0,
            "pseudo-R2 at level {j} out of (0, 1): {r2}"
        );
    }

    let q = spacings_to_quantiles(&fit.coefficients, &design, fit.anchor).expect("reconstruct");
    assert_eq!(q.dim(), (500, 3));
    for row in 0..500 {
        assert!(q[[row, 0]] <= q[[row, 1]], "crossing at row {row} (lower)");
        assert!(q[[row, 1]] <= q[[row, 2]], "crossing at row {row} (upper)");
    }

    // The anchor fit should recover the conditional median reasonably well.
    let median = fit.coefficients.row(1);
    assert!((median[0] - 1.0).abs() < 0.6, "intercept {}", median[0]);
    assert!((median[1] - 2.0).abs() < 1.2, "x1 slope {}", median[1]);
    assert!((median[2] + 1.0).abs() < 0.8, "x2 slope {}", median[2]);
}

#[test]
fn truncation_mode_keeps_every_signed_row_and_stays_monotone() {
    let (design, y, names) = heteroskedastic_data(400, 31);
    let grid = QuantileGrid::new(vec![0.2, 0.5, 0.8], 1).expect("grid");
    let options = SpacingOptions {
        truncate: true,
        ..SpacingOptions::default()
    };

    let fit = quantile_spacing_fit(&y, &design, &names, &grid, &options, None, None)
        .expect("truncated spacing fit");

    let filtered = quantile_spacing_fit(
        &y,
        &design,
        &names,
        &grid,
        &SpacingOptions::default(),
        None,
        None,
    )
    .expect("filtered spacing fit");

    // Truncation clamps sub-floor residuals instead of dropping them, so its
    // walk can only use at least as many rows as filtering does.
    assert!(fit.row_counts[0] >= filtered.row_counts[0]);
    assert!(fit.row_counts[2] >= filtered.row_counts[2]);

    let q = spacings_to_quantiles(&fit.coefficients, &design, fit.anchor).expect("reconstruct");
    for row in 0..400 {
        assert!(q[[row, 0]] <= q[[row, 1]]);
        assert!(q[[row, 1]] <= q[[row, 2]]);
    }
}

#[test]
fn redundant_design_column_is_repaired_and_reported() {
    let (design, y, _) = heteroskedastic_data(300, 99);
    // Append a copy of x1 so the design is rank deficient.
    let dense = design.dense();
    let mut wide = Array2::<f64>::zeros((300, 4));
    wide.slice_mut(ndarray::s![.., ..3]).assign(dense);
    wide.column_mut(3).assign(&dense.column(1));
    let wide = DesignMatrix::from_dense(wide);
    let names = vec![
        "intercept".to_string(),
        "x1".to_string(),
        "x2".to_string(),
        "x1_copy".to_string(),
    ];

    let grid = QuantileGrid::new(vec![0.25, 0.5, 0.75], 1).expect("grid");
    let fit = quantile_spacing_fit(
        &y,
        &wide,
        &names,
        &grid,
        &SpacingOptions::default(),
        None,
        None,
    )
    .expect("rank-repaired fit");

    // Coefficients re-expand to all four columns, with the dropped copy zeroed.
    assert_eq!(fit.coefficients.ncols(), 4);
    for j in 0..3 {
        assert_eq!(fit.coefficients[[j, 3]], 0.0);
        assert!(!fit.retained_names[j].contains(&"x1_copy".to_string()));
    }
}

#[test]
fn start_coefficients_do_not_change_the_answer_materially() {
    let (design, y, names) = heteroskedastic_data(250, 5);
    let grid = QuantileGrid::new(vec![0.3, 0.5, 0.7], 1).expect("grid");
    let options = SpacingOptions::default();

    let cold = quantile_spacing_fit(&y, &design, &names, &grid, &options, None, None)
        .expect("cold fit");
    let anchor_row = cold.coefficients.row(1).to_owned();
    let warm = quantile_spacing_fit(
        &y,
        &design,
        &names,
        &grid,
        &options,
        Some(&anchor_row),
        None,
    )
    .expect("warm fit");

    for j in 0..3 {
        for c in 0..3 {
            assert!(
                (cold.coefficients[[j, c]] - warm.coefficients[[j, c]]).abs() < 5e-2,
                "level {j} column {c} diverged"
            );
        }
    }
}
