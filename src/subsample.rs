use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample as index_sample;
use rand_distr::{Distribution, Exp};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::faer_ndarray::solve_spd;
use crate::matrix::DesignMatrix;
use crate::spacing::{EstimationError, quantile_spacing_fit};
use crate::types::{InferenceOptions, QuantileGrid};

/// Floor on exponential replicate weight draws.
pub const MIN_REPLICATE_WEIGHT: f64 = 5e-3;

/// Cluster layout of the rows: half-open `(start, end)` row ranges, one per
/// cluster, plus an optional stratum id per cluster.
///
/// Rows must be pre-sorted so that each cluster occupies one contiguous
/// block; sortedness is the caller's invariant and is not checked beyond the
/// range bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub ranges: Vec<(usize, usize)>,
    pub strata: Option<Vec<usize>>,
}

impl ClusterSpec {
    fn validate(&self, n_rows: usize) -> Result<(), EstimationError> {
        if self.ranges.is_empty() {
            return Err(EstimationError::InvalidInput(
                "cluster specification has no clusters".to_string(),
            ));
        }
        for &(start, end) in &self.ranges {
            if start >= end || end > n_rows {
                return Err(EstimationError::InvalidInput(format!(
                    "cluster range ({start}, {end}) is invalid for {n_rows} rows"
                )));
            }
        }
        if let Some(strata) = &self.strata
            && strata.len() != self.ranges.len()
        {
            return Err(EstimationError::DimensionMismatch(format!(
                "{} stratum labels for {} clusters",
                strata.len(),
                self.ranges.len()
            )));
        }
        Ok(())
    }
}

/// Per-replicate spacing diagnostics carried into the aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateDiagnostics {
    pub pseudo_r2: Vec<f64>,
    pub converged: Vec<bool>,
    pub iterations: Vec<usize>,
    pub row_count: usize,
}

/// Aggregated subsampling output.
///
/// `quant_cov` is square over the flattened (level-major) spacing
/// coefficients, `ols_cov` over the companion least-squares coefficients;
/// both are already scaled by the sample fraction M.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub quant_cov: Array2<f64>,
    pub ols_cov: Array2<f64>,
    pub quant_draws: Array2<f64>,
    pub ols_draws: Array2<f64>,
    pub successes: usize,
    pub requested: usize,
    pub diagnostics: Vec<ReplicateDiagnostics>,
}

struct ReplicateOutput {
    quant_row: Vec<f64>,
    ols_row: Vec<f64>,
    diagnostics: ReplicateDiagnostics,
}

/// One subsample draw: selected rows (ascending) and, when requested, one
/// positive weight factor per selected row.
///
/// Without clustering, `floor(M * n)` rows are drawn uniformly without
/// replacement. With clustering, whole clusters are drawn — a fraction M of
/// clusters overall, or of each stratum — and every row of a selected
/// cluster shares that cluster's weight factor.
fn draw_subsample(
    rng: &mut StdRng,
    n_rows: usize,
    cluster: Option<&ClusterSpec>,
    fraction: f64,
    draw_weights: bool,
) -> Result<(Vec<usize>, Option<Vec<f64>>), EstimationError> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(EstimationError::InvalidSampleFraction(fraction));
    }
    let exp = Exp::new(1.0_f64).expect("unit exponential is well-defined");
    let factor = |rng: &mut StdRng| -> f64 { exp.sample(rng).max(MIN_REPLICATE_WEIGHT) };

    match cluster {
        None => {
            let take = ((fraction * n_rows as f64).floor() as usize).min(n_rows);
            if take == 0 {
                return Err(EstimationError::InvalidInput(
                    "subsample fraction selects no rows".to_string(),
                ));
            }
            let mut rows = index_sample(rng, n_rows, take).into_vec();
            rows.sort_unstable();
            let factors =
                draw_weights.then(|| rows.iter().map(|_| factor(rng)).collect::<Vec<f64>>());
            Ok((rows, factors))
        }
        Some(spec) => {
            let n_clusters = spec.ranges.len();
            let mut selected: Vec<usize> = match &spec.strata {
                None => {
                    let take = ((fraction * n_clusters as f64).floor() as usize).min(n_clusters);
                    if take == 0 {
                        return Err(EstimationError::InvalidInput(
                            "subsample fraction selects no clusters".to_string(),
                        ));
                    }
                    index_sample(rng, n_clusters, take).into_vec()
                }
                Some(strata) => {
                    let mut by_stratum: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
                    for (cluster_id, &stratum) in strata.iter().enumerate() {
                        by_stratum.entry(stratum).or_default().push(cluster_id);
                    }
                    let mut chosen = Vec::new();
                    for members in by_stratum.values() {
                        let take =
                            ((fraction * members.len() as f64).floor() as usize).min(members.len());
                        for idx in index_sample(rng, members.len(), take).into_vec() {
                            chosen.push(members[idx]);
                        }
                    }
                    if chosen.is_empty() {
                        return Err(EstimationError::InvalidInput(
                            "subsample fraction selects no clusters in any stratum".to_string(),
                        ));
                    }
                    chosen
                }
            };
            selected.sort_unstable();

            let mut rows = Vec::new();
            let mut factors = draw_weights.then(Vec::new);
            for &cluster_id in &selected {
                let (start, end) = spec.ranges[cluster_id];
                let shared = factors.is_some().then(|| factor(rng));
                for row in start..end {
                    rows.push(row);
                    if let (Some(fs), Some(f)) = (factors.as_mut(), shared) {
                        fs.push(f);
                    }
                }
            }
            Ok((rows, factors))
        }
    }
}

fn slice_rows(vector: &Array1<f64>, rows: &[usize]) -> Array1<f64> {
    Array1::from_iter(rows.iter().map(|&r| vector[r]))
}

/// Base weights (already sliced to the subsample) times replicate factors,
/// optionally squared for the least-squares weighting convention.
fn compose_weights(
    base: Option<&Array1<f64>>,
    factors: Option<&[f64]>,
    square: bool,
) -> Option<Array1<f64>> {
    let composed: Array1<f64> = match (base, factors) {
        (None, None) => return None,
        (Some(b), None) => b.clone(),
        (None, Some(f)) => Array1::from_iter(f.iter().cloned()),
        (Some(b), Some(f)) => Array1::from_iter(b.iter().zip(f.iter()).map(|(&b, &f)| b * f)),
    };
    Some(if square {
        composed.mapv(|w| w * w)
    } else {
        composed
    })
}

/// Weighted least-squares companion fit.
fn wls_fit(
    design: &DesignMatrix,
    response: &Array1<f64>,
    weights: Option<&Array1<f64>>,
) -> Result<Array1<f64>, EstimationError> {
    let x = design.dense();
    let (n, k) = x.dim();
    let mut gram = Array2::<f64>::zeros((k, k));
    let mut rhs = Array1::<f64>::zeros(k);
    for i in 0..n {
        let w = weights.map_or(1.0, |w| w[i]);
        let wy = w * response[i];
        for a in 0..k {
            let xa = x[[i, a]];
            rhs[a] += wy * xa;
            let wxa = w * xa;
            for b in 0..k {
                gram[[a, b]] += wxa * x[[i, b]];
            }
        }
    }
    Ok(solve_spd(&gram, &rhs)?)
}

fn covariance_scaled(draws: &Array2<f64>, fraction: f64) -> Array2<f64> {
    let reps = draws.nrows();
    let dims = draws.ncols();
    let means = draws
        .mean_axis(ndarray::Axis(0))
        .unwrap_or_else(|| Array1::zeros(dims));
    let mut centered = draws.clone();
    for mut row in centered.rows_mut() {
        row -= &means;
    }
    let mut cov = Array2::<f64>::zeros((dims, dims));
    for a in 0..dims {
        for b in a..dims {
            let mut acc = 0.0_f64;
            for r in 0..reps {
                acc += centered[[r, a]] * centered[[r, b]];
            }
            let value = acc / (reps as f64 - 1.0) * fraction;
            cov[[a, b]] = value;
            cov[[b, a]] = value;
        }
    }
    cov
}

/// Subsampling variance estimation for the spacing model.
///
/// Each replicate redraws rows (whole clusters when `cluster` is given),
/// refits the full spacing model plus a weighted least-squares companion,
/// and the successful replicates' coefficient vectors are stacked into
/// covariance matrices scaled by the sample fraction. A replicate that fails
/// is dropped from the aggregate, not retried.
///
/// Replicates are independent; when `pool` is given they run on that
/// caller-owned rayon pool.
#[allow(clippy::too_many_arguments)]
pub fn subsample_standard_errors(
    response: &Array1<f64>,
    design: &DesignMatrix,
    var_names: &[String],
    grid: &QuantileGrid,
    cluster: Option<&ClusterSpec>,
    options: &InferenceOptions,
    start_coefficients: Option<&Array1<f64>>,
    base_weights: Option<&Array1<f64>>,
    pool: Option<&rayon::ThreadPool>,
) -> Result<InferenceResult, EstimationError> {
    let n = design.nrows();
    let k = design.ncols();
    let fraction = options.sample_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(EstimationError::InvalidSampleFraction(fraction));
    }
    if response.len() != n {
        return Err(EstimationError::DimensionMismatch(format!(
            "response has {} rows, design has {}",
            response.len(),
            n
        )));
    }
    if let Some(w) = base_weights
        && w.len() != n
    {
        return Err(EstimationError::DimensionMismatch(format!(
            "base weight vector has {} entries for {} rows",
            w.len(),
            n
        )));
    }
    if let Some(spec) = cluster {
        spec.validate(n)?;
    }
    if options.replicate_count == 0 {
        return Err(EstimationError::InvalidInput(
            "replicate count must be positive".to_string(),
        ));
    }

    let run_replicate = |replicate: usize| -> Result<ReplicateOutput, EstimationError> {
        let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(replicate as u64));
        let (rows, factors) =
            draw_subsample(&mut rng, n, cluster, fraction, options.draw_weights)?;

        let sub_design = design.row_subset(&rows);
        let sub_response = slice_rows(response, &rows);
        let sub_base = base_weights.map(|w| slice_rows(w, &rows));

        let quant_weights = compose_weights(sub_base.as_ref(), factors.as_deref(), false);
        let ols_weights = compose_weights(
            sub_base.as_ref(),
            factors.as_deref(),
            options.square_ols_weights,
        );

        let spacing = quantile_spacing_fit(
            &sub_response,
            &sub_design,
            var_names,
            grid,
            &options.spacing,
            start_coefficients,
            quant_weights.as_ref(),
        )?;
        let ols = wls_fit(&sub_design, &sub_response, ols_weights.as_ref())?;

        Ok(ReplicateOutput {
            quant_row: spacing.coefficients.iter().cloned().collect(),
            ols_row: ols.to_vec(),
            diagnostics: ReplicateDiagnostics {
                pseudo_r2: spacing.pseudo_r2.to_vec(),
                converged: spacing.converged,
                iterations: spacing.iterations,
                row_count: rows.len(),
            },
        })
    };

    let outcomes: Vec<Result<ReplicateOutput, EstimationError>> = match pool {
        Some(pool) => pool.install(|| {
            (0..options.replicate_count)
                .into_par_iter()
                .map(run_replicate)
                .collect()
        }),
        None => (0..options.replicate_count).map(run_replicate).collect(),
    };

    let mut successes = Vec::new();
    for (replicate, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(output) => successes.push(output),
            Err(reason) => {
                log::warn!("replicate {replicate} dropped: {reason}");
            }
        }
    }
    if successes.len() < 2 {
        return Err(EstimationError::TooFewReplicates {
            successes: successes.len(),
            requested: options.replicate_count,
        });
    }

    let quant_dim = grid.len() * k;
    let mut quant_draws = Array2::<f64>::zeros((successes.len(), quant_dim));
    let mut ols_draws = Array2::<f64>::zeros((successes.len(), k));
    let mut diagnostics = Vec::with_capacity(successes.len());
    for (r, output) in successes.into_iter().enumerate() {
        for (j, value) in output.quant_row.into_iter().enumerate() {
            quant_draws[[r, j]] = value;
        }
        for (j, value) in output.ols_row.into_iter().enumerate() {
            ols_draws[[r, j]] = value;
        }
        diagnostics.push(output.diagnostics);
    }

    let quant_cov = covariance_scaled(&quant_draws, fraction);
    let ols_cov = covariance_scaled(&ols_draws, fraction);
    let successes = quant_draws.nrows();

    Ok(InferenceResult {
        quant_cov,
        ols_cov,
        quant_draws,
        ols_draws,
        successes,
        requested: options.replicate_count,
        diagnostics,
    })
}
