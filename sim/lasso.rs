//! # Cross-Validated L1-Penalized Logistic Regression
//!
//! The joint detection method fits every SNP, the exposure and every
//! SNP × exposure column at once under an L1 penalty, and reads the
//! interaction block of the coefficient vector: a coefficient of exactly zero
//! means "not detected".
//!
//! The fitter follows the usual pathwise scheme:
//!
//! 1. Predictors are standardized (mean 0, population sd 1); the intercept is
//!    never penalized and constant columns are pinned at zero.
//! 2. `lambda_max` is the smallest penalty at which every coefficient is zero;
//!    the path descends log-linearly to `lambda_min_ratio * lambda_max`.
//! 3. For each penalty an outer loop forms the IRLS quadratic approximation of
//!    the binomial log-likelihood and an inner loop minimizes the penalized
//!    weighted least-squares problem by cyclic coordinate descent with soft
//!    thresholding, iterating on the active set between full sweeps.
//! 4. The path stops early once the deviance explained exceeds 0.999 or stops
//!    improving.
//!
//! The penalty is chosen by k-fold cross-validated binomial deviance and the
//! coefficients at that penalty are read from the full-data path.

use crate::cohort::logistic;
use crate::config::{LambdaSelection, LassoConfig};
use crate::design::build_joint_design;
use crate::glm::calculate_deviance;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

/// Fitted probabilities are kept in `[PROB_MIN, 1 - PROB_MIN]`.
const PROB_MIN: f64 = 1e-5;
/// Stop the path when the deviance explained exceeds this fraction.
const MAX_DEVIANCE_RATIO: f64 = 0.999;
/// Stop the path when the deviance explained improves by less than this, relatively.
const MIN_DEVIANCE_RATIO_GAIN: f64 = 1e-5;
/// The early-stopping rules are only consulted after this many penalties.
const MIN_PATH_LENGTH: usize = 5;
const LAMBDA_MAX_INFLATION: f64 = 1.0 + 1e-9;
/// Columns whose standard deviation falls below this are treated as constant.
const CONSTANT_COLUMN_SD: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum LassoError {
    #[error("Design has {rows} rows but the response has {response} entries.")]
    DimensionMismatch { rows: usize, response: usize },
    #[error("Cannot fit a penalized regression to an empty design ({rows} x {cols}).")]
    EmptyDesign { rows: usize, cols: usize },
    #[error("Cannot split {n_individuals} individuals into {n_folds} folds (need 3 <= folds <= n).")]
    InvalidFolds { n_folds: usize, n_individuals: usize },
    #[error(
        "Coordinate descent did not converge at lambda={lambda:.6e} within {iterations} {stage} iterations."
    )]
    DidNotConverge {
        lambda: f64,
        iterations: usize,
        stage: &'static str,
    },
}

/// A fitted regularization path on the original predictor scale.
#[derive(Debug, Clone)]
pub struct LassoPath {
    /// Penalties, strictly decreasing.
    pub lambdas: Vec<f64>,
    pub intercepts: Vec<f64>,
    /// One row of coefficients per penalty, shape `[lambdas.len(), p]`.
    pub coefficients: Array2<f64>,
    /// Fraction of the null deviance explained at each penalty.
    pub deviance_ratio: Vec<f64>,
}

/// The path together with its cross-validation curve.
#[derive(Debug, Clone)]
pub struct CvLasso {
    pub path: LassoPath,
    /// Mean held-out deviance per observation, per penalty.
    pub cv_mean: Array1<f64>,
    /// Standard error of `cv_mean` across folds.
    pub cv_sd: Array1<f64>,
    pub index_min: usize,
    pub index_1se: usize,
    /// Index into the path picked by the configured [`LambdaSelection`].
    pub selected: usize,
}

impl CvLasso {
    pub fn selected_lambda(&self) -> f64 {
        self.path.lambdas[self.selected]
    }

    pub fn selected_coefficients(&self) -> ArrayView1<'_, f64> {
        self.path.coefficients.row(self.selected)
    }
}

/// Output of [`lasso_test`]: the interaction coefficients in SNP order.
#[derive(Debug, Clone)]
pub struct LassoTestResult {
    /// Length `m`; entry `i` is SNP `i`'s interaction coefficient.
    pub interaction_coefficients: Array1<f64>,
    pub lambda: f64,
    pub cv: CvLasso,
}

struct Standardized {
    x: Array2<f64>,
    means: Array1<f64>,
    scales: Array1<f64>,
    varying: Vec<bool>,
}

fn standardize(x: ArrayView2<f64>) -> Standardized {
    let n = x.nrows() as f64;
    let means = x.sum_axis(Axis(0)) / n;
    let mut centered = &x - &means.view().insert_axis(Axis(0));
    let sds = centered.map_axis(Axis(0), |col| (col.dot(&col) / n).sqrt());
    let varying: Vec<bool> = sds.iter().map(|&sd| sd > CONSTANT_COLUMN_SD).collect();
    let scales: Array1<f64> = sds
        .iter()
        .zip(&varying)
        .map(|(&sd, &v)| if v { sd } else { 1.0 })
        .collect();
    centered /= &scales.view().insert_axis(Axis(0));
    Standardized {
        x: centered,
        means,
        scales,
        varying,
    }
}

#[inline]
fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

fn clamped_logit(p: f64) -> f64 {
    let p = p.clamp(PROB_MIN, 1.0 - PROB_MIN);
    (p / (1.0 - p)).ln()
}

/// Decreasing, log-spaced penalty sequence from `lambda_max` down.
fn lambda_sequence(data: &Standardized, y: ArrayView1<f64>, config: &LassoConfig) -> Vec<f64> {
    let n = data.x.nrows();
    let p = data.x.ncols();
    let ybar = y.mean().unwrap_or(0.0);
    let centered_y = y.mapv(|v| v - ybar);

    let lambda_max = data
        .x
        .axis_iter(Axis(1))
        .zip(&data.varying)
        .filter(|(_, v)| **v)
        .map(|(col, _)| (col.dot(&centered_y) / n as f64).abs())
        .fold(0.0_f64, f64::max);

    if !(lambda_max > 0.0 && lambda_max.is_finite()) {
        log::debug!("Null model is optimal for every penalty; using a single-point path");
        return vec![0.0];
    }

    // Slight inflation keeps the first fit exactly null despite round-off in
    // the IRLS working response.
    let lambda_max = lambda_max * LAMBDA_MAX_INFLATION;
    let ratio = config
        .lambda_min_ratio
        .unwrap_or(if n > p { 1e-4 } else { 1e-2 });
    if config.n_lambda == 1 {
        return vec![lambda_max];
    }
    let steps = (config.n_lambda - 1) as f64;
    (0..config.n_lambda)
        .map(|k| lambda_max * ratio.powf(k as f64 / steps))
        .collect()
}

/// The penalty sequence the full-data fit of `x`, `y` would use.
pub fn lambda_path(x: ArrayView2<f64>, y: ArrayView1<f64>, config: &LassoConfig) -> Vec<f64> {
    lambda_sequence(&standardize(x), y, config)
}

/// State of the penalized fit in the standardized basis.
struct CdState {
    beta: Array1<f64>,
    intercept: f64,
}

/// One coordinate-descent sweep over `columns`, followed by an intercept
/// update. Returns the largest weighted squared coefficient change.
#[allow(clippy::too_many_arguments)]
fn sweep(
    data: &Standardized,
    weights: &Array1<f64>,
    xw2: &Array1<f64>,
    residual: &mut Array1<f64>,
    state: &mut CdState,
    lambda: f64,
    columns: &[usize],
    weight_sum: f64,
) -> f64 {
    let n = data.x.nrows() as f64;
    let mut max_change = 0.0_f64;

    for &j in columns {
        if xw2[j] <= 0.0 {
            continue;
        }
        let col = data.x.column(j);
        let gradient = Zip::from(weights)
            .and(&*residual)
            .and(&col)
            .fold(0.0, |acc, &w, &r, &x| acc + w * r * x)
            / n;
        let current = state.beta[j];
        let updated = soft_threshold(gradient + xw2[j] * current, lambda) / xw2[j];
        let delta = updated - current;
        if delta != 0.0 {
            state.beta[j] = updated;
            residual.scaled_add(-delta, &col);
            max_change = max_change.max(xw2[j] * delta * delta);
        }
    }

    let delta0 = weights.dot(&*residual) / weight_sum;
    if delta0 != 0.0 {
        state.intercept += delta0;
        residual.mapv_inplace(|r| r - delta0);
        max_change = max_change.max(weight_sum / n * delta0 * delta0);
    }
    max_change
}

/// Minimizes the penalized weighted least-squares problem for one quadratic
/// approximation.
fn coordinate_descent(
    data: &Standardized,
    weights: &Array1<f64>,
    residual: &mut Array1<f64>,
    state: &mut CdState,
    lambda: f64,
    config: &LassoConfig,
) -> Result<(), LassoError> {
    let n = data.x.nrows() as f64;
    let xw2: Array1<f64> = data
        .x
        .axis_iter(Axis(1))
        .zip(&data.varying)
        .map(|(col, &v)| {
            if v {
                Zip::from(weights).and(&col).fold(0.0, |acc, &w, &x| acc + w * x * x) / n
            } else {
                0.0
            }
        })
        .collect();
    let weight_sum = weights.sum();
    let eligible: Vec<usize> = (0..data.x.ncols()).filter(|&j| data.varying[j]).collect();

    let mut sweeps = 0;
    loop {
        let change = sweep(
            data, weights, &xw2, residual, state, lambda, &eligible, weight_sum,
        );
        sweeps += 1;
        if change < config.convergence_tolerance {
            return Ok(());
        }

        let active: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|&j| state.beta[j] != 0.0)
            .collect();
        loop {
            if sweeps >= config.max_sweeps {
                return Err(LassoError::DidNotConverge {
                    lambda,
                    iterations: config.max_sweeps,
                    stage: "coordinate-descent sweep",
                });
            }
            let change = sweep(
                data, weights, &xw2, residual, state, lambda, &active, weight_sum,
            );
            sweeps += 1;
            if change < config.convergence_tolerance {
                break;
            }
        }
    }
}

/// Fits the path on standardized data and maps it back to the original scale.
fn fit_standardized_path(
    data: &Standardized,
    y: ArrayView1<f64>,
    lambdas: &[f64],
    config: &LassoConfig,
    early_stop: bool,
) -> Result<LassoPath, LassoError> {
    let n = data.x.nrows();
    let p = data.x.ncols();
    let ybar = y.mean().unwrap_or(0.0);
    let null_mu = Array1::from_elem(n, ybar.clamp(PROB_MIN, 1.0 - PROB_MIN));
    let null_deviance = calculate_deviance(y, &null_mu);

    let mut state = CdState {
        beta: Array1::zeros(p),
        intercept: clamped_logit(ybar),
    };

    let mut fitted_lambdas = Vec::with_capacity(lambdas.len());
    let mut intercepts = Vec::with_capacity(lambdas.len());
    let mut rows: Vec<Array1<f64>> = Vec::with_capacity(lambdas.len());
    let mut deviance_ratio = Vec::with_capacity(lambdas.len());

    // A single-class response has no slopes to estimate.
    let single_class = ybar <= 0.0 || ybar >= 1.0;

    for (k, &lambda) in lambdas.iter().enumerate() {
        if !single_class {
            let mut converged = false;
            for _ in 0..config.max_iterations {
                let eta = data.x.dot(&state.beta) + state.intercept;
                let mu = eta.mapv(|e| logistic(e).clamp(PROB_MIN, 1.0 - PROB_MIN));
                let weights = mu.mapv(|m| m * (1.0 - m));
                let mut residual = (&y - &mu) / &weights;

                let beta_before = state.beta.clone();
                let intercept_before = state.intercept;
                coordinate_descent(data, &weights, &mut residual, &mut state, lambda, config)?;

                let weighted_change = Zip::from(&state.beta)
                    .and(&beta_before)
                    .and(data.x.columns())
                    .fold(0.0_f64, |acc, &b, &b0, col| {
                        let xw2 = Zip::from(&weights)
                            .and(&col)
                            .fold(0.0, |s, &w, &x| s + w * x * x)
                            / n as f64;
                        acc.max(xw2 * (b - b0) * (b - b0))
                    });
                let intercept_change = weights.sum() / n as f64
                    * (state.intercept - intercept_before).powi(2);
                if weighted_change.max(intercept_change) < config.convergence_tolerance {
                    converged = true;
                    break;
                }
            }
            if !converged {
                return Err(LassoError::DidNotConverge {
                    lambda,
                    iterations: config.max_iterations,
                    stage: "quadratic-approximation",
                });
            }
        }

        let eta = data.x.dot(&state.beta) + state.intercept;
        let mu = eta.mapv(logistic);
        let deviance = calculate_deviance(y, &mu);
        let ratio = if null_deviance > 0.0 {
            1.0 - deviance / null_deviance
        } else {
            0.0
        };

        let coefficients = Zip::from(&state.beta)
            .and(&data.scales)
            .map_collect(|&b, &s| if b == 0.0 { 0.0 } else { b / s });
        let intercept = state.intercept - coefficients.dot(&data.means);

        let previous_ratio = deviance_ratio.last().copied();
        fitted_lambdas.push(lambda);
        intercepts.push(intercept);
        rows.push(coefficients);
        deviance_ratio.push(ratio);

        if early_stop && k + 1 >= MIN_PATH_LENGTH {
            let stalled = previous_ratio
                .map(|prev| ratio > 0.0 && ratio - prev < MIN_DEVIANCE_RATIO_GAIN * ratio)
                .unwrap_or(false);
            if ratio > MAX_DEVIANCE_RATIO || stalled {
                log::debug!(
                    "Stopping lasso path after {} of {} penalties (deviance ratio {:.6})",
                    k + 1,
                    lambdas.len(),
                    ratio
                );
                break;
            }
        }
    }

    let mut coefficients = Array2::zeros((rows.len(), p));
    for (mut target, row) in coefficients.rows_mut().into_iter().zip(&rows) {
        target.assign(row);
    }

    Ok(LassoPath {
        lambdas: fitted_lambdas,
        intercepts,
        coefficients,
        deviance_ratio,
    })
}

fn check_dimensions(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), LassoError> {
    if x.nrows() != y.len() {
        return Err(LassoError::DimensionMismatch {
            rows: x.nrows(),
            response: y.len(),
        });
    }
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(LassoError::EmptyDesign {
            rows: x.nrows(),
            cols: x.ncols(),
        });
    }
    Ok(())
}

/// Fits the full regularization path of `y` on `x` (no intercept column; one
/// is always fitted). `lambdas` overrides the automatically chosen sequence.
pub fn fit_lasso_path(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    lambdas: Option<&[f64]>,
    config: &LassoConfig,
) -> Result<LassoPath, LassoError> {
    check_dimensions(x, y)?;
    let data = standardize(x);
    match lambdas {
        Some(lambdas) => fit_standardized_path(&data, y, lambdas, config, false),
        None => {
            let lambdas = lambda_sequence(&data, y, config);
            fit_standardized_path(&data, y, &lambdas, config, true)
        }
    }
}

/// Mean binomial deviance per observation, probabilities clamped to
/// `[PROB_MIN, 1 - PROB_MIN]`.
fn held_out_deviance(y: ArrayView1<f64>, eta: &Array1<f64>) -> f64 {
    let total = Zip::from(y).and(eta).fold(0.0, |acc, &yi, &e| {
        let p = logistic(e).clamp(PROB_MIN, 1.0 - PROB_MIN);
        acc - 2.0 * (yi * p.ln() + (1.0 - yi) * (1.0 - p).ln())
    });
    total / y.len() as f64
}

/// Randomly assigns each of `n` individuals to one of `n_folds` balanced folds.
fn assign_folds<R: Rng + ?Sized>(rng: &mut R, n: usize, n_folds: usize) -> Vec<usize> {
    let mut folds: Vec<usize> = (0..n).map(|i| i % n_folds).collect();
    folds.shuffle(rng);
    folds
}

/// Fits the full-data path and selects a penalty by k-fold cross-validation.
pub fn cv_lasso<R: Rng + ?Sized>(
    rng: &mut R,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    config: &LassoConfig,
) -> Result<CvLasso, LassoError> {
    check_dimensions(x, y)?;
    let n = x.nrows();
    let k = config.n_folds;
    if k < 3 || k > n {
        return Err(LassoError::InvalidFolds {
            n_folds: k,
            n_individuals: n,
        });
    }

    let path = fit_lasso_path(x, y, None, config)?;
    let n_lambda = path.lambdas.len();
    let folds = assign_folds(rng, n, k);

    let mut cv_raw = Array2::<f64>::zeros((k, n_lambda));
    let mut fold_sizes = Array1::<f64>::zeros(k);
    for fold in 0..k {
        let (test, train): (Vec<usize>, Vec<usize>) = (0..n).partition(|&i| folds[i] == fold);
        fold_sizes[fold] = test.len() as f64;

        let x_train = x.select(Axis(0), &train);
        let y_train = y.select(Axis(0), &train);
        let x_test = x.select(Axis(0), &test);
        let y_test = y.select(Axis(0), &test);

        let fold_path = fit_lasso_path(
            x_train.view(),
            y_train.view(),
            Some(&path.lambdas),
            config,
        )?;
        for l in 0..n_lambda {
            let eta = x_test.dot(&fold_path.coefficients.row(l)) + fold_path.intercepts[l];
            cv_raw[[fold, l]] = held_out_deviance(y_test.view(), &eta);
        }
    }

    let total_weight = fold_sizes.sum();
    let cv_mean = fold_sizes.dot(&cv_raw) / total_weight;
    let cv_sd: Array1<f64> = (0..n_lambda)
        .map(|l| {
            let variance = Zip::from(cv_raw.column(l))
                .and(&fold_sizes)
                .fold(0.0, |acc, &v, &w| acc + w * (v - cv_mean[l]).powi(2))
                / total_weight;
            (variance / (k as f64 - 1.0)).sqrt()
        })
        .collect();

    let mut index_min = 0;
    for l in 1..n_lambda {
        if cv_mean[l] < cv_mean[index_min] {
            index_min = l;
        }
    }
    let bound = cv_mean[index_min] + cv_sd[index_min];
    let index_1se = (0..=index_min)
        .find(|&l| cv_mean[l] <= bound)
        .unwrap_or(index_min);

    let selected = match config.selection {
        LambdaSelection::Min => index_min,
        LambdaSelection::OneSe => index_1se,
    };
    log::debug!(
        "CV lasso: {} penalties, lambda.min={:.4e} (#{index_min}), lambda.1se={:.4e} (#{index_1se})",
        n_lambda,
        path.lambdas[index_min],
        path.lambdas[index_1se]
    );

    Ok(CvLasso {
        path,
        cv_mean,
        cv_sd,
        index_min,
        index_1se,
        selected,
    })
}

/// Fits the joint `[SNPs | exposure | SNP × exposure]` model and returns the
/// `m` interaction coefficients at the cross-validated penalty.
pub fn lasso_test<R: Rng + ?Sized>(
    rng: &mut R,
    outcome: ArrayView1<f64>,
    genotypes: ArrayView2<f64>,
    exposure: ArrayView1<f64>,
    config: &LassoConfig,
) -> Result<LassoTestResult, LassoError> {
    let (layout, x) = build_joint_design(genotypes, exposure);
    let cv = cv_lasso(rng, x.view(), outcome, config)?;

    layout.assert_ordering();
    let interaction_coefficients = cv
        .selected_coefficients()
        .slice(ndarray::s![layout.interaction_cols()])
        .to_owned();
    assert_eq!(interaction_coefficients.len(), genotypes.ncols());

    Ok(LassoTestResult {
        interaction_coefficients,
        lambda: cv.selected_lambda(),
        cv,
    })
}
