//! # Logistic Regression by IRLS
//!
//! Unpenalized binomial GLM fits used by the likelihood-ratio test. The loop is
//! the classic iteratively reweighted least squares scheme with step halving:
//! each iteration solves `(XᵀWX) β = XᵀWz` by Cholesky, and a trial step that
//! increases the deviance (or produces non-finite values) is halved until it
//! does not.
//!
//! A design whose columns are linearly dependent is rejected up front rather
//! than silently fitted with aliased coefficients.

use crate::config::GlmConfig;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{FactorizeC, SolveC, UPLO};
use thiserror::Error;

/// Smallest squared Cholesky pivot, relative to the largest, accepted when
/// checking the column rank of a design.
const RANK_TOLERANCE: f64 = 1e-10;
const MAX_STEP_HALVINGS: usize = 30;
/// Fitted probabilities closer than this to 0 or 1 mark (quasi-)separation.
const SEPARATION_BOUND: f64 = 1e-6;
/// Relative deviance change below which a separated fit is accepted. The
/// change of a separated fit stalls near the probability clamp instead of
/// reaching `convergence_tolerance`.
const SEPARATION_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Design has {rows} rows but the response has {response} entries.")]
    DimensionMismatch { rows: usize, response: usize },
    #[error(
        "Design matrix is rank deficient: column '{column}' is (numerically) a linear combination of the preceding columns."
    )]
    RankDeficient { column: String },
    #[error("A linear system solve failed. The weighted Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),
    #[error(
        "IRLS did not converge within {max_iterations} iterations. Last relative deviance change was {last_change:.6e}."
    )]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },
    #[error("IRLS could not find a step with finite, non-increasing deviance at iteration {0}.")]
    StepHalvingFailed(usize),
}

/// The status of IRLS convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStatus {
    Converged,
    /// Some fitted probabilities are numerically 0 or 1 (quasi-complete
    /// separation) while the deviance was still falling. The coefficients of
    /// the separating columns are not meaningful; the deviance is.
    ConvergedWithSeparation,
}

/// A converged logistic fit.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    /// Coefficients in the column order of the design.
    pub coefficients: Array1<f64>,
    /// Binomial deviance, `-2 log L` for a 0/1 response.
    pub deviance: f64,
    pub fitted: Array1<f64>,
    pub iterations: usize,
    pub status: FitStatus,
}

/// Computes `mu`, the IRLS weights and the working response for a logit link.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-6;
    const PROB_EPS: f64 = 1e-8;

    let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
    let mut mu = eta_clamped.mapv(|e| 1.0 / (1.0 + (-e).exp()));
    mu.mapv_inplace(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = (&mu * (1.0 - &mu)).mapv(|v| v.max(MIN_WEIGHT));

    let residual = &y - &mu;
    let z = &eta_clamped + &(&residual / &weights);

    (mu, weights, z)
}

/// Binomial deviance of `mu` against a 0/1 response.
pub fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>) -> f64 {
    const EPS: f64 = 1e-8;
    let total = Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
        let mui_c = mui.clamp(EPS, 1.0 - EPS);
        let term1 = if yi > EPS {
            yi * (yi.ln() - mui_c.ln())
        } else {
            0.0
        };
        let term2 = if yi < 1.0 - EPS {
            (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui_c).ln())
        } else {
            0.0
        };
        acc + term1 + term2
    });
    2.0 * total
}

/// Fails with [`FitError::RankDeficient`] if any column of `x` is numerically a
/// linear combination of the columns before it.
///
/// Works on the Gram matrix of the unit-normalised columns so the threshold is
/// scale free.
pub fn check_full_rank(x: ArrayView2<f64>, column_names: &[String]) -> Result<(), FitError> {
    let p = x.ncols();
    let column_name = |j: usize| {
        column_names
            .get(j)
            .cloned()
            .unwrap_or_else(|| format!("column {j}"))
    };

    if x.nrows() < p {
        return Err(FitError::RankDeficient {
            column: column_name(x.nrows()),
        });
    }

    let norms = x.map_axis(Axis(0), |col| col.dot(&col).sqrt());
    if let Some(j) = norms.iter().position(|&n| n == 0.0) {
        return Err(FitError::RankDeficient {
            column: column_name(j),
        });
    }

    let normalised = &x / &norms.view().insert_axis(Axis(0));
    let gram = normalised.t().dot(&normalised);

    let factor = match gram.factorizec(UPLO::Lower) {
        Ok(factorized) => factorized.factor,
        Err(_) => {
            return Err(FitError::RankDeficient {
                column: column_name(p - 1),
            });
        }
    };
    let pivots = factor.diag().mapv(|d| d * d);
    let largest = pivots.iter().cloned().fold(0.0_f64, f64::max);
    if let Some(j) = pivots.iter().position(|&d| d < RANK_TOLERANCE * largest) {
        return Err(FitError::RankDeficient {
            column: column_name(j),
        });
    }
    Ok(())
}

fn solve_weighted_least_squares(
    x: ArrayView2<f64>,
    weights: &Array1<f64>,
    z: &Array1<f64>,
) -> Result<Array1<f64>, FitError> {
    let xw = &x * &weights.view().insert_axis(Axis(1));
    let xtwx: Array2<f64> = xw.t().dot(&x);
    let xtwz = xw.t().dot(z);
    let factorized = xtwx.factorizec(UPLO::Lower)?;
    Ok(factorized.solvec(&xtwz)?)
}

/// Fits a logistic regression of `y` on the columns of `x` (which must contain
/// its own intercept column).
pub fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    column_names: &[String],
    config: &GlmConfig,
) -> Result<LogisticFit, FitError> {
    if x.nrows() != y.len() {
        return Err(FitError::DimensionMismatch {
            rows: x.nrows(),
            response: y.len(),
        });
    }
    check_full_rank(x, column_names)?;

    let mut beta = Array1::<f64>::zeros(x.ncols());
    let mut eta = x.dot(&beta);
    let (mut mu, mut weights, mut z) = update_glm_vectors(y, &eta);
    let mut last_deviance = calculate_deviance(y, &mu);
    let mut last_change = f64::INFINITY;

    for iter in 1..=config.max_iterations {
        let beta_current = beta.clone();
        let mut beta_trial = solve_weighted_least_squares(x, &weights, &z)?;
        let mut eta_trial = x.dot(&beta_trial);
        let (mut mu_trial, _, _) = update_glm_vectors(y, &eta_trial);
        let mut deviance_trial = calculate_deviance(y, &mu_trial);

        let mut step_halving_count = 0;
        while (!deviance_trial.is_finite()
            || !beta_trial.iter().all(|b| b.is_finite())
            || deviance_trial > last_deviance * (1.0 + 1e-12))
            && step_halving_count < MAX_STEP_HALVINGS
        {
            beta_trial = &beta_current + 0.5 * (&beta_trial - &beta_current);
            eta_trial = x.dot(&beta_trial);
            mu_trial = update_glm_vectors(y, &eta_trial).0;
            deviance_trial = calculate_deviance(y, &mu_trial);
            step_halving_count += 1;
        }
        if !deviance_trial.is_finite() || deviance_trial > last_deviance * (1.0 + 1e-12) {
            log::warn!("IRLS failed to find a valid step after {step_halving_count} halvings");
            return Err(FitError::StepHalvingFailed(iter));
        }
        if step_halving_count > 0 {
            log::debug!("IRLS iteration {iter}: step halved {step_halving_count} times");
        }

        beta = beta_trial;
        eta = eta_trial;
        last_change = (deviance_trial - last_deviance).abs() / (deviance_trial.abs() + 0.1);
        last_deviance = deviance_trial;
        (mu, weights, z) = update_glm_vectors(y, &eta);

        let separated = at_probability_bound(&mu);
        if last_change < config.convergence_tolerance
            || (separated && last_change < SEPARATION_TOLERANCE)
        {
            let status = if separated {
                FitStatus::ConvergedWithSeparation
            } else {
                FitStatus::Converged
            };
            log::debug!(
                "IRLS converged after {iter} iterations, deviance {:.6}, status {:?}",
                last_deviance,
                status
            );
            return Ok(LogisticFit {
                coefficients: beta,
                deviance: last_deviance,
                fitted: mu,
                iterations: iter,
                status,
            });
        }
    }

    // Step halving never lets the deviance rise, so a fit that ran out of
    // iterations with probabilities at the bound is still moving towards the
    // separated limit.
    if at_probability_bound(&mu) {
        log::debug!(
            "IRLS stopped at the separated limit after {} iterations, deviance {:.6}",
            config.max_iterations,
            last_deviance
        );
        return Ok(LogisticFit {
            coefficients: beta,
            deviance: last_deviance,
            fitted: mu,
            iterations: config.max_iterations,
            status: FitStatus::ConvergedWithSeparation,
        });
    }

    Err(FitError::DidNotConverge {
        max_iterations: config.max_iterations,
        last_change,
    })
}

fn at_probability_bound(mu: &Array1<f64>) -> bool {
    mu.iter()
        .any(|&m| !(SEPARATION_BOUND..=1.0 - SEPARATION_BOUND).contains(&m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn names(p: usize) -> Vec<String> {
        (0..p).map(|j| format!("x{j}")).collect()
    }

    #[test]
    fn deviance_of_perfect_fit_is_zero() {
        let y = array![0.0, 1.0, 1.0, 0.0];
        let mu = array![0.0, 1.0, 1.0, 0.0];
        assert_abs_diff_eq!(calculate_deviance(y.view(), &mu), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn deviance_of_coin_flip_model() {
        let y = array![0.0, 1.0, 1.0, 0.0];
        let mu = Array1::from_elem(4, 0.5);
        let expected = 2.0 * 4.0 * std::f64::consts::LN_2;
        assert_abs_diff_eq!(calculate_deviance(y.view(), &mu), expected, epsilon = 1e-12);
    }

    #[test]
    fn intercept_only_fit_recovers_log_odds() {
        let y = array![1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        let x = Array2::ones((8, 1));
        let fit = fit_logistic(x.view(), y.view(), &names(1), &GlmConfig::default()).unwrap();
        let p: f64 = 5.0 / 8.0;
        assert_abs_diff_eq!(fit.coefficients[0], (p / (1.0 - p)).ln(), epsilon = 1e-6);
        assert_eq!(fit.status, FitStatus::Converged);
    }

    #[test]
    fn recovers_simulated_coefficients() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 4000;
        let true_beta = array![-0.5, 1.0, -0.75];
        let mut x = Array2::ones((n, 3));
        for i in 0..n {
            x[[i, 1]] = rng.gen_range(-2.0..2.0);
            x[[i, 2]] = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
        }
        let eta = x.dot(&true_beta);
        let y = eta.mapv(|e: f64| {
            let p = 1.0 / (1.0 + (-e).exp());
            if rng.gen_bool(p) { 1.0 } else { 0.0 }
        });

        let fit = fit_logistic(x.view(), y.view(), &names(3), &GlmConfig::default()).unwrap();
        for j in 0..3 {
            assert!(
                (fit.coefficients[j] - true_beta[j]).abs() < 0.2,
                "coefficient {j}: {} vs {}",
                fit.coefficients[j],
                true_beta[j]
            );
        }
    }

    #[test]
    fn duplicate_column_is_rank_deficient() {
        let x = array![
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 1.0],
            [1.0, 2.0, 2.0],
            [1.0, 1.0, 1.0],
            [1.0, 0.0, 0.0]
        ];
        let y = array![0.0, 1.0, 1.0, 0.0, 1.0];
        let result = fit_logistic(x.view(), y.view(), &names(3), &GlmConfig::default());
        assert!(matches!(result, Err(FitError::RankDeficient { ref column }) if column == "x2"));
    }

    #[test]
    fn zero_column_is_rank_deficient() {
        let x = array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0]];
        assert!(matches!(
            check_full_rank(x.view(), &names(2)),
            Err(FitError::RankDeficient { .. })
        ));
    }

    #[test]
    fn mismatched_response_is_rejected() {
        let x = Array2::ones((4, 1));
        let y = array![1.0, 0.0];
        assert!(matches!(
            fit_logistic(x.view(), y.view(), &names(1), &GlmConfig::default()),
            Err(FitError::DimensionMismatch { rows: 4, response: 2 })
        ));
    }

    #[test]
    fn separated_data_converges_with_flag() {
        let x = array![
            [1.0, -2.0],
            [1.0, -1.5],
            [1.0, -1.0],
            [1.0, 1.0],
            [1.0, 1.5],
            [1.0, 2.0]
        ];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let fit = fit_logistic(x.view(), y.view(), &names(2), &GlmConfig::default()).unwrap();
        assert_eq!(fit.status, FitStatus::ConvergedWithSeparation);
        assert!(fit.iterations <= GlmConfig::default().max_iterations);
        assert!(fit.deviance < 1e-3);
    }

    #[test]
    fn quasi_separated_interaction_fits_under_default_iterations() {
        // Every exposed carrier is a case; the rest of the data is mixed.
        let g = [0.0, 0.0, 1.0, 1.0, 2.0, 0.0, 1.0, 0.0, 1.0, 2.0, 0.0, 1.0];
        let e = [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0];
        let y = array![0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let mut x = Array2::ones((12, 4));
        for i in 0..12 {
            x[[i, 1]] = g[i];
            x[[i, 2]] = e[i];
            x[[i, 3]] = g[i] * e[i];
        }

        let fit = fit_logistic(x.view(), y.view(), &names(4), &GlmConfig::default()).unwrap();
        assert_eq!(fit.status, FitStatus::ConvergedWithSeparation);
        assert!(fit.deviance.is_finite() && fit.deviance > 0.0);
        assert!(fit.coefficients[3] > 5.0);
    }
}
