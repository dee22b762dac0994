//! Likelihood-ratio test for a single SNP × exposure interaction.
//!
//! Two nested logistic models are fitted on the same individuals:
//!
//! - reduced: `logit(p) = b0 + b1·g + b2·e`
//! - full:    `logit(p) = b0 + b1·g + b2·e + b3·g·e`
//!
//! The statistic `D_reduced - D_full` is referred to a chi-squared
//! distribution with one degree of freedom.

use crate::config::GlmConfig;
use crate::design::{DesignLayout, build_single_snp_designs};
use crate::glm::{FitError, fit_logistic};
use ndarray::ArrayView1;
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Outcome of one likelihood-ratio comparison.
#[derive(Debug, Clone, Copy)]
pub struct LrTestResult {
    pub deviance_reduced: f64,
    pub deviance_full: f64,
    /// `max(0, D_reduced - D_full)`.
    pub statistic: f64,
    pub p_value: f64,
}

/// Tests the interaction of `snp_column` with `exposure` on `outcome`.
///
/// `snp` only names the columns in error messages. Any fit failure of either
/// model is returned unchanged.
pub fn lr_test(
    outcome: ArrayView1<f64>,
    snp_column: ArrayView1<f64>,
    exposure: ArrayView1<f64>,
    snp: usize,
    config: &GlmConfig,
) -> Result<LrTestResult, FitError> {
    let (reduced_x, full_x) = build_single_snp_designs(snp_column, exposure);

    let reduced = fit_logistic(
        reduced_x.view(),
        outcome,
        &DesignLayout::single_snp(snp, false).names(),
        config,
    )?;
    let full = fit_logistic(
        full_x.view(),
        outcome,
        &DesignLayout::single_snp(snp, true).names(),
        config,
    )?;

    // The full model nests the reduced one; a negative difference is round-off.
    let statistic = (reduced.deviance - full.deviance).max(0.0);
    let p_value = chi_squared_survival(statistic, 1.0);

    log::debug!(
        "LR test snp{snp}: D_reduced={:.4}, D_full={:.4}, stat={:.4}, p={:.4e}",
        reduced.deviance,
        full.deviance,
        statistic,
        p_value
    );

    Ok(LrTestResult {
        deviance_reduced: reduced.deviance,
        deviance_full: full.deviance,
        statistic,
        p_value,
    })
}

/// Upper-tail probability `P(X >= statistic)` for `X ~ χ²(df)`.
fn chi_squared_survival(statistic: f64, df: f64) -> f64 {
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(statistic).clamp(0.0, 1.0),
        Err(_) => f64::NAN,
    }
}
