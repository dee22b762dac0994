//! # Study Configuration
//!
//! Every numeric knob of a simulation run lives in [`StudyConfig`]. The
//! configuration is validated once, before a cohort is drawn, so that a bad
//! probability or an impossible fold count never costs a partially completed
//! run. Configurations round-trip through TOML so a run can be reproduced
//! from the file that produced it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Guard applied before flooring `prevalence * count`, so products such as
/// `0.29 * 100 = 28.999999999999996` are counted as 29.
const FLOOR_GUARD: f64 = 1e-9;

/// What happens to a realization when one of its regression fits fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FitFailurePolicy {
    /// Propagate the first fit failure and abort the whole run.
    #[default]
    Abort,
    /// Drop the failing unit from both scenarios and count it in the results.
    SkipAndCount,
}

/// Rule used to pick the penalty from the cross-validation curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LambdaSelection {
    /// The penalty with the smallest mean held-out deviance.
    Min,
    /// The largest penalty whose mean deviance is within one standard error of
    /// the minimum. Keeps null interaction coefficients at zero far more often
    /// than `Min`.
    #[default]
    OneSe,
}

/// Settings for the unpenalized logistic fits used by the likelihood-ratio test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlmConfig {
    pub max_iterations: usize,
    /// Relative deviance change `|dev - dev_old| / (|dev| + 0.1)` that ends IRLS.
    pub convergence_tolerance: f64,
}

impl Default for GlmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            convergence_tolerance: 1e-8,
        }
    }
}

/// Settings for the cross-validated L1-penalized logistic regression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LassoConfig {
    pub n_lambda: usize,
    /// Smallest penalty as a fraction of `lambda_max`. When absent, 1e-4 is used
    /// if there are more individuals than predictors and 1e-2 otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda_min_ratio: Option<f64>,
    pub n_folds: usize,
    #[serde(default)]
    pub selection: LambdaSelection,
    /// Maximum quadratic-approximation (outer) iterations per penalty.
    pub max_iterations: usize,
    /// Maximum coordinate-descent sweeps per outer iteration.
    pub max_sweeps: usize,
    pub convergence_tolerance: f64,
}

impl Default for LassoConfig {
    fn default() -> Self {
        Self {
            n_lambda: 100,
            lambda_min_ratio: None,
            n_folds: 10,
            selection: LambdaSelection::OneSe,
            max_iterations: 100,
            max_sweeps: 10_000,
            convergence_tolerance: 1e-7,
        }
    }
}

/// The complete description of one simulation study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    /// Individuals per cohort (`n`).
    pub n_individuals: usize,
    /// SNPs per cohort (`m`).
    pub n_snps: usize,
    /// Independent outcome realizations sharing the cohort (`N`).
    pub n_realizations: usize,
    /// Probability that an individual is exposed (`prev`).
    pub exposure_prevalence: f64,
    /// Fraction of SNPs carrying a marginal effect (`prev_s`).
    pub snp_prevalence: f64,
    /// Fraction of active SNPs that also interact with the exposure (`prev_i`).
    pub interaction_prevalence: f64,
    /// Significance threshold for the likelihood-ratio p-values.
    pub alpha: f64,
    pub seed: u64,
    #[serde(default)]
    pub fit_failure_policy: FitFailurePolicy,
    #[serde(default)]
    pub glm: GlmConfig,
    #[serde(default)]
    pub lasso: LassoConfig,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            n_individuals: 1000,
            n_snps: 10,
            n_realizations: 100,
            exposure_prevalence: 0.5,
            snp_prevalence: 0.6,
            interaction_prevalence: 0.5,
            alpha: 0.05,
            seed: 42,
            fit_failure_policy: FitFailurePolicy::Abort,
            glm: GlmConfig::default(),
            lasso: LassoConfig::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("'{name}' must be a positive integer, got 0.")]
    ZeroCount { name: &'static str },
    #[error("'{name}' must lie in [0, 1], got {value}.")]
    ProbabilityOutOfRange { name: &'static str, value: f64 },
    #[error("The significance threshold alpha must lie strictly between 0 and 1, got {0}.")]
    AlphaOutOfRange(f64),
    #[error("Cross-validation needs at least 3 folds, got {0}.")]
    TooFewFolds(usize),
    #[error("Cannot split {n_individuals} individuals into {n_folds} cross-validation folds.")]
    MoreFoldsThanIndividuals { n_folds: usize, n_individuals: usize },
    #[error("'{name}' must be a finite positive number, got {value}.")]
    InvalidTolerance { name: &'static str, value: f64 },
    #[error("The lambda_min_ratio must lie in (0, 1), got {0}.")]
    LambdaRatioOutOfRange(f64),
    #[error("{interacting} interacting SNPs were requested but only {active} SNPs are active.")]
    InteractingExceedsActive { interacting: usize, active: usize },
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// `floor(fraction * count)` with a small guard against representation error.
pub fn prevalence_count(fraction: f64, count: usize) -> usize {
    (fraction * count as f64 + FLOOR_GUARD).floor() as usize
}

impl StudyConfig {
    /// Number of SNPs with a nonzero marginal effect (`m_b`).
    pub fn active_snp_count(&self) -> usize {
        prevalence_count(self.snp_prevalence, self.n_snps)
    }

    /// Number of active SNPs that also carry an interaction effect (`n_i`).
    pub fn interacting_snp_count(&self) -> usize {
        prevalence_count(self.interaction_prevalence, self.active_snp_count())
    }

    /// Checks every field. Called before any sampling takes place.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("n_individuals", self.n_individuals),
            ("n_snps", self.n_snps),
            ("n_realizations", self.n_realizations),
            ("glm.max_iterations", self.glm.max_iterations),
            ("lasso.n_lambda", self.lasso.n_lambda),
            ("lasso.max_iterations", self.lasso.max_iterations),
            ("lasso.max_sweeps", self.lasso.max_sweeps),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCount { name });
            }
        }

        for (name, value) in [
            ("exposure_prevalence", self.exposure_prevalence),
            ("snp_prevalence", self.snp_prevalence),
            ("interaction_prevalence", self.interaction_prevalence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { name, value });
            }
        }

        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(ConfigError::AlphaOutOfRange(self.alpha));
        }

        if self.lasso.n_folds < 3 {
            return Err(ConfigError::TooFewFolds(self.lasso.n_folds));
        }
        if self.lasso.n_folds > self.n_individuals {
            return Err(ConfigError::MoreFoldsThanIndividuals {
                n_folds: self.lasso.n_folds,
                n_individuals: self.n_individuals,
            });
        }

        for (name, value) in [
            ("glm.convergence_tolerance", self.glm.convergence_tolerance),
            ("lasso.convergence_tolerance", self.lasso.convergence_tolerance),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidTolerance { name, value });
            }
        }

        if let Some(ratio) = self.lasso.lambda_min_ratio {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(ConfigError::LambdaRatioOutOfRange(ratio));
            }
        }

        let active = self.active_snp_count();
        let interacting = self.interacting_snp_count();
        if interacting > active {
            return Err(ConfigError::InteractingExceedsActive {
                interacting,
                active,
            });
        }

        Ok(())
    }

    /// Saves the configuration as pretty-printed TOML.
    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Loads a configuration from TOML and validates it.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: StudyConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }
}
