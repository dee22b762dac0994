//! # Trial Runner
//!
//! Draws one cohort, then for each of `N` realizations:
//!
//! - runs the likelihood-ratio test on every active SNP, in the order the
//!   active SNPs were sampled, for both the interaction and the
//!   interaction-free outcomes, appending one truth bit per tested SNP;
//! - runs the cross-validated lasso once per scenario over all `m` SNPs,
//!   appending `m` coefficients per scenario and `m` truth bits.
//!
//! The two signal families have different denominators and are never merged.
//! Within a family, `with_interaction[k]`, `no_interaction[k]` and `truth[k]`
//! always describe the same SNP of the same realization.

use crate::cohort::{
    Cohort, GenerationError, Realization, ScenarioKind, generate_cohort, generate_realization,
};
use crate::config::{ConfigError, FitFailurePolicy, StudyConfig};
use crate::glm::FitError;
use crate::lasso::{LassoError, lasso_test};
use crate::lrt::lr_test;
use crate::progress::{TrialProgressObserver, TrialStage};
use crate::score::ScoreError;
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Data generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error(
        "Likelihood-ratio fit failed for SNP {snp} in realization {realization} ({scenario} scenario): {source}"
    )]
    LrFit {
        realization: usize,
        snp: usize,
        scenario: &'static str,
        #[source]
        source: FitError,
    },
    #[error("Lasso fit failed in realization {realization} ({scenario} scenario): {source}")]
    LassoFit {
        realization: usize,
        scenario: &'static str,
        #[source]
        source: LassoError,
    },
    #[error("Scoring failed: {0}")]
    Score(#[from] ScoreError),
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write TSV report: {0}")]
    Csv(#[from] csv::Error),
}

/// Decision signals of one method for both scenarios, aligned with truth.
#[derive(Debug, Clone, Default)]
pub struct SignalFamily {
    pub with_interaction: Vec<f64>,
    pub no_interaction: Vec<f64>,
    /// `true` iff the SNP interacts with the exposure in its realization.
    pub truth: Vec<bool>,
}

impl SignalFamily {
    pub fn signals(&self, scenario: ScenarioKind) -> &[f64] {
        match scenario {
            ScenarioKind::WithInteraction => &self.with_interaction,
            ScenarioKind::NoInteraction => &self.no_interaction,
        }
    }

    pub fn len(&self) -> usize {
        self.truth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.truth.is_empty()
    }

    fn push(&mut self, with_interaction: f64, no_interaction: f64, truth: bool) {
        self.with_interaction.push(with_interaction);
        self.no_interaction.push(no_interaction);
        self.truth.push(truth);
    }
}

/// Units dropped under [`FitFailurePolicy::SkipAndCount`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCounts {
    /// Single-SNP likelihood-ratio tests (both scenarios dropped together).
    pub lr_tests: usize,
    /// Whole-realization lasso fits (both scenarios dropped together).
    pub lasso_fits: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.lr_tests + self.lasso_fits
    }
}

/// Raw decision signals of a run.
#[derive(Debug, Clone, Default)]
pub struct TrialResults {
    /// p-values over the active SNPs of each realization.
    pub lr: SignalFamily,
    /// Interaction coefficients over all SNPs of each realization.
    pub lasso: SignalFamily,
    pub skipped: SkipCounts,
    pub n_realizations: usize,
}

/// Runs the likelihood-ratio tests of one realization and appends them to `family`.
pub fn run_lr_tests(
    cohort: &Cohort,
    realization: &Realization,
    index: usize,
    config: &StudyConfig,
    family: &mut SignalFamily,
    skipped: &mut SkipCounts,
) -> Result<(), SimulationError> {
    for &snp in &realization.active_snps {
        let column = cohort.snp_column(snp);
        let mut p_values = [f64::NAN; 2];
        let mut failure = None;
        for (slot, scenario) in ScenarioKind::ALL.into_iter().enumerate() {
            let outcome = realization.scenario(scenario).outcomes.view();
            match lr_test(outcome, column, cohort.exposure(), snp, &config.glm) {
                Ok(result) => p_values[slot] = result.p_value,
                Err(source) => {
                    failure = Some(SimulationError::LrFit {
                        realization: index,
                        snp,
                        scenario: scenario.label(),
                        source,
                    });
                    break;
                }
            }
        }

        match (failure, config.fit_failure_policy) {
            (None, _) => family.push(p_values[0], p_values[1], realization.is_interacting(snp)),
            (Some(err), FitFailurePolicy::Abort) => return Err(err),
            (Some(err), FitFailurePolicy::SkipAndCount) => {
                log::warn!("Skipping LR test: {err}");
                skipped.lr_tests += 1;
            }
        }
    }
    Ok(())
}

/// Runs the lasso for both scenarios of one realization and appends the `m`
/// interaction coefficients of each to `family`.
pub fn run_lasso_tests<R: Rng + ?Sized>(
    rng: &mut R,
    cohort: &Cohort,
    realization: &Realization,
    index: usize,
    config: &StudyConfig,
    family: &mut SignalFamily,
    skipped: &mut SkipCounts,
) -> Result<(), SimulationError> {
    let mut fits = Vec::with_capacity(2);
    for scenario in ScenarioKind::ALL {
        let outcome = realization.scenario(scenario).outcomes.view();
        match lasso_test(rng, outcome, cohort.genotypes(), cohort.exposure(), &config.lasso) {
            Ok(result) => fits.push(result.interaction_coefficients),
            Err(source) => {
                let err = SimulationError::LassoFit {
                    realization: index,
                    scenario: scenario.label(),
                    source,
                };
                return match config.fit_failure_policy {
                    FitFailurePolicy::Abort => Err(err),
                    FitFailurePolicy::SkipAndCount => {
                        log::warn!("Skipping lasso fit: {err}");
                        skipped.lasso_fits += 1;
                        Ok(())
                    }
                };
            }
        }
    }

    let truth = realization.interaction_truth();
    for (snp, &is_interacting) in truth.iter().enumerate() {
        family.push(fits[0][snp], fits[1][snp], is_interacting);
    }
    Ok(())
}

/// Generates a cohort and `N` realizations and collects both methods' signals.
pub fn run_trials<R: Rng + ?Sized>(
    config: &StudyConfig,
    rng: &mut R,
    observer: &mut dyn TrialProgressObserver,
) -> Result<TrialResults, SimulationError> {
    config.validate()?;

    observer.on_stage_start(TrialStage::Cohort, 1);
    let cohort = generate_cohort(
        rng,
        config.n_individuals,
        config.n_snps,
        config.exposure_prevalence,
    )?;
    observer.on_stage_finish(TrialStage::Cohort);

    let n_active = config.active_snp_count();
    let n_interacting = config.interacting_snp_count();
    log::info!(
        "Cohort ready: {} individuals, {} SNPs; {} active and {} interacting SNPs per realization",
        cohort.n_individuals(),
        cohort.n_snps(),
        n_active,
        n_interacting
    );
    if n_active == 0 {
        log::warn!("No SNP has a marginal effect; the likelihood-ratio path will test nothing");
    }
    if n_interacting == 0 {
        log::warn!("No SNP interacts with the exposure; every truth label will be negative");
    }

    let mut results = TrialResults::default();
    observer.on_stage_start(TrialStage::Realizations, config.n_realizations);
    for index in 0..config.n_realizations {
        let realization = generate_realization(rng, &cohort, n_active, n_interacting)?;
        log::debug!(
            "Realization {index}: active {:?}, interacting {:?}",
            realization.active_snps,
            realization.interacting_snps
        );

        run_lr_tests(
            &cohort,
            &realization,
            index,
            config,
            &mut results.lr,
            &mut results.skipped,
        )?;
        run_lasso_tests(
            rng,
            &cohort,
            &realization,
            index,
            config,
            &mut results.lasso,
            &mut results.skipped,
        )?;

        results.n_realizations += 1;
        observer.on_stage_advance(TrialStage::Realizations, index + 1);
    }
    observer.on_stage_finish(TrialStage::Realizations);

    if results.skipped.total() > 0 {
        log::warn!(
            "{} LR tests and {} lasso fits were skipped after fit failures",
            results.skipped.lr_tests,
            results.skipped.lasso_fits
        );
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LassoConfig;
    use crate::progress::NoopTrialProgress;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn quick_config() -> StudyConfig {
        StudyConfig {
            n_individuals: 400,
            n_snps: 4,
            n_realizations: 2,
            snp_prevalence: 0.5,
            interaction_prevalence: 0.5,
            lasso: LassoConfig {
                n_lambda: 20,
                n_folds: 4,
                ..LassoConfig::default()
            },
            ..StudyConfig::default()
        }
    }

    #[test]
    fn families_have_expected_lengths() {
        let config = quick_config();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let results = run_trials(&config, &mut rng, &mut NoopTrialProgress).unwrap();

        assert_eq!(results.n_realizations, 2);
        assert_eq!(results.skipped, SkipCounts::default());
        let lr_expected = 2 * config.active_snp_count();
        assert_eq!(results.lr.len(), lr_expected);
        assert_eq!(results.lr.with_interaction.len(), results.lr.len());
        assert_eq!(results.lr.no_interaction.len(), results.lr.len());

        let lasso_expected = 2 * config.n_snps;
        assert_eq!(results.lasso.len(), lasso_expected);
        assert_eq!(results.lasso.with_interaction.len(), lasso_expected);
        assert_eq!(results.lasso.no_interaction.len(), lasso_expected);
        assert!(
            results
                .lr
                .with_interaction
                .iter()
                .all(|p| (0.0..=1.0).contains(p))
        );
    }

    #[test]
    fn lr_truth_follows_sampled_order() {
        let config = quick_config();
        let mut rng = StdRng::seed_from_u64(3);
        let cohort = generate_cohort(&mut rng, 400, 6, 0.5).unwrap();
        let realization = generate_realization(&mut rng, &cohort, 4, 2).unwrap();

        let mut family = SignalFamily::default();
        let mut skipped = SkipCounts::default();
        run_lr_tests(&cohort, &realization, 0, &config, &mut family, &mut skipped).unwrap();

        assert_eq!(skipped, SkipCounts::default());
        assert_eq!(family.len(), 4);
        let expected: Vec<bool> = realization
            .active_snps
            .iter()
            .map(|&snp| realization.interacting_snps.contains(&snp))
            .collect();
        assert_eq!(family.truth, expected);
    }

    #[test]
    fn lasso_truth_is_in_column_order() {
        let config = quick_config();
        let mut rng = StdRng::seed_from_u64(4);
        let cohort = generate_cohort(&mut rng, 300, 5, 0.5).unwrap();
        let realization = generate_realization(&mut rng, &cohort, 3, 1).unwrap();

        let mut family = SignalFamily::default();
        let mut skipped = SkipCounts::default();
        run_lasso_tests(
            &mut rng,
            &cohort,
            &realization,
            0,
            &config,
            &mut family,
            &mut skipped,
        )
        .unwrap();

        assert_eq!(skipped, SkipCounts::default());
        assert_eq!(family.len(), 5);
        assert_eq!(family.truth, realization.interaction_truth());
        assert_eq!(family.truth.iter().filter(|&&t| t).count(), 1);
    }

    #[test]
    fn zero_interaction_prevalence_yields_all_negative_truth() {
        let config = StudyConfig {
            interaction_prevalence: 0.0,
            ..quick_config()
        };
        let mut rng = StdRng::seed_from_u64(config.seed);
        let results = run_trials(&config, &mut rng, &mut NoopTrialProgress).unwrap();
        assert!(results.lr.truth.iter().all(|&t| !t));
        assert!(results.lasso.truth.iter().all(|&t| !t));
        // Without interactions both scenarios see identical outcomes.
        assert_eq!(results.lr.with_interaction, results.lr.no_interaction);
    }

    #[test]
    fn invalid_configuration_fails_before_sampling() {
        let config = StudyConfig {
            alpha: 0.0,
            ..quick_config()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let err = run_trials(&config, &mut rng, &mut NoopTrialProgress).unwrap_err();
        assert!(matches!(err, SimulationError::Config(ConfigError::AlphaOutOfRange(_))));
    }

    #[test]
    fn abort_policy_surfaces_rank_deficient_fits() {
        // A monomorphic SNP makes every LR fit rank deficient.
        let genotypes = ndarray::Array2::<f64>::zeros((60, 2));
        let mafs = ndarray::Array1::from_elem(2, 0.1);
        let exposure: ndarray::Array1<f64> = (0..60).map(|i| (i % 2) as f64).collect();
        let cohort = Cohort::from_parts(genotypes, mafs, exposure);
        let mut rng = StdRng::seed_from_u64(8);
        let realization = generate_realization(&mut rng, &cohort, 1, 0).unwrap();

        let abort = quick_config();
        assert_eq!(abort.fit_failure_policy, FitFailurePolicy::Abort);
        let mut family = SignalFamily::default();
        let mut skipped = SkipCounts::default();
        let err = run_lr_tests(&cohort, &realization, 5, &abort, &mut family, &mut skipped)
            .unwrap_err();
        assert!(matches!(
            err,
            SimulationError::LrFit {
                realization: 5,
                source: FitError::RankDeficient { .. },
                ..
            }
        ));

        let skip = StudyConfig {
            fit_failure_policy: FitFailurePolicy::SkipAndCount,
            ..quick_config()
        };
        run_lr_tests(&cohort, &realization, 5, &skip, &mut family, &mut skipped).unwrap();
        assert!(family.is_empty());
        assert_eq!(skipped.lr_tests, 1);
    }
}
