//! # Generative Model
//!
//! A run draws one [`Cohort`] (genotype dosages, minor-allele frequencies and a
//! binary exposure) and then `N` independent [`Realization`]s on top of it. Each
//! realization fixes a set of true coefficients and draws case/control outcomes
//! from the logistic model
//!
//! ```text
//! eta = b0 + X·b_snp + b_env·E + (E ⊙ X)·b_int
//! ```
//!
//! Sampling is two-staged: the active SNPs are drawn from all `m` SNPs, then the
//! interacting SNPs are drawn from the active set only. The interaction-free
//! counterfactual is not sampled separately; it reuses the same coefficients
//! and the same latent uniforms with `b_int` masked to zero.
//!
//! SNP indices are zero-based throughout the crate.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rand::Rng;
use rand::seq::index;
use rand_distr::{Bernoulli, Binomial, Distribution, StandardNormal};
use thiserror::Error;

/// Lower bound of the minor-allele-frequency range.
pub const MAF_MIN: f64 = 0.07;
/// Upper bound of the minor-allele-frequency range.
pub const MAF_MAX: f64 = 0.45;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Exposure prevalence must lie in [0, 1], got {0}.")]
    InvalidExposurePrevalence(f64),
    #[error("Invalid binomial parameter for SNP {snp}: {reason}")]
    InvalidAlleleFrequency { snp: usize, reason: String },
    #[error("Cannot draw {requested} active SNPs from a cohort of {available}.")]
    TooManyActiveSnps { requested: usize, available: usize },
    #[error("Cannot draw {requested} interacting SNPs from {available} active SNPs.")]
    TooManyInteractingSnps { requested: usize, available: usize },
}

/// The logistic link, `1 / (1 + exp(-eta))`.
#[inline]
pub fn logistic(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

/// The inverse of [`logistic`], `ln(p / (1 - p))`.
#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Genotypes and exposure shared by every realization of a run.
///
/// A cohort is immutable once generated. Its fields are only reachable through
/// shared views.
#[derive(Debug, Clone)]
pub struct Cohort {
    genotypes: Array2<f64>,
    minor_allele_freqs: Array1<f64>,
    exposure: Array1<f64>,
    exposure_interactions: Array2<f64>,
}

impl Cohort {
    /// Builds a cohort from precomputed parts. The `exposure ⊙ genotypes`
    /// product is computed here once.
    ///
    /// # Panics
    /// If the row counts of `genotypes` and `exposure` differ, or the number of
    /// genotype columns differs from the number of allele frequencies.
    pub fn from_parts(
        genotypes: Array2<f64>,
        minor_allele_freqs: Array1<f64>,
        exposure: Array1<f64>,
    ) -> Self {
        assert_eq!(
            genotypes.nrows(),
            exposure.len(),
            "Genotype rows must match exposure length"
        );
        assert_eq!(
            genotypes.ncols(),
            minor_allele_freqs.len(),
            "Genotype columns must match allele-frequency count"
        );
        let mut exposure_interactions = genotypes.clone();
        Zip::from(exposure_interactions.rows_mut())
            .and(&exposure)
            .for_each(|mut row, &e| row *= e);
        Self {
            genotypes,
            minor_allele_freqs,
            exposure,
            exposure_interactions,
        }
    }

    pub fn n_individuals(&self) -> usize {
        self.genotypes.nrows()
    }

    pub fn n_snps(&self) -> usize {
        self.genotypes.ncols()
    }

    /// Dosage matrix, shape `[n_individuals, n_snps]`, values in {0, 1, 2}.
    pub fn genotypes(&self) -> ArrayView2<'_, f64> {
        self.genotypes.view()
    }

    pub fn minor_allele_freqs(&self) -> ArrayView1<'_, f64> {
        self.minor_allele_freqs.view()
    }

    /// Binary exposure indicator per individual.
    pub fn exposure(&self) -> ArrayView1<'_, f64> {
        self.exposure.view()
    }

    /// `exposure ⊙ genotypes`, the per-individual interaction columns.
    pub fn exposure_interactions(&self) -> ArrayView2<'_, f64> {
        self.exposure_interactions.view()
    }

    pub fn snp_column(&self, snp: usize) -> ArrayView1<'_, f64> {
        self.genotypes.column(snp)
    }
}

/// Draws a cohort: `m` allele frequencies uniformly from [0.07, 0.45], `n`
/// Binomial(2, maf) dosages per SNP, and `n` Bernoulli exposure indicators.
pub fn generate_cohort<R: Rng + ?Sized>(
    rng: &mut R,
    n_individuals: usize,
    n_snps: usize,
    exposure_prevalence: f64,
) -> Result<Cohort, GenerationError> {
    let exposure_law = Bernoulli::new(exposure_prevalence)
        .map_err(|_| GenerationError::InvalidExposurePrevalence(exposure_prevalence))?;

    let minor_allele_freqs: Array1<f64> =
        (0..n_snps).map(|_| rng.gen_range(MAF_MIN..=MAF_MAX)).collect();

    let mut genotypes = Array2::<f64>::zeros((n_individuals, n_snps));
    for (snp, mut column) in genotypes.axis_iter_mut(Axis(1)).enumerate() {
        let dosage_law = Binomial::new(2, minor_allele_freqs[snp]).map_err(|e| {
            GenerationError::InvalidAlleleFrequency {
                snp,
                reason: e.to_string(),
            }
        })?;
        for value in column.iter_mut() {
            *value = dosage_law.sample(rng) as f64;
        }
    }

    let exposure: Array1<f64> = (0..n_individuals)
        .map(|_| if exposure_law.sample(rng) { 1.0 } else { 0.0 })
        .collect();

    log::debug!(
        "Generated cohort: {} individuals, {} SNPs, {} exposed",
        n_individuals,
        n_snps,
        exposure.sum()
    );

    Ok(Cohort::from_parts(genotypes, minor_allele_freqs, exposure))
}

/// The true coefficients of one realization.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    pub intercept: f64,
    /// Marginal SNP effects, length `m`. Nonzero only on the active SNPs.
    pub snp: Array1<f64>,
    pub environment: f64,
    /// SNP × exposure effects, length `m`. Nonzero only on the interacting SNPs.
    pub interaction: Array1<f64>,
}

impl Coefficients {
    /// The same coefficients with the interaction term masked to zero.
    pub fn without_interaction(&self) -> Self {
        Self {
            intercept: self.intercept,
            snp: self.snp.clone(),
            environment: self.environment,
            interaction: Array1::zeros(self.interaction.len()),
        }
    }

    /// `b0 + X·b_snp + b_env·E + (E ⊙ X)·b_int` for every individual.
    pub fn linear_predictor(&self, cohort: &Cohort) -> Array1<f64> {
        let mut eta = cohort.genotypes().dot(&self.snp);
        eta += self.intercept;
        eta.scaled_add(self.environment, &cohort.exposure());
        if self.interaction.iter().any(|&b| b != 0.0) {
            eta += &cohort.exposure_interactions().dot(&self.interaction);
        }
        eta
    }
}

/// Which outcome vector of a realization is being analysed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    /// Outcomes drawn from the full model, interaction term included.
    WithInteraction,
    /// Counterfactual outcomes with the interaction term removed.
    NoInteraction,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 2] = [ScenarioKind::WithInteraction, ScenarioKind::NoInteraction];

    pub fn label(self) -> &'static str {
        match self {
            ScenarioKind::WithInteraction => "interaction",
            ScenarioKind::NoInteraction => "no_interaction",
        }
    }
}

/// Linear predictor, success probabilities and binary outcomes of one scenario.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub linear_predictor: Array1<f64>,
    pub probabilities: Array1<f64>,
    pub outcomes: Array1<f64>,
}

impl Scenario {
    /// Derives a scenario deterministically from coefficients and the latent
    /// uniforms: individual `i` is a case iff `u_i < p_i`, which is a
    /// Bernoulli(`p_i`) draw when `u_i ~ U(0, 1)`.
    pub fn from_coefficients(
        cohort: &Cohort,
        coefficients: &Coefficients,
        latent_uniforms: ArrayView1<f64>,
    ) -> Self {
        let linear_predictor = coefficients.linear_predictor(cohort);
        let probabilities = linear_predictor.mapv(logistic);
        let outcomes = Zip::from(&probabilities)
            .and(latent_uniforms)
            .map_collect(|&p, &u| if u < p { 1.0 } else { 0.0 });
        Self {
            linear_predictor,
            probabilities,
            outcomes,
        }
    }
}

/// One of the `N` independent outcome draws sharing a cohort.
#[derive(Debug, Clone)]
pub struct Realization {
    pub coefficients: Coefficients,
    /// SNPs with a nonzero marginal effect, in the order they were sampled.
    pub active_snps: Vec<usize>,
    /// Subset of `active_snps` with a nonzero interaction effect, in sampling order.
    pub interacting_snps: Vec<usize>,
    pub latent_uniforms: Array1<f64>,
    pub with_interaction: Scenario,
    pub no_interaction: Scenario,
}

impl Realization {
    pub fn scenario(&self, kind: ScenarioKind) -> &Scenario {
        match kind {
            ScenarioKind::WithInteraction => &self.with_interaction,
            ScenarioKind::NoInteraction => &self.no_interaction,
        }
    }

    pub fn is_interacting(&self, snp: usize) -> bool {
        self.coefficients.interaction[snp] != 0.0
    }

    /// Ground-truth interaction label for every SNP, in column order.
    pub fn interaction_truth(&self) -> Vec<bool> {
        self.coefficients
            .interaction
            .iter()
            .map(|&b| b != 0.0)
            .collect()
    }

    /// Recomputes the interaction-free scenario from the stored coefficients and
    /// latent draws. The result never depends on `coefficients.interaction`.
    pub fn counterfactual(&self, cohort: &Cohort) -> Scenario {
        Scenario::from_coefficients(
            cohort,
            &self.coefficients.without_interaction(),
            self.latent_uniforms.view(),
        )
    }
}

/// Draws a nonzero standard-normal coefficient. A zero draw has probability
/// zero but would break the `coefficient != 0 <=> selected` labelling.
fn nonzero_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    loop {
        let value: f64 = rng.sample(StandardNormal);
        if value != 0.0 {
            return value;
        }
    }
}

/// Draws one realization on `cohort` with `n_active` SNPs carrying marginal
/// effects and `n_interacting` of those also interacting with the exposure.
///
/// `n_interacting == 0` yields an empty interacting set, which is how the
/// interaction-free baseline is obtained.
pub fn generate_realization<R: Rng + ?Sized>(
    rng: &mut R,
    cohort: &Cohort,
    n_active: usize,
    n_interacting: usize,
) -> Result<Realization, GenerationError> {
    let m = cohort.n_snps();
    if n_active > m {
        return Err(GenerationError::TooManyActiveSnps {
            requested: n_active,
            available: m,
        });
    }
    if n_interacting > n_active {
        return Err(GenerationError::TooManyInteractingSnps {
            requested: n_interacting,
            available: n_active,
        });
    }

    let active_snps = index::sample(rng, m, n_active).into_vec();
    let mut snp = Array1::zeros(m);
    for &j in &active_snps {
        snp[j] = nonzero_normal(rng);
    }

    let intercept: f64 = rng.sample(StandardNormal);
    let environment: f64 = rng.sample(StandardNormal);

    // Second stage: positions into `active_snps`, never into all m SNPs.
    let interacting_snps: Vec<usize> = index::sample(rng, n_active, n_interacting)
        .into_iter()
        .map(|position| active_snps[position])
        .collect();
    let mut interaction = Array1::zeros(m);
    for &j in &interacting_snps {
        interaction[j] = nonzero_normal(rng);
    }

    let coefficients = Coefficients {
        intercept,
        snp,
        environment,
        interaction,
    };

    let latent_uniforms: Array1<f64> = (0..cohort.n_individuals())
        .map(|_| rng.gen_range(0.0..1.0))
        .collect();

    let with_interaction =
        Scenario::from_coefficients(cohort, &coefficients, latent_uniforms.view());
    let no_interaction = Scenario::from_coefficients(
        cohort,
        &coefficients.without_interaction(),
        latent_uniforms.view(),
    );

    Ok(Realization {
        coefficients,
        active_snps,
        interacting_snps,
        latent_uniforms,
        with_interaction,
        no_interaction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn cohort(seed: u64, n: usize, m: usize) -> (StdRng, Cohort) {
        let mut rng = StdRng::seed_from_u64(seed);
        let cohort = generate_cohort(&mut rng, n, m, 0.5).unwrap();
        (rng, cohort)
    }

    #[test]
    fn cohort_has_valid_dosages_and_frequencies() {
        let (_, cohort) = cohort(1, 200, 8);
        assert_eq!(cohort.genotypes().dim(), (200, 8));
        assert!(cohort.genotypes().iter().all(|&g| g == 0.0 || g == 1.0 || g == 2.0));
        assert!(
            cohort
                .minor_allele_freqs()
                .iter()
                .all(|&f| (MAF_MIN..=MAF_MAX).contains(&f))
        );
        assert!(cohort.exposure().iter().all(|&e| e == 0.0 || e == 1.0));
    }

    #[test]
    fn exposure_interactions_mask_unexposed_rows() {
        let (_, cohort) = cohort(2, 100, 4);
        for i in 0..cohort.n_individuals() {
            for j in 0..cohort.n_snps() {
                let expected = cohort.genotypes()[[i, j]] * cohort.exposure()[i];
                assert_eq!(cohort.exposure_interactions()[[i, j]], expected);
            }
        }
    }

    #[test]
    fn rejects_invalid_exposure_prevalence() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            generate_cohort(&mut rng, 10, 2, 1.5),
            Err(GenerationError::InvalidExposurePrevalence(_))
        ));
    }

    #[test]
    fn interacting_snps_are_a_subset_of_active_snps() {
        let (mut rng, cohort) = cohort(3, 100, 20);
        for _ in 0..50 {
            let realization = generate_realization(&mut rng, &cohort, 12, 6).unwrap();
            let active: HashSet<usize> = realization.active_snps.iter().copied().collect();
            assert_eq!(active.len(), 12);
            assert_eq!(realization.interacting_snps.len(), 6);
            assert!(realization.interacting_snps.iter().all(|j| active.contains(j)));

            for j in 0..cohort.n_snps() {
                let b_snp = realization.coefficients.snp[j];
                let b_int = realization.coefficients.interaction[j];
                assert_eq!(b_snp != 0.0, active.contains(&j));
                if b_int != 0.0 {
                    assert!(active.contains(&j));
                }
                assert_eq!(b_int != 0.0, realization.interacting_snps.contains(&j));
            }
        }
    }

    #[test]
    fn zero_interacting_snps_gives_identical_scenarios() {
        let (mut rng, cohort) = cohort(4, 150, 6);
        let realization = generate_realization(&mut rng, &cohort, 6, 0).unwrap();
        assert!(realization.interacting_snps.is_empty());
        assert!(realization.interaction_truth().iter().all(|&t| !t));
        assert_eq!(
            realization.with_interaction.outcomes,
            realization.no_interaction.outcomes
        );
    }

    #[test]
    fn all_snps_active_is_allowed() {
        let (mut rng, cohort) = cohort(5, 50, 5);
        let realization = generate_realization(&mut rng, &cohort, 5, 5).unwrap();
        let mut active = realization.active_snps.clone();
        active.sort_unstable();
        assert_eq!(active, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn rejects_impossible_counts() {
        let (mut rng, cohort) = cohort(6, 20, 3);
        assert!(matches!(
            generate_realization(&mut rng, &cohort, 4, 0),
            Err(GenerationError::TooManyActiveSnps { .. })
        ));
        assert!(matches!(
            generate_realization(&mut rng, &cohort, 2, 3),
            Err(GenerationError::TooManyInteractingSnps { .. })
        ));
    }

    #[test]
    fn no_interaction_scenario_ignores_interaction_coefficients() {
        let (mut rng, cohort) = cohort(7, 120, 6);
        let realization = generate_realization(&mut rng, &cohort, 4, 2).unwrap();

        let mut altered = realization.clone();
        altered.coefficients.interaction.mapv_inplace(|b| b * 10.0 + 3.0);
        let recomputed = altered.counterfactual(&cohort);

        assert_eq!(recomputed.probabilities, realization.no_interaction.probabilities);
        assert_eq!(recomputed.outcomes, realization.no_interaction.outcomes);
    }

    #[test]
    fn probabilities_invert_to_linear_predictor() {
        let (mut rng, cohort) = cohort(8, 80, 5);
        let realization = generate_realization(&mut rng, &cohort, 3, 1).unwrap();
        let scenario = &realization.with_interaction;
        for (&p, &eta) in scenario.probabilities.iter().zip(scenario.linear_predictor.iter()) {
            if p > 1e-12 && p < 1.0 - 1e-12 {
                assert_abs_diff_eq!(logit(p), eta, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn linear_predictor_matches_manual_sum() {
        let (mut rng, cohort) = cohort(9, 30, 4);
        let realization = generate_realization(&mut rng, &cohort, 4, 2).unwrap();
        let coef = &realization.coefficients;
        let eta = &realization.with_interaction.linear_predictor;
        for i in 0..cohort.n_individuals() {
            let e = cohort.exposure()[i];
            let mut expected = coef.intercept + coef.environment * e;
            for j in 0..cohort.n_snps() {
                let g = cohort.genotypes()[[i, j]];
                expected += g * coef.snp[j] + e * g * coef.interaction[j];
            }
            assert_abs_diff_eq!(eta[i], expected, epsilon = 1e-10);
        }
    }
}
