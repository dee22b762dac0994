//! Explicit column layouts for the two detection methods.
//!
//! The joint (lasso) design has `2m + 1` columns in a fixed order:
//!
//! ```text
//! [ snp_0 .. snp_{m-1} | exposure | snp_0:exposure .. snp_{m-1}:exposure ]
//! ```
//!
//! Downstream code reads SNP `i`'s interaction coefficient at position
//! `m + 1 + i`, so the order is asserted whenever a design is built instead of
//! being inferred from column names.

use ndarray::{Array2, ArrayView1, ArrayView2, s};
use std::ops::Range;

/// The meaning of one design column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Intercept,
    Snp(usize),
    Exposure,
    Interaction(usize),
}

impl ColumnRole {
    pub fn name(self) -> String {
        match self {
            ColumnRole::Intercept => "(Intercept)".to_string(),
            ColumnRole::Snp(j) => format!("snp{j}"),
            ColumnRole::Exposure => "exposure".to_string(),
            ColumnRole::Interaction(j) => format!("snp{j}:exposure"),
        }
    }
}

/// An ordered list of named columns.
#[derive(Debug, Clone)]
pub struct DesignLayout {
    columns: Vec<ColumnRole>,
    n_snps: usize,
}

impl DesignLayout {
    /// Joint layout over all `n_snps` SNPs: SNPs, exposure, interactions. The
    /// intercept is handled by the fitting routine and is not a column.
    pub fn for_snps(n_snps: usize) -> Self {
        let mut columns = Vec::with_capacity(2 * n_snps + 1);
        columns.extend((0..n_snps).map(ColumnRole::Snp));
        columns.push(ColumnRole::Exposure);
        columns.extend((0..n_snps).map(ColumnRole::Interaction));
        let layout = Self { columns, n_snps };
        layout.assert_ordering();
        layout
    }

    /// Single-SNP layout for the likelihood-ratio test. The reduced model is
    /// `[intercept, snp, exposure]`; the full model appends the interaction.
    pub fn single_snp(snp: usize, with_interaction: bool) -> Self {
        let mut columns = vec![ColumnRole::Intercept, ColumnRole::Snp(snp), ColumnRole::Exposure];
        if with_interaction {
            columns.push(ColumnRole::Interaction(snp));
        }
        Self { columns, n_snps: 1 }
    }

    pub fn columns(&self) -> &[ColumnRole] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name()).collect()
    }

    /// Column range holding the SNP × exposure coefficients of a joint layout.
    pub fn interaction_cols(&self) -> Range<usize> {
        self.n_snps + 1..2 * self.n_snps + 1
    }

    /// Panics unless this is a joint layout whose interaction block lists SNPs
    /// in column order.
    pub fn assert_ordering(&self) {
        let m = self.n_snps;
        assert_eq!(
            self.columns.len(),
            2 * m + 1,
            "Joint design must have 2m + 1 columns"
        );
        for j in 0..m {
            assert_eq!(
                self.columns[j],
                ColumnRole::Snp(j),
                "SNP block out of order at {j}"
            );
        }
        assert_eq!(
            self.columns[m],
            ColumnRole::Exposure,
            "Exposure column must follow the SNP block"
        );
        for (i, col) in self.interaction_cols().enumerate() {
            assert_eq!(
                self.columns[col],
                ColumnRole::Interaction(i),
                "Interaction block out of order at {i}"
            );
        }
    }

    /// Materialises the layout. `genotypes` is `[n, m]`, `exposure` has length `n`.
    pub fn build(&self, genotypes: ArrayView2<f64>, exposure: ArrayView1<f64>) -> Array2<f64> {
        assert_eq!(
            genotypes.nrows(),
            exposure.len(),
            "Genotype rows must match exposure length"
        );
        let n = genotypes.nrows();
        let mut x = Array2::<f64>::zeros((n, self.columns.len()));
        for (k, role) in self.columns.iter().enumerate() {
            let mut target = x.column_mut(k);
            match *role {
                ColumnRole::Intercept => target.fill(1.0),
                ColumnRole::Snp(j) => target.assign(&genotypes.column(j)),
                ColumnRole::Exposure => target.assign(&exposure),
                ColumnRole::Interaction(j) => {
                    target.assign(&(&genotypes.column(j) * &exposure))
                }
            }
        }
        x
    }
}

/// Builds the `n × (2m + 1)` joint design for the lasso path.
pub fn build_joint_design(
    genotypes: ArrayView2<f64>,
    exposure: ArrayView1<f64>,
) -> (DesignLayout, Array2<f64>) {
    let layout = DesignLayout::for_snps(genotypes.ncols());
    let x = layout.build(genotypes, exposure);
    debug_assert_eq!(
        x.slice(s![.., layout.interaction_cols()]).dim(),
        (genotypes.nrows(), genotypes.ncols())
    );
    (layout, x)
}

/// Builds `[1, g, e]` and `[1, g, e, g·e]` for one SNP column.
pub fn build_single_snp_designs(
    snp_column: ArrayView1<f64>,
    exposure: ArrayView1<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let n = snp_column.len();
    let mut full = Array2::<f64>::zeros((n, 4));
    full.column_mut(0).fill(1.0);
    full.column_mut(1).assign(&snp_column);
    full.column_mut(2).assign(&exposure);
    full.column_mut(3).assign(&(&snp_column * &exposure));
    let reduced = full.slice(s![.., 0..3]).to_owned();
    (reduced, full)
}
