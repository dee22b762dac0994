#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
//! Monte Carlo comparison of two gene × environment interaction tests on
//! synthetic case/control cohorts: per-SNP likelihood-ratio tests and a
//! cross-validated joint lasso.

pub mod cohort;
pub mod config;
pub mod design;
pub mod glm;
pub mod lasso;
pub mod lrt;
pub mod progress;
pub mod report;
pub mod score;
pub mod trials;
