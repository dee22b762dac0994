//! Contingency counting and detection metrics.
//!
//! Labels follow the usual confusion-matrix layout, with the predicted label
//! taken from a decision signal and the true label from the realization:
//!
//! | truth \ predicted | positive | negative |
//! |-------------------|----------|----------|
//! | interacting       | `S`      | `T`      |
//! | not interacting   | `V`      | `U`      |

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScoreError {
    #[error("Signal and truth sequences differ in length ({signals} vs {truths}).")]
    LengthMismatch { signals: usize, truths: usize },
}

/// How a raw signal is turned into a predicted label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Positive iff the p-value is at or below `threshold`.
    PValue { threshold: f64 },
    /// Positive iff the coefficient is nonzero.
    NonZero,
}

impl Decision {
    /// NaN signals are always negative.
    pub fn is_positive(self, signal: f64) -> bool {
        if signal.is_nan() {
            return false;
        }
        match self {
            Decision::PValue { threshold } => signal <= threshold,
            Decision::NonZero => signal != 0.0,
        }
    }
}

/// Confusion-matrix counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Contingency {
    /// True positives.
    pub s: usize,
    /// False negatives.
    pub t: usize,
    /// False positives.
    pub v: usize,
    /// True negatives.
    pub u: usize,
}

impl Contingency {
    pub fn total(&self) -> usize {
        self.s + self.t + self.v + self.u
    }

    fn record(&mut self, predicted: bool, truth: bool) {
        match (truth, predicted) {
            (true, true) => self.s += 1,
            (true, false) => self.t += 1,
            (false, true) => self.v += 1,
            (false, false) => self.u += 1,
        }
    }
}

/// Counts predictions from `signals` against `truths`, position by position.
pub fn contingency(
    signals: &[f64],
    truths: &[bool],
    decision: Decision,
) -> Result<Contingency, ScoreError> {
    if signals.len() != truths.len() {
        return Err(ScoreError::LengthMismatch {
            signals: signals.len(),
            truths: truths.len(),
        });
    }
    let mut counts = Contingency::default();
    for (&signal, &truth) in signals.iter().zip(truths) {
        counts.record(decision.is_positive(signal), truth);
    }
    Ok(counts)
}

/// Counts predictions when no SNP truly interacts, so `S = T = 0`.
pub fn null_contingency(signals: &[f64], decision: Decision) -> Contingency {
    let mut counts = Contingency::default();
    for &signal in signals {
        counts.record(decision.is_positive(signal), false);
    }
    counts
}

/// Detection metrics. `None` marks a ratio whose denominator is zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub counts: Contingency,
    pub recall: Option<f64>,
    pub specificity: Option<f64>,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub f_score: Option<f64>,
    pub false_positive_rate: Option<f64>,
}

fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

impl Metrics {
    pub fn from_counts(counts: Contingency) -> Self {
        let Contingency { s, t, v, u } = counts;
        let recall = ratio(s, s + t);
        let specificity = ratio(u, u + v);
        let precision = ratio(s, s + v);
        let f_score = match (precision, recall) {
            (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
            _ => None,
        };
        Self {
            counts,
            recall,
            specificity,
            accuracy: ratio(s + u, counts.total()),
            precision,
            f_score,
            false_positive_rate: ratio(v, u + v),
        }
    }

    /// The six metrics as `(name, value)` pairs, in report order.
    pub fn named(&self) -> [(&'static str, Option<f64>); 6] {
        [
            ("recall", self.recall),
            ("specificity", self.specificity),
            ("accuracy", self.accuracy),
            ("precision", self.precision),
            ("f_score", self.f_score),
            ("false_positive_rate", self.false_positive_rate),
        ]
    }
}

/// Formats an optional metric, printing `NA` when it is undefined.
pub struct MetricValue(pub Option<f64>);

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match (self.0, f.precision()) {
            (Some(value), Some(precision)) => format!("{value:.precision$}"),
            (Some(value), None) => value.to_string(),
            (None, _) => "NA".to_string(),
        };
        match f.width() {
            Some(width) => write!(f, "{text:>width$}"),
            None => f.write_str(&text),
        }
    }
}
