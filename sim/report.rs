//! Orchestration of a full study and rendering of its results.

use crate::cohort::ScenarioKind;
use crate::config::StudyConfig;
use crate::progress::{TrialProgressObserver, TrialStage};
use crate::score::{Decision, Metrics, MetricValue, contingency, null_contingency};
use crate::trials::{SimulationError, SkipCounts, TrialResults, run_trials};
use itertools::Itertools;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fmt;
use std::path::Path;

const METRIC_WIDTH: usize = 22;
const LABEL_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    LikelihoodRatio,
    Lasso,
}

impl Method {
    pub fn label(self) -> &'static str {
        match self {
            Method::LikelihoodRatio => "lr",
            Method::Lasso => "lasso",
        }
    }
}

/// Metrics of one method under one scenario.
#[derive(Debug, Clone)]
pub struct ReportColumn {
    pub method: Method,
    pub scenario: ScenarioKind,
    pub metrics: Metrics,
}

impl ReportColumn {
    pub fn header(&self) -> String {
        format!("{}/{}", self.method.label(), self.scenario.label())
    }
}

/// The four method × scenario columns of a finished study.
#[derive(Debug, Clone)]
pub struct StudyReport {
    pub columns: Vec<ReportColumn>,
    pub alpha: f64,
    pub n_realizations: usize,
    pub skipped: SkipCounts,
}

/// Structured metrics together with their rendered table.
#[derive(Debug, Clone)]
pub struct StudyOutput {
    pub report: StudyReport,
    pub table: String,
}

impl StudyReport {
    pub fn column(&self, method: Method, scenario: ScenarioKind) -> Option<&ReportColumn> {
        self.columns
            .iter()
            .find(|c| c.method == method && c.scenario == scenario)
    }

    /// Writes one tab-separated row per column, `NA` marking undefined metrics.
    pub fn write_tsv(&self, path: &Path) -> Result<(), SimulationError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;

        let mut header = vec!["method", "scenario", "S", "T", "V", "U"];
        if let Some(first) = self.columns.first() {
            header.extend(first.metrics.named().iter().map(|(name, _)| *name));
        }
        writer.write_record(&header)?;

        for column in &self.columns {
            let counts = column.metrics.counts;
            let mut record = vec![
                column.method.label().to_string(),
                column.scenario.label().to_string(),
                counts.s.to_string(),
                counts.t.to_string(),
                counts.v.to_string(),
                counts.u.to_string(),
            ];
            record.extend(
                column
                    .metrics
                    .named()
                    .iter()
                    .map(|(_, value)| MetricValue(*value).to_string()),
            );
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for StudyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers = self
            .columns
            .iter()
            .map(|c| format!("{:>METRIC_WIDTH$}", c.header()))
            .join("");
        writeln!(f, "{:<LABEL_WIDTH$}{headers}", "metric")?;

        let Some(first) = self.columns.first() else {
            return Ok(());
        };
        for (row, (name, _)) in first.metrics.named().iter().enumerate() {
            let cells = self
                .columns
                .iter()
                .map(|c| format!("{:>METRIC_WIDTH$.4}", MetricValue(c.metrics.named()[row].1)))
                .join("");
            writeln!(f, "{name:<LABEL_WIDTH$}{cells}")?;
        }

        let count_rows: [(&str, fn(&Metrics) -> usize); 4] = [
            ("S (true pos.)", |m| m.counts.s),
            ("T (false neg.)", |m| m.counts.t),
            ("V (false pos.)", |m| m.counts.v),
            ("U (true neg.)", |m| m.counts.u),
        ];
        for (name, count) in count_rows {
            let cells = self
                .columns
                .iter()
                .map(|c| format!("{:>METRIC_WIDTH$}", count(&c.metrics)))
                .join("");
            writeln!(f, "{name:<LABEL_WIDTH$}{cells}")?;
        }

        write!(
            f,
            "{} realizations, alpha = {}",
            self.n_realizations, self.alpha
        )?;
        if self.skipped.total() > 0 {
            write!(
                f,
                "; skipped {} LR tests and {} lasso fits",
                self.skipped.lr_tests, self.skipped.lasso_fits
            )?;
        }
        Ok(())
    }
}

/// Scores the raw signals of a run. The interaction-free scenario is scored
/// against an all-negative truth.
pub fn score_trials(results: &TrialResults, alpha: f64) -> Result<StudyReport, SimulationError> {
    let p_value = Decision::PValue { threshold: alpha };
    let families = [
        (Method::LikelihoodRatio, &results.lr, p_value),
        (Method::Lasso, &results.lasso, Decision::NonZero),
    ];

    let mut columns = Vec::with_capacity(4);
    for (method, family, decision) in families {
        for scenario in ScenarioKind::ALL {
            let signals = family.signals(scenario);
            let counts = match scenario {
                ScenarioKind::WithInteraction => contingency(signals, &family.truth, decision)?,
                ScenarioKind::NoInteraction => null_contingency(signals, decision),
            };
            columns.push(ReportColumn {
                method,
                scenario,
                metrics: Metrics::from_counts(counts),
            });
        }
    }

    Ok(StudyReport {
        columns,
        alpha,
        n_realizations: results.n_realizations,
        skipped: results.skipped,
    })
}

/// Runs the trials of `config` from its seed, scores both methods, and
/// renders the summary table.
pub fn run_full_study(
    config: &StudyConfig,
    observer: &mut dyn TrialProgressObserver,
) -> Result<StudyOutput, SimulationError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let results = run_trials(config, &mut rng, observer)?;

    observer.on_stage_start(TrialStage::Scoring, 1);
    let report = score_trials(&results, config.alpha)?;
    observer.on_stage_finish(TrialStage::Scoring);

    let table = report.to_string();
    log::info!(
        "Scored {} LR signals and {} lasso signals",
        results.lr.len(),
        results.lasso.len()
    );
    Ok(StudyOutput { report, table })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trials::SignalFamily;
    use std::fs;
    use tempfile::tempdir;

    fn fixed_results() -> TrialResults {
        TrialResults {
            lr: SignalFamily {
                with_interaction: vec![0.01, 0.30, 0.02, 0.70],
                no_interaction: vec![0.40, 0.80, 0.03, 0.60],
                truth: vec![true, true, false, false],
            },
            lasso: SignalFamily {
                with_interaction: vec![0.5, 0.0, 0.0, -0.2, 0.0, 0.0],
                no_interaction: vec![0.0, 0.0, 0.0, 0.1, 0.0, 0.0],
                truth: vec![true, false, false, false, true, false],
            },
            skipped: SkipCounts::default(),
            n_realizations: 2,
        }
    }

    #[test]
    fn scoring_produces_four_columns() {
        let report = score_trials(&fixed_results(), 0.05).unwrap();
        assert_eq!(report.columns.len(), 4);

        let lr = report
            .column(Method::LikelihoodRatio, ScenarioKind::WithInteraction)
            .unwrap();
        assert_eq!(lr.metrics.counts.s, 1);
        assert_eq!(lr.metrics.counts.t, 1);
        assert_eq!(lr.metrics.counts.v, 1);
        assert_eq!(lr.metrics.counts.u, 1);

        let lr_null = report
            .column(Method::LikelihoodRatio, ScenarioKind::NoInteraction)
            .unwrap();
        assert_eq!(lr_null.metrics.counts.s + lr_null.metrics.counts.t, 0);
        assert_eq!(lr_null.metrics.counts.v, 1);
        assert_eq!(lr_null.metrics.recall, None);

        let lasso = report
            .column(Method::Lasso, ScenarioKind::WithInteraction)
            .unwrap();
        assert_eq!(lasso.metrics.counts.total(), 6);
        assert_eq!(lasso.metrics.counts.s, 1);
        assert_eq!(lasso.metrics.counts.v, 1);
    }

    #[test]
    fn table_marks_undefined_metrics() {
        let report = score_trials(&fixed_results(), 0.05).unwrap();
        let table = report.to_string();
        assert!(table.starts_with("metric"));
        assert!(table.contains("lr/no_interaction"));
        assert!(table.contains("lasso/interaction"));
        assert!(table.contains("NA"));
        assert!(table.contains("2 realizations"));
    }

    #[test]
    fn tsv_has_one_row_per_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.tsv");
        let report = score_trials(&fixed_results(), 0.05).unwrap();
        report.write_tsv(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("method\tscenario\tS\tT\tV\tU\trecall"));
        assert!(lines[2].starts_with("lr\tno_interaction\t0\t0\t1\t3\tNA"));
    }

    #[test]
    fn misaligned_truth_is_reported() {
        let mut results = fixed_results();
        results.lasso.truth.pop();
        let err = score_trials(&results, 0.05).unwrap_err();
        assert!(matches!(err, SimulationError::Score(_)));
    }
}
