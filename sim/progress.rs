use std::fmt;

/// Stages reported while a study runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrialStage {
    Cohort,
    Realizations,
    Scoring,
}

impl TrialStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Cohort => "cohort generation",
            Self::Realizations => "realization testing",
            Self::Scoring => "contingency scoring",
        }
    }
}

impl fmt::Display for TrialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress while trials run.
pub trait TrialProgressObserver {
    fn on_stage_start(&mut self, stage: TrialStage, total_units: usize) {
        let _ = (stage, total_units);
    }
    fn on_stage_advance(&mut self, stage: TrialStage, completed_units: usize) {
        let _ = (stage, completed_units);
    }
    fn on_stage_finish(&mut self, stage: TrialStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopTrialProgress;

impl TrialProgressObserver for NoopTrialProgress {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(TrialStage, usize)>,
    }

    impl TrialProgressObserver for Recorder {
        fn on_stage_advance(&mut self, stage: TrialStage, completed_units: usize) {
            self.events.push((stage, completed_units));
        }
    }

    #[test]
    fn default_methods_are_optional() {
        let mut recorder = Recorder::default();
        recorder.on_stage_start(TrialStage::Realizations, 3);
        recorder.on_stage_advance(TrialStage::Realizations, 1);
        recorder.on_stage_finish(TrialStage::Realizations);
        assert_eq!(recorder.events, vec![(TrialStage::Realizations, 1)]);
        assert_eq!(TrialStage::Scoring.to_string(), "contingency scoring");
    }
}
