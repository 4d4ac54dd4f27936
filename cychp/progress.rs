use std::fmt;

/// Stages reported while a report is processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Split,
    Reconcile,
}

impl PipelineStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Split => "splitting report sections",
            Self::Reconcile => "aligning tables by probe",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress through the pipeline.
///
/// `processed` counts input lines during [`PipelineStage::Split`] and finished
/// tables during [`PipelineStage::Reconcile`].
pub trait ProgressObserver {
    fn on_stage_start(&mut self, stage: PipelineStage) {
        let _ = stage;
    }
    fn on_stage_advance(&mut self, stage: PipelineStage, processed: usize) {
        let _ = (stage, processed);
    }
    fn on_stage_finish(&mut self, stage: PipelineStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}
