// ========================================================================================
//
//                                 Run orchestration
//
// ========================================================================================
//
// Checks the run's preconditions, then drives the splitter and the reconciler in that
// order. Both stages receive the same selection, derived once from the run mode.

use crate::progress::ProgressObserver;
use crate::reconcile::{self, ReconcileError, ReconcileSummary};
use crate::schema::RunMode;
use crate::split::{self, SplitError, SplitSummary};
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Given input file '{}' is not a file.", .0.display())]
    InputNotAFile(PathBuf),
    #[error("Provided output path '{}' is not a directory.", .0.display())]
    OutputNotADirectory(PathBuf),
    #[error("Could not open input file '{}': {source}", path.display())]
    OpenInput { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("Could not remove intermediate table '{}': {source}", path.display())]
    Clean { path: PathBuf, source: io::Error },
}

/// Everything a run needs to know, fixed before any file is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub mode: RunMode,
    /// Remove the intermediate per-table files once the filtered tables are written.
    pub clean: bool,
}

impl RunConfig {
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, mode: RunMode) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            mode,
            clean: false,
        }
    }

    pub fn with_clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    /// Fails unless the input is an existing file and the output path an existing
    /// directory. Nothing is created or opened.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.input.is_file() {
            return Err(PipelineError::InputNotAFile(self.input.clone()));
        }
        if !self.output_dir.is_dir() {
            return Err(PipelineError::OutputNotADirectory(self.output_dir.clone()));
        }
        Ok(())
    }

    /// `<output_dir>/<input file name>`, without a trailing `.gz`. Every file the run
    /// writes is named after this prefix.
    pub fn output_prefix(&self) -> PathBuf {
        let file_name = self.input.file_name().unwrap_or(self.input.as_os_str());
        let mut prefix = self.output_dir.join(file_name);
        if split::is_gzipped(&prefix) {
            prefix.set_extension("");
        }
        prefix
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub prefix: PathBuf,
    pub split: SplitSummary,
    pub reconcile: ReconcileSummary,
}

/// Splits the report, aligns its probe tables and optionally removes the intermediate
/// files. The first failure aborts the run.
pub fn run<O>(config: &RunConfig, observer: &mut O) -> Result<RunSummary, PipelineError>
where
    O: ProgressObserver,
{
    config.validate()?;
    let selection = config.mode.selection();
    let prefix = config.output_prefix();
    info!(
        "Processing {} ({:?} mode) into {}",
        config.input.display(),
        config.mode,
        config.output_dir.display()
    );

    let reader = split::open_report(&config.input).map_err(|source| PipelineError::OpenInput {
        path: config.input.clone(),
        source,
    })?;
    let split_summary = split::split_report(reader, &prefix, &selection, observer)?;
    let reconcile_summary = reconcile::reconcile(&prefix, &selection, observer)?;

    if config.clean {
        remove_intermediates(&split_summary)?;
    }

    Ok(RunSummary {
        prefix,
        split: split_summary,
        reconcile: reconcile_summary,
    })
}

fn remove_intermediates(summary: &SplitSummary) -> Result<(), PipelineError> {
    for table in &summary.tables {
        remove_file(&table.path)?;
    }
    Ok(())
}

fn remove_file(path: &Path) -> Result<(), PipelineError> {
    debug!("Removing intermediate table {}", path.display());
    fs::remove_file(path).map_err(|source| PipelineError::Clean {
        path: path.to_path_buf(),
        source,
    })
}
