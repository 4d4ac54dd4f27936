// ========================================================================================
//
//                      CYCHP report splitter: command-line entry point
//
// ========================================================================================

use clap::Parser;
use cychp::progress::{PipelineStage, ProgressObserver};
use cychp::{RunConfig, RunMode};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(
    name = "cychp",
    version,
    about = "Parser and filter for CytoScan HD and CytoScan 750K CYCHP text reports."
)]
struct Args {
    /// Input CYCHP text report. Files ending in `.gz` are decompressed on the fly.
    #[arg(short = 'i', long = "input-file", visible_alias = "input_file")]
    input_file: PathBuf,

    /// Output directory.
    #[arg(short = 'o', long = "output-path", visible_alias = "output_path")]
    output_path: PathBuf,

    /// Ignore the allele-peaks table.
    #[arg(short, long)]
    short: bool,

    /// Remove the intermediate per-table files once the filtered tables are written.
    #[arg(short, long)]
    clean: bool,
}

/// Spinner on stderr, drawn only when stderr is a terminal.
#[derive(Default)]
struct SpinnerProgress {
    bar: Option<ProgressBar>,
}

impl SpinnerProgress {
    fn abandon(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

fn create_spinner(message: &'static str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(None, draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] {spinner:.cyan} {pos} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

impl ProgressObserver for SpinnerProgress {
    fn on_stage_start(&mut self, stage: PipelineStage) {
        self.bar = Some(create_spinner(stage.describe()));
    }

    fn on_stage_advance(&mut self, stage: PipelineStage, processed: usize) {
        if let Some(bar) = &self.bar {
            bar.set_message(stage.describe());
            bar.set_position(processed as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: PipelineStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage}: done"));
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let start_time = Instant::now();
    let args = Args::parse();
    let config = RunConfig::new(
        args.input_file,
        args.output_path,
        RunMode::from_short_flag(args.short),
    )
    .with_clean(args.clean);

    let mut progress = SpinnerProgress::default();
    match cychp::run(&config, &mut progress) {
        Ok(summary) => {
            eprintln!(
                "> Wrote {} filtered tables sharing {} probes in {:.2?}.",
                summary.reconcile.tables.len(),
                summary.reconcile.common_probes.len(),
                start_time.elapsed()
            );
            for table in &summary.reconcile.tables {
                eprintln!("> {}", table.path.display());
            }
        }
        Err(e) => {
            progress.abandon();
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
