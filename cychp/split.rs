// ========================================================================================
//
//                              Report section splitter
//
// ========================================================================================
//
// A CYCHP text report interleaves `#` metadata lines with tab-delimited tables. The
// first non-marker line after a run of marker lines is a table header; the table runs
// until the next marker line. Each selected table is copied verbatim to
// `<prefix>.<tag>.txt`.

use crate::progress::{PipelineStage, ProgressObserver};
use crate::schema::{Selection, TableKind};
use flate2::read::MultiGzDecoder;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// First byte of every metadata / separator line.
pub const MARKER: u8 = b'#';

/// How many input lines pass between two progress notifications.
const PROGRESS_INTERVAL_LINES: usize = 1 << 16;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("I/O error while reading the report: {0}")]
    Io(#[from] io::Error),
    #[error("Could not write table file '{}': {source}", path.display())]
    TableWrite { path: PathBuf, source: io::Error },
    #[error("Could not remove table file '{}' left by an earlier run: {source}", path.display())]
    StaleTable { path: PathBuf, source: io::Error },
}

/// A table written to disk by the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitTable {
    pub kind: TableKind,
    pub path: PathBuf,
    /// Body rows, header excluded.
    pub rows: usize,
}

#[derive(Debug, Default)]
pub struct SplitSummary {
    pub lines_read: usize,
    /// Number of sections entered, recognized or not.
    pub sections: usize,
    /// Sections whose header was unknown or not selected for this run.
    pub skipped_sections: usize,
    /// One entry per table kind written; a repeated kind keeps its last occurrence.
    pub tables: Vec<SplitTable>,
}

impl SplitSummary {
    pub fn table(&self, kind: TableKind) -> Option<&SplitTable> {
        self.tables.iter().find(|table| table.kind == kind)
    }

    fn record(&mut self, table: SplitTable) {
        match self.tables.iter_mut().find(|t| t.kind == table.kind) {
            Some(existing) => {
                warn!(
                    "Table '{}' appears more than once in the report; keeping the later section ({} rows) over the earlier one ({} rows).",
                    table.kind, table.rows, existing.rows
                );
                *existing = table;
            }
            None => self.tables.push(table),
        }
    }
}

/// Path of the intermediate file holding one table of the report.
pub fn split_table_path(prefix: &Path, kind: TableKind) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".{}.txt", kind.tag()));
    PathBuf::from(name)
}

pub fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Opens a report for line-oriented reading, decompressing `.gz` files on the fly.
pub fn open_report(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_gzipped(path) {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// The single table file currently open for writing.
struct OpenTable {
    kind: TableKind,
    path: PathBuf,
    writer: BufWriter<File>,
    lines: usize,
}

impl OpenTable {
    fn create(prefix: &Path, kind: TableKind) -> Result<Self, SplitError> {
        let path = split_table_path(prefix, kind);
        let file = File::create(&path).map_err(|source| SplitError::TableWrite {
            path: path.clone(),
            source,
        })?;
        debug!("Writing table '{}' to {}", kind, path.display());
        Ok(Self {
            kind,
            path,
            writer: BufWriter::new(file),
            lines: 0,
        })
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), SplitError> {
        self.lines += 1;
        self.writer
            .write_all(line)
            .map_err(|source| SplitError::TableWrite {
                path: self.path.clone(),
                source,
            })
    }

    fn close(mut self) -> Result<SplitTable, SplitError> {
        if let Err(source) = self.writer.flush() {
            return Err(SplitError::TableWrite {
                path: self.path,
                source,
            });
        }
        Ok(SplitTable {
            kind: self.kind,
            path: self.path,
            rows: self.lines.saturating_sub(1),
        })
    }
}

/// Removes `<prefix>.<tag>.txt` for every selected kind, so that a table absent from
/// this report can never be picked up from an earlier run into the same directory.
fn clear_stale_tables(prefix: &Path, selection: &Selection) -> Result<(), SplitError> {
    for &kind in selection.kinds() {
        let path = split_table_path(prefix, kind);
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale table '{}' at {}", kind, path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(SplitError::StaleTable { path, source }),
        }
    }
    Ok(())
}

enum SectionState {
    /// The previous line was a marker line, or nothing has been read yet.
    Outside,
    /// Inside a table that is not written.
    Skipping,
    Writing(OpenTable),
}

/// Splits `reader` into per-table files named after `prefix`.
///
/// Only tables in `selection` are written. Sections with an unknown header are read
/// past without error. Lines are copied byte for byte, terminators included. Table
/// files of selected kinds left over from an earlier run are removed first.
pub fn split_report<R, O>(
    mut reader: R,
    prefix: &Path,
    selection: &Selection,
    observer: &mut O,
) -> Result<SplitSummary, SplitError>
where
    R: BufRead,
    O: ProgressObserver,
{
    let mut summary = SplitSummary::default();
    let mut state = SectionState::Outside;
    let mut line = Vec::with_capacity(256);

    clear_stale_tables(prefix, selection)?;
    observer.on_stage_start(PipelineStage::Split);
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        summary.lines_read += 1;
        let is_marker = line.first() == Some(&MARKER);

        state = match (state, is_marker) {
            (SectionState::Outside, true) => SectionState::Outside,
            (SectionState::Outside, false) => {
                summary.sections += 1;
                let header = String::from_utf8_lossy(&line);
                match selection.classify(&header) {
                    Some(kind) => {
                        let mut table = OpenTable::create(prefix, kind)?;
                        table.write_line(&line)?;
                        SectionState::Writing(table)
                    }
                    None => {
                        summary.skipped_sections += 1;
                        match TableKind::from_header(&header) {
                            Some(kind) => debug!(
                                "Line {}: skipping table '{}', not selected for this run",
                                summary.lines_read, kind
                            ),
                            None => debug!(
                                "Line {}: skipping section with unrecognized header",
                                summary.lines_read
                            ),
                        }
                        SectionState::Skipping
                    }
                }
            }
            (SectionState::Skipping, true) => SectionState::Outside,
            (SectionState::Skipping, false) => SectionState::Skipping,
            (SectionState::Writing(table), true) => {
                summary.record(table.close()?);
                SectionState::Outside
            }
            (SectionState::Writing(mut table), false) => {
                table.write_line(&line)?;
                SectionState::Writing(table)
            }
        };

        if summary.lines_read % PROGRESS_INTERVAL_LINES == 0 {
            observer.on_stage_advance(PipelineStage::Split, summary.lines_read);
        }
    }

    if let SectionState::Writing(table) = state {
        summary.record(table.close()?);
    }
    observer.on_stage_advance(PipelineStage::Split, summary.lines_read);
    observer.on_stage_finish(PipelineStage::Split);

    info!(
        "Read {} lines in {} sections; wrote {} tables, skipped {} sections.",
        summary.lines_read,
        summary.sections,
        summary.tables.len(),
        summary.skipped_sections
    );
    for table in &summary.tables {
        info!(
            "  {:<9} {:>9} rows -> {}",
            table.kind.tag(),
            table.rows,
            table.path.display()
        );
    }

    Ok(summary)
}
