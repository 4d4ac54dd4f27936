// ========================================================================================
//
//                        Cross-table probe reconciliation
//
// ========================================================================================
//
// Loads the per-probe tables written by the splitter, gives genotype rows their probe
// names, and rewrites every table restricted to the probes present in all of them. Row
// `i` of every filtered table describes the same probe.
//
// The copy-number table anchors the run: genotype rows point at copy-number rows by
// position, and the shared probe sequence follows copy-number load order.

use crate::progress::{PipelineStage, ProgressObserver};
use crate::schema::{GENOTYPE_INDEX, PROBE_SET_NAME, Selection, TableKind};
use crate::split::split_table_path;
use crate::table::{self, KeyIndex, TableError};
use log::{debug, info, warn};
use polars::prelude::{DataFrame, IdxSize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Expected table '{kind}' was not found at '{}'.", path.display())]
    MissingTable { kind: TableKind, path: PathBuf },
    #[error(
        "The copy-number table is not part of this run; it is required to identify probes."
    )]
    NoCopyNumberTable,
    #[error("Failed to process table '{kind}' ({}): {source}", path.display())]
    Table {
        kind: TableKind,
        path: PathBuf,
        source: TableError,
    },
    #[error("Could not move filtered table into place at '{}': {source}", path.display())]
    Publish { path: PathBuf, source: io::Error },
}

impl ReconcileError {
    fn table(kind: TableKind, path: &Path, source: TableError) -> Self {
        Self::Table {
            kind,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A filtered table written by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredTable {
    pub kind: TableKind,
    pub path: PathBuf,
    /// Rows in the split table before de-duplication.
    pub loaded_rows: usize,
    /// Rows dropped because an earlier row had the same probe name.
    pub duplicate_rows: usize,
    /// Rows dropped because they carried no probe name.
    pub unnamed_rows: usize,
}

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    /// Probes present in every participating table, in output row order.
    pub common_probes: Vec<String>,
    /// Genotype rows whose `Index` did not point at a copy-number row.
    pub unresolved_genotype_rows: usize,
    pub tables: Vec<FilteredTable>,
}

impl ReconcileSummary {
    pub fn table(&self, kind: TableKind) -> Option<&FilteredTable> {
        self.tables.iter().find(|table| table.kind == kind)
    }
}

/// Path of the filtered output for one table: the prefix without its trailing `.txt`,
/// followed by `.<tag>.f.txt`.
pub fn filtered_table_path(prefix: &Path, kind: TableKind) -> PathBuf {
    let stem = if prefix.extension().is_some_and(|ext| ext == "txt") {
        prefix.with_extension("")
    } else {
        prefix.to_path_buf()
    };
    let mut name = stem.into_os_string();
    name.push(format!(".{}.f.txt", kind.tag()));
    PathBuf::from(name)
}

fn sibling_path(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn staging_path(dest: &Path) -> PathBuf {
    sibling_path(dest, ".tmp")
}

fn backup_path(dest: &Path) -> PathBuf {
    sibling_path(dest, ".prev")
}

/// Copy-number probe names in load order, captured before the table is indexed.
///
/// Genotype rows refer to copy-number rows by position, so this snapshot is the only
/// valid lookup table for them.
#[derive(Debug, Clone)]
pub struct ProbeOrder(Vec<Option<String>>);

impl ProbeOrder {
    pub fn new(names: Vec<Option<String>>) -> Self {
        Self(names)
    }

    pub fn capture(copy_number: &DataFrame) -> Result<Self, TableError> {
        Ok(Self(table::text_column(copy_number, PROBE_SET_NAME)?))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The probe name at the zero-based position `index`. Empty, non-integer and
    /// out-of-range references resolve to nothing.
    pub fn resolve(&self, index: &str) -> Option<&str> {
        let position: usize = index.trim().parse().ok()?;
        self.0.get(position)?.as_deref()
    }
}

/// Sets the genotype table's `ProbeSetName` column from its `Index` column and returns
/// how many rows could not be resolved.
pub fn resolve_genotype_probes(
    genotype: &mut DataFrame,
    order: &ProbeOrder,
) -> Result<usize, TableError> {
    let names: Vec<Option<&str>> = table::text_column(genotype, GENOTYPE_INDEX)?
        .iter()
        .map(|index| index.as_deref().and_then(|index| order.resolve(index)))
        .collect();
    let unresolved = names.iter().filter(|name| name.is_none()).count();
    table::set_text_column(genotype, PROBE_SET_NAME, names)?;
    Ok(unresolved)
}

/// Keys of the first index that every other index also contains, in the first index's
/// order.
pub fn common_probes(indices: &[&KeyIndex]) -> Vec<String> {
    let Some((anchor, others)) = indices.split_first() else {
        return Vec::new();
    };
    anchor
        .keys()
        .iter()
        .filter(|probe| others.iter().all(|index| index.contains(probe)))
        .cloned()
        .collect()
}

/// Selects the rows of `frame` for `common` in that order and moves a `ProbeSetName`
/// column built from `common` to the end of the table.
pub fn align_table(
    frame: &DataFrame,
    index: &KeyIndex,
    common: &[String],
) -> Result<DataFrame, TableError> {
    let rows: Vec<IdxSize> = common
        .iter()
        .filter_map(|probe| index.row(probe))
        .collect();
    debug_assert_eq!(rows.len(), common.len());

    let mut aligned = table::select_rows(frame, &rows)?;
    aligned.drop_in_place(PROBE_SET_NAME)?;
    table::set_text_column(&mut aligned, PROBE_SET_NAME, common.iter().map(Some))?;
    Ok(aligned)
}

struct LoadedTable {
    kind: TableKind,
    frame: DataFrame,
    index: KeyIndex,
}

fn load_table(prefix: &Path, kind: TableKind) -> Result<DataFrame, ReconcileError> {
    let path = split_table_path(prefix, kind);
    if !path.is_file() {
        return Err(ReconcileError::MissingTable { kind, path });
    }
    let frame =
        table::read_table(&path).map_err(|source| ReconcileError::table(kind, &path, source))?;
    debug!(
        "Loaded table '{}' from {}: {} rows x {} columns",
        kind,
        path.display(),
        frame.height(),
        frame.width()
    );
    Ok(frame)
}

/// A filtered table moved into place, with the earlier file it displaced, if any.
struct Swapped {
    dest: PathBuf,
    backup: Option<PathBuf>,
}

impl Swapped {
    fn undo(&self) {
        match &self.backup {
            Some(backup) => {
                let _ = fs::rename(backup, &self.dest);
            }
            None => {
                let _ = fs::remove_file(&self.dest);
            }
        }
    }
}

/// Moves `temp` onto `dest`, first setting aside an existing `dest` file.
fn swap_into_place(temp: &Path, dest: &Path) -> io::Result<Swapped> {
    let backup = if dest.is_file() {
        let backup = backup_path(dest);
        fs::rename(dest, &backup)?;
        Some(backup)
    } else {
        None
    };
    if let Err(e) = fs::rename(temp, dest) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, dest);
        }
        return Err(e);
    }
    Ok(Swapped {
        dest: dest.to_path_buf(),
        backup,
    })
}

/// Writes every aligned table next to its destination, then moves all of them into
/// place. When any step fails, the files displaced so far are restored and the staged
/// files removed, leaving the destinations as they were before the call.
fn publish(aligned: Vec<(TableKind, PathBuf, DataFrame)>) -> Result<(), ReconcileError> {
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(aligned.len());
    for (kind, dest, mut frame) in aligned {
        let temp = staging_path(&dest);
        if let Err(source) = table::write_table(&mut frame, &temp) {
            let _ = fs::remove_file(&temp);
            for (written, _) in &staged {
                let _ = fs::remove_file(written);
            }
            return Err(ReconcileError::table(kind, &dest, source));
        }
        staged.push((temp, dest));
    }

    let mut swapped: Vec<Swapped> = Vec::with_capacity(staged.len());
    for (position, (temp, dest)) in staged.iter().enumerate() {
        match swap_into_place(temp, dest) {
            Ok(done) => swapped.push(done),
            Err(source) => {
                for done in swapped.iter().rev() {
                    done.undo();
                }
                for (pending, _) in &staged[position..] {
                    let _ = fs::remove_file(pending);
                }
                return Err(ReconcileError::Publish {
                    path: dest.clone(),
                    source,
                });
            }
        }
    }

    for backup in swapped.iter().filter_map(|done| done.backup.as_ref()) {
        if let Err(e) = fs::remove_file(backup) {
            warn!("Could not remove {}: {}", backup.display(), e);
        }
    }
    Ok(())
}

/// Loads the selected probe tables split from `prefix`, aligns them on their common
/// probes and writes `<stem>.<tag>.f.txt` for each.
///
/// Selected tables that do not describe probes are left alone. A missing split file
/// for a selected probe table aborts the run before anything is written.
pub fn reconcile<O>(
    prefix: &Path,
    selection: &Selection,
    observer: &mut O,
) -> Result<ReconcileSummary, ReconcileError>
where
    O: ProgressObserver,
{
    if !selection.contains(TableKind::CopyNumber) {
        return Err(ReconcileError::NoCopyNumberTable);
    }
    observer.on_stage_start(PipelineStage::Reconcile);

    let kinds: Vec<TableKind> = std::iter::once(TableKind::CopyNumber)
        .chain(
            selection
                .kinds()
                .iter()
                .copied()
                .filter(|kind| kind.is_probe_table() && *kind != TableKind::CopyNumber),
        )
        .collect();

    // Every split file is loaded before any table is indexed, so a missing table
    // fails the run without touching the outputs.
    let mut frames = Vec::with_capacity(kinds.len());
    for &kind in &kinds {
        frames.push((kind, load_table(prefix, kind)?));
    }

    let copy_number_path = split_table_path(prefix, TableKind::CopyNumber);
    let order = ProbeOrder::capture(&frames[0].1).map_err(|source| {
        ReconcileError::table(TableKind::CopyNumber, &copy_number_path, source)
    })?;

    let mut summary = ReconcileSummary::default();
    let mut loaded: Vec<(LoadedTable, usize)> = Vec::with_capacity(frames.len());
    for (kind, mut frame) in frames {
        let path = split_table_path(prefix, kind);
        if kind == TableKind::Genotype {
            let unresolved = resolve_genotype_probes(&mut frame, &order)
                .map_err(|source| ReconcileError::table(kind, &path, source))?;
            if unresolved > 0 {
                warn!(
                    "{} of {} genotype rows reference no copy-number row ({} rows available) and were dropped.",
                    unresolved,
                    frame.height(),
                    order.len()
                );
            }
            summary.unresolved_genotype_rows = unresolved;
        }

        let index = KeyIndex::build(&frame, PROBE_SET_NAME)
            .map_err(|source| ReconcileError::table(kind, &path, source))?;
        if index.duplicates() > 0 {
            debug!(
                "Table '{}': kept the first of repeated probe names, dropping {} rows.",
                kind,
                index.duplicates()
            );
        }
        let loaded_rows = frame.height();
        loaded.push((LoadedTable { kind, frame, index }, loaded_rows));
    }

    let indices: Vec<&KeyIndex> = loaded.iter().map(|(table, _)| &table.index).collect();
    summary.common_probes = common_probes(&indices);
    info!(
        "{} probes are common to {} tables ({}).",
        summary.common_probes.len(),
        loaded.len(),
        kinds.iter().map(|kind| kind.tag()).collect::<Vec<_>>().join(", ")
    );
    if summary.common_probes.is_empty() {
        warn!("No probe is shared by all tables; filtered tables will contain only a header.");
    }

    let mut aligned = Vec::with_capacity(loaded.len());
    for (table, loaded_rows) in &loaded {
        let dest = filtered_table_path(prefix, table.kind);
        let frame = align_table(&table.frame, &table.index, &summary.common_probes)
            .map_err(|source| ReconcileError::table(table.kind, &dest, source))?;
        summary.tables.push(FilteredTable {
            kind: table.kind,
            path: dest.clone(),
            loaded_rows: *loaded_rows,
            duplicate_rows: table.index.duplicates(),
            unnamed_rows: table.index.missing(),
        });
        aligned.push((table.kind, dest, frame));
        observer.on_stage_advance(PipelineStage::Reconcile, aligned.len());
    }

    publish(aligned)?;
    observer.on_stage_finish(PipelineStage::Reconcile);

    for table in &summary.tables {
        info!(
            "  {:<9} {:>9} rows loaded, {:>7} duplicates, {:>7} unnamed -> {}",
            table.kind.tag(),
            table.loaded_rows,
            table.duplicate_rows,
            table.unnamed_rows,
            table.path.display()
        );
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::schema::RunMode;
    use polars::prelude::{NamedFrom, Series};
    use tempfile::tempdir;

    fn frame(columns: Vec<(&str, Vec<&str>)>) -> DataFrame {
        DataFrame::new(
            columns
                .into_iter()
                .map(|(name, values)| Series::new(name.into(), values).into())
                .collect(),
        )
        .expect("construct dataframe")
    }

    fn names(values: &[&str]) -> ProbeOrder {
        ProbeOrder::new(values.iter().map(|v| Some(v.to_string())).collect())
    }

    #[test]
    fn probe_order_resolves_positions() {
        let order = names(&["P1", "P2", "P3"]);

        assert_eq!(order.resolve("0"), Some("P1"));
        assert_eq!(order.resolve(" 2 "), Some("P3"));
        assert_eq!(order.resolve("3"), None);
        assert_eq!(order.resolve("-1"), None);
        assert_eq!(order.resolve("1.0"), None);
        assert_eq!(order.resolve(""), None);
    }

    #[test]
    fn genotype_names_follow_copy_number_load_order() {
        let order = names(&["P1", "P2", "P1", "P4"]);
        let mut genotype = frame(vec![
            ("Index", vec!["3", "0", "1", "8"]),
            ("Call", vec!["AA", "AB", "BB", "NC"]),
        ]);

        let unresolved = resolve_genotype_probes(&mut genotype, &order).unwrap();

        assert_eq!(unresolved, 1);
        assert_eq!(
            table::text_column(&genotype, PROBE_SET_NAME).unwrap(),
            vec![
                Some("P4".to_string()),
                Some("P1".to_string()),
                Some("P2".to_string()),
                None
            ]
        );
    }

    #[test]
    fn common_probes_excludes_anything_missing_from_one_table() {
        let copy_number = KeyIndex::from_keys(["P3", "P1", "P2", "P5"].map(Some));
        let genotype = KeyIndex::from_keys(["P1", "P2", "P3"].map(Some));
        let peaks = KeyIndex::from_keys(["P2", "P3", "P5", "P9"].map(Some));

        let common = common_probes(&[&copy_number, &genotype, &peaks]);

        assert_eq!(common, ["P3", "P2"]);
        for probe in &common {
            assert!(copy_number.contains(probe) && genotype.contains(probe) && peaks.contains(probe));
        }
        assert!(common_probes(&[]).is_empty());
    }

    #[test]
    fn aligned_table_is_positional_and_ends_with_probe_name() {
        let copy_number = frame(vec![
            ("ProbeSetName", vec!["P1", "P2", "P1", "P3"]),
            ("Chromosome", vec!["1", "1", "9", "2"]),
        ]);
        let index = KeyIndex::build(&copy_number, PROBE_SET_NAME).unwrap();
        let common = vec!["P3".to_string(), "P1".to_string()];

        let aligned = align_table(&copy_number, &index, &common).unwrap();

        let columns: Vec<String> = aligned
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(columns, ["Chromosome", "ProbeSetName"]);
        assert_eq!(
            table::text_column(&aligned, "Chromosome").unwrap(),
            vec![Some("2".to_string()), Some("1".to_string())]
        );
        assert_eq!(
            table::text_column(&aligned, PROBE_SET_NAME).unwrap(),
            vec![Some("P3".to_string()), Some("P1".to_string())]
        );
    }

    #[test]
    fn filtered_paths_drop_trailing_txt() {
        assert_eq!(
            filtered_table_path(Path::new("/out/sample.cychp.txt"), TableKind::Genotype),
            PathBuf::from("/out/sample.cychp.genotype.f.txt")
        );
        assert_eq!(
            filtered_table_path(Path::new("/out/sample.cychp"), TableKind::CopyNumber),
            PathBuf::from("/out/sample.cychp.cnds.f.txt")
        );
    }

    #[test]
    fn missing_split_file_is_fatal_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("r.txt");
        std::fs::write(
            split_table_path(&prefix, TableKind::CopyNumber),
            "ProbeSetName\tChromosome\tPosition\tLog2Ratio\tWeightedLog2Ratio\tSmoothSignal\nP1\t1\t1\t0\t0\t0\n",
        )
        .unwrap();

        let err = reconcile(&prefix, &RunMode::Short.selection(), &mut NoopProgress).unwrap_err();

        match err {
            ReconcileError::MissingTable { kind, .. } => assert_eq!(kind, TableKind::Genotype),
            other => panic!("Expected MissingTable, got {other:?}"),
        }
        assert!(!filtered_table_path(&prefix, TableKind::CopyNumber).exists());
    }

    #[test]
    fn failed_move_restores_every_earlier_output() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("r.txt");
        let copy_number_dest = filtered_table_path(&prefix, TableKind::CopyNumber);
        let genotype_dest = filtered_table_path(&prefix, TableKind::Genotype);
        std::fs::write(&copy_number_dest, "earlier\n").unwrap();
        // A non-empty directory cannot be replaced by a file.
        std::fs::create_dir(&genotype_dest).unwrap();
        std::fs::write(genotype_dest.join("keep"), "").unwrap();

        let aligned = vec![
            (
                TableKind::CopyNumber,
                copy_number_dest.clone(),
                frame(vec![("ProbeSetName", vec!["P1"])]),
            ),
            (
                TableKind::Genotype,
                genotype_dest.clone(),
                frame(vec![("ProbeSetName", vec!["P1"])]),
            ),
        ];

        let err = publish(aligned).unwrap_err();

        match err {
            ReconcileError::Publish { path, .. } => assert_eq!(path, genotype_dest),
            other => panic!("Expected Publish, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&copy_number_dest).unwrap(), "earlier\n");
        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, ["r.cnds.f.txt", "r.genotype.f.txt"]);
    }

    #[test]
    fn successful_publish_replaces_outputs_and_drops_backups() {
        let dir = tempdir().unwrap();
        let dest = filtered_table_path(&dir.path().join("r.txt"), TableKind::CopyNumber);
        std::fs::write(&dest, "earlier\n").unwrap();

        publish(vec![(
            TableKind::CopyNumber,
            dest.clone(),
            frame(vec![("ProbeSetName", vec!["P1"])]),
        )])
        .unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "ProbeSetName\nP1\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn selection_without_copy_number_is_rejected() {
        let dir = tempdir().unwrap();
        let selection = Selection::from_kinds(&[TableKind::Genotype]);

        let err = reconcile(&dir.path().join("r.txt"), &selection, &mut NoopProgress).unwrap_err();

        assert!(matches!(err, ReconcileError::NoCopyNumberTable));
    }
}
