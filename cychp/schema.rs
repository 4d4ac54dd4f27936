// ========================================================================================
//
//                        Table registry & active selection
//
// ========================================================================================

use itertools::Itertools;
use std::fmt::{self, Display, Formatter};

/// Column holding the probe identifier shared by the copy-number and allele-peak tables.
pub const PROBE_SET_NAME: &str = "ProbeSetName";

/// Column of the genotype table that points at a row of the copy-number table.
pub const GENOTYPE_INDEX: &str = "Index";

/// Every table layout a CYCHP text report is known to contain.
///
/// A section of the report is recognized only when its header line matches one of
/// these layouts exactly (after tabs are normalized to spaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Per-chromosome segment summary.
    SegmentSummary,
    /// Per-probe copy-number signal and log-ratios.
    CopyNumber,
    /// Per-probe allele peak positions.
    AllelePeaks,
    /// Mosaicism allele-balance scores.
    Mosaicism,
    /// Copy-number state segments.
    CopyNumberSegments,
    /// Loss-of-heterozygosity segments.
    LohSegments,
    /// Copy-neutral loss-of-heterozygosity segments.
    CnNeutralLohSegments,
    /// Per-probe genotype calls, keyed by copy-number row position.
    Genotype,
}

impl TableKind {
    pub const ALL: [TableKind; 8] = [
        TableKind::SegmentSummary,
        TableKind::CopyNumber,
        TableKind::AllelePeaks,
        TableKind::Mosaicism,
        TableKind::CopyNumberSegments,
        TableKind::LohSegments,
        TableKind::CnNeutralLohSegments,
        TableKind::Genotype,
    ];

    /// Short identifier used in file names, e.g. `sample.cychp.txt.cnds.txt`.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::SegmentSummary => "sds",
            Self::CopyNumber => "cnds",
            Self::AllelePeaks => "apds",
            Self::Mosaicism => "mabsds",
            Self::CopyNumberSegments => "cn_ds",
            Self::LohSegments => "lohds",
            Self::CnNeutralLohSegments => "cnnlohds",
            Self::Genotype => "genotype",
        }
    }

    /// Column names of the table, in header order.
    pub const fn col_names(self) -> &'static [&'static str] {
        match self {
            Self::SegmentSummary => &[
                "Chromosome",
                "Display",
                "StartIndex",
                "MarkerCount",
                "MinSignal",
                "MaxSignal",
                "MedianCnState",
                "HomFrequency",
                "HetFrequency",
                "Mosaicism",
                "LOH",
                "MedianSignal",
            ],
            Self::CopyNumber => &[
                PROBE_SET_NAME,
                "Chromosome",
                "Position",
                "Log2Ratio",
                "WeightedLog2Ratio",
                "SmoothSignal",
            ],
            Self::AllelePeaks => &[
                PROBE_SET_NAME,
                "Chromosome",
                "Position",
                "AllelePeaks0",
                "AllelePeaks1",
            ],
            Self::Mosaicism => &[GENOTYPE_INDEX, "SCAR"],
            Self::CopyNumberSegments => &[
                "SegmentID",
                "Chromosome",
                "StartPosition",
                "StopPosition",
                "MarkerCount",
                "MeanMarkerDistance",
                "State",
                "Confidence",
            ],
            Self::LohSegments => &[
                "SegmentID",
                "Chromosome",
                "StartPosition",
                "StopPosition",
                "MarkerCount",
                "MeanMarkerDistance",
                "LOH",
                "Confidence",
            ],
            Self::CnNeutralLohSegments => &[
                "SegmentID",
                "Chromosome",
                "StartPosition",
                "StopPosition",
                "MarkerCount",
                "MeanMarkerDistance",
                "CNNeutralLOH",
                "Confidence",
            ],
            Self::Genotype => &[
                GENOTYPE_INDEX,
                "Call",
                "Confidence",
                "ForcedCall",
                "ASignal",
                "BSignal",
                "SignalStrength",
                "Contrast",
            ],
        }
    }

    /// Whether rows of this table describe single probes and take part in alignment.
    pub const fn is_probe_table(self) -> bool {
        matches!(self, Self::CopyNumber | Self::AllelePeaks | Self::Genotype)
    }

    /// The normalized header line that identifies this table.
    pub fn header(self) -> String {
        self.col_names().iter().join(" ")
    }

    /// Identifies a table from its raw header line.
    pub fn from_header(line: &str) -> Option<TableKind> {
        let normalized = normalize_header(line);
        Self::ALL
            .into_iter()
            .find(|kind| kind.header() == normalized)
    }
}

impl Display for TableKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Trims surrounding whitespace and turns every tab into a single space.
pub fn normalize_header(line: &str) -> String {
    line.trim().replace('\t', " ")
}

/// How much of the report a run processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Copy-number, genotype and allele-peak tables.
    #[default]
    Full,
    /// Copy-number and genotype tables only; allele peaks are ignored entirely.
    Short,
}

impl RunMode {
    pub fn from_short_flag(short: bool) -> Self {
        if short { Self::Short } else { Self::Full }
    }

    pub const fn selection(self) -> Selection {
        match self {
            Self::Full => Selection {
                kinds: &[
                    TableKind::CopyNumber,
                    TableKind::Genotype,
                    TableKind::AllelePeaks,
                ],
            },
            Self::Short => Selection {
                kinds: &[TableKind::CopyNumber, TableKind::Genotype],
            },
        }
    }
}

/// The set of table kinds a run materializes. Every other section of the report is
/// read past without being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    kinds: &'static [TableKind],
}

impl Selection {
    pub const fn from_kinds(kinds: &'static [TableKind]) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> &'static [TableKind] {
        self.kinds
    }

    pub fn contains(&self, kind: TableKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Returns the selected table kind whose header matches `line`, if any.
    pub fn classify(&self, line: &str) -> Option<TableKind> {
        TableKind::from_header(line).filter(|kind| self.contains(*kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_unique_per_kind() {
        let headers: Vec<String> = TableKind::ALL.iter().map(|k| k.header()).collect();
        assert_eq!(headers.iter().unique().count(), TableKind::ALL.len());
    }

    #[test]
    fn tab_separated_header_is_recognized() {
        let line = "ProbeSetName\tChromosome\tPosition\tLog2Ratio\tWeightedLog2Ratio\tSmoothSignal\r\n";
        assert_eq!(TableKind::from_header(line), Some(TableKind::CopyNumber));
    }

    #[test]
    fn segment_variants_are_distinguished() {
        let loh = "SegmentID\tChromosome\tStartPosition\tStopPosition\tMarkerCount\tMeanMarkerDistance\tLOH\tConfidence";
        let neutral = loh.replace("\tLOH\t", "\tCNNeutralLOH\t");
        assert_eq!(TableKind::from_header(loh), Some(TableKind::LohSegments));
        assert_eq!(
            TableKind::from_header(&neutral),
            Some(TableKind::CnNeutralLohSegments)
        );
    }

    #[test]
    fn partial_or_reordered_header_is_not_recognized() {
        assert_eq!(TableKind::from_header("ProbeSetName\tChromosome"), None);
        assert_eq!(TableKind::from_header("SCAR\tIndex"), None);
        assert_eq!(TableKind::from_header(""), None);
    }

    #[test]
    fn short_mode_drops_allele_peaks() {
        let short = RunMode::Short.selection();
        let full = RunMode::Full.selection();
        let header = TableKind::AllelePeaks.header();

        assert!(!short.contains(TableKind::AllelePeaks));
        assert_eq!(short.classify(&header), None);
        assert_eq!(full.classify(&header), Some(TableKind::AllelePeaks));
        assert_eq!(RunMode::from_short_flag(true), RunMode::Short);
        assert_eq!(RunMode::default(), RunMode::Full);
    }

    #[test]
    fn recognized_but_unselected_kind_is_not_classified() {
        let selection = RunMode::Full.selection();
        assert_eq!(selection.classify("Index\tSCAR"), None);
        assert_eq!(TableKind::from_header("Index\tSCAR"), Some(TableKind::Mosaicism));
    }
}
