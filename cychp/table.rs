//! # Tabular Dataset Module
//!
//! Thin layer over `polars` giving the reconciler the handful of table operations it
//! needs: load a tab-delimited file, index rows by a key column keeping the first
//! occurrence of every key, select rows by position, and write the table back out.
//!
//! Every column is loaded as text. Values are never parsed or validated, so a table
//! written back out carries exactly the cell text it was read with.

use ahash::AHashMap;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the table.")]
    ColumnNotFound(String),
}

/// Loads a tab-delimited table with a header row, reading every column as text.
///
/// `"` has no special meaning. Column names are trimmed, and columns whose name is
/// empty (a header ending in a tab) are dropped.
pub fn read_table(path: &Path) -> Result<DataFrame, TableError> {
    let file = File::open(path)?;
    let mut df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .map_parse_options(|options| options.with_separator(b'\t').with_quote_char(None))
        .into_reader_with_file_handle(file)
        .finish()?;
    normalize_column_names(&mut df)?;
    Ok(df)
}

fn normalize_column_names(df: &mut DataFrame) -> Result<(), TableError> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    for name in names {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            df.drop_in_place(&name)?;
        } else if trimmed != name {
            df.rename(&name, trimmed.into())?;
        }
    }
    Ok(())
}

/// Writes a table as tab-delimited text with a header row and no row index. Cells are
/// never quoted.
pub fn write_table(df: &mut DataFrame, path: &Path) -> Result<(), TableError> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .with_quote_style(QuoteStyle::Never)
        .finish(df)?;
    Ok(())
}

/// The values of one column in row order.
pub fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, TableError> {
    let column = df
        .column(name)
        .map_err(|_| TableError::ColumnNotFound(name.to_string()))?
        .cast(&DataType::String)?;
    let values = column.as_materialized_series().str()?;
    Ok(values
        .into_iter()
        .map(|value| value.map(str::to_owned))
        .collect())
}

/// Selects rows by position, in the order given.
pub fn select_rows(df: &DataFrame, rows: &[IdxSize]) -> Result<DataFrame, TableError> {
    let indices = IdxCa::from_vec("rows".into(), rows.to_vec());
    Ok(df.take(&indices)?)
}

/// Replaces a text column in place, or appends it when `df` has no column `name`.
pub fn set_text_column<I, S>(df: &mut DataFrame, name: &str, values: I) -> Result<(), TableError>
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let values: Vec<Option<String>> = values
        .into_iter()
        .map(|value| value.map(|text| text.as_ref().to_owned()))
        .collect();
    df.with_column(Series::new(name.into(), values))?;
    Ok(())
}

/// Maps each distinct key of a column to the row of its first occurrence.
///
/// Keys keep the order in which they were first seen. Missing keys never enter the
/// index; later rows repeating a key are counted as duplicates and otherwise ignored.
#[derive(Debug, Default)]
pub struct KeyIndex {
    keys: Vec<String>,
    rows: AHashMap<String, IdxSize>,
    duplicates: usize,
    missing: usize,
}

impl KeyIndex {
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let mut index = Self::default();
        for (row, key) in keys.into_iter().enumerate() {
            let Some(key) = key else {
                index.missing += 1;
                continue;
            };
            let key = key.as_ref();
            if index.rows.contains_key(key) {
                index.duplicates += 1;
                continue;
            }
            index.rows.insert(key.to_owned(), row as IdxSize);
            index.keys.push(key.to_owned());
        }
        index
    }

    /// Indexes `df` by the text of `column`.
    pub fn build(df: &DataFrame, column: &str) -> Result<Self, TableError> {
        Ok(Self::from_keys(text_column(df, column)?))
    }

    /// Distinct keys in first-occurrence order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn row(&self, key: &str) -> Option<IdxSize> {
        self.rows.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Rows dropped because their key had already been seen.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Rows dropped because their key was missing.
    pub fn missing(&self) -> usize {
        self.missing
    }
}
