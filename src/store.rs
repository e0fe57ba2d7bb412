//! CSV-backed durable table store.
//!
//! A [`Table`] keeps rows in file order together with an index from natural
//! key to the last row carrying that key. Flushes always rewrite the whole
//! file, going through a sibling temp file so that a crash mid-write leaves
//! the previous checkpoint intact.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Column, Field, NaturalKey, Patch, SongRow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("table {} is missing required column {column}", .path.display())]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("CSV error in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// Merge Policy
// ============================================================================

/// How a patch treats fields that already hold a value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// New values replace old ones, nulls included.
    #[default]
    Overwrite,
    /// A null in the patch never erases a populated field.
    KeepExisting,
}

fn merge_value<T>(slot: &mut Option<T>, new: Option<T>, policy: MergePolicy) {
    match (policy, &new) {
        (MergePolicy::KeepExisting, None) => {}
        _ => *slot = new,
    }
}

/// Apply an enrichment patch to a row. Key, lyrics and extra columns are
/// never touched.
pub fn apply(row: &mut SongRow, patch: &Patch, policy: MergePolicy) {
    match patch {
        Patch::Metadata(m) => {
            let meta = &mut row.metadata;
            merge_value(&mut meta.spotify_url, m.spotify_url.clone(), policy);
            merge_value(&mut meta.album_name, m.album_name.clone(), policy);
            merge_value(&mut meta.album_release_date, m.album_release_date.clone(), policy);
            merge_value(&mut meta.duration_ms, m.duration_ms, policy);
            merge_value(&mut meta.popularity, m.popularity, policy);
            merge_value(&mut meta.preview_url, m.preview_url.clone(), policy);
        }
        Patch::SpotifyUrl(url) => merge_value(&mut row.metadata.spotify_url, url.clone(), policy),
        Patch::Language(lang) => merge_value(&mut row.language, lang.clone(), policy),
    }
}

// ============================================================================
// Table
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<SongRow>,
    /// Natural key -> index of the last row with that key.
    index: FxHashMap<NaturalKey, usize>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// An empty table with the standard key and lyrics columns.
    #[cfg(test)]
    pub fn empty() -> Self {
        Self::new(vec![Column::ArtistName, Column::SongName, Column::Lyrics])
    }

    pub fn from_rows(columns: Vec<Column>, rows: Vec<SongRow>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push(row);
        }
        table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[SongRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &Column) -> bool {
        self.columns.contains(column)
    }

    /// Append enrichment columns that are not present yet.
    pub fn ensure_fields(&mut self, fields: &[Field]) {
        for &field in fields {
            let column = Column::Field(field);
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
    }

    /// Add any column of `other` this table does not have yet, so rows
    /// copied from `other` keep all their cells on save.
    pub fn adopt_columns(&mut self, other: &[Column]) {
        for column in other {
            if !self.columns.contains(column) {
                self.columns.push(column.clone());
            }
        }
    }

    pub fn push(&mut self, row: SongRow) {
        if let Some(key) = row.key() {
            self.index.insert(key, self.rows.len());
        }
        self.rows.push(row);
    }

    /// The last row carrying `key`.
    pub fn get(&self, key: &NaturalKey) -> Option<&SongRow> {
        self.index.get(key).map(|&i| &self.rows[i])
    }

    pub fn get_mut(&mut self, key: &NaturalKey) -> Option<&mut SongRow> {
        match self.index.get(key) {
            Some(&i) => Some(&mut self.rows[i]),
            None => None,
        }
    }

    /// Keys of all keyed rows.
    pub fn keys(&self) -> FxHashSet<NaturalKey> {
        self.index.keys().cloned().collect()
    }

    /// Update the row with the same key in place, or append `row` with the
    /// patch applied when the key is absent. An in-place update also takes
    /// the carried cells (lyrics, extra columns) of `row`, so the latest
    /// occurrence of a key wins.
    pub fn upsert(&mut self, row: &SongRow, patch: &Patch, policy: MergePolicy) {
        if let Some(existing) = row.key().and_then(|k| self.get_mut(&k)) {
            if row.lyrics.is_some() {
                existing.lyrics = row.lyrics.clone();
            }
            existing
                .extra
                .extend(row.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            apply(existing, patch, policy);
            return;
        }
        let mut fresh = row.clone();
        apply(&mut fresh, patch, policy);
        self.push(fresh);
    }

    /// Drop earlier duplicates of every natural key, keeping the last
    /// occurrence at its position. Rows without a key are kept as is.
    /// Returns the number of rows removed.
    pub fn dedup_keep_last(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen: FxHashSet<NaturalKey> = FxHashSet::default();
        let mut kept: Vec<SongRow> = Vec::with_capacity(before);
        for row in self.rows.drain(..).rev() {
            let keep = match row.key() {
                Some(key) => seen.insert(key),
                None => true,
            };
            if keep {
                kept.push(row);
            }
        }
        kept.reverse();
        self.rows = kept;
        self.rebuild_index();
        before - self.rows.len()
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, row) in self.rows.iter().enumerate() {
            if let Some(key) = row.key() {
                self.index.insert(key, i);
            }
        }
    }
}

// ============================================================================
// CSV Load / Save
// ============================================================================

/// Load a table from a CSV file with a header row.
pub fn load(path: &Path) -> Result<Table, StoreError> {
    if !path.exists() {
        return Err(StoreError::NotFound(path.to_path_buf()));
    }
    let csv_err = |source| StoreError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;

    let columns: Vec<Column> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(Column::from_header)
        .collect();

    for (required, name) in [
        (Column::ArtistName, crate::models::ARTIST_NAME),
        (Column::SongName, crate::models::SONG_NAME),
    ] {
        if !columns.contains(&required) {
            return Err(StoreError::MissingColumn {
                path: path.to_path_buf(),
                column: name,
            });
        }
    }

    let mut table = Table::new(columns.clone());
    let mut rejected = 0usize;
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let mut row = SongRow::default();
        for (column, raw) in columns.iter().zip(record.iter()) {
            if !row.set_cell(column, raw) {
                if rejected == 0 {
                    warn!(
                        "{}: {} value {:?} on data row {} is not an integer, reading it as empty",
                        path.display(),
                        column.header(),
                        raw,
                        table.len() + 1
                    );
                }
                rejected += 1;
            }
        }
        table.push(row);
    }
    if rejected > 1 {
        warn!(
            "{}: {} non-integer cells read as empty in total; they are written back empty",
            path.display(),
            rejected
        );
    }

    debug!("Loaded {} rows from {}", table.len(), path.display());
    Ok(table)
}

/// Overwrite `path` with the full table: header of every known column, rows
/// in memory order.
pub fn save(table: &Table, path: &Path) -> Result<(), StoreError> {
    let tmp = temp_path(path);
    let csv_err = |source| StoreError::Csv {
        path: tmp.clone(),
        source,
    };

    {
        let mut writer = csv::Writer::from_path(&tmp).map_err(csv_err)?;
        writer
            .write_record(table.columns().iter().map(Column::header))
            .map_err(csv_err)?;
        for row in table.rows() {
            let cells: Vec<String> = table
                .columns()
                .iter()
                .map(|c| row.cell(c).unwrap_or_default())
                .collect();
            writer.write_record(&cells).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
    }

    fs::rename(&tmp, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// ============================================================================
// Sinks
// ============================================================================

/// Durable destination for checkpoints.
pub trait TableSink {
    fn flush(&mut self, table: &Table) -> Result<(), StoreError>;

    /// Human-readable destination for log messages.
    fn describe(&self) -> String;
}

/// Writes checkpoints to a CSV file.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TableSink for CsvSink {
    fn flush(&mut self, table: &Table) -> Result<(), StoreError> {
        save(table, &self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
