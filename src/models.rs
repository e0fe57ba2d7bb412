//! Core data models for song table enrichment.
//!
//! This module contains the row and field definitions shared by the store,
//! the reconciler, the enrichment callers and the batch driver.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::fmt;

// ============================================================================
// Natural Key
// ============================================================================

/// The (artist, title) pair identifying a song across tables.
/// Case-sensitive; both components must be present for a row to be keyed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub artist: String,
    pub title: String,
}

impl NaturalKey {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

// ============================================================================
// Columns
// ============================================================================

pub const ARTIST_NAME: &str = "ARTIST_NAME";
pub const SONG_NAME: &str = "SONG_NAME";
pub const LYRICS: &str = "LYRICS";

/// Enrichment fields, each independently nullable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    SpotifyUrl,
    AlbumName,
    AlbumReleaseDate,
    DurationMs,
    Popularity,
    PreviewUrl,
    Language,
}

impl Field {
    /// Fields filled by a full catalog lookup, in output column order.
    pub const METADATA: [Field; 6] = [
        Field::SpotifyUrl,
        Field::AlbumName,
        Field::AlbumReleaseDate,
        Field::DurationMs,
        Field::Popularity,
        Field::PreviewUrl,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Field::SpotifyUrl => "SPOTIFY_URL",
            Field::AlbumName => "ALBUM_NAME",
            Field::AlbumReleaseDate => "ALBUM_RELEASE_DATE",
            Field::DurationMs => "DURATION_MS",
            Field::Popularity => "POPULARITY",
            Field::PreviewUrl => "PREVIEW_URL",
            Field::Language => "LANGUAGE",
        }
    }

    pub fn from_header(header: &str) -> Option<Field> {
        FIELD_BY_HEADER.get(header.trim()).copied()
    }
}

static FIELD_BY_HEADER: Lazy<FxHashMap<&'static str, Field>> = Lazy::new(|| {
    Field::METADATA
        .iter()
        .chain(std::iter::once(&Field::Language))
        .map(|&f| (f.header(), f))
        .collect()
});

/// A column of a song table, in file order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Column {
    ArtistName,
    SongName,
    Lyrics,
    Field(Field),
    /// Any other input column, carried through verbatim.
    Extra(String),
}

impl Column {
    pub fn from_header(header: &str) -> Column {
        match header.trim() {
            ARTIST_NAME => Column::ArtistName,
            SONG_NAME => Column::SongName,
            LYRICS => Column::Lyrics,
            other => match Field::from_header(other) {
                Some(field) => Column::Field(field),
                None => Column::Extra(header.to_string()),
            },
        }
    }

    pub fn header(&self) -> &str {
        match self {
            Column::ArtistName => ARTIST_NAME,
            Column::SongName => SONG_NAME,
            Column::Lyrics => LYRICS,
            Column::Field(field) => field.header(),
            Column::Extra(name) => name,
        }
    }
}

// ============================================================================
// Track Metadata
// ============================================================================

/// Catalog metadata for one song. All fields `None` means "not found".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub spotify_url: Option<String>,
    pub album_name: Option<String>,
    pub album_release_date: Option<String>,
    pub duration_ms: Option<i64>,
    pub popularity: Option<i64>,
    pub preview_url: Option<String>,
}

impl TrackMetadata {
    pub fn is_empty(&self) -> bool {
        *self == TrackMetadata::default()
    }
}

impl fmt::Display for TrackMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "not found");
        }
        write!(
            f,
            "url={} album={} released={} duration_ms={} popularity={}",
            self.spotify_url.as_deref().unwrap_or("-"),
            self.album_name.as_deref().unwrap_or("-"),
            self.album_release_date.as_deref().unwrap_or("-"),
            self.duration_ms.map_or("-".to_string(), |d| d.to_string()),
            self.popularity.map_or("-".to_string(), |p| p.to_string()),
        )
    }
}

// ============================================================================
// Rows
// ============================================================================

/// A song row: natural key, lyrics, enrichment fields and any extra columns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SongRow {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub lyrics: Option<String>,
    pub metadata: TrackMetadata,
    pub language: Option<String>,
    /// Extra columns by header name. Empty cells are not stored.
    pub extra: FxHashMap<String, String>,
}

impl SongRow {
    pub fn new(artist: &str, title: &str) -> Self {
        Self {
            artist: Some(artist.to_string()),
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    pub fn with_lyrics(mut self, lyrics: &str) -> Self {
        self.lyrics = Some(lyrics.to_string());
        self
    }

    /// Natural key, or `None` when either component is missing.
    pub fn key(&self) -> Option<NaturalKey> {
        match (&self.artist, &self.title) {
            (Some(artist), Some(title)) => Some(NaturalKey::new(artist.as_str(), title.as_str())),
            _ => None,
        }
    }

    pub fn is_null(&self, field: Field) -> bool {
        match field {
            Field::SpotifyUrl => self.metadata.spotify_url.is_none(),
            Field::AlbumName => self.metadata.album_name.is_none(),
            Field::AlbumReleaseDate => self.metadata.album_release_date.is_none(),
            Field::DurationMs => self.metadata.duration_ms.is_none(),
            Field::Popularity => self.metadata.popularity.is_none(),
            Field::PreviewUrl => self.metadata.preview_url.is_none(),
            Field::Language => self.language.is_none(),
        }
    }

    /// True when every listed field is null.
    pub fn all_null(&self, fields: &[Field]) -> bool {
        fields.iter().all(|&f| self.is_null(f))
    }

    pub fn clear(&mut self, fields: &[Field]) {
        for &field in fields {
            match field {
                Field::SpotifyUrl => self.metadata.spotify_url = None,
                Field::AlbumName => self.metadata.album_name = None,
                Field::AlbumReleaseDate => self.metadata.album_release_date = None,
                Field::DurationMs => self.metadata.duration_ms = None,
                Field::Popularity => self.metadata.popularity = None,
                Field::PreviewUrl => self.metadata.preview_url = None,
                Field::Language => self.language = None,
            }
        }
    }

    /// Cell text for a column; `None` renders as an empty cell.
    pub fn cell(&self, column: &Column) -> Option<String> {
        match column {
            Column::ArtistName => self.artist.clone(),
            Column::SongName => self.title.clone(),
            Column::Lyrics => self.lyrics.clone(),
            Column::Field(field) => match field {
                Field::SpotifyUrl => self.metadata.spotify_url.clone(),
                Field::AlbumName => self.metadata.album_name.clone(),
                Field::AlbumReleaseDate => self.metadata.album_release_date.clone(),
                Field::DurationMs => self.metadata.duration_ms.map(|v| v.to_string()),
                Field::Popularity => self.metadata.popularity.map(|v| v.to_string()),
                Field::PreviewUrl => self.metadata.preview_url.clone(),
                Field::Language => self.language.clone(),
            },
            Column::Extra(name) => self.extra.get(name).cloned(),
        }
    }

    /// Store a cell read from a file. Empty text is null. Returns false when
    /// a non-empty integer cell could not be parsed and was stored as null.
    pub fn set_cell(&mut self, column: &Column, raw: &str) -> bool {
        let value = if raw.is_empty() {
            None
        } else {
            Some(raw.to_string())
        };
        match column {
            Column::ArtistName => self.artist = value,
            Column::SongName => self.title = value,
            Column::Lyrics => self.lyrics = value,
            Column::Field(field) => match field {
                Field::SpotifyUrl => self.metadata.spotify_url = value,
                Field::AlbumName => self.metadata.album_name = value,
                Field::AlbumReleaseDate => self.metadata.album_release_date = value,
                Field::DurationMs => {
                    self.metadata.duration_ms = parse_int_cell(raw);
                    return self.metadata.duration_ms.is_some() || raw.trim().is_empty();
                }
                Field::Popularity => {
                    self.metadata.popularity = parse_int_cell(raw);
                    return self.metadata.popularity.is_some() || raw.trim().is_empty();
                }
                Field::PreviewUrl => self.metadata.preview_url = value,
                Field::Language => self.language = value,
            },
            Column::Extra(name) => {
                if let Some(v) = value {
                    self.extra.insert(name.clone(), v);
                }
            }
        }
        true
    }
}

/// Parse an integer cell. Accepts "215000" and the "215000.0" form that
/// dataframe tools write for nullable integer columns.
pub fn parse_int_cell(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 => Some(f as i64),
        _ => None,
    }
}

// ============================================================================
// Patches
// ============================================================================

/// The result of one enrichment call, ready to merge into a row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Patch {
    /// Full catalog record (all six metadata fields).
    Metadata(TrackMetadata),
    /// Track URL only.
    SpotifyUrl(Option<String>),
    /// Detected language code.
    Language(Option<String>),
}

impl Patch {
    /// True when the call produced no data at all.
    pub fn is_miss(&self) -> bool {
        match self {
            Patch::Metadata(m) => m.is_empty(),
            Patch::SpotifyUrl(url) => url.is_none(),
            Patch::Language(lang) => lang.is_none(),
        }
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patch::Metadata(m) => write!(f, "{}", m),
            Patch::SpotifyUrl(url) => write!(f, "url={}", url.as_deref().unwrap_or("not found")),
            Patch::Language(lang) => write!(f, "language={}", lang.as_deref().unwrap_or("unknown")),
        }
    }
}
