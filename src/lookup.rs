//! Enrichment callers.
//!
//! External services are reached through two seams, [`TrackSearch`] and
//! [`LanguageDetector`], which report faults as [`LookupError`]. The callers
//! in this module are the only place those errors are collapsed into null
//! results: a single failing row is logged and the batch moves on.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Field, Patch, SongRow, TrackMetadata};

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("detection failed: {0}")]
    Detection(String),
}

// ============================================================================
// Seams
// ============================================================================

/// Catalog search: first track matching a free-text query.
pub trait TrackSearch {
    fn search_track(&self, query: &str) -> Result<Option<TrackMetadata>, LookupError>;
}

/// Language identification for a block of text.
pub trait LanguageDetector {
    fn detect(&self, text: &str) -> Result<Option<String>, LookupError>;
}

impl<T: TrackSearch + ?Sized> TrackSearch for &T {
    fn search_track(&self, query: &str) -> Result<Option<TrackMetadata>, LookupError> {
        (**self).search_track(query)
    }
}

impl<T: LanguageDetector + ?Sized> LanguageDetector for &T {
    fn detect(&self, text: &str) -> Result<Option<String>, LookupError> {
        (**self).detect(text)
    }
}

/// One enrichment step of the batch driver.
pub trait Enricher {
    /// Produce a patch for `row`. Never fails.
    fn enrich(&self, row: &SongRow) -> Patch;

    /// Fields this enricher fills.
    fn fields(&self) -> &'static [Field];
}

// ============================================================================
// Catalog Caller
// ============================================================================

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Search query for an (artist, title) pair.
pub fn build_query(artist: &str, title: &str, encode: bool) -> String {
    let joined = format!("{} {}", artist, title);
    let query = WHITESPACE.replace_all(joined.trim(), " ").to_string();
    if encode {
        urlencoding::encode(&query).into_owned()
    } else {
        query
    }
}

/// Which part of a catalog record is merged back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    /// All six metadata fields.
    #[default]
    Full,
    /// Only the track URL.
    UrlOnly,
}

const URL_ONLY: [Field; 1] = [Field::SpotifyUrl];

pub struct MetadataCaller<S> {
    search: S,
    encode_query: bool,
    projection: Projection,
}

impl<S: TrackSearch> MetadataCaller<S> {
    pub fn new(search: S) -> Self {
        Self {
            search,
            encode_query: false,
            projection: Projection::Full,
        }
    }

    pub fn with_encoded_query(mut self, encode: bool) -> Self {
        self.encode_query = encode;
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Look up a song. Misses and faults both come back as an all-null record.
    pub fn lookup(&self, artist: &str, title: &str) -> TrackMetadata {
        let query = build_query(artist, title, self.encode_query);
        match self.search.search_track(&query) {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("No catalog match for '{}'", query);
                TrackMetadata::default()
            }
            Err(e) => {
                warn!("Lookup failed for {} - {}: {}", artist, title, e);
                TrackMetadata::default()
            }
        }
    }
}

impl<S: TrackSearch> Enricher for MetadataCaller<S> {
    fn enrich(&self, row: &SongRow) -> Patch {
        let artist = row.artist.as_deref().unwrap_or_default();
        let title = row.title.as_deref().unwrap_or_default();
        let found = self.lookup(artist, title);
        match self.projection {
            Projection::Full => Patch::Metadata(found),
            Projection::UrlOnly => Patch::SpotifyUrl(found.spotify_url),
        }
    }

    fn fields(&self) -> &'static [Field] {
        match self.projection {
            Projection::Full => &Field::METADATA,
            Projection::UrlOnly => &URL_ONLY,
        }
    }
}

// ============================================================================
// Language Caller
// ============================================================================

const LANGUAGE_ONLY: [Field; 1] = [Field::Language];

pub struct LanguageCaller<D> {
    detector: D,
}

impl<D: LanguageDetector> LanguageCaller<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    /// Language code for `text`, or `None` for empty input or any fault.
    pub fn detect(&self, text: Option<&str>) -> Option<String> {
        let text = text.map(str::trim).filter(|t| !t.is_empty())?;
        match self.detector.detect(text) {
            Ok(code) => code,
            Err(e) => {
                debug!("Language detection failed: {}", e);
                None
            }
        }
    }
}

impl<D: LanguageDetector> Enricher for LanguageCaller<D> {
    fn enrich(&self, row: &SongRow) -> Patch {
        Patch::Language(self.detect(row.lyrics.as_deref()))
    }

    fn fields(&self) -> &'static [Field] {
        &LANGUAGE_ONLY
    }
}
