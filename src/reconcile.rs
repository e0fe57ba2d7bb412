//! Natural-key reconciliation between an original table and a partially
//! enriched output.
//!
//! The pending set is recomputed from the two tables on every run instead of
//! being tracked in a status column, so a hand-edited output never drifts.

use crate::models::{Field, SongRow};
use crate::store::Table;

/// Which output rows count as already processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingRule<'a> {
    /// Pending iff the key is absent from the output.
    MissingKey,
    /// Pending iff the key is absent, or present with all `fields` null.
    MissingOrEmpty(&'a [Field]),
}

/// Rows of `original` that still need enrichment, in original order, with
/// `fields` reset to null. Rows without a complete natural key never pend.
pub fn pending(
    original: &Table,
    output: &Table,
    rule: PendingRule<'_>,
    fields: &[Field],
) -> Vec<SongRow> {
    let existing = output.keys();

    original
        .rows()
        .iter()
        .filter(|row| {
            let Some(key) = row.key() else {
                return false;
            };
            if !existing.contains(&key) {
                return true;
            }
            match rule {
                PendingRule::MissingKey => false,
                PendingRule::MissingOrEmpty(empty_fields) => output
                    .get(&key)
                    .is_some_and(|done| done.all_null(empty_fields)),
            }
        })
        .map(|row| {
            let mut row = row.clone();
            row.clear(fields);
            row
        })
        .collect()
}

/// Rows of `original` without a complete natural key. They are never
/// pending, so a fresh output copies them over unchanged.
pub fn keyless(original: &Table) -> impl Iterator<Item = &SongRow> {
    original.rows().iter().filter(|row| row.key().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, NaturalKey, Patch, TrackMetadata};
    use crate::store::MergePolicy;

    fn table(keys: &[(&str, &str)]) -> Table {
        Table::from_rows(
            vec![Column::ArtistName, Column::SongName, Column::Lyrics],
            keys.iter().map(|(a, t)| SongRow::new(a, t).with_lyrics("la")).collect(),
        )
    }

    fn found(url: &str) -> Patch {
        Patch::Metadata(TrackMetadata {
            spotify_url: Some(url.to_string()),
            ..Default::default()
        })
    }

    fn keys(rows: &[SongRow]) -> Vec<NaturalKey> {
        rows.iter().filter_map(SongRow::key).collect()
    }

    #[test]
    fn test_empty_output_returns_everything() {
        let original = table(&[("A", "X"), ("B", "Y"), ("C", "Z")]);
        let rows = pending(&original, &Table::empty(), PendingRule::MissingKey, &Field::METADATA);
        assert_eq!(
            keys(&rows),
            vec![
                NaturalKey::new("A", "X"),
                NaturalKey::new("B", "Y"),
                NaturalKey::new("C", "Z")
            ]
        );
    }

    #[test]
    fn test_set_difference_preserves_original_order() {
        let original = table(&[("C", "Z"), ("A", "X"), ("B", "Y")]);
        let output = table(&[("A", "X")]);
        let rows = pending(&original, &output, PendingRule::MissingKey, &Field::METADATA);
        assert_eq!(keys(&rows), vec![NaturalKey::new("C", "Z"), NaturalKey::new("B", "Y")]);
    }

    #[test]
    fn test_pending_rows_have_enrichment_reset() {
        let mut original = table(&[("A", "X")]);
        original.get_mut(&NaturalKey::new("A", "X")).unwrap().metadata.spotify_url =
            Some("stale".to_string());
        original.get_mut(&NaturalKey::new("A", "X")).unwrap().language = Some("eng".to_string());
        let rows = pending(&original, &Table::empty(), PendingRule::MissingKey, &Field::METADATA);
        assert!(rows[0].metadata.is_empty());
        assert_eq!(rows[0].language.as_deref(), Some("eng"));
        assert_eq!(rows[0].lyrics.as_deref(), Some("la"));
    }

    #[test]
    fn test_keyless_rows_never_pend() {
        let mut original = table(&[("A", "X")]);
        let mut keyless = SongRow::new("B", "Y");
        keyless.artist = None;
        original.push(keyless);
        let rows = pending(&original, &Table::empty(), PendingRule::MissingKey, &Field::METADATA);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_missing_or_empty_retries_null_rows() {
        let original = table(&[("A", "X"), ("B", "Y")]);
        let mut output = table(&[("A", "X"), ("B", "Y")]);
        output.upsert(&SongRow::new("A", "X"), &found("u"), MergePolicy::Overwrite);

        let strict = pending(&original, &output, PendingRule::MissingKey, &Field::METADATA);
        assert!(strict.is_empty());

        let retry = pending(
            &original,
            &output,
            PendingRule::MissingOrEmpty(&Field::METADATA),
            &Field::METADATA,
        );
        assert_eq!(keys(&retry), vec![NaturalKey::new("B", "Y")]);
    }

    #[test]
    fn test_reconciliation_is_idempotent_after_processing() {
        let original = table(&[("A", "X"), ("B", "Y"), ("C", "Z"), ("D", "W")]);
        let mut output = table(&[("B", "Y")]);
        let todo = pending(&original, &output, PendingRule::MissingKey, &Field::METADATA);
        assert_eq!(todo.len(), 3);
        for row in &todo {
            output.upsert(row, &Patch::Metadata(TrackMetadata::default()), MergePolicy::Overwrite);
        }
        assert!(pending(&original, &output, PendingRule::MissingKey, &Field::METADATA).is_empty());
    }

    #[test]
    fn test_partial_batch_shrinks_pending_set() {
        let original = table(&[("A", "X"), ("B", "Y"), ("C", "Z")]);
        let mut output = Table::empty();
        let before = pending(&original, &output, PendingRule::MissingKey, &Field::METADATA);
        output.upsert(&before[0], &found("u"), MergePolicy::Overwrite);
        let after = pending(&original, &output, PendingRule::MissingKey, &Field::METADATA);
        assert!(after.len() < before.len());
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn test_keyless_rows_in_original_order() {
        let mut no_artist = SongRow::new("", "Untitled").with_lyrics("one");
        no_artist.artist = None;
        let mut no_title = SongRow::new("B", "").with_lyrics("two");
        no_title.title = None;
        let original = Table::from_rows(
            vec![Column::ArtistName, Column::SongName, Column::Lyrics],
            vec![SongRow::new("A", "X"), no_artist, SongRow::new("C", "Z"), no_title],
        );
        let lyrics: Vec<_> = keyless(&original).map(|r| r.lyrics.as_deref()).collect();
        assert_eq!(lyrics, [Some("one"), Some("two")]);
    }
}
