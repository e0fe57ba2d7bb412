//! Checkpointed batch driver.
//!
//! Walks the pending rows serially, merging each enrichment result into the
//! output table. The table is deduplicated and flushed every `save_interval`
//! processed rows and once more when the loop ends, so an interrupted run
//! loses at most one interval of work. The serial loop plus the explicit
//! pause between calls is what keeps the run under the external rate limit.

use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::lookup::Enricher;
use crate::models::{Patch, SongRow};
use crate::progress::{create_progress_bar, log_progress};
use crate::store::{apply, MergePolicy, StoreError, Table, TableSink};

// ============================================================================
// Configuration
// ============================================================================

/// How results land in the output table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Update the row with the same key, appending only when absent.
    #[default]
    InPlace,
    /// Always append a full row; duplicates are folded at each checkpoint.
    Append,
}

/// A longer pause taken every `every` processed rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cooldown {
    pub every: u64,
    pub duration: Duration,
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Pause between consecutive calls.
    pub wait_time: Duration,
    /// Processed rows between checkpoints. 0 disables intermediate flushes.
    pub save_interval: u64,
    /// Per-run call budget.
    pub max_requests: Option<u64>,
    pub cooldown: Option<Cooldown>,
    pub write_mode: WriteMode,
    pub merge_policy: MergePolicy,
    /// Rows between log-only progress lines.
    pub progress_interval: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_millis(100),
            save_interval: 500,
            max_requests: Some(35_000),
            cooldown: None,
            write_mode: WriteMode::InPlace,
            merge_policy: MergePolicy::Overwrite,
            progress_interval: 100,
        }
    }
}

// ============================================================================
// Throttling
// ============================================================================

pub trait Throttle {
    fn pause(&mut self, duration: Duration);
}

/// Blocks the current thread.
pub struct ThreadSleep;

impl Throttle for ThreadSleep {
    fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Every pending row was processed.
    Exhausted,
    /// `max_requests` reached with rows left over.
    BudgetExhausted,
    /// A checkpoint flush failed; the final flush was still attempted.
    CheckpointFailed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: u64,
    pub found: u64,
    pub missed: u64,
    /// Flushes performed, final flush included.
    pub flushes: u64,
    pub stop: StopReason,
    pub elapsed: Duration,
}

// ============================================================================
// Driver
// ============================================================================

pub struct BatchDriver {
    config: BatchConfig,
}

impl BatchDriver {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    fn checkpoint<S: TableSink + ?Sized>(&self, table: &mut Table, sink: &mut S) -> Result<(), StoreError> {
        let dropped = table.dedup_keep_last();
        if dropped > 0 {
            debug!("Dropped {} superseded rows", dropped);
        }
        sink.flush(table)
    }

    fn merge(&self, table: &mut Table, row: &SongRow, patch: &Patch) {
        match self.config.write_mode {
            WriteMode::InPlace => table.upsert(row, patch, self.config.merge_policy),
            WriteMode::Append => {
                let mut fresh = row.clone();
                apply(&mut fresh, patch, self.config.merge_policy);
                table.push(fresh);
            }
        }
    }

    /// Process `pending` into `table`. Returns an error only when the final
    /// flush fails; everything else ends the loop normally.
    pub fn run<E, S, T>(
        &self,
        pending: &[SongRow],
        enricher: &E,
        table: &mut Table,
        sink: &mut S,
        throttle: &mut T,
    ) -> Result<BatchReport, StoreError>
    where
        E: Enricher + ?Sized,
        S: TableSink + ?Sized,
        T: Throttle + ?Sized,
    {
        let start = Instant::now();
        let mut report = BatchReport {
            processed: 0,
            found: 0,
            missed: 0,
            flushes: 0,
            stop: StopReason::Exhausted,
            elapsed: Duration::ZERO,
        };

        if pending.is_empty() {
            info!("No rows to process");
            return Ok(report);
        }

        table.ensure_fields(enricher.fields());
        let total = pending.len() as u64;
        let pb = create_progress_bar(total, "Enriching");
        let mut request_count: u64 = 0;

        for (i, row) in pending.iter().enumerate() {
            let patch = enricher.enrich(row);
            self.merge(table, row, &patch);

            if patch.is_miss() {
                report.missed += 1;
            } else {
                report.found += 1;
            }
            request_count += 1;
            report.processed = request_count;

            pb.inc(1);
            debug!(
                "[{}/{}] {} {}: {}",
                i + 1,
                total,
                row.artist.as_deref().unwrap_or_default(),
                row.title.as_deref().unwrap_or_default(),
                patch
            );
            log_progress("enrich", request_count, total, self.config.progress_interval);

            if self.config.save_interval > 0 && request_count % self.config.save_interval == 0 {
                info!("Saving progress to {} after {} rows", sink.describe(), request_count);
                match self.checkpoint(table, sink) {
                    Ok(()) => report.flushes += 1,
                    Err(e) => {
                        error!("Checkpoint failed, stopping run: {}", e);
                        report.stop = StopReason::CheckpointFailed;
                        break;
                    }
                }
            }

            let has_more = request_count < total;
            if let Some(max) = self.config.max_requests {
                if request_count >= max {
                    if has_more {
                        info!("Request budget of {} reached, stopping until the next run", max);
                        report.stop = StopReason::BudgetExhausted;
                    }
                    break;
                }
            }

            if has_more {
                throttle.pause(self.config.wait_time);
                if let Some(cooldown) = self.config.cooldown {
                    if cooldown.every > 0 && request_count % cooldown.every == 0 {
                        info!(
                            "Cooling down for {}s after {} rows",
                            cooldown.duration.as_secs(),
                            request_count
                        );
                        throttle.pause(cooldown.duration);
                    }
                }
            }
        }
        pb.finish_with_message(format!("Enriched {} rows", report.processed));

        info!("Saving final table to {}", sink.describe());
        self.checkpoint(table, sink)?;
        report.flushes += 1;
        report.elapsed = start.elapsed();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{LookupError, MetadataCaller, TrackSearch};
    use crate::models::{Column, Field, NaturalKey, Patch, TrackMetadata};
    use std::cell::Cell;

    struct CountingSink {
        flushes: usize,
        fail_on: Option<usize>,
        last_len: usize,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                flushes: 0,
                fail_on: None,
                last_len: 0,
            }
        }
    }

    impl TableSink for CountingSink {
        fn flush(&mut self, table: &Table) -> Result<(), StoreError> {
            self.flushes += 1;
            if self.fail_on == Some(self.flushes) {
                return Err(StoreError::Io {
                    path: "memory".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.last_len = table.len();
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    #[derive(Default)]
    struct RecordingThrottle {
        pauses: Vec<Duration>,
    }

    impl Throttle for RecordingThrottle {
        fn pause(&mut self, duration: Duration) {
            self.pauses.push(duration);
        }
    }

    /// Finds every song except those titled "missing"; faults on "boom".
    struct FakeSearch {
        calls: Cell<u64>,
    }

    impl TrackSearch for FakeSearch {
        fn search_track(&self, query: &str) -> Result<Option<TrackMetadata>, LookupError> {
            self.calls.set(self.calls.get() + 1);
            if query.ends_with("boom") {
                return Err(LookupError::Transport("timeout".to_string()));
            }
            if query.ends_with("missing") {
                return Ok(None);
            }
            Ok(Some(TrackMetadata {
                spotify_url: Some(format!("https://open.spotify.com/track/{}", query)),
                ..Default::default()
            }))
        }
    }

    fn caller() -> MetadataCaller<FakeSearch> {
        MetadataCaller::new(FakeSearch { calls: Cell::new(0) })
    }

    fn rows(n: usize) -> Vec<SongRow> {
        (0..n).map(|i| SongRow::new(&format!("Artist{}", i), "Song")).collect()
    }

    fn config() -> BatchConfig {
        BatchConfig {
            wait_time: Duration::ZERO,
            save_interval: 3,
            max_requests: None,
            ..Default::default()
        }
    }

    fn run(
        cfg: BatchConfig,
        pending: &[SongRow],
        table: &mut Table,
    ) -> (BatchReport, CountingSink, RecordingThrottle) {
        let mut sink = CountingSink::new();
        let mut throttle = RecordingThrottle::default();
        let report = BatchDriver::new(cfg)
            .run(pending, &caller(), table, &mut sink, &mut throttle)
            .unwrap();
        (report, sink, throttle)
    }

    #[test]
    fn test_empty_pending_does_not_flush() {
        let mut table = Table::empty();
        let (report, sink, _) = run(config(), &[], &mut table);
        assert_eq!(report.processed, 0);
        assert_eq!(sink.flushes, 0);
    }

    #[test]
    fn test_checkpoint_count_is_bounded() {
        for (n, expected) in [(10usize, 4usize), (9, 4), (2, 1), (1, 1)] {
            let mut table = Table::empty();
            let (report, sink, _) = run(config(), &rows(n), &mut table);
            assert_eq!(report.processed, n as u64);
            assert_eq!(sink.flushes, expected, "n = {}", n);
            let bound = (n + 2) / 3 + 1;
            assert!(sink.flushes <= bound);
            assert_eq!(sink.last_len, n);
        }
    }

    #[test]
    fn test_budget_cutoff_processes_exactly_k() {
        let mut table = Table::empty();
        let cfg = BatchConfig {
            max_requests: Some(2),
            ..config()
        };
        let (report, sink, _) = run(cfg, &rows(5), &mut table);
        assert_eq!(report.processed, 2);
        assert_eq!(report.stop, StopReason::BudgetExhausted);
        assert_eq!(sink.flushes, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_budget_equal_to_pending_is_exhausted() {
        let mut table = Table::empty();
        let cfg = BatchConfig {
            max_requests: Some(3),
            save_interval: 0,
            ..config()
        };
        let (report, _, _) = run(cfg, &rows(3), &mut table);
        assert_eq!(report.stop, StopReason::Exhausted);
    }

    #[test]
    fn test_row_fault_does_not_abort_batch() {
        let pending = vec![
            SongRow::new("A", "X"),
            SongRow::new("B", "boom"),
            SongRow::new("C", "missing"),
            SongRow::new("D", "W"),
        ];
        let mut table = Table::empty();
        let (report, _, _) = run(config(), &pending, &mut table);
        assert_eq!(report.processed, 4);
        assert_eq!(report.found, 2);
        assert_eq!(report.missed, 2);
        assert!(table.get(&NaturalKey::new("B", "boom")).unwrap().metadata.is_empty());
        assert!(table.get(&NaturalKey::new("D", "W")).unwrap().metadata.spotify_url.is_some());
    }

    #[test]
    fn test_wait_between_calls_but_not_after_last() {
        let mut table = Table::empty();
        let cfg = BatchConfig {
            wait_time: Duration::from_millis(100),
            ..config()
        };
        let (_, _, throttle) = run(cfg, &rows(3), &mut table);
        assert_eq!(throttle.pauses, vec![Duration::from_millis(100); 2]);
    }

    #[test]
    fn test_no_wait_after_budget_cutoff() {
        let mut table = Table::empty();
        let cfg = BatchConfig {
            wait_time: Duration::from_millis(100),
            max_requests: Some(2),
            ..config()
        };
        let (_, _, throttle) = run(cfg, &rows(5), &mut table);
        assert_eq!(throttle.pauses.len(), 1);
    }

    #[test]
    fn test_cooldown_every_n_rows() {
        let mut table = Table::empty();
        let cfg = BatchConfig {
            cooldown: Some(Cooldown {
                every: 2,
                duration: Duration::from_secs(30),
            }),
            ..config()
        };
        let (_, _, throttle) = run(cfg, &rows(5), &mut table);
        let cooldowns = throttle
            .pauses
            .iter()
            .filter(|d| **d == Duration::from_secs(30))
            .count();
        assert_eq!(cooldowns, 2);
    }

    #[test]
    fn test_append_mode_folds_stale_rows() {
        let mut table = Table::empty();
        let mut stale = SongRow::new("A", "X");
        stale.metadata.spotify_url = Some("stale".to_string());
        table.push(stale);
        table.push(SongRow::new("B", "Y"));

        let cfg = BatchConfig {
            write_mode: WriteMode::Append,
            ..config()
        };
        let (_, sink, _) = run(cfg, &[SongRow::new("A", "X")], &mut table);
        assert_eq!(sink.last_len, 2);
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(&NaturalKey::new("A", "X")).unwrap().metadata.spotify_url.as_deref(),
            Some("https://open.spotify.com/track/A X")
        );
        assert_eq!(table.rows()[1].key(), Some(NaturalKey::new("A", "X")));
    }

    #[test]
    fn test_keep_existing_policy_survives_a_miss() {
        let mut table = Table::empty();
        let mut done = SongRow::new("C", "missing");
        done.metadata.spotify_url = Some("good".to_string());
        table.push(done);

        let cfg = BatchConfig {
            merge_policy: MergePolicy::KeepExisting,
            ..config()
        };
        run(cfg, &[SongRow::new("C", "missing")], &mut table);
        assert_eq!(
            table.get(&NaturalKey::new("C", "missing")).unwrap().metadata.spotify_url.as_deref(),
            Some("good")
        );
    }

    #[test]
    fn test_checkpoint_failure_stops_and_still_flushes() {
        let mut table = Table::empty();
        let mut sink = CountingSink::new();
        sink.fail_on = Some(1);
        let mut throttle = RecordingThrottle::default();
        let report = BatchDriver::new(config())
            .run(&rows(10), &caller(), &mut table, &mut sink, &mut throttle)
            .unwrap();
        assert_eq!(report.stop, StopReason::CheckpointFailed);
        assert_eq!(report.processed, 3);
        assert_eq!(sink.flushes, 2);
        assert_eq!(sink.last_len, 3);
    }

    #[test]
    fn test_adds_enrichment_columns() {
        let mut table = Table::new(vec![Column::ArtistName, Column::SongName]);
        run(config(), &rows(1), &mut table);
        assert!(table.has_column(&Column::Field(Field::PreviewUrl)));
    }

    #[test]
    fn test_patch_display_used_in_logs() {
        let patch = Patch::SpotifyUrl(None);
        assert_eq!(patch.to_string(), "url=not found");
    }
}
