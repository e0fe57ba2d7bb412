//! Per-run orchestration: load, reconcile, enrich, report.
//!
//! The three enrichment variants differ only in their enricher, their pending
//! rule and their batch settings; everything else runs through [`run`].

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::batch::{BatchConfig, BatchDriver, BatchReport, StopReason, Throttle};
use crate::lookup::Enricher;
use crate::models::Column;
use crate::progress::{create_spinner, format_duration};
use crate::reconcile::{keyless, pending, PendingRule};
use crate::safety::OutputLock;
use crate::store::{self, CsvSink, StoreError, Table};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Metadata,
    Urls,
    Language,
}

impl Variant {
    /// Input columns the variant cannot run without.
    fn requires_lyrics(self) -> bool {
        matches!(self, Variant::Language)
    }
}

#[derive(Clone, Debug)]
pub struct RunPlan {
    pub variant: Variant,
    pub input: PathBuf,
    pub output: PathBuf,
    pub batch: BatchConfig,
    /// Treat rows present in the output with every enrichment field null as
    /// pending again.
    pub retry_empty: bool,
    /// Hold `<output>.lock` for the duration of the run.
    pub lock_output: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was pending; the output was not touched.
    NothingToDo,
    Completed(BatchReport),
    /// Budget reached; the rest is picked up by the next run.
    BudgetExhausted(BatchReport),
    /// Failed before processing any row.
    AbortedBeforeWork(String),
    /// Failed after processing rows; the last successful flush survives.
    AbortedMidRun {
        report: Option<BatchReport>,
        reason: String,
    },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::NothingToDo | RunOutcome::Completed(_) | RunOutcome::BudgetExhausted(_) => 0,
            RunOutcome::AbortedBeforeWork(_) => 2,
            RunOutcome::AbortedMidRun { .. } => 3,
        }
    }

    pub fn report(&self) -> Option<&BatchReport> {
        match self {
            RunOutcome::Completed(r) | RunOutcome::BudgetExhausted(r) => Some(r),
            RunOutcome::AbortedMidRun { report, .. } => report.as_ref(),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RunOutcome::NothingToDo => "nothing_to_do",
            RunOutcome::Completed(_) => "completed",
            RunOutcome::BudgetExhausted(_) => "budget_exhausted",
            RunOutcome::AbortedBeforeWork(_) => "aborted_before_work",
            RunOutcome::AbortedMidRun { .. } => "aborted_mid_run",
        }
    }
}

/// Machine-readable summary of one run (`--stats`).
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub variant: Variant,
    pub input: PathBuf,
    pub output: PathBuf,
    pub outcome: &'static str,
    pub pending: u64,
    pub processed: u64,
    pub found: u64,
    pub missed: u64,
    pub flushes: u64,
    pub elapsed_secs: f64,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(plan: &RunPlan, pending: u64, outcome: &RunOutcome) -> Self {
        let report = outcome.report();
        let error = match outcome {
            RunOutcome::AbortedBeforeWork(reason) | RunOutcome::AbortedMidRun { reason, .. } => {
                Some(reason.clone())
            }
            _ => None,
        };
        Self {
            variant: plan.variant,
            input: plan.input.clone(),
            output: plan.output.clone(),
            outcome: outcome.label(),
            pending,
            processed: report.map_or(0, |r| r.processed),
            found: report.map_or(0, |r| r.found),
            missed: report.map_or(0, |r| r.missed),
            flushes: report.map_or(0, |r| r.flushes),
            elapsed_secs: report.map_or(0.0, |r| r.elapsed.as_secs_f64()),
            error,
        }
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

fn load_input(plan: &RunPlan) -> Result<Table, String> {
    let spinner = create_spinner("Loading input");
    let loaded = store::load(&plan.input);
    spinner.finish_and_clear();

    let original = loaded.map_err(|e| match e {
        StoreError::NotFound(path) => format!(
            "Input file {} was not found, check the path",
            path.display()
        ),
        other => format!("Failed to load input: {}", other),
    })?;

    if plan.variant.requires_lyrics() && !original.has_column(&Column::Lyrics) {
        return Err(format!(
            "Input {} has no {} column",
            plan.input.display(),
            crate::models::LYRICS
        ));
    }
    info!("Loaded {} input rows from {}", original.len(), plan.input.display());
    Ok(original)
}

/// Load the prior output, or start a fresh one holding only the original's
/// keyless rows. The flag is true for a fresh table.
fn load_output(plan: &RunPlan, original: &Table) -> Result<(Table, bool), String> {
    match store::load(&plan.output) {
        Ok(existing) => {
            info!(
                "Output {} found with {} rows, checking for missing rows",
                plan.output.display(),
                existing.len()
            );
            Ok((existing, false))
        }
        Err(StoreError::NotFound(_)) => {
            info!("Output {} not found, starting from scratch", plan.output.display());
            let mut table = Table::new(original.columns().to_vec());
            for row in keyless(original) {
                table.push(row.clone());
            }
            if !table.is_empty() {
                info!("Carrying over {} rows without artist or title", table.len());
            }
            Ok((table, true))
        }
        Err(e) => Err(format!("Failed to load existing output: {}", e)),
    }
}

/// Execute one enrichment run. Returns the outcome and the size of the
/// pending set that was computed.
pub fn run<E, T>(plan: &RunPlan, enricher: &E, throttle: &mut T) -> (RunOutcome, u64)
where
    E: Enricher + ?Sized,
    T: Throttle + ?Sized,
{
    let _lock = if plan.lock_output {
        match OutputLock::acquire(&plan.output) {
            Ok(lock) => Some(lock),
            Err(e) => {
                error!("{}", e);
                return (RunOutcome::AbortedBeforeWork(e.to_string()), 0);
            }
        }
    } else {
        None
    };

    let original = match load_input(plan) {
        Ok(t) => t,
        Err(reason) => {
            error!("{}", reason);
            return (RunOutcome::AbortedBeforeWork(reason), 0);
        }
    };

    let (mut table, fresh) = match load_output(plan, &original) {
        Ok(t) => t,
        Err(reason) => {
            error!("{}", reason);
            return (RunOutcome::AbortedBeforeWork(reason), 0);
        }
    };
    table.adopt_columns(original.columns());

    let fields = enricher.fields();
    let rule = if plan.retry_empty {
        PendingRule::MissingOrEmpty(fields)
    } else {
        PendingRule::MissingKey
    };
    let todo = pending(&original, &table, rule, fields);
    let pending_count = todo.len() as u64;
    info!("Rows left to process: {}", pending_count);

    if todo.is_empty() {
        info!("No rows to process");
        if fresh && !table.is_empty() {
            table.ensure_fields(fields);
            if let Err(e) = store::save(&table, &plan.output) {
                error!("Failed to save output: {}", e);
                return (
                    RunOutcome::AbortedMidRun {
                        report: None,
                        reason: e.to_string(),
                    },
                    0,
                );
            }
        }
        return (RunOutcome::NothingToDo, 0);
    }

    let mut sink = CsvSink::new(&plan.output);
    let driver = BatchDriver::new(plan.batch.clone());
    let outcome = match driver.run(&todo, enricher, &mut table, &mut sink, throttle) {
        Ok(report) => {
            info!(
                "Processed {} rows ({} found, {} missed) in {}, {} saves",
                report.processed,
                report.found,
                report.missed,
                format_duration(report.elapsed),
                report.flushes
            );
            match report.stop {
                StopReason::Exhausted => RunOutcome::Completed(report),
                StopReason::BudgetExhausted => {
                    warn!(
                        "Request limit reached; {} rows remain for the next run",
                        pending_count - report.processed
                    );
                    RunOutcome::BudgetExhausted(report)
                }
                StopReason::CheckpointFailed => RunOutcome::AbortedMidRun {
                    reason: "checkpoint flush failed".to_string(),
                    report: Some(report),
                },
            }
        }
        Err(e) => {
            error!("Final save failed: {}", e);
            RunOutcome::AbortedMidRun {
                report: None,
                reason: e.to_string(),
            }
        }
    };

    (outcome, pending_count)
}
