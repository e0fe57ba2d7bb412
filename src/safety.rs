//! Safety utilities to prevent losing enrichment progress.
//!
//! Two guards: the output path is validated so a run can never overwrite its
//! own input, and an advisory lock file keeps two runs from interleaving
//! whole-table writes to the same output.

use anyhow::{bail, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Validates that an output path is safe to overwrite.
///
/// Checks:
/// - Output must have a `.csv` extension
/// - Output cannot resolve to the same file as the input
pub fn validate_output_path(output: &Path, input: &Path) -> Result<()> {
    let is_csv = output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if !is_csv {
        bail!(
            "Safety check failed: output file '{}' must have a .csv extension",
            output.display()
        );
    }

    if output == input || same_file(output, input) {
        bail!(
            "Safety check failed: output '{}' cannot be the same as input '{}'",
            output.display(),
            input.display()
        );
    }

    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

// ============================================================================
// Output Lock
// ============================================================================

#[derive(Debug, Error)]
pub enum LockError {
    #[error("output {} is locked by another run (lock file {})", .output.display(), .lock.display())]
    Held { output: PathBuf, lock: PathBuf },
    #[error("cannot create lock file {}: {source}", .lock.display())]
    Io {
        lock: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Advisory single-writer lock: `<output>.lock`, created exclusively and
/// removed on drop. A crashed run leaves the file behind; delete it by hand.
#[derive(Debug)]
pub struct OutputLock {
    path: PathBuf,
}

impl OutputLock {
    pub fn lock_path(output: &Path) -> PathBuf {
        let mut name = output
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        output.with_file_name(name)
    }

    pub fn acquire(output: &Path) -> Result<Self, LockError> {
        let path = Self::lock_path(output);
        let mut file: File = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held {
                    output: output.to_path_buf(),
                    lock: path,
                })
            }
            Err(source) => return Err(LockError::Io { lock: path, source }),
        };
        // Owner pid, for whoever finds a stale lock.
        let _ = writeln!(file, "{}", std::process::id());
        debug!("Acquired output lock {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}
