use std::path::Path;

use anyhow::{Context, Result};
use runcmd_core::write_text_atomic;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of comparing a configuration version against the persisted marker.
pub enum SequenceDecision {
    /// The candidate is newer; it has been persisted and should be processed.
    Proceed,
    /// A version at least as new was already processed.
    AlreadyProcessed { persisted: u64 },
}

/// Reads the persisted sequence number. A missing marker means nothing was processed yet.
pub fn read_sequence_number(path: &Path) -> Result<Option<u64>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read sequence marker {}", path.display()))
        }
    };
    let value = raw.trim().parse::<u64>().with_context(|| {
        format!(
            "sequence marker {} does not contain a sequence number: '{}'",
            path.display(),
            raw.trim()
        )
    })?;
    Ok(Some(value))
}

/// Accepts `candidate` only when it is strictly greater than the persisted value, in which
/// case the marker is overwritten with it. Callers serialize invocations for one extension;
/// the read-then-write is not atomic across processes.
pub fn check_and_advance(path: &Path, candidate: u64) -> Result<SequenceDecision> {
    debug!(path = %path.display(), candidate, "comparing sequence number");
    if let Some(persisted) = read_sequence_number(path)? {
        if candidate <= persisted {
            return Ok(SequenceDecision::AlreadyProcessed { persisted });
        }
    }
    write_text_atomic(path, &candidate.to_string())
        .with_context(|| format!("failed to save sequence number {candidate}"))?;
    info!(path = %path.display(), seq_num = candidate, "sequence number saved");
    Ok(SequenceDecision::Proceed)
}
