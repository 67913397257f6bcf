//! Staleness-safe commit protocol for long-running fill mutations
//! (background removal, vectorization, upscaling).
//!
//! State lives in block metadata so that UI code can observe it:
//!
//! ```text
//! Idle -> Processing -> Processed | Error
//! Processed | Error -> Idle          (reset, or a new run)
//! ```
//!
//! A run only writes while it is still *current*: the block exists, its fill
//! identity is the one captured at start, and the metadata for that fill is
//! `Processing` with this run's id. Anything else means the user reset,
//! deleted or redirected the target, and the run's writes are dropped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::{BlockId, EngineApi, FillId, FillSource};
use crate::error::{EngineError, GenError};

const METADATA_PREFIX: &str = "gencore/processing/";

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Source of unique run ids within this process.
static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Idle,
    Processing,
    Processed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub key: String,
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub status: ProcessingStatus,
    pub run_id: u64,
    /// Fill source before the mutation started, used for rollback and reset.
    pub original: Option<FillSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a run ended. Failures are reported here and in metadata, never as
/// errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Committed,
    /// The target changed underneath the run; the result was dropped.
    Discarded,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessingOptions {
    pub progress_interval: Duration,
    pub cancellation: CancellationToken,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            cancellation: CancellationToken::new(),
        }
    }
}

fn metadata_key(fill: FillId) -> String {
    format!("{METADATA_PREFIX}{fill}")
}

fn read_metadata(engine: &dyn EngineApi, block: BlockId, fill: FillId) -> Option<ProcessingMetadata> {
    let raw = engine.metadata(block, &metadata_key(fill)).ok()??;
    match serde_json::from_str(&raw) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            tracing::warn!(block = %block, error = %e, "ignoring malformed processing metadata");
            None
        }
    }
}

fn write_metadata(
    engine: &dyn EngineApi,
    block: BlockId,
    fill: FillId,
    metadata: &ProcessingMetadata,
) -> Result<(), GenError> {
    let raw = serde_json::to_string(metadata)
        .map_err(|e| GenError::Other(format!("failed to encode processing metadata: {e}")))?;
    engine.set_metadata(block, &metadata_key(fill), &raw)?;
    Ok(())
}

/// Identity of one run, captured at start.
#[derive(Debug, Clone, Copy)]
struct RunTicket {
    block: BlockId,
    fill: FillId,
    run_id: u64,
}

impl RunTicket {
    fn current_metadata(&self, engine: &dyn EngineApi) -> Option<ProcessingMetadata> {
        if !engine.is_valid(self.block) {
            return None;
        }
        if engine.fill(self.block) != Ok(Some(self.fill)) {
            return None;
        }
        read_metadata(engine, self.block, self.fill)
            .filter(|m| m.status == ProcessingStatus::Processing && m.run_id == self.run_id)
    }

    fn is_current(&self, engine: &dyn EngineApi) -> bool {
        self.current_metadata(engine).is_some()
    }
}

#[derive(Debug, Default)]
struct Throttle {
    last_write: Option<Instant>,
    /// Newest update held back by the interval.
    pending: Option<Progress>,
}

/// Coalescing progress sink handed to the processor.
///
/// At most one write per interval reaches the block metadata. Updates that
/// arrive inside the interval replace each other; the newest one is written
/// by the next report after the interval or by [`ProgressReporter::flush`].
#[derive(Clone)]
pub struct ProgressReporter {
    engine: Arc<dyn EngineApi>,
    ticket: RunTicket,
    interval: Duration,
    throttle: Arc<Mutex<Throttle>>,
}

impl ProgressReporter {
    /// Record progress. Returns true when it was written to the block
    /// metadata now, false when it was held back or the run is no longer
    /// current.
    pub fn report(&self, progress: Progress) -> bool {
        let Ok(mut throttle) = self.throttle.lock() else {
            return false;
        };
        if throttle.last_write.is_some_and(|at| at.elapsed() < self.interval) {
            throttle.pending = Some(progress);
            return false;
        }
        throttle.pending = None;
        self.write(&mut throttle, progress)
    }

    /// Write the held-back update, if any, regardless of the interval.
    pub fn flush(&self) -> bool {
        let Ok(mut throttle) = self.throttle.lock() else {
            return false;
        };
        match throttle.pending.take() {
            Some(progress) => self.write(&mut throttle, progress),
            None => false,
        }
    }

    fn write(&self, throttle: &mut Throttle, progress: Progress) -> bool {
        let Some(mut metadata) = self.ticket.current_metadata(&*self.engine) else {
            return false;
        };
        metadata.progress = Some(progress);
        match write_metadata(&*self.engine, self.ticket.block, self.ticket.fill, &metadata) {
            Ok(()) => {
                throttle.last_write = Some(Instant::now());
                true
            }
            Err(e) => {
                tracing::debug!(block = %self.ticket.block, error = %e, "progress write failed");
                false
            }
        }
    }
}

/// Current processing metadata of the block's fill, if any.
pub fn processing_metadata(
    engine: &dyn EngineApi,
    block: BlockId,
) -> Result<Option<ProcessingMetadata>, GenError> {
    let fill = engine.fill(block)?.ok_or(EngineError::NoFill(block))?;
    Ok(read_metadata(engine, block, fill))
}

pub fn processing_state(engine: &dyn EngineApi, block: BlockId) -> Result<ProcessingStatus, GenError> {
    Ok(processing_metadata(engine, block)?.map_or(ProcessingStatus::Idle, |m| m.status))
}

/// Put the original fill source back and return to `Idle`. Any run still in
/// flight for this fill becomes stale.
pub fn reset_processing(engine: &dyn EngineApi, block: BlockId) -> Result<(), GenError> {
    let fill = engine.fill(block)?.ok_or(EngineError::NoFill(block))?;
    if let Some(metadata) = read_metadata(engine, block, fill) {
        if let Some(original) = metadata.original {
            engine.set_fill_source(fill, original)?;
        }
        engine.remove_metadata(block, &metadata_key(fill))?;
        tracing::debug!(block = %block, previous = ?metadata.status, "processing reset");
    }
    Ok(())
}

/// Drive an asynchronous mutation of `block`'s fill.
///
/// Errors are returned when the run cannot start (invalid block, no fill) or
/// when the engine rejects the commit. Processor failures and cancellation are
/// reported as a [`ProcessingOutcome`].
pub async fn process_fill<F, Fut>(
    engine: Arc<dyn EngineApi>,
    block: BlockId,
    options: &ProcessingOptions,
    processor: F,
) -> Result<ProcessingOutcome, GenError>
where
    F: FnOnce(FillSource, ProgressReporter) -> Fut,
    Fut: Future<Output = Result<FillSource, GenError>>,
{
    if !engine.is_valid(block) {
        return Err(EngineError::InvalidBlock(block).into());
    }
    let fill = engine.fill(block)?.ok_or(EngineError::NoFill(block))?;

    // A run restarted mid-flight must keep the source captured by the first
    // run: the live fill is already cleared.
    let original = match read_metadata(&*engine, block, fill) {
        Some(ProcessingMetadata {
            status: ProcessingStatus::Processing,
            original: Some(original),
            ..
        }) => original,
        _ => engine.fill_source(fill)?,
    };

    let ticket = RunTicket {
        block,
        fill,
        run_id: RUN_COUNTER.fetch_add(1, Ordering::Relaxed),
    };
    write_metadata(
        &*engine,
        block,
        fill,
        &ProcessingMetadata {
            status: ProcessingStatus::Processing,
            run_id: ticket.run_id,
            original: Some(original.clone()),
            progress: None,
            error: None,
        },
    )?;
    engine.set_fill_source(fill, FillSource::default())?;
    tracing::debug!(block = %block, run_id = ticket.run_id, "fill processing started");

    let reporter = ProgressReporter {
        engine: engine.clone(),
        ticket,
        interval: options.progress_interval,
        throttle: Arc::new(Mutex::new(Throttle::default())),
    };
    let flusher = reporter.clone();

    let result = tokio::select! {
        _ = options.cancellation.cancelled() => Err(GenError::Cancelled),
        result = processor(original.clone(), reporter) => result,
    };

    match result {
        Ok(_) if options.cancellation.is_cancelled() => Ok(cancel(&*engine, ticket, original)),
        Ok(source) => {
            flusher.flush();
            let Some(current) = ticket.current_metadata(&*engine) else {
                tracing::warn!(block = %block, run_id = ticket.run_id, "target changed while processing, result discarded");
                return Ok(ProcessingOutcome::Discarded);
            };
            engine.set_fill_source(fill, source)?;
            write_metadata(
                &*engine,
                block,
                fill,
                &ProcessingMetadata {
                    status: ProcessingStatus::Processed,
                    run_id: ticket.run_id,
                    original: Some(original),
                    progress: current.progress,
                    error: None,
                },
            )?;
            engine.add_undo_step();
            tracing::debug!(block = %block, run_id = ticket.run_id, "fill processing committed");
            Ok(ProcessingOutcome::Committed)
        }
        Err(GenError::Cancelled) => Ok(cancel(&*engine, ticket, original)),
        Err(e) => {
            let message = e.to_string();
            tracing::error!(block = %block, run_id = ticket.run_id, error = %e, "fill processing failed");
            if ticket.is_current(&*engine) {
                let rollback = engine.set_fill_source(fill, original.clone());
                if let Err(e) = rollback {
                    tracing::warn!(block = %block, error = %e, "rollback after failure failed");
                }
                let written = write_metadata(
                    &*engine,
                    block,
                    fill,
                    &ProcessingMetadata {
                        status: ProcessingStatus::Error,
                        run_id: ticket.run_id,
                        original: Some(original),
                        progress: None,
                        error: Some(message.clone()),
                    },
                );
                if let Err(e) = written {
                    tracing::warn!(block = %block, error = %e, "failed to record processing error");
                }
            }
            Ok(ProcessingOutcome::Failed(message))
        }
    }
}

fn cancel(engine: &dyn EngineApi, ticket: RunTicket, original: FillSource) -> ProcessingOutcome {
    if ticket.is_current(engine) {
        if let Err(e) = engine.set_fill_source(ticket.fill, original) {
            tracing::warn!(block = %ticket.block, error = %e, "rollback after cancellation failed");
        }
        if let Err(e) = engine.remove_metadata(ticket.block, &metadata_key(ticket.fill)) {
            tracing::warn!(block = %ticket.block, error = %e, "failed to clear processing metadata");
        }
    }
    tracing::info!(block = %ticket.block, run_id = ticket.run_id, "fill processing cancelled");
    ProcessingOutcome::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_in_upper_case() {
        let json = serde_json::to_string(&ProcessingStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
    }

    #[test]
    fn metadata_keys_are_per_fill() {
        assert_ne!(metadata_key(FillId(1)), metadata_key(FillId(2)));
        assert!(metadata_key(FillId(7)).starts_with(METADATA_PREFIX));
    }
}
