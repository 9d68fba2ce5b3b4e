use crate::storage::models::{RunStage, RunStatus};

/// Trait for reporting run progress.
///
/// The CLI implements this with indicatif progress bars; tests use
/// [`SilentReporter`]. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_run_start(&self, _run_id: i64) {}
    fn on_stage_start(&self, _stage: RunStage, _total_items: usize) {}
    fn on_stage_progress(&self, _stage: RunStage, _completed: usize, _total: usize) {}
    fn on_stage_complete(&self, _stage: RunStage, _duration_secs: f64) {}
    fn on_item_skipped(&self, _stage: RunStage, _subject: &str, _reason: &str) {}
    fn on_run_complete(&self, _run_id: i64, _status: RunStatus) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
