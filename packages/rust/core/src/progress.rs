//! Progress callbacks for long-running pipeline runs.

use regwatch_shared::{PipelineRun, Stage};

/// Callback trait for pipeline progress reporting.
///
/// Calls come from worker tasks, possibly several at once.
pub trait ProgressReporter: Send + Sync {
    /// Called when the run enters a new stage.
    fn phase(&self, stage: Stage);
    /// Called after an adapter call returns for a source.
    fn source_fetched(&self, source: &str, items: usize);
    /// Called after an item reaches a terminal state.
    fn item_done(&self, source: &str, current: usize, total: usize);
    /// Called once when the run stops (completed, cancelled or failed).
    fn done(&self, run: &PipelineRun);
}

/// No-op progress reporter.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _stage: Stage) {}
    fn source_fetched(&self, _source: &str, _items: usize) {}
    fn item_done(&self, _source: &str, _current: usize, _total: usize) {}
    fn done(&self, _run: &PipelineRun) {}
}
