//! Adapter call harness.
//!
//! Wraps every adapter call so the contract holds even for misbehaving
//! adapters: a cumulative timeout, panic isolation, item and age limits.
//! The harness never returns an error; failures travel in [`AdapterOutput`].

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, instrument, warn};

use regwatch_shared::{RegwatchError, SourceConfig, SourceLimits};

use crate::adapters::{AdapterOutput, SourceAdapter};

/// Run one adapter call under the source's limits.
///
/// On timeout the adapter task is aborted, which drops whatever it held.
#[instrument(skip_all, fields(source = %source.code, adapter = adapter.name()))]
pub async fn run_adapter(
    adapter: Arc<dyn SourceAdapter>,
    source: &SourceConfig,
    limits: SourceLimits,
) -> AdapterOutput {
    let task_source = source.clone();
    let task_adapter = adapter.clone();
    let mut handle =
        tokio::spawn(async move { task_adapter.fetch(&task_source, &limits).await });

    let mut output = match tokio::time::timeout(limits.timeout, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(join_err)) => {
            warn!(error = %join_err, "adapter task failed");
            AdapterOutput::failed(RegwatchError::adapter(
                &source.code,
                format!("adapter '{}' crashed: {join_err}", adapter.name()),
            ))
        }
        Err(_) => {
            handle.abort();
            AdapterOutput::failed(RegwatchError::timeout(format!(
                "{}: adapter exceeded {:?}",
                source.code, limits.timeout
            )))
        }
    };

    apply_limits(&mut output, &limits, Utc::now());
    output
}

/// Drop candidates older than the age cutoff, then truncate to `max_items`.
///
/// Candidates without a date are kept; their age is unknown, not old. A
/// cutoff before the earliest representable time keeps everything.
pub fn apply_limits(output: &mut AdapterOutput, limits: &SourceLimits, now: DateTime<Utc>) {
    let cutoff = limits.max_age_days.and_then(|days| {
        ChronoDuration::try_days(i64::from(days)).and_then(|age| now.checked_sub_signed(age))
    });
    if let (Some(cutoff), Some(days)) = (cutoff, limits.max_age_days) {
        let before = output.records.len();
        output
            .records
            .retain(|r| r.published_date.is_none_or(|d| d >= cutoff));
        let dropped = before - output.records.len();
        if dropped > 0 {
            debug!(dropped, max_age_days = days, "dropped stale candidates");
        }
    }
    output.records.truncate(limits.max_items);
}
