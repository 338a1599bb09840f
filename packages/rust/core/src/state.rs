//! Stage state machine for items and runs.
//!
//! Items move `pending → fetched → normalized → deduped → persisted →
//! enriched → scored → done`. Side exits: `failed` from any live state
//! (retryable a bounded number of times, then `dead`). Transitions outside
//! the table are rejected.

use serde::{Deserialize, Serialize};

use regwatch_shared::{RegwatchError, Result, RunStatus};

/// Per-item pipeline state, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Fetched,
    Normalized,
    Deduped,
    Persisted,
    Enriched,
    Scored,
    Done,
    Failed,
    Dead,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetched => "fetched",
            Self::Normalized => "normalized",
            Self::Deduped => "deduped",
            Self::Persisted => "persisted",
            Self::Enriched => "enriched",
            Self::Scored => "scored",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }

    /// The forward transition table. `failed` exits are handled by [`ItemTracker`].
    pub fn can_advance_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, Fetched)
                | (Fetched, Normalized)
                | (Normalized, Deduped)
                | (Deduped, Persisted)
                | (Persisted, Enriched)
                // Enrichment skipped, disabled, or failed: the record stays unenriched.
                | (Persisted, Scored)
                // Unchanged on re-ingestion: nothing downstream to redo.
                | (Persisted, Done)
                | (Enriched, Scored)
                | (Enriched, Done)
                | (Scored, Done)
        )
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one item through the pipeline, including failure and retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTracker {
    state: ItemState,
    /// Last good state before entering `failed`; retry resumes here.
    resume_at: Option<ItemState>,
    retries: u32,
    max_retries: u32,
    last_error: Option<String>,
}

impl ItemTracker {
    pub fn new(max_retries: u32) -> Self {
        Self::starting_at(ItemState::Pending, max_retries)
    }

    /// Start at a later state, e.g. `persisted` for backfills over stored records.
    pub fn starting_at(state: ItemState, max_retries: u32) -> Self {
        Self {
            state,
            resume_at: None,
            retries: 0,
            max_retries,
            last_error: None,
        }
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn advance(&mut self, next: ItemState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(RegwatchError::invalid_transition(self.state, next));
        }
        self.state = next;
        Ok(())
    }

    /// Move to `failed`, remembering where to resume.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() || self.state == ItemState::Failed {
            return Err(RegwatchError::invalid_transition(self.state, ItemState::Failed));
        }
        self.resume_at = Some(self.state);
        self.state = ItemState::Failed;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Non-retryable failure: straight to `dead`.
    pub fn kill(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(RegwatchError::invalid_transition(self.state, ItemState::Dead));
        }
        self.state = ItemState::Dead;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Leave `failed` for another attempt, or go `dead` when retries are spent.
    ///
    /// Returns the state the item is now in.
    pub fn retry(&mut self) -> Result<ItemState> {
        if self.state != ItemState::Failed {
            return Err(RegwatchError::invalid_transition(self.state, "retry"));
        }
        if self.retries >= self.max_retries {
            self.state = ItemState::Dead;
            return Ok(self.state);
        }
        self.retries += 1;
        self.state = self.resume_at.take().unwrap_or(ItemState::Pending);
        Ok(self.state)
    }
}

/// Run-level lifecycle table.
pub fn can_transition_run(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Completed)
            | (Running, Failed)
            // A failed run resumes from its durable state.
            | (Failed, Running)
            | (Pending, Cancelled)
            | (Running, Cancelled)
            | (Paused, Cancelled)
            | (Failed, Cancelled)
    )
}

pub fn check_run_transition(from: RunStatus, to: RunStatus) -> Result<()> {
    if can_transition_run(from, to) {
        Ok(())
    } else {
        Err(RegwatchError::invalid_transition(from, to))
    }
}
