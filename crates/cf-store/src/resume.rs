//! Resume negotiation.

use serde_json::json;

use cf_core::{BatchState, Error, ItemState, Result, RunId, Stage, StateCounts};

use crate::checkpoint::CheckpointStore;
use crate::lease::{RunLease, RunLeases};
use crate::store::WorkStore;

/// What a stored checkpoint allows.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointStatus {
    /// Work remains; the run can be resumed.
    Resumable(ResumeSummary),
    /// Every item is terminal; only acknowledge or reprocess apply.
    Complete(StateCounts),
}

/// Summary of a checkpoint offered for resumption.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeSummary {
    pub run_id: RunId,
    pub already_done: usize,
    pub failed: usize,
    /// Items still to process, including any that were stranded.
    pub remaining: usize,
    /// Items that were `Processing` when the previous controller stopped.
    pub stranded: usize,
    pub stage_cursor: usize,
    pub stage: Stage,
}

impl ResumeSummary {
    fn from_state(state: &BatchState) -> Self {
        let counts = state.counts();
        Self {
            run_id: state.run_id,
            already_done: counts.done,
            failed: counts.failed,
            remaining: counts.remaining(),
            stranded: counts.processing,
            stage_cursor: state.stage_cursor,
            // `validate` already checked the cursor is in range.
            stage: state.run_parameters.stages[state.stage_cursor],
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "run_id": self.run_id.to_string(),
            "already_done": self.already_done,
            "failed": self.failed,
            "remaining": self.remaining,
            "stranded": self.stranded,
            "stage": self.stage.name(),
        })
    }
}

/// Decides whether a stored run can be resumed and rebuilds its store.
pub struct ResumeNegotiator<'a> {
    checkpoints: &'a CheckpointStore,
    leases: &'a RunLeases,
}

impl<'a> ResumeNegotiator<'a> {
    pub fn new(checkpoints: &'a CheckpointStore, leases: &'a RunLeases) -> Self {
        Self {
            checkpoints,
            leases,
        }
    }

    /// Classify a loaded batch. Validates it first.
    pub fn classify(state: &BatchState) -> Result<CheckpointStatus> {
        state.validate()?;
        check_cursor(state)?;
        if state.is_complete() {
            Ok(CheckpointStatus::Complete(state.counts()))
        } else {
            Ok(CheckpointStatus::Resumable(ResumeSummary::from_state(state)))
        }
    }

    /// Look at the checkpoint for `run_id` without claiming it.
    ///
    /// Returns `Ok(None)` if there is no checkpoint.
    pub fn inspect(&self, run_id: RunId) -> Result<Option<CheckpointStatus>> {
        match self.checkpoints.load(run_id)? {
            Some(state) => Self::classify(&state).map(Some),
            None => Ok(None),
        }
    }

    /// Claim the run and rebuild its store for resumption.
    ///
    /// Items stranded in `Processing` are reset to `Pending`; everything
    /// else is taken as persisted.
    ///
    /// # Errors
    ///
    /// - [`Error::RunLocked`] if a live controller owns the run.
    /// - [`Error::NotFound`] if there is no checkpoint.
    /// - [`Error::CorruptCheckpoint`] if the checkpoint is invalid or the run
    ///   is already complete.
    pub fn prepare(&self, run_id: RunId) -> Result<(WorkStore, ResumeSummary, RunLease)> {
        let lease = self.leases.acquire(run_id)?;

        let state = self
            .checkpoints
            .load(run_id)?
            .ok_or_else(|| Error::not_found("checkpoint", run_id))?;

        let summary = match Self::classify(&state)? {
            CheckpointStatus::Resumable(summary) => summary,
            CheckpointStatus::Complete(_) => {
                return Err(Error::CorruptCheckpoint(format!(
                    "run {run_id} is already complete and cannot be resumed"
                )));
            }
        };

        let store = WorkStore::from_state(state)?;
        store.recover_stranded();

        tracing::info!(
            %run_id,
            done = summary.already_done,
            failed = summary.failed,
            remaining = summary.remaining,
            stranded = summary.stranded,
            stage = %summary.stage,
            "Prepared run for resume"
        );
        Ok((store, summary, lease))
    }
}

/// Queued work behind the cursor means the stage order was broken.
fn check_cursor(state: &BatchState) -> Result<()> {
    if let Some(item) = state.items.iter().find(|i| {
        i.stage < state.stage_cursor && (i.state.is_queued() || i.state == ItemState::Processing)
    }) {
        return Err(Error::CorruptCheckpoint(format!(
            "item {} of stage {} is unfinished but the cursor is at stage {}",
            item.id, item.stage, state.stage_cursor
        )));
    }
    Ok(())
}
