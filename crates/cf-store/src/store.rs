//! The Work Item Store.
//!
//! Holds every [`WorkItem`] of a run in queue order. Apart from enqueueing,
//! all state changes go through [`WorkStore::transition`], a compare-and-set
//! under a single write lock, so the state machine holds even when several
//! workers share the store.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use cf_core::item::CHECKPOINT_FORMAT_VERSION;
use cf_core::{
    BatchState, Error, ItemId, ItemState, NewItem, Result, RunId, RunParameters, StateCounts,
    WorkItem,
};

struct Inner {
    items: Vec<WorkItem>,
    index: HashMap<ItemId, usize>,
    next_position: u64,
    stage_cursor: usize,
}

impl Inner {
    fn get(&self, id: &ItemId) -> Option<&WorkItem> {
        self.index.get(id).map(|&i| &self.items[i])
    }

    /// `batch` holds items enqueued ahead of `item` in the same call.
    fn check_new(&self, item: &NewItem, stage_count: usize, batch: &[NewItem]) -> Result<()> {
        if self.index.contains_key(&item.id) || batch.iter().any(|b| b.id == item.id) {
            return Err(Error::DuplicateItem {
                id: item.id.to_string(),
            });
        }
        if item.stage >= stage_count {
            return Err(Error::Validation(format!(
                "item {} targets stage {} but the run has {stage_count} stages",
                item.id, item.stage
            )));
        }
        if let Some(parent) = &item.parent_id {
            if !self.index.contains_key(parent) && !batch.iter().any(|b| &b.id == parent) {
                return Err(Error::Validation(format!(
                    "item {} references unknown parent {parent}",
                    item.id
                )));
            }
        }
        Ok(())
    }

    fn push(&mut self, item: NewItem) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        self.index.insert(item.id.clone(), self.items.len());
        self.items.push(WorkItem {
            id: item.id,
            kind: item.kind,
            source_path: item.source_path,
            parent_id: item.parent_id,
            state: ItemState::Pending,
            queue_position: position,
            stage: item.stage,
            last_error: None,
            result: None,
        });
        position
    }
}

/// Ordered collection of the work items of one run.
pub struct WorkStore {
    run_id: RunId,
    params: RunParameters,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for WorkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("WorkStore")
            .field("run_id", &self.run_id)
            .field("items", &inner.items.len())
            .field("stage_cursor", &inner.stage_cursor)
            .finish()
    }
}

impl WorkStore {
    /// Create an empty store for a fresh run (queue positions start at 0).
    pub fn new(run_id: RunId, params: RunParameters) -> Self {
        Self {
            run_id,
            params,
            inner: RwLock::new(Inner {
                items: Vec::new(),
                index: HashMap::new(),
                next_position: 0,
                stage_cursor: 0,
            }),
        }
    }

    /// Rebuild a store from a persisted batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptCheckpoint`] if the batch violates any
    /// structural invariant.
    pub fn from_state(state: BatchState) -> Result<Self> {
        state.validate()?;

        let next_position = state
            .items
            .last()
            .map(|i| i.queue_position + 1)
            .unwrap_or(0);
        let index = state
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id.clone(), i))
            .collect();

        Ok(Self {
            run_id: state.run_id,
            params: state.run_parameters,
            inner: RwLock::new(Inner {
                items: state.items,
                index,
                next_position,
                stage_cursor: state.stage_cursor,
            }),
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn params(&self) -> &RunParameters {
        &self.params
    }

    /// Append an item in state `Pending` and return its queue position.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateItem`] if the id is already present; a validation
    /// error if the parent is unknown or the stage index is out of range.
    pub fn enqueue(&self, item: NewItem) -> Result<u64> {
        let mut inner = self.inner.write();
        inner.check_new(&item, self.params.stages.len(), &[])?;
        let id = item.id.clone();
        let position = inner.push(item);
        tracing::debug!(run_id = %self.run_id, item_id = %id, position, "Enqueued item");
        Ok(position)
    }

    /// Enqueue several items atomically: either all are added, in order, or
    /// none are.
    pub fn enqueue_all(&self, items: Vec<NewItem>) -> Result<Vec<u64>> {
        let mut inner = self.inner.write();
        let stage_count = self.params.stages.len();

        for (i, item) in items.iter().enumerate() {
            inner.check_new(item, stage_count, &items[..i])?;
        }

        Ok(items.into_iter().map(|item| inner.push(item)).collect())
    }

    pub fn get(&self, id: &ItemId) -> Option<WorkItem> {
        self.inner.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest-position queued (`Pending` or `Paused`) item of the active
    /// stage. Does not change any state.
    pub fn next_pending(&self) -> Option<WorkItem> {
        let stage = self.stage_cursor();
        self.next_pending_in(stage)
    }

    /// Lowest-position queued item consumed by `stage`.
    pub fn next_pending_in(&self, stage: usize) -> Option<WorkItem> {
        self.inner
            .read()
            .items
            .iter()
            .find(|i| i.stage == stage && i.state.is_queued())
            .cloned()
    }

    /// Compare-and-set a single item's state.
    ///
    /// `payload` carries the result for `Done` and the failure reason for
    /// `Failed`; it must be `None` for every other target state.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] for an unknown id.
    /// - [`Error::InvalidTransition`] if the item is not in `from`, or if
    ///   `from -> to` is not an edge of the state machine.
    /// - [`Error::Validation`] if the payload does not fit the target state.
    pub fn transition(
        &self,
        id: &ItemId,
        from: ItemState,
        to: ItemState,
        payload: Option<String>,
    ) -> Result<WorkItem> {
        let needs_payload = matches!(to, ItemState::Done | ItemState::Failed);
        if needs_payload != payload.is_some() {
            return Err(Error::Validation(format!(
                "transition of {id} to {to:?} {} a payload",
                if needs_payload { "requires" } else { "does not take" }
            )));
        }

        let mut inner = self.inner.write();
        let idx = *inner
            .index
            .get(id)
            .ok_or_else(|| Error::not_found("item", id))?;
        let item = &mut inner.items[idx];

        if item.state != from || !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from,
                to,
                actual: item.state,
            });
        }

        item.state = to;
        match to {
            ItemState::Done => item.result = payload,
            ItemState::Failed => item.last_error = payload,
            _ => {}
        }

        tracing::debug!(run_id = %self.run_id, item_id = %id, ?from, ?to, "Item transition");
        Ok(item.clone())
    }

    /// Finish a `Processing` item as `Done` and enqueue the items it produced,
    /// as one step: no snapshot can observe the parent `Done` without its
    /// follow-ups.
    ///
    /// If any follow-up is rejected nothing changes and the item stays
    /// `Processing`.
    pub fn complete(
        &self,
        id: &ItemId,
        result: String,
        follow_ups: Vec<NewItem>,
    ) -> Result<WorkItem> {
        let mut inner = self.inner.write();
        let idx = *inner
            .index
            .get(id)
            .ok_or_else(|| Error::not_found("item", id))?;
        let actual = inner.items[idx].state;
        if actual != ItemState::Processing {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: ItemState::Processing,
                to: ItemState::Done,
                actual,
            });
        }

        let stage_count = self.params.stages.len();
        for (i, item) in follow_ups.iter().enumerate() {
            inner.check_new(item, stage_count, &follow_ups[..i])?;
        }

        let item = &mut inner.items[idx];
        item.state = ItemState::Done;
        item.result = Some(result);
        let done = item.clone();

        let produced = follow_ups.len();
        for follow_up in follow_ups {
            inner.push(follow_up);
        }

        tracing::debug!(run_id = %self.run_id, item_id = %id, produced, "Item done");
        Ok(done)
    }

    /// Put a queued or running item on hold (`Paused`).
    pub fn hold(&self, id: &ItemId) -> Result<WorkItem> {
        let current = self
            .get(id)
            .ok_or_else(|| Error::not_found("item", id))?
            .state;
        self.transition(id, current, ItemState::Paused, None)
    }

    /// Return every held item of `stage` to `Pending`.
    pub fn release_held(&self, stage: usize) -> Result<usize> {
        let held: Vec<ItemId> = self
            .inner
            .read()
            .items
            .iter()
            .filter(|i| i.stage == stage && i.state == ItemState::Paused)
            .map(|i| i.id.clone())
            .collect();
        for id in &held {
            self.transition(id, ItemState::Paused, ItemState::Pending, None)?;
        }
        Ok(held.len())
    }

    /// Reset items left `Processing` by a crashed run back to `Pending`.
    ///
    /// This is the one backwards edge outside the normal state machine and is
    /// only used while rebuilding a store from a checkpoint.
    pub fn recover_stranded(&self) -> Vec<ItemId> {
        let mut inner = self.inner.write();
        let mut recovered = Vec::new();
        for item in inner
            .items
            .iter_mut()
            .filter(|i| i.state == ItemState::Processing)
        {
            item.state = ItemState::Pending;
            recovered.push(item.id.clone());
        }
        if !recovered.is_empty() {
            tracing::info!(
                run_id = %self.run_id,
                count = recovered.len(),
                "Reset stranded items to pending"
            );
        }
        recovered
    }

    /// Re-enqueue every `Failed` item as a new item with a fresh id and queue
    /// position, then rewind the stage cursor to the earliest stage that has
    /// work again. The failed originals stay `Failed`.
    pub fn requeue_failed(&self) -> Result<Vec<ItemId>> {
        let mut inner = self.inner.write();
        let failed: Vec<WorkItem> = inner
            .items
            .iter()
            .filter(|i| i.state == ItemState::Failed)
            .cloned()
            .collect();

        let mut requeued = Vec::with_capacity(failed.len());
        for item in failed {
            let root = item.id.retry_root();
            // A later copy of this exact item supersedes the failure; only
            // the newest failure of a chain is retried.
            if inner
                .items
                .iter()
                .any(|i| i.queue_position > item.queue_position && i.id.retry_root() == root)
            {
                continue;
            }
            let id = (1..)
                .map(|n| root.retry(n))
                .find(|candidate| !inner.index.contains_key(candidate))
                .ok_or_else(|| Error::Internal("retry id space exhausted".into()))?;
            inner.push(NewItem {
                id: id.clone(),
                kind: item.kind,
                source_path: item.source_path,
                parent_id: item.parent_id,
                stage: item.stage,
            });
            requeued.push(id);
        }

        if let Some(stage) = inner
            .items
            .iter()
            .filter(|i| i.state.is_queued())
            .map(|i| i.stage)
            .min()
        {
            if stage < inner.stage_cursor {
                inner.stage_cursor = stage;
            }
        }

        Ok(requeued)
    }

    pub fn stage_cursor(&self) -> usize {
        self.inner.read().stage_cursor
    }

    /// Move the cursor to `stage`.
    pub fn set_stage_cursor(&self, stage: usize) -> Result<()> {
        if stage >= self.params.stages.len() {
            return Err(Error::Validation(format!(
                "stage cursor {stage} out of range for {} stages",
                self.params.stages.len()
            )));
        }
        self.inner.write().stage_cursor = stage;
        Ok(())
    }

    pub fn counts(&self) -> StateCounts {
        StateCounts::from_items(&self.inner.read().items)
    }

    pub fn stage_counts(&self, stage: usize) -> StateCounts {
        StateCounts::from_items(self.inner.read().items.iter().filter(|i| i.stage == stage))
    }

    /// 1-based ordinal of `id` within its stage, and the stage's size.
    pub fn stage_position(&self, id: &ItemId) -> Option<(usize, usize)> {
        let inner = self.inner.read();
        let item = inner.get(id)?;
        let mut index = 0;
        let mut total = 0;
        for other in inner.items.iter().filter(|i| i.stage == item.stage) {
            total += 1;
            if other.queue_position <= item.queue_position {
                index += 1;
            }
        }
        Some((index, total))
    }

    /// Items in queue order.
    pub fn items(&self) -> Vec<WorkItem> {
        self.inner.read().items.clone()
    }

    /// Deep, point-in-time copy suitable for persistence.
    pub fn snapshot(&self) -> BatchState {
        let inner = self.inner.read();
        BatchState {
            format_version: CHECKPOINT_FORMAT_VERSION,
            run_id: self.run_id,
            saved_at: Utc::now(),
            items: inner.items.clone(),
            stage_cursor: inner.stage_cursor,
            run_parameters: self.params.clone(),
        }
    }
}
