//! The batch controller: the run loop for one stage.
//!
//! Per item:
//!
//! 1. `Pending -> Processing`, then checkpoint.
//! 2. Call the processor, bounded by the item timeout.
//! 3. `Processing -> Done` (with follow-ups) or `Processing -> Failed`, then
//!    checkpoint.
//! 4. Emit a progress event.
//!
//! Adapter failures and timeouts fail the item and the loop moves on. A
//! checkpoint failure is a run fault and ends the loop with an error.
//!
//! Up to `max_concurrent` items are in flight at once. Items are claimed in
//! queue order; with more than one worker they may finish out of order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinSet;

use cf_adapters::AdapterError;
use cf_core::events::{ProgressBus, ProgressEvent};
use cf_core::{Error, ItemState, Result, RunParameters, WorkItem};
use cf_store::{Checkpointer, WorkStore};

use crate::control::RunControl;
use crate::processor::ItemProcessor;

/// Why [`BatchController::run_stage`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// No queued items remain in the stage.
    Drained,
    /// A pause was observed at an item boundary.
    Paused,
    /// A stop was observed at an item boundary.
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub max_concurrent: usize,
    pub item_timeout: Duration,
}

impl ControllerConfig {
    pub fn from_params(params: &RunParameters) -> Self {
        Self {
            max_concurrent: params.max_concurrent.max(1),
            item_timeout: Duration::from_secs(params.item_timeout_secs),
        }
    }
}

#[derive(Default)]
struct Timing {
    finished: u32,
    total: Duration,
}

impl Timing {
    fn average(&self) -> Duration {
        if self.finished == 0 {
            Duration::ZERO
        } else {
            self.total / self.finished
        }
    }
}

/// Drives the items of a stage through the state machine.
#[derive(Clone)]
pub struct BatchController {
    store: Arc<WorkStore>,
    checkpointer: Arc<dyn Checkpointer>,
    control: RunControl,
    progress: Arc<ProgressBus>,
    config: ControllerConfig,
    timing: Arc<Mutex<Timing>>,
    persist_lock: Arc<Mutex<()>>,
}

impl BatchController {
    pub fn new(
        store: Arc<WorkStore>,
        checkpointer: Arc<dyn Checkpointer>,
        control: RunControl,
        progress: Arc<ProgressBus>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            checkpointer,
            control,
            progress,
            config,
            timing: Arc::new(Mutex::new(Timing::default())),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<WorkStore> {
        &self.store
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Write the current store state. Snapshot and write happen under one
    /// lock so a newer snapshot is never overwritten by an older one.
    pub fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        let state = self.store.snapshot();
        self.checkpointer.write(&state).map_err(|e| {
            tracing::error!(run_id = %state.run_id, "Checkpoint write failed: {e}");
            e
        })
    }

    /// Process queued items of `stage` until it drains or a signal is seen.
    ///
    /// # Errors
    ///
    /// A checkpoint failure ([`Error::Checkpoint`]) or a broken store
    /// invariant. In-flight items are allowed to finish first.
    pub async fn run_stage(
        &self,
        processor: Arc<dyn ItemProcessor>,
        stage: usize,
    ) -> Result<LoopExit> {
        let mut in_flight: JoinSet<Result<()>> = JoinSet::new();
        let mut fault: Option<Error> = None;

        loop {
            while fault.is_none()
                && in_flight.len() < self.config.max_concurrent
                && !self.control.is_paused()
                && !self.control.is_stopped()
            {
                let Some(next) = self.store.next_pending_in(stage) else {
                    break;
                };
                let item = match self.claim(next) {
                    Ok(item) => item,
                    Err(e) => {
                        fault = Some(e);
                        break;
                    }
                };
                let this = self.clone();
                let processor = processor.clone();
                in_flight.spawn(async move { this.execute(processor, item).await });
            }

            match in_flight.join_next().await {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    fault.get_or_insert(e);
                }
                Some(Err(join_err)) => {
                    fault.get_or_insert(Error::Internal(format!("item task failed: {join_err}")));
                }
                None => break,
            }
        }

        if let Some(e) = fault {
            return Err(e);
        }
        Ok(if self.control.is_stopped() {
            LoopExit::Stopped
        } else if self.control.is_paused() {
            LoopExit::Paused
        } else {
            LoopExit::Drained
        })
    }

    /// Move `item` to `Processing` and checkpoint before any adapter call.
    fn claim(&self, item: WorkItem) -> Result<WorkItem> {
        if item.state == ItemState::Paused {
            self.store
                .transition(&item.id, ItemState::Paused, ItemState::Pending, None)?;
        }
        let item = self
            .store
            .transition(&item.id, ItemState::Pending, ItemState::Processing, None)?;
        self.persist()?;
        self.emit(&item, Duration::ZERO);
        Ok(item)
    }

    async fn execute(&self, processor: Arc<dyn ItemProcessor>, item: WorkItem) -> Result<()> {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.item_timeout, processor.process(&item))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(AdapterError::timeout(format!(
                "no result after {}s",
                self.config.item_timeout.as_secs_f64()
            ))),
        };

        let finished = match outcome {
            Ok(output) => match self.store.complete(&item.id, output.result, output.follow_ups) {
                Ok(done) => done,
                Err(e) => self.fail(&item, e.to_string())?,
            },
            Err(e) => self.fail(&item, e.to_string())?,
        };

        let elapsed = started.elapsed();
        {
            let mut timing = self.timing.lock();
            timing.finished += 1;
            timing.total += elapsed;
        }

        self.persist()?;
        self.emit(&finished, elapsed);
        Ok(())
    }

    fn fail(&self, item: &WorkItem, reason: String) -> Result<WorkItem> {
        tracing::warn!(
            run_id = %self.store.run_id(),
            item_id = %item.id,
            file = %item.file_name(),
            "Item failed: {reason}"
        );
        self.store
            .transition(&item.id, ItemState::Processing, ItemState::Failed, Some(reason))
    }

    fn emit(&self, item: &WorkItem, elapsed: Duration) {
        let Some(stage) = self.store.params().stage(item.stage) else {
            return;
        };
        let (index, total) = self.store.stage_position(&item.id).unwrap_or((0, 0));
        self.progress.emit(ProgressEvent {
            run_id: self.store.run_id(),
            stage,
            item_id: item.id.clone(),
            new_state: item.state,
            index,
            total,
            elapsed_for_item: elapsed,
            running_average: self.timing.lock().average(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ItemOutput;
    use async_trait::async_trait;
    use cf_core::{FrameSelection, ItemKind, NewItem, RunId, Stage};
    use std::path::PathBuf;

    struct Recording {
        writes: Mutex<Vec<cf_core::BatchState>>,
    }

    impl Checkpointer for Recording {
        fn write(&self, state: &cf_core::BatchState) -> Result<()> {
            self.writes.lock().push(state.clone());
            Ok(())
        }
    }

    struct Ok1;

    #[async_trait]
    impl ItemProcessor for Ok1 {
        async fn process(&self, item: &WorkItem) -> std::result::Result<ItemOutput, AdapterError> {
            Ok(ItemOutput::new(format!("ok {}", item.id)))
        }
    }

    struct Hang;

    #[async_trait]
    impl ItemProcessor for Hang {
        async fn process(&self, _item: &WorkItem) -> std::result::Result<ItemOutput, AdapterError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ItemOutput::new("late"))
        }
    }

    fn setup(n: usize, timeout: Duration) -> (BatchController, Arc<Recording>) {
        let params = RunParameters {
            provider: "fake".into(),
            model: "m".into(),
            prompt_style: "concise".into(),
            stages: vec![Stage::Annotate],
            frame_selection: FrameSelection::default(),
            convert_to: "jpg".into(),
            convert_from: vec![],
            item_timeout_secs: 1,
            max_concurrent: 1,
            output_dir: PathBuf::from("/tmp/out"),
            report_path: None,
        };
        let store = Arc::new(WorkStore::new(RunId::new(), params));
        for i in 0..n {
            store
                .enqueue(NewItem::source(
                    PathBuf::from(format!("/m/{i}.jpg")),
                    ItemKind::SourceImage,
                ))
                .unwrap();
        }
        let recording = Arc::new(Recording {
            writes: Mutex::new(Vec::new()),
        });
        let controller = BatchController::new(
            store,
            recording.clone(),
            RunControl::new(),
            Arc::new(ProgressBus::default()),
            ControllerConfig {
                max_concurrent: 1,
                item_timeout: timeout,
            },
        );
        (controller, recording)
    }

    #[tokio::test]
    async fn checkpoints_before_and_after_each_item() {
        let (controller, recording) = setup(2, Duration::from_secs(5));
        let exit = controller.run_stage(Arc::new(Ok1), 0).await.unwrap();
        assert_eq!(exit, LoopExit::Drained);

        let writes = recording.writes.lock();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0].items[0].state, ItemState::Processing);
        assert_eq!(writes[1].items[0].state, ItemState::Done);
        assert_eq!(writes[1].items[1].state, ItemState::Pending);
        assert_eq!(writes[3].counts().done, 2);
    }

    #[tokio::test]
    async fn timeout_fails_the_item() {
        let (controller, _) = setup(1, Duration::from_millis(50));
        controller.run_stage(Arc::new(Hang), 0).await.unwrap();
        let item = &controller.store().items()[0];
        assert_eq!(item.state, ItemState::Failed);
        assert!(item.last_error.as_deref().unwrap().starts_with("timeout:"));
    }

    #[tokio::test]
    async fn events_carry_position_and_timing() {
        let (controller, _) = setup(3, Duration::from_secs(5));
        let mut rx = controller.progress.subscribe();
        controller.run_stage(Arc::new(Ok1), 0).await.unwrap();

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events.len(), 6);
        assert_eq!(events[0].new_state, ItemState::Processing);
        assert_eq!((events[0].index, events[0].total), (1, 3));
        assert_eq!(events[5].new_state, ItemState::Done);
        assert_eq!((events[5].index, events[5].total), (3, 3));
    }

    #[tokio::test]
    async fn stop_before_start_processes_nothing() {
        let (controller, recording) = setup(2, Duration::from_secs(5));
        controller.control().stop();
        let exit = controller.run_stage(Arc::new(Ok1), 0).await.unwrap();
        assert_eq!(exit, LoopExit::Stopped);
        assert!(recording.writes.lock().is_empty());
        assert_eq!(controller.store().counts().pending, 2);
    }

    #[tokio::test]
    async fn held_items_are_released_before_processing() {
        let (controller, _) = setup(1, Duration::from_secs(5));
        let id = controller.store().items()[0].id.clone();
        controller.store().hold(&id).unwrap();
        controller.run_stage(Arc::new(Ok1), 0).await.unwrap();
        assert_eq!(controller.store().get(&id).unwrap().state, ItemState::Done);
    }
}
