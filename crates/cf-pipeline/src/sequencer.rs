//! Walks a run's stage list.
//!
//! The stage cursor only moves forward once a stage has drained, and the
//! move is checkpointed before the next stage starts, so a resumed run
//! continues at the stage it was in.

use std::sync::Arc;

use cf_core::{Error, Result};

use crate::controller::{BatchController, LoopExit};
use crate::processor::ItemProcessor;

/// How a sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Every stage drained.
    Completed,
    /// A stop request was observed; the checkpoint is kept for resume.
    Stopped,
}

pub struct PipelineSequencer {
    controller: BatchController,
    processors: Vec<Arc<dyn ItemProcessor>>,
}

impl PipelineSequencer {
    /// `processors[i]` handles stage `i` of the run's stage list.
    pub fn new(controller: BatchController, processors: Vec<Arc<dyn ItemProcessor>>) -> Self {
        Self {
            controller,
            processors,
        }
    }

    pub async fn run(&self) -> Result<SequenceOutcome> {
        let store = self.controller.store().clone();
        let control = self.controller.control().clone();
        let run_id = store.run_id();
        let stage_count = store.params().stages.len();
        if self.processors.len() != stage_count {
            return Err(Error::Internal(format!(
                "{} processors for {stage_count} stages",
                self.processors.len()
            )));
        }

        loop {
            let cursor = store.stage_cursor();
            let stage = store.params().stages[cursor];
            let pending = store.stage_counts(cursor).remaining();
            tracing::info!(%run_id, %stage, pending, "Stage started");

            match self
                .controller
                .run_stage(self.processors[cursor].clone(), cursor)
                .await?
            {
                LoopExit::Drained => {
                    let counts = store.stage_counts(cursor);
                    tracing::info!(
                        %run_id,
                        %stage,
                        done = counts.done,
                        failed = counts.failed,
                        "Stage finished"
                    );
                    if cursor + 1 >= stage_count {
                        return Ok(SequenceOutcome::Completed);
                    }
                    store.set_stage_cursor(cursor + 1)?;
                    self.controller.persist()?;
                }
                LoopExit::Paused => {
                    tracing::info!(%run_id, %stage, "Run paused");
                    if !control.wait_while_paused().await {
                        tracing::info!(%run_id, "Run stopped while paused");
                        return Ok(SequenceOutcome::Stopped);
                    }
                    let released = store.release_held(cursor)?;
                    if released > 0 {
                        self.controller.persist()?;
                    }
                    tracing::info!(%run_id, %stage, "Run resumed");
                }
                LoopExit::Stopped => {
                    tracing::info!(%run_id, %stage, "Run stopped");
                    return Ok(SequenceOutcome::Stopped);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RunControl;
    use crate::controller::ControllerConfig;
    use crate::processor::ItemOutput;
    use async_trait::async_trait;
    use cf_adapters::AdapterError;
    use cf_core::events::ProgressBus;
    use cf_core::{
        BatchState, FrameSelection, ItemKind, ItemState, NewItem, RunId, RunParameters, Stage,
        WorkItem,
    };
    use cf_store::{Checkpointer, WorkStore};
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Carries every item to the next stage with a `<id>.next` id.
    struct Forward {
        next: Option<usize>,
    }

    #[async_trait]
    impl ItemProcessor for Forward {
        async fn process(&self, item: &WorkItem) -> std::result::Result<ItemOutput, AdapterError> {
            let mut out = ItemOutput::new("ok");
            if let Some(next) = self.next {
                out.follow_ups.push(NewItem {
                    id: item.id.child("next"),
                    kind: item.kind,
                    source_path: item.source_path.clone(),
                    parent_id: Some(item.id.clone()),
                    stage: next,
                });
            }
            Ok(out)
        }
    }

    struct Last(Mutex<Option<BatchState>>);

    impl Checkpointer for Last {
        fn write(&self, state: &BatchState) -> cf_core::Result<()> {
            *self.0.lock() = Some(state.clone());
            Ok(())
        }
    }

    fn controller(n: usize) -> (BatchController, Arc<Last>) {
        let params = RunParameters {
            provider: "fake".into(),
            model: "m".into(),
            prompt_style: "concise".into(),
            stages: vec![Stage::Annotate, Stage::Report],
            frame_selection: FrameSelection::default(),
            convert_to: "jpg".into(),
            convert_from: vec![],
            item_timeout_secs: 5,
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
        let last = Arc::new(Last(Mutex::new(None)));
        let controller = BatchController::new(
            store,
            last.clone(),
            RunControl::new(),
            Arc::new(ProgressBus::default()),
            ControllerConfig {
                max_concurrent: 1,
                item_timeout: Duration::from_secs(5),
            },
        );
        (controller, last)
    }

    fn processors() -> Vec<Arc<dyn ItemProcessor>> {
        vec![
            Arc::new(Forward { next: Some(1) }),
            Arc::new(Forward { next: None }),
        ]
    }

    #[tokio::test]
    async fn runs_every_stage_in_order() {
        let (controller, last) = controller(2);
        let store = controller.store().clone();
        let outcome = PipelineSequencer::new(controller, processors())
            .run()
            .await
            .unwrap();
        assert_eq!(outcome, SequenceOutcome::Completed);

        let items = store.items();
        assert_eq!(items.len(), 4);
        assert!(items.iter().all(|i| i.state == ItemState::Done));
        // Stage-1 items were created after every stage-0 item.
        assert!(items[..2].iter().all(|i| i.stage == 0));
        assert!(items[2..].iter().all(|i| i.stage == 1));

        let persisted = last.0.lock().clone().unwrap();
        assert_eq!(persisted.stage_cursor, 1);
        assert!(persisted.is_complete());
    }

    #[tokio::test]
    async fn empty_run_completes() {
        let (controller, _) = controller(0);
        let outcome = PipelineSequencer::new(controller, processors())
            .run()
            .await
            .unwrap();
        assert_eq!(outcome, SequenceOutcome::Completed);
    }

    #[tokio::test]
    async fn paused_run_continues_after_resume() {
        let (controller, _) = controller(3);
        let control = controller.control().clone();
        let store = controller.store().clone();
        control.pause();

        let task = tokio::spawn(async move {
            PipelineSequencer::new(controller, processors()).run().await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.counts().done, 0);

        control.resume();
        assert_eq!(task.await.unwrap().unwrap(), SequenceOutcome::Completed);
        assert_eq!(store.counts().done, 6);
    }

    #[tokio::test]
    async fn stop_while_paused_ends_run() {
        let (controller, _) = controller(3);
        let control = controller.control().clone();
        control.pause();

        let task = tokio::spawn(async move {
            PipelineSequencer::new(controller, processors()).run().await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.stop();
        assert_eq!(task.await.unwrap().unwrap(), SequenceOutcome::Stopped);
    }

    #[tokio::test]
    async fn processor_count_must_match_stages() {
        let (controller, _) = controller(1);
        let only_one: Vec<Arc<dyn ItemProcessor>> = vec![Arc::new(Forward { next: None })];
        let err = PipelineSequencer::new(controller, only_one)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
