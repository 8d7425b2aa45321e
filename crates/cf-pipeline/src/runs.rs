//! Run lifecycle: the control surface callers use.
//!
//! [`RunManager`] starts and recovers runs, tracks the live ones, and offers
//! the operations that only make sense on a stored checkpoint (reprocess,
//! acknowledge). Each live run executes on its own tokio task and is reached
//! through a [`RunHandle`] or by id through the manager.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cf_adapters::{prompt, FfmpegTransformer, MediaTransformer, ProviderRegistry, ToolRegistry};
use cf_core::events::{ProgressBus, ProgressEvent};
use cf_core::{
    Error, ItemKind, NewItem, Result, RunId, RunParameters, Stage, StateCounts,
};
use cf_store::{
    CheckpointStatus, CheckpointStore, Checkpointer, ResumeNegotiator, ResumeSummary, RunLease,
    RunLeases, WorkStore,
};

use crate::control::RunControl;
use crate::controller::{BatchController, ControllerConfig};
use crate::processor::{StageContext, StageProcessor};
use crate::report::RunReport;
use crate::sequencer::{PipelineSequencer, SequenceOutcome};

/// How a run task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Stopped at an item boundary; resumable from its checkpoint.
    Stopped(StateCounts),
}

/// Coarse lifecycle phase reported by [`RunManager::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Running,
    Paused,
    /// Not live; work remains in the checkpoint.
    Resumable,
    /// Not live; every item is terminal.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub stage: Stage,
    pub counts: StateCounts,
}

/// One entry of [`RunManager::list_checkpoints`].
#[derive(Debug)]
pub struct RunListing {
    pub run_id: RunId,
    pub live: bool,
    pub status: Result<CheckpointStatus>,
}

struct LiveRun {
    control: RunControl,
    store: Arc<WorkStore>,
    progress: Arc<ProgressBus>,
}

/// Where media transforms come from.
enum Transformers {
    /// Build an ffmpeg transformer per run, writing to the run's output dir.
    Tools(ToolRegistry),
    Fixed(Arc<dyn MediaTransformer>),
}

/// Owner of every run in this process.
#[derive(Clone)]
pub struct RunManager {
    checkpoints: Arc<CheckpointStore>,
    leases: RunLeases,
    providers: Arc<ProviderRegistry>,
    transformers: Arc<Transformers>,
    live: Arc<DashMap<RunId, LiveRun>>,
}

impl RunManager {
    pub fn new(checkpoints: CheckpointStore, providers: ProviderRegistry, tools: ToolRegistry) -> Self {
        Self {
            leases: RunLeases::for_checkpoints(&checkpoints),
            checkpoints: Arc::new(checkpoints),
            providers: Arc::new(providers),
            transformers: Arc::new(Transformers::Tools(tools)),
            live: Arc::new(DashMap::new()),
        }
    }

    /// Use `transformer` for every run instead of ffmpeg.
    pub fn with_transformer(mut self, transformer: Arc<dyn MediaTransformer>) -> Self {
        self.transformers = Arc::new(Transformers::Fixed(transformer));
        self
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Start a new run over `sources`.
    ///
    /// # Errors
    ///
    /// - Validation errors for bad parameters or an unsupported source.
    /// - [`Error::NotFound`] if the provider is not registered.
    /// - [`Error::RunLocked`] if the id is live, [`Error::Conflict`] if a
    ///   checkpoint for it already exists.
    /// - [`Error::DuplicateItem`] if a source is listed twice.
    pub fn start(
        &self,
        run_id: RunId,
        sources: Vec<PathBuf>,
        params: RunParameters,
    ) -> Result<RunHandle> {
        params.validate()?;
        if params.stages.contains(&Stage::Annotate) && !prompt::is_known(&params.prompt_style) {
            return Err(Error::Validation(format!(
                "unknown prompt style '{}' (valid: {})",
                params.prompt_style,
                prompt::styles().collect::<Vec<_>>().join(", ")
            )));
        }

        let lease = self.leases.acquire(run_id)?;
        if self.checkpoints.exists(run_id) {
            return Err(Error::Conflict(format!(
                "a checkpoint for run {run_id} already exists; resume or discard it"
            )));
        }

        let store = Arc::new(WorkStore::new(run_id, params));
        let ctx = self.stage_context(store.clone())?;

        let items = sources
            .into_iter()
            .map(|path| {
                let kind = ItemKind::classify(&path).ok_or_else(|| {
                    Error::Validation(format!("{} is not a supported image or video", path.display()))
                })?;
                Ok(NewItem::source(path, kind))
            })
            .collect::<Result<Vec<_>>>()?;
        store.enqueue_all(items)?;

        self.checkpoints.write(&store.snapshot())?;
        tracing::info!(
            %run_id,
            items = store.len(),
            stages = ?store.params().stages,
            provider = %store.params().provider,
            "Run started"
        );
        Ok(self.spawn(store, ctx, lease))
    }

    /// Resume a run from its checkpoint.
    ///
    /// # Errors
    ///
    /// See [`ResumeNegotiator::prepare`].
    pub fn recover(&self, run_id: RunId) -> Result<(RunHandle, ResumeSummary)> {
        let negotiator = ResumeNegotiator::new(&self.checkpoints, &self.leases);
        let (store, summary, lease) = negotiator.prepare(run_id)?;
        let store = Arc::new(store);
        let ctx = self.stage_context(store.clone())?;

        // Record the stranded-item reset before any new work starts.
        self.checkpoints.write(&store.snapshot())?;
        Ok((self.spawn(store, ctx, lease), summary))
    }

    pub fn pause(&self, run_id: RunId) -> Result<bool> {
        Ok(self.live_control(run_id)?.pause())
    }

    pub fn resume(&self, run_id: RunId) -> Result<bool> {
        Ok(self.live_control(run_id)?.resume())
    }

    pub fn stop(&self, run_id: RunId) -> Result<()> {
        self.live_control(run_id)?.stop();
        Ok(())
    }

    /// Status of a live run, or of a stored one from its checkpoint.
    pub fn status(&self, run_id: RunId) -> Result<RunStatus> {
        if let Some(live) = self.live.get(&run_id) {
            let cursor = live.store.stage_cursor();
            return Ok(RunStatus {
                run_id,
                phase: if live.control.is_paused() {
                    RunPhase::Paused
                } else {
                    RunPhase::Running
                },
                stage: live.store.params().stages[cursor],
                counts: live.store.counts(),
            });
        }

        let state = self
            .checkpoints
            .load(run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        Ok(RunStatus {
            run_id,
            phase: if state.is_complete() {
                RunPhase::Complete
            } else {
                RunPhase::Resumable
            },
            stage: state.run_parameters.stages[state.stage_cursor],
            counts: state.counts(),
        })
    }

    /// Subscribe to a live run's progress events.
    pub fn subscribe(&self, run_id: RunId) -> Result<broadcast::Receiver<ProgressEvent>> {
        self.live
            .get(&run_id)
            .map(|live| live.progress.subscribe())
            .ok_or_else(|| Error::not_found("live run", run_id))
    }

    /// Re-enqueue every failed item of a stored run. Returns how many were
    /// queued; follow with [`RunManager::recover`] to process them.
    pub fn reprocess_failed(&self, run_id: RunId) -> Result<usize> {
        let _lease = self.leases.acquire(run_id)?;
        let state = self
            .checkpoints
            .load(run_id)?
            .ok_or_else(|| Error::not_found("checkpoint", run_id))?;
        let store = WorkStore::from_state(state)?;
        let requeued = store.requeue_failed()?;
        if !requeued.is_empty() {
            self.checkpoints.write(&store.snapshot())?;
        }
        tracing::info!(%run_id, count = requeued.len(), "Requeued failed items");
        Ok(requeued.len())
    }

    /// Delete the checkpoint of a finished run.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if work remains; [`Error::RunLocked`] if live.
    pub fn acknowledge(&self, run_id: RunId) -> Result<()> {
        let _lease = self.leases.acquire(run_id)?;
        let state = self
            .checkpoints
            .load(run_id)?
            .ok_or_else(|| Error::not_found("checkpoint", run_id))?;
        if !state.is_complete() {
            return Err(Error::Conflict(format!(
                "run {run_id} still has {} unfinished items",
                state.counts().remaining()
            )));
        }
        self.checkpoints.delete(run_id)?;
        Ok(())
    }

    /// Every stored run with its classification.
    pub fn list_checkpoints(&self) -> Result<Vec<RunListing>> {
        let negotiator = ResumeNegotiator::new(&self.checkpoints, &self.leases);
        Ok(self
            .checkpoints
            .list()?
            .into_iter()
            .map(|run_id| RunListing {
                run_id,
                live: self.live.contains_key(&run_id),
                status: negotiator
                    .inspect(run_id)
                    .and_then(|s| s.ok_or_else(|| Error::not_found("checkpoint", run_id))),
            })
            .collect())
    }

    pub fn is_live(&self, run_id: RunId) -> bool {
        self.live.contains_key(&run_id)
    }

    fn live_control(&self, run_id: RunId) -> Result<RunControl> {
        self.live
            .get(&run_id)
            .map(|live| live.control.clone())
            .ok_or_else(|| Error::not_found("live run", run_id))
    }

    /// Resolve the collaborators a run's stages need, once.
    fn stage_context(&self, store: Arc<WorkStore>) -> Result<Arc<StageContext>> {
        let params = store.params().clone();

        let describer = if params.stages.contains(&Stage::Annotate) {
            Some(self.providers.resolve(&params.provider)?)
        } else {
            None
        };

        let transformer = if params.stages.contains(&Stage::Normalize) {
            Some(match self.transformers.as_ref() {
                Transformers::Fixed(t) => t.clone(),
                Transformers::Tools(tools) => {
                    let ffmpeg = FfmpegTransformer::from_registry(tools, params.output_dir.clone())?
                        .with_timeout(std::time::Duration::from_secs(params.item_timeout_secs));
                    Arc::new(ffmpeg) as Arc<dyn MediaTransformer>
                }
            })
        } else {
            None
        };

        Ok(Arc::new(StageContext {
            params,
            store,
            describer,
            transformer,
        }))
    }

    fn spawn(&self, store: Arc<WorkStore>, ctx: Arc<StageContext>, lease: RunLease) -> RunHandle {
        let run_id = store.run_id();
        let control = RunControl::new();
        let progress = Arc::new(ProgressBus::default());

        self.live.insert(
            run_id,
            LiveRun {
                control: control.clone(),
                store: store.clone(),
                progress: progress.clone(),
            },
        );

        let controller = BatchController::new(
            store.clone(),
            self.checkpoints.clone(),
            control.clone(),
            progress.clone(),
            ControllerConfig::from_params(store.params()),
        );
        let sequencer = PipelineSequencer::new(controller, StageProcessor::for_run(ctx));
        let live = self.live.clone();
        let task_store = store.clone();

        let task = tokio::spawn(async move {
            // Declared first so it is released last, after the live entry.
            let _lease = lease;
            let outcome = finish(run_id, &task_store, sequencer.run().await);
            live.remove(&run_id);
            outcome
        });

        RunHandle {
            run_id,
            control,
            progress,
            store,
            task,
        }
    }
}

fn finish(
    run_id: RunId,
    store: &WorkStore,
    result: Result<SequenceOutcome>,
) -> Result<RunOutcome> {
    match result {
        Ok(SequenceOutcome::Completed) => {
            let report = RunReport::from_state(&store.snapshot());
            tracing::info!(
                %run_id,
                done = report.counts.done,
                failed = report.counts.failed,
                "Run completed"
            );
            if let Some(path) = &store.params().report_path {
                report.write(path)?;
            }
            Ok(RunOutcome::Completed(report))
        }
        Ok(SequenceOutcome::Stopped) => {
            let counts = store.counts();
            tracing::info!(%run_id, remaining = counts.remaining(), "Run stopped; checkpoint kept");
            Ok(RunOutcome::Stopped(counts))
        }
        Err(e) => {
            tracing::error!(%run_id, "Run halted: {e}");
            Err(e)
        }
    }
}

/// Handle to one live run.
pub struct RunHandle {
    run_id: RunId,
    control: RunControl,
    progress: Arc<ProgressBus>,
    store: Arc<WorkStore>,
    task: JoinHandle<Result<RunOutcome>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn counts(&self) -> StateCounts {
        self.store.counts()
    }

    /// Wait for the run task to end.
    pub async fn wait(self) -> Result<RunOutcome> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {e}")))?
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}
