//! Fakes shared by the pipeline integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use cf_adapters::{AdapterError, Description, Describer, MediaTransformer};
use cf_core::events::ProgressBus;
use cf_core::{
    BatchState, Error, FrameSelection, ItemKind, ItemState, NewItem, RunId, RunParameters, Stage,
    WorkItem,
};
use cf_pipeline::{BatchController, ControllerConfig, ItemOutput, ItemProcessor, RunControl};
use cf_store::{Checkpointer, WorkStore};

pub fn params(stages: Vec<Stage>, max_concurrent: usize) -> RunParameters {
    RunParameters {
        provider: "fake".into(),
        model: "fake-vision".into(),
        prompt_style: "concise".into(),
        stages,
        frame_selection: FrameSelection::Interval { seconds: 1.0 },
        convert_to: "jpg".into(),
        convert_from: vec!["heic".into()],
        item_timeout_secs: 5,
        max_concurrent,
        output_dir: PathBuf::from("/tmp/captionforge-test"),
        report_path: None,
    }
}

/// A store holding `n` source images `/media/img{i}.jpg` for stage 0.
pub fn store_with(n: usize, params: RunParameters) -> Arc<WorkStore> {
    let store = Arc::new(WorkStore::new(RunId::new(), params));
    for i in 0..n {
        store
            .enqueue(NewItem::source(
                PathBuf::from(format!("/media/img{i}.jpg")),
                ItemKind::SourceImage,
            ))
            .unwrap();
    }
    store
}

/// Checkpointer that keeps every snapshot and can be told to start failing.
#[derive(Default)]
pub struct Recorder {
    pub snapshots: Mutex<Vec<BatchState>>,
    fail_from: Mutex<Option<usize>>,
}

impl Recorder {
    pub fn failing_from(write_index: usize) -> Self {
        Self {
            snapshots: Mutex::new(Vec::new()),
            fail_from: Mutex::new(Some(write_index)),
        }
    }

    pub fn max_processing(&self) -> usize {
        self.snapshots
            .lock()
            .iter()
            .map(|s| s.counts().processing)
            .max()
            .unwrap_or(0)
    }
}

impl Checkpointer for Recorder {
    fn write(&self, state: &BatchState) -> cf_core::Result<()> {
        let mut snapshots = self.snapshots.lock();
        if let Some(limit) = *self.fail_from.lock() {
            if snapshots.len() >= limit {
                return Err(Error::checkpoint(state.run_id, "disk full"));
            }
        }
        snapshots.push(state.clone());
        Ok(())
    }
}

pub fn controller(
    store: Arc<WorkStore>,
    checkpointer: Arc<dyn Checkpointer>,
) -> BatchController {
    let config = ControllerConfig::from_params(store.params());
    BatchController::new(
        store,
        checkpointer,
        RunControl::new(),
        Arc::new(ProgressBus::default()),
        config,
    )
}

type Hook = Box<dyn Fn(usize, &WorkItem) -> Result<ItemOutput, AdapterError> + Send + Sync>;

/// Processor that records the order of calls and delegates to a hook that
/// gets the 1-based call number.
pub struct Scripted {
    pub calls: Mutex<Vec<String>>,
    count: AtomicUsize,
    delay: Duration,
    hook: Hook,
}

impl Scripted {
    pub fn new(
        hook: impl Fn(usize, &WorkItem) -> Result<ItemOutput, AdapterError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            delay: Duration::ZERO,
            hook: Box::new(hook),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(|_, item| Ok(ItemOutput::new(format!("described {}", item.id))))
    }

    pub fn with_delay(
        delay: Duration,
        hook: impl Fn(usize, &WorkItem) -> Result<ItemOutput, AdapterError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            delay,
            hook: Box::new(hook),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ItemProcessor for Scripted {
    async fn process(&self, item: &WorkItem) -> Result<ItemOutput, AdapterError> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.lock().push(item.id.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.hook)(n, item)
    }
}

/// Describer that names the file, failing for file names starting with
/// `bad` while `failing` is set.
pub struct FakeDescriber {
    pub calls: AtomicUsize,
    pub failing: std::sync::atomic::AtomicBool,
    pub delay: Duration,
}

impl FakeDescriber {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failing: std::sync::atomic::AtomicBool::new(true),
            delay,
        })
    }
}

#[async_trait]
impl Describer for FakeDescriber {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn describe(
        &self,
        path: &Path,
        prompt_style: &str,
        _model: &str,
    ) -> Result<Description, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.starts_with("bad") && self.failing.load(Ordering::SeqCst) {
            return Err(AdapterError::invalid_input(format!("cannot decode {name}")));
        }
        Ok(Description {
            text: format!("{prompt_style} description of {name}"),
            token_usage: None,
        })
    }
}

/// Transformer that pretends every video has `frames` frames.
pub struct FakeTransformer {
    pub frames: usize,
}

#[async_trait]
impl MediaTransformer for FakeTransformer {
    async fn extract_frames(
        &self,
        video: &Path,
        _selection: &FrameSelection,
    ) -> Result<Vec<PathBuf>, AdapterError> {
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok((1..=self.frames)
            .map(|i| video.with_file_name(format!("{stem}_frame_{i:04}.jpg")))
            .collect())
    }

    async fn convert_format(&self, path: &Path, target_ext: &str) -> Result<PathBuf, AdapterError> {
        Ok(path.with_extension(target_ext))
    }
}

pub fn states(store: &WorkStore) -> Vec<ItemState> {
    store.items().iter().map(|i| i.state).collect()
}
