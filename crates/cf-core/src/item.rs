//! Work items, their state machine, and the checkpoint unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::ids::{ItemId, RunId};
use crate::stage::Stage;

/// Current checkpoint format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "heic", "heif",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "m4v", "mpg", "mpeg"];

// ---------------------------------------------------------------------------
// ItemKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    SourceImage,
    SourceVideo,
    DerivedFrame,
    ConvertedImage,
}

impl ItemKind {
    /// Classify a source file by extension. Returns `None` for anything that
    /// is neither a recognised image nor a recognised video.
    pub fn classify(path: &Path) -> Option<ItemKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(ItemKind::SourceImage)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(ItemKind::SourceVideo)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::SourceImage => "source_image",
            ItemKind::SourceVideo => "source_video",
            ItemKind::DerivedFrame => "derived_frame",
            ItemKind::ConvertedImage => "converted_image",
        }
    }
}

// ---------------------------------------------------------------------------
// ItemState
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
///
/// Items move forward along `Pending -> Processing -> {Done, Failed}`.
/// `Paused` is a held state entered from `Pending` or `Processing` that only
/// ever returns to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Pending,
    Processing,
    Done,
    Failed,
    Paused,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Failed)
    }

    /// Whether the item is still waiting to be picked up.
    pub fn is_queued(self) -> bool {
        matches!(self, ItemState::Pending | ItemState::Paused)
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Done)
                | (Processing, Failed)
                | (Pending, Paused)
                | (Processing, Paused)
                | (Paused, Pending)
        )
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One unit of processing tracked through the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub kind: ItemKind,
    pub source_path: PathBuf,
    /// Item that produced this one. A lookup key, never an ownership link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ItemId>,
    pub state: ItemState,
    pub queue_position: u64,
    /// Index into the run's stage list of the stage that consumes this item.
    pub stage: usize,
    /// Present iff `state == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Present iff `state == Done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl WorkItem {
    /// File name of the underlying media, for log lines and reports.
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Descriptor of an item about to be enqueued; the store assigns its
/// position and initial state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub id: ItemId,
    pub kind: ItemKind,
    pub source_path: PathBuf,
    pub parent_id: Option<ItemId>,
    pub stage: usize,
}

impl NewItem {
    /// A first-stage item for a source file, with a path-derived id.
    pub fn source(path: PathBuf, kind: ItemKind) -> Self {
        Self {
            id: ItemId::for_path(&path),
            kind,
            source_path: path,
            parent_id: None,
            stage: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// RunParameters
// ---------------------------------------------------------------------------

/// How frames are picked out of a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum FrameSelection {
    /// One frame every `seconds`.
    Interval { seconds: f64 },
    /// One frame per detected scene change above `threshold` (0.0 - 1.0).
    Scene { threshold: f64 },
}

impl Default for FrameSelection {
    fn default() -> Self {
        FrameSelection::Interval { seconds: 5.0 }
    }
}

/// Snapshot of everything needed to resume a run identically.
///
/// Immutable once the run has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Annotation provider name, resolved once at run start.
    pub provider: String,
    pub model: String,
    pub prompt_style: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub frame_selection: FrameSelection,
    /// Target extension for image conversion.
    pub convert_to: String,
    /// Image extensions that get converted during `normalize`.
    #[serde(default)]
    pub convert_from: Vec<String>,
    pub item_timeout_secs: u64,
    /// Maximum items `Processing` at once (1 = single worker).
    pub max_concurrent: usize,
    /// Where extracted frames and converted images are written.
    pub output_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl RunParameters {
    pub fn validate(&self) -> Result<()> {
        Stage::validate_list(&self.stages)?;
        if self.max_concurrent == 0 {
            return Err(Error::Validation("max_concurrent must be at least 1".into()));
        }
        if self.item_timeout_secs == 0 {
            return Err(Error::Validation("item_timeout_secs must be at least 1".into()));
        }
        if self.stages.contains(&Stage::Annotate) && self.provider.trim().is_empty() {
            return Err(Error::Validation(
                "an annotate stage needs a provider".into(),
            ));
        }
        Ok(())
    }

    pub fn stage(&self, index: usize) -> Option<Stage> {
        self.stages.get(index).copied()
    }
}

// ---------------------------------------------------------------------------
// StateCounts
// ---------------------------------------------------------------------------

/// Number of items in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
    pub paused: usize,
}

impl StateCounts {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            counts.record(item.state);
        }
        counts
    }

    pub fn record(&mut self, state: ItemState) {
        match state {
            ItemState::Pending => self.pending += 1,
            ItemState::Processing => self.processing += 1,
            ItemState::Done => self.done += 1,
            ItemState::Failed => self.failed += 1,
            ItemState::Paused => self.paused += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.done + self.failed + self.paused
    }

    /// Items that still need work.
    pub fn remaining(&self) -> usize {
        self.pending + self.processing + self.paused
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

// ---------------------------------------------------------------------------
// BatchState
// ---------------------------------------------------------------------------

/// The checkpoint unit: the full, ordered item list plus run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub format_version: u32,
    pub run_id: RunId,
    pub saved_at: DateTime<Utc>,
    /// Ordered by `queue_position`.
    pub items: Vec<WorkItem>,
    pub stage_cursor: usize,
    pub run_parameters: RunParameters,
}

impl BatchState {
    pub fn counts(&self) -> StateCounts {
        StateCounts::from_items(&self.items)
    }

    /// Every item is `Done` or `Failed`.
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(|i| i.state.is_terminal())
    }

    /// At least one item is still waiting to be picked up.
    pub fn is_resumable(&self) -> bool {
        self.items
            .iter()
            .any(|i| i.state.is_queued() || i.state == ItemState::Processing)
    }

    /// Check every structural invariant of a persisted batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptCheckpoint`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| Err(Error::CorruptCheckpoint(msg));

        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return corrupt(format!(
                "unsupported format version {} (expected {CHECKPOINT_FORMAT_VERSION})",
                self.format_version
            ));
        }
        if let Err(e) = self.run_parameters.validate() {
            return corrupt(format!("invalid run parameters: {e}"));
        }

        let stage_count = self.run_parameters.stages.len();
        if self.stage_cursor >= stage_count {
            return corrupt(format!(
                "stage cursor {} out of range for {stage_count} stages",
                self.stage_cursor
            ));
        }

        let mut seen: HashSet<&ItemId> = HashSet::with_capacity(self.items.len());
        let mut last_position: Option<u64> = None;
        let mut processing = 0usize;

        for item in &self.items {
            if !seen.insert(&item.id) {
                return corrupt(format!("duplicate item id {}", item.id));
            }
            if let Some(prev) = last_position {
                if item.queue_position <= prev {
                    return corrupt(format!(
                        "queue position {} of {} is not after {prev}",
                        item.queue_position, item.id
                    ));
                }
            }
            last_position = Some(item.queue_position);

            if let Some(parent) = &item.parent_id {
                // `seen` already holds the item itself, so reject self-links
                // explicitly.
                if parent == &item.id || !seen.contains(parent) {
                    return corrupt(format!(
                        "item {} references parent {parent} that does not precede it",
                        item.id
                    ));
                }
            }
            if item.stage >= stage_count {
                return corrupt(format!(
                    "item {} belongs to stage {} out of range",
                    item.id, item.stage
                ));
            }
            if (item.state == ItemState::Done) != item.result.is_some() {
                return corrupt(format!(
                    "item {} is {:?} but result presence is {}",
                    item.id,
                    item.state,
                    item.result.is_some()
                ));
            }
            if (item.state == ItemState::Failed) != item.last_error.is_some() {
                return corrupt(format!(
                    "item {} is {:?} but last_error presence is {}",
                    item.id,
                    item.state,
                    item.last_error.is_some()
                ));
            }
            if item.state == ItemState::Processing {
                processing += 1;
            }
        }

        if processing > self.run_parameters.max_concurrent {
            return corrupt(format!(
                "{processing} items processing but at most {} allowed",
                self.run_parameters.max_concurrent
            ));
        }

        Ok(())
    }
}
