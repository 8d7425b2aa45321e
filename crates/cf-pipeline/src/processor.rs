//! Per-stage item processing.
//!
//! An [`ItemProcessor`] turns one work item into a result string plus the
//! items it hands to the next stage. [`StageProcessor`] is the built-in
//! implementation for the four named stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use cf_adapters::{AdapterError, Describer, MediaTransformer};
use cf_core::{ItemId, ItemKind, NewItem, RunParameters, Stage, WorkItem};
use cf_store::WorkStore;

/// What processing one item produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutput {
    /// Stored on the item when it becomes `Done`.
    pub result: String,
    /// Items for the next stage, enqueued together with the `Done`
    /// transition.
    pub follow_ups: Vec<NewItem>,
}

impl ItemOutput {
    pub fn new(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            follow_ups: Vec::new(),
        }
    }
}

/// Processes the items of one stage.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, item: &WorkItem) -> Result<ItemOutput, AdapterError>;
}

/// Collaborators shared by the stage processors of one run.
pub struct StageContext {
    pub params: RunParameters,
    /// Read-only lookups of earlier items (report stage).
    pub store: Arc<WorkStore>,
    /// Resolved once at run start; required when the run annotates.
    pub describer: Option<Arc<dyn Describer>>,
    /// Required when the run normalizes.
    pub transformer: Option<Arc<dyn MediaTransformer>>,
}

/// Built-in processor for the stage at `index` of the run's stage list.
pub struct StageProcessor {
    index: usize,
    stage: Stage,
    ctx: Arc<StageContext>,
}

impl StageProcessor {
    pub fn new(index: usize, stage: Stage, ctx: Arc<StageContext>) -> Self {
        Self { index, stage, ctx }
    }

    /// One processor per stage of the run, in order.
    pub fn for_run(ctx: Arc<StageContext>) -> Vec<Arc<dyn ItemProcessor>> {
        ctx.params
            .stages
            .iter()
            .enumerate()
            .map(|(i, &stage)| {
                Arc::new(StageProcessor::new(i, stage, ctx.clone())) as Arc<dyn ItemProcessor>
            })
            .collect()
    }

    /// A next-stage item, or `None` if this is the last stage or the next
    /// stage does not take `kind`.
    fn follow_up(
        &self,
        parent: &WorkItem,
        kind: ItemKind,
        path: PathBuf,
        suffix: &str,
    ) -> Option<NewItem> {
        let next = self.index + 1;
        let next_stage = self.ctx.params.stage(next)?;
        if !next_stage.accepts(kind) {
            tracing::debug!(
                item_id = %parent.id,
                kind = kind.as_str(),
                stage = %next_stage,
                "Output not carried to next stage"
            );
            return None;
        }
        Some(NewItem {
            id: parent.id.child(suffix),
            kind,
            source_path: path,
            parent_id: Some(parent.id.clone()),
            stage: next,
        })
    }

    /// The item itself, carried into the next stage.
    fn carry(&self, item: &WorkItem) -> Vec<NewItem> {
        let suffix = self
            .ctx
            .params
            .stage(self.index + 1)
            .map(Stage::name)
            .unwrap_or_default();
        self.follow_up(item, item.kind, item.source_path.clone(), suffix)
            .into_iter()
            .collect()
    }

    async fn acquire(&self, item: &WorkItem) -> Result<ItemOutput, AdapterError> {
        let path = &item.source_path;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| AdapterError::invalid_input(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(AdapterError::invalid_input(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let resolved = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.clone());

        Ok(ItemOutput {
            result: resolved.to_string_lossy().to_string(),
            follow_ups: self.carry(item),
        })
    }

    async fn normalize(&self, item: &WorkItem) -> Result<ItemOutput, AdapterError> {
        let path = &item.source_path;
        match item.kind {
            ItemKind::SourceVideo => {
                let frames = self
                    .transformer()?
                    .extract_frames(path, &self.ctx.params.frame_selection)
                    .await?;
                if frames.is_empty() {
                    return Err(AdapterError::invalid_input(format!(
                        "no frames extracted from {}",
                        path.display()
                    )));
                }
                let count = frames.len();
                let follow_ups = frames
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, frame)| {
                        self.follow_up(item, ItemKind::DerivedFrame, frame, &format!("f{:04}", i + 1))
                    })
                    .collect();
                Ok(ItemOutput {
                    result: format!("extracted {count} frames"),
                    follow_ups,
                })
            }
            ItemKind::SourceImage if self.needs_conversion(path) => {
                let converted = self
                    .transformer()?
                    .convert_format(path, &self.ctx.params.convert_to)
                    .await?;
                Ok(ItemOutput {
                    result: converted.to_string_lossy().to_string(),
                    follow_ups: self
                        .follow_up(item, ItemKind::ConvertedImage, converted, "converted")
                        .into_iter()
                        .collect(),
                })
            }
            _ => Ok(ItemOutput {
                result: path.to_string_lossy().to_string(),
                follow_ups: self.carry(item),
            }),
        }
    }

    async fn annotate(&self, item: &WorkItem) -> Result<ItemOutput, AdapterError> {
        let describer = self
            .ctx
            .describer
            .as_ref()
            .ok_or_else(|| AdapterError::unknown("no annotation provider configured"))?;
        let params = &self.ctx.params;
        let description = describer
            .describe(&item.source_path, &params.prompt_style, &params.model)
            .await?;
        if let Some(usage) = description.token_usage {
            tracing::debug!(
                item_id = %item.id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Token usage"
            );
        }
        Ok(ItemOutput {
            result: description.text,
            follow_ups: self.carry(item),
        })
    }

    fn report(&self, item: &WorkItem) -> Result<ItemOutput, AdapterError> {
        let description = self.nearest_annotation(item);
        let source = self.root_source(item);
        let entry = json!({
            "id": item.id.as_str(),
            "kind": item.kind.as_str(),
            "path": item.source_path,
            "source": source,
            "description": description,
        });
        Ok(ItemOutput {
            result: entry.to_string(),
            follow_ups: self.carry(item),
        })
    }

    /// Result of the closest `Done` ancestor that went through `annotate`.
    fn nearest_annotation(&self, item: &WorkItem) -> Option<String> {
        let annotate = self
            .ctx
            .params
            .stages
            .iter()
            .position(|&s| s == Stage::Annotate)?;
        self.ancestors(item)
            .into_iter()
            .find(|a| a.stage == annotate)
            .and_then(|a| a.result)
    }

    /// Path of the first-stage item this one descends from.
    fn root_source(&self, item: &WorkItem) -> PathBuf {
        self.ancestors(item)
            .pop()
            .map(|a| a.source_path)
            .unwrap_or_else(|| item.source_path.clone())
    }

    /// Parents of `item`, nearest first.
    fn ancestors(&self, item: &WorkItem) -> Vec<WorkItem> {
        let mut out = Vec::new();
        let mut next: Option<ItemId> = item.parent_id.clone();
        while let Some(id) = next {
            let Some(parent) = self.ctx.store.get(&id) else {
                break;
            };
            next = parent.parent_id.clone();
            out.push(parent);
        }
        out
    }

    fn needs_conversion(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.ctx
            .params
            .convert_from
            .iter()
            .any(|from| from.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    fn transformer(&self) -> Result<&Arc<dyn MediaTransformer>, AdapterError> {
        self.ctx
            .transformer
            .as_ref()
            .ok_or_else(|| AdapterError::unknown("no media transformer configured"))
    }
}

#[async_trait]
impl ItemProcessor for StageProcessor {
    async fn process(&self, item: &WorkItem) -> Result<ItemOutput, AdapterError> {
        if !self.stage.accepts(item.kind) {
            return Err(AdapterError::invalid_input(format!(
                "stage {} does not accept {} items",
                self.stage,
                item.kind.as_str()
            )));
        }

        match self.stage {
            Stage::Acquire => self.acquire(item).await,
            Stage::Normalize => self.normalize(item).await,
            Stage::Annotate => self.annotate(item).await,
            Stage::Report => self.report(item),
        }
    }
}
