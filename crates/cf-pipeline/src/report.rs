//! Final per-run report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cf_core::{BatchState, Error, ItemId, ItemKind, ItemState, Result, RunId, Stage, StateCounts};
use cf_store::atomic_write;

/// Outcome of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub id: ItemId,
    pub kind: ItemKind,
    pub stage: Stage,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ItemId>,
    pub state: ItemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub generated_at: DateTime<Utc>,
    pub stages: Vec<Stage>,
    pub counts: StateCounts,
    pub items: Vec<ReportEntry>,
}

impl RunReport {
    pub fn from_state(state: &BatchState) -> Self {
        let stages = state.run_parameters.stages.clone();
        let items = state
            .items
            .iter()
            .filter_map(|item| {
                Some(ReportEntry {
                    id: item.id.clone(),
                    kind: item.kind,
                    stage: *stages.get(item.stage)?,
                    path: item.source_path.clone(),
                    parent_id: item.parent_id.clone(),
                    state: item.state,
                    result: item.result.clone(),
                    error: item.last_error.clone(),
                })
            })
            .collect();

        Self {
            run_id: state.run_id,
            generated_at: Utc::now(),
            counts: state.counts(),
            stages,
            items,
        }
    }

    /// Entries that ended `Failed`, with their reasons.
    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.items.iter().filter(|e| e.state == ItemState::Failed)
    }

    /// Write the report as pretty JSON, atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(path, &json).map_err(Error::from)?;
        tracing::info!(run_id = %self.run_id, path = %path.display(), "Report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::{FrameSelection, NewItem, RunParameters};
    use cf_store::WorkStore;

    fn finished_state() -> BatchState {
        let params = RunParameters {
            provider: "fake".into(),
            model: "m".into(),
            prompt_style: "concise".into(),
            stages: vec![Stage::Annotate],
            frame_selection: FrameSelection::default(),
            convert_to: "jpg".into(),
            convert_from: vec![],
            item_timeout_secs: 5,
            max_concurrent: 1,
            output_dir: PathBuf::from("/tmp/out"),
            report_path: None,
        };
        let store = WorkStore::new(RunId::new(), params);
        for (name, ok) in [("a.jpg", true), ("b.jpg", false)] {
            let item = NewItem::source(PathBuf::from(name), ItemKind::SourceImage);
            let id = item.id.clone();
            store.enqueue(item).unwrap();
            store
                .transition(&id, ItemState::Pending, ItemState::Processing, None)
                .unwrap();
            if ok {
                store.complete(&id, "a dog".into(), vec![]).unwrap();
            } else {
                store
                    .transition(
                        &id,
                        ItemState::Processing,
                        ItemState::Failed,
                        Some("auth_failure: HTTP 401".into()),
                    )
                    .unwrap();
            }
        }
        store.snapshot()
    }

    #[test]
    fn failures_keep_their_reason() {
        let report = RunReport::from_state(&finished_state());
        assert_eq!(report.counts.done, 1);
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("auth_failure: HTTP 401"));
        assert_eq!(failures[0].stage, Stage::Annotate);
    }

    #[test]
    fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let report = RunReport::from_state(&finished_state());
        report.write(&path).unwrap();

        let back: RunReport =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back.items, report.items);
    }
}
