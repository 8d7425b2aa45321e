//! Named pipeline stages and the item kinds each one consumes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::item::ItemKind;

/// One named step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Verify that each source file is present and readable.
    Acquire,
    /// Extract frames from videos and convert images into a describable format.
    Normalize,
    /// Ask the annotation provider for a description of each image.
    Annotate,
    /// Collect per-item outcomes into the run report.
    Report,
}

impl Stage {
    /// All stages in their canonical order.
    pub const ALL: [Stage; 4] = [
        Stage::Acquire,
        Stage::Normalize,
        Stage::Annotate,
        Stage::Report,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Normalize => "normalize",
            Stage::Annotate => "annotate",
            Stage::Report => "report",
        }
    }

    /// Whether items of `kind` are valid input for this stage.
    pub fn accepts(self, kind: ItemKind) -> bool {
        match self {
            Stage::Acquire => matches!(kind, ItemKind::SourceImage | ItemKind::SourceVideo),
            Stage::Normalize | Stage::Report => true,
            Stage::Annotate => !matches!(kind, ItemKind::SourceVideo),
        }
    }

    /// Parse a comma-separated stage list such as `"acquire,annotate"`.
    pub fn parse_list(s: &str) -> Result<Vec<Stage>> {
        let stages = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Stage::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::validate_list(&stages)?;
        Ok(stages)
    }

    /// Reject empty lists and repeated stages.
    pub fn validate_list(stages: &[Stage]) -> Result<()> {
        if stages.is_empty() {
            return Err(Error::Validation("stage list is empty".into()));
        }
        for (i, stage) in stages.iter().enumerate() {
            if stages[..i].contains(stage) {
                return Err(Error::Validation(format!(
                    "stage '{stage}' appears more than once"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "acquire" => Ok(Stage::Acquire),
            "normalize" => Ok(Stage::Normalize),
            "annotate" | "describe" => Ok(Stage::Annotate),
            "report" => Ok(Stage::Report),
            other => Err(Error::Validation(format!("unknown stage '{other}'"))),
        }
    }
}
