//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! storage locations, run defaults, provider endpoints, and tool paths. Every
//! section defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::item::{FrameSelection, RunParameters};
use crate::stage::Stage;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one checkpoint file per run.
    pub checkpoint_dir: PathBuf,
    /// Directory for extracted frames and converted images.
    pub output_dir: PathBuf,
    pub defaults: RunDefaults,
    pub providers: ProvidersConfig,
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(".captionforge/checkpoints"),
            output_dir: PathBuf::from(".captionforge/work"),
            defaults: RunDefaults::default(),
            providers: ProvidersConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.max_concurrent == 0 {
            warnings.push("defaults.max_concurrent is 0; 1 will be used".into());
        }
        if self.defaults.item_timeout_secs == 0 {
            warnings.push("defaults.item_timeout_secs is 0; items would time out at once".into());
        }
        if let Err(e) = Stage::validate_list(&self.defaults.stages) {
            warnings.push(format!("defaults.stages: {e}"));
        }

        let provider = self.defaults.provider.as_str();
        let known = ["ollama", "openai"];
        if !known.contains(&provider) {
            warnings.push(format!(
                "defaults.provider '{provider}' is not a known provider (valid: {})",
                known.join(", ")
            ));
        }
        if provider == "ollama" && !self.providers.ollama.enabled {
            warnings.push("defaults.provider is 'ollama' but providers.ollama is disabled".into());
        }
        if provider == "openai" && !self.providers.openai.enabled {
            warnings.push("defaults.provider is 'openai' but providers.openai is disabled".into());
        }
        if self.providers.openai.enabled && self.providers.openai.api_key.is_none() {
            warnings.push("providers.openai is enabled but no api_key is set".into());
        }
        if self.providers.openai.requests_per_second == 0 {
            warnings.push("providers.openai.requests_per_second is 0; 1 will be used".into());
        }

        warnings
    }

    /// Build run parameters from the configured defaults.
    pub fn run_parameters(&self) -> RunParameters {
        let d = &self.defaults;
        RunParameters {
            provider: d.provider.clone(),
            model: d.model.clone(),
            prompt_style: d.prompt_style.clone(),
            stages: d.stages.clone(),
            frame_selection: d.frame_selection.clone(),
            convert_to: d.convert_to.clone(),
            convert_from: d.convert_from.clone(),
            item_timeout_secs: d.item_timeout_secs,
            max_concurrent: d.max_concurrent.max(1),
            output_dir: self.output_dir.clone(),
            report_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Defaults applied to new runs; CLI flags override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub provider: String,
    pub model: String,
    pub prompt_style: String,
    pub stages: Vec<Stage>,
    pub frame_selection: FrameSelection,
    pub convert_to: String,
    pub convert_from: Vec<String>,
    #[serde(default = "default_item_timeout")]
    pub item_timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_item_timeout() -> u64 {
    120
}

fn default_max_concurrent() -> usize {
    1
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            provider: "ollama".into(),
            model: "llava".into(),
            prompt_style: "detailed".into(),
            stages: Stage::ALL.to_vec(),
            frame_selection: FrameSelection::default(),
            convert_to: "jpg".into(),
            convert_from: vec!["heic".into(), "heif".into(), "tif".into(), "tiff".into()],
            item_timeout_secs: default_item_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Annotation provider endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub ollama: OllamaConfig,
    pub openai: OpenAiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub enabled: bool,
    pub base_url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".into(),
        }
    }
}

/// An OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_requests_per_second() -> u32 {
    2
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            requests_per_second: default_requests_per_second(),
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
}
