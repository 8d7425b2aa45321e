//! # cf-adapters
//!
//! External capability adapters: the collaborators a run calls but does not
//! implement.
//!
//! - [`Describer`] -- image annotation providers ([`OllamaDescriber`],
//!   [`OpenAiDescriber`]) selected through a [`ProviderRegistry`].
//! - [`MediaTransformer`] -- video frame extraction and image format
//!   conversion, implemented by [`FfmpegTransformer`].
//! - [`ToolCommand`] / [`ToolRegistry`] -- external CLI invocation with
//!   timeouts and `PATH` discovery.
//!
//! Every adapter failure is an [`AdapterError`]: an item-level outcome that
//! the caller records on the item, never a run-level fault.

pub mod command;
pub mod describe;
pub mod error;
pub mod media;
pub mod prompt;
pub mod providers;
pub mod registry;
pub mod tools;

pub use command::{ToolCommand, ToolOutput};
pub use describe::{Description, Describer, TokenUsage};
pub use error::{AdapterError, AdapterErrorKind};
pub use media::{FfmpegTransformer, MediaTransformer};
pub use providers::{OllamaDescriber, OpenAiDescriber};
pub use registry::ProviderRegistry;
pub use tools::{ToolInfo, ToolRegistry};
