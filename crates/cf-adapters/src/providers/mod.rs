//! HTTP annotation providers.

pub mod ollama;
pub mod openai;

pub use ollama::OllamaDescriber;
pub use openai::OpenAiDescriber;
