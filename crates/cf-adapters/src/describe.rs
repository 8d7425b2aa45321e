//! The annotation adapter contract.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

/// Token accounting reported by a provider, when it reports any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A provider's description of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

/// An image annotation provider.
///
/// Implementations are shared across workers behind an `Arc` and must not
/// retry internally: a failed call is reported once and the caller decides.
#[async_trait]
pub trait Describer: Send + Sync {
    /// Short, lowercase identifier (e.g. `"ollama"`).
    fn name(&self) -> &'static str;

    /// Describe the image at `path`.
    async fn describe(
        &self,
        path: &Path,
        prompt_style: &str,
        model: &str,
    ) -> Result<Description, AdapterError>;
}

/// Read an image and return its bytes with a MIME type guessed from the
/// extension.
pub(crate) async fn read_image(path: &Path) -> Result<(Vec<u8>, &'static str), AdapterError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AdapterError::invalid_input(format!("{}: {e}", path.display())))?;
    if bytes.is_empty() {
        return Err(AdapterError::invalid_input(format!(
            "{} is empty",
            path.display()
        )));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    };
    Ok((bytes, mime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdapterErrorKind;

    #[tokio::test]
    async fn read_image_guesses_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.PNG");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();
        let (bytes, mime) = read_image(&path).await.unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(mime, "image/png");
    }

    #[tokio::test]
    async fn missing_or_empty_image_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_image(&dir.path().join("nope.jpg")).await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidInput);

        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();
        let err = read_image(&empty).await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidInput);
    }
}
