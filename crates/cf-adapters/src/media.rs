//! The media transform adapter contract and its ffmpeg implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use cf_core::{FrameSelection, ItemId};

use crate::command::ToolCommand;
use crate::error::AdapterError;
use crate::tools::ToolRegistry;

/// Default ceiling on a single ffmpeg invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Produces describable images from videos and unsupported image formats.
#[async_trait]
pub trait MediaTransformer: Send + Sync {
    /// Extract frames from `video`, returned in presentation order.
    async fn extract_frames(
        &self,
        video: &Path,
        selection: &FrameSelection,
    ) -> Result<Vec<PathBuf>, AdapterError>;

    /// Convert the image at `path` to `target_ext` and return the new path.
    async fn convert_format(&self, path: &Path, target_ext: &str) -> Result<PathBuf, AdapterError>;
}

/// [`MediaTransformer`] that shells out to ffmpeg.
///
/// Output lands under `output_dir`, keyed by the path-derived id of the input
/// so that re-running an item overwrites its earlier output instead of
/// accumulating duplicates:
///
/// ```text
/// <output_dir>/frames/<id>/frame_0001.jpg
/// <output_dir>/converted/<id>.<ext>
/// ```
pub struct FfmpegTransformer {
    ffmpeg: PathBuf,
    output_dir: PathBuf,
    timeout: Duration,
}

impl FfmpegTransformer {
    pub fn new(ffmpeg: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            ffmpeg,
            output_dir,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Resolve ffmpeg from a tool registry.
    pub fn from_registry(tools: &ToolRegistry, output_dir: PathBuf) -> cf_core::Result<Self> {
        Ok(Self::new(tools.require("ffmpeg")?.to_path_buf(), output_dir))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.timeout(self.timeout)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"]);
        cmd
    }

    async fn run(&self, cmd: &ToolCommand) -> Result<(), AdapterError> {
        cmd.execute().await.map(|_| ()).map_err(AdapterError::from)
    }
}

/// The `-vf` filter for a frame selection.
fn frame_filter(selection: &FrameSelection) -> Result<String, AdapterError> {
    match *selection {
        FrameSelection::Interval { seconds } if seconds > 0.0 && seconds.is_finite() => {
            Ok(format!("fps=1/{seconds}"))
        }
        FrameSelection::Scene { threshold } if (0.0..=1.0).contains(&threshold) => {
            Ok(format!("select='gt(scene,{threshold})'"))
        }
        ref other => Err(AdapterError::invalid_input(format!(
            "invalid frame selection {other:?}"
        ))),
    }
}

fn ensure_input(path: &Path) -> Result<(), AdapterError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(AdapterError::invalid_input(format!(
            "{} does not exist or is not a file",
            path.display()
        )))
    }
}

fn io_error(context: &Path, e: std::io::Error) -> AdapterError {
    AdapterError::unknown(format!("{}: {e}", context.display()))
}

#[async_trait]
impl MediaTransformer for FfmpegTransformer {
    async fn extract_frames(
        &self,
        video: &Path,
        selection: &FrameSelection,
    ) -> Result<Vec<PathBuf>, AdapterError> {
        ensure_input(video)?;
        let filter = frame_filter(selection)?;

        let dir = self
            .output_dir
            .join("frames")
            .join(ItemId::for_path(video).as_str());
        // Frames left by an interrupted attempt would be picked up twice.
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let mut cmd = self.command();
        cmd.arg("-i")
            .arg(video.to_string_lossy())
            .arg("-vf")
            .arg(filter);
        if matches!(selection, FrameSelection::Scene { .. }) {
            cmd.args(["-vsync", "vfr"]);
        }
        cmd.args(["-q:v", "2"])
            .arg(dir.join("frame_%04d.jpg").to_string_lossy());

        tracing::debug!(video = %video.display(), ?selection, "Extracting frames");
        self.run(&cmd).await?;

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        let mut frames = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            let is_frame = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("frame_") && n.ends_with(".jpg"));
            if is_frame {
                frames.push(path);
            }
        }
        frames.sort();

        tracing::debug!(video = %video.display(), count = frames.len(), "Extracted frames");
        Ok(frames)
    }

    async fn convert_format(&self, path: &Path, target_ext: &str) -> Result<PathBuf, AdapterError> {
        ensure_input(path)?;
        let target_ext = target_ext.trim_start_matches('.').to_ascii_lowercase();
        if target_ext.is_empty() {
            return Err(AdapterError::invalid_input("empty target extension"));
        }

        let dir = self.output_dir.join("converted");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        let output = dir.join(format!("{}.{target_ext}", ItemId::for_path(path)));

        let mut cmd = self.command();
        cmd.arg("-i")
            .arg(path.to_string_lossy())
            .args(["-frames:v", "1"])
            .arg(output.to_string_lossy());

        tracing::debug!(input = %path.display(), output = %output.display(), "Converting image");
        self.run(&cmd).await?;

        if !output.is_file() {
            return Err(AdapterError::unknown(format!(
                "ffmpeg reported success but {} was not written",
                output.display()
            )));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdapterErrorKind;

    #[test]
    fn filters_for_selection() {
        assert_eq!(
            frame_filter(&FrameSelection::Interval { seconds: 2.5 }).unwrap(),
            "fps=1/2.5"
        );
        assert_eq!(
            frame_filter(&FrameSelection::Scene { threshold: 0.3 }).unwrap(),
            "select='gt(scene,0.3)'"
        );
        assert!(frame_filter(&FrameSelection::Interval { seconds: 0.0 }).is_err());
        assert!(frame_filter(&FrameSelection::Scene { threshold: 1.5 }).is_err());
    }

    #[tokio::test]
    async fn missing_input_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let transformer = FfmpegTransformer::new(PathBuf::from("ffmpeg"), dir.path().into());
        let err = transformer
            .extract_frames(&dir.path().join("gone.mp4"), &FrameSelection::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidInput);
    }

    /// Install a shell script standing in for ffmpeg. It records its
    /// arguments and writes files next to the output pattern.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("ffmpeg");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extract_frames_lists_output_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let args_log = dir.path().join("args.txt");
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            &format!(
                "echo \"$@\" > {log}\nfor last; do :; done\nout=$(dirname \"$last\")\n\
                 touch \"$out/frame_0002.jpg\" \"$out/frame_0001.jpg\" \"$out/notes.txt\"",
                log = args_log.display()
            ),
        );
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"video").unwrap();

        let transformer = FfmpegTransformer::new(ffmpeg, dir.path().join("out"));
        let frames = transformer
            .extract_frames(&video, &FrameSelection::Interval { seconds: 2.0 })
            .await
            .unwrap();

        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["frame_0001.jpg", "frame_0002.jpg"]);
        let args = std::fs::read_to_string(&args_log).unwrap();
        assert!(args.contains("fps=1/2"), "args: {args}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_ffmpeg_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), "echo 'Invalid data found' >&2\nexit 1");
        let image = dir.path().join("photo.heic");
        std::fs::write(&image, b"heic").unwrap();

        let transformer = FfmpegTransformer::new(ffmpeg, dir.path().join("out"));
        let err = transformer.convert_format(&image, "jpg").await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Unknown);
        assert!(err.message.contains("Invalid data found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_ffmpeg_is_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), "sleep 10");
        let image = dir.path().join("photo.heic");
        std::fs::write(&image, b"heic").unwrap();

        let transformer = FfmpegTransformer::new(ffmpeg, dir.path().join("out"))
            .with_timeout(Duration::from_millis(200));
        let err = transformer.convert_format(&image, "jpg").await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Timeout);
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_mentioning_a_timeout_is_not_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), "echo 'Connection timed out' >&2\nexit 1");
        let image = dir.path().join("photo.heic");
        std::fs::write(&image, b"heic").unwrap();

        let transformer = FfmpegTransformer::new(ffmpeg, dir.path().join("out"));
        let err = transformer.convert_format(&image, "jpg").await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Unknown);
        assert!(err.message.contains("Connection timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn convert_format_returns_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), "for last; do :; done\ntouch \"$last\"");
        let image = dir.path().join("photo.tiff");
        std::fs::write(&image, b"tiff").unwrap();

        let transformer = FfmpegTransformer::new(ffmpeg, dir.path().join("out"));
        let out = transformer.convert_format(&image, ".JPG").await.unwrap();
        assert!(out.is_file());
        assert_eq!(out.extension().unwrap(), "jpg");
    }
}
