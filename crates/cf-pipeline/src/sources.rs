//! Input discovery.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use cf_core::{Error, ItemKind, Result};

/// Every recognised image or video under `dir`, sorted by path.
///
/// Symlinks are not followed. Unreadable entries are skipped with a warning.
pub fn collect_sources(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::Validation(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut sources: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                tracing::warn!("Skipping unreadable entry: {err}");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| ItemKind::classify(p).is_some())
        .collect();
    sources.sort();

    tracing::debug!(dir = %dir.display(), count = sources.len(), "Collected sources");
    Ok(sources)
}

/// Expand command-line inputs: directories are walked, files are taken
/// as given. The result keeps argument order and drops repeated paths.
///
/// # Errors
///
/// [`Error::Validation`] for a path that does not exist or a file that is
/// neither an image nor a video.
pub fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = Vec::new();
    for input in inputs {
        let found = if input.is_dir() {
            collect_sources(input)?
        } else if input.is_file() {
            if ItemKind::classify(input).is_none() {
                return Err(Error::Validation(format!(
                    "{} is not a supported image or video",
                    input.display()
                )));
            }
            vec![input.clone()]
        } else {
            return Err(Error::Validation(format!(
                "{} does not exist",
                input.display()
            )));
        };
        for path in found {
            if !out.contains(&path) {
                out.push(path);
            }
        }
    }
    Ok(out)
}
