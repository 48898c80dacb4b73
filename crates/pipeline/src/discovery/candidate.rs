//! Filesystem enumeration of candidate recordings. Blocking; run on
//! `spawn_blocking`.

use std::path::{Path, PathBuf};

use packline_core::types::{from_millis, Timestamp};
use walkdir::WalkDir;

use crate::config::SourceConfig;

/// A recording found on disk, before probing and filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Canonical absolute path.
    pub path: PathBuf,
    pub camera_id: String,
    pub mtime_ms: i64,
}

impl Candidate {
    pub fn modified_at(&self) -> Timestamp {
        from_millis(self.mtime_ms)
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Result of one enumeration: candidates plus the count of entries that
/// could not be read.
#[derive(Debug, Default)]
pub struct Enumeration {
    pub candidates: Vec<Candidate>,
    pub errors: usize,
}

/// Walk every source root and collect files with an accepted extension.
pub fn enumerate_sources(sources: &[SourceConfig], extensions: &[String]) -> Enumeration {
    let mut out = Enumeration::default();
    for source in sources {
        if !source.root.is_dir() {
            tracing::warn!(
                camera_id = %source.camera_id,
                root = %source.root.display(),
                "Source directory missing, skipping",
            );
            out.errors += 1;
            continue;
        }
        for entry in WalkDir::new(&source.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(camera_id = %source.camera_id, error = %e, "Unreadable directory entry");
                    out.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_extension(entry.path(), extensions) {
                continue;
            }
            match stat(entry.path(), &source.camera_id) {
                Ok(candidate) => out.candidates.push(candidate),
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to stat file");
                    out.errors += 1;
                }
            }
        }
    }
    out
}

/// Resolve an explicit list of files and directories (custom mode).
///
/// Each path is attributed to the source whose root contains it; paths
/// outside every source are attributed to `"custom"`.
pub fn enumerate_paths(
    paths: &[PathBuf],
    sources: &[SourceConfig],
    extensions: &[String],
) -> Enumeration {
    let mut out = Enumeration::default();
    for path in paths {
        let camera_id = camera_for(path, sources);
        if path.is_dir() {
            let nested = SourceConfig {
                camera_id,
                root: path.clone(),
            };
            let found = enumerate_sources(std::slice::from_ref(&nested), extensions);
            out.candidates.extend(found.candidates);
            out.errors += found.errors;
            continue;
        }
        match stat(path, &camera_id) {
            Ok(candidate) => out.candidates.push(candidate),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to stat file");
                out.errors += 1;
            }
        }
    }
    out
}

fn stat(path: &Path, camera_id: &str) -> std::io::Result<Candidate> {
    let canonical = std::fs::canonicalize(path)?;
    let modified = std::fs::metadata(&canonical)?.modified()?;
    let mtime_ms = chrono::DateTime::<chrono::Utc>::from(modified).timestamp_millis();
    Ok(Candidate {
        path: canonical,
        camera_id: camera_id.to_string(),
        mtime_ms,
    })
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|accepted| accepted.eq_ignore_ascii_case(e)))
}

/// Longest matching source root wins.
fn camera_for(path: &Path, sources: &[SourceConfig]) -> String {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    sources
        .iter()
        .filter_map(|source| {
            let root = std::fs::canonicalize(&source.root).unwrap_or_else(|_| source.root.clone());
            canonical
                .starts_with(&root)
                .then(|| (root.components().count(), &source.camera_id))
        })
        .max_by_key(|(depth, _)| *depth)
        .map(|(_, camera)| camera.clone())
        .unwrap_or_else(|| "custom".to_string())
}
