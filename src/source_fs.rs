//! Filesystem knowledge source.
//!
//! Lists the files directly inside the knowledge directory whose name
//! matches `*.{extension}`, sorted by name so every build sees the same
//! order. Subdirectories are not descended into.

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use kb_harness_core::corpus::DocumentSource;
use kb_harness_core::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn extension_matcher(extension: &str) -> Result<GlobMatcher> {
    let pattern = format!("*.{}", extension.trim_start_matches('.'));
    Glob::new(&pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::InvalidConfig(format!("bad extension pattern {}: {}", pattern, e)))
}

/// Blocking directory scan; run it off the async runtime.
fn scan_dir(root: &Path, matcher: &GlobMatcher) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(Error::SourceUnavailable(format!(
            "knowledge directory does not exist: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            Error::SourceUnavailable(format!("cannot list {}: {}", root.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if matcher.is_match(&name) {
            files.push(name);
        }
    }

    files.sort();
    Ok(files)
}

#[async_trait]
impl DocumentSource for FsSource {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn list_files(&self, extension: &str) -> Result<Vec<String>> {
        let matcher = extension_matcher(extension)?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_dir(&root, &matcher))
            .await
            .map_err(|e| Error::Internal(format!("directory scan aborted: {}", e)))?
    }

    async fn read_file(&self, identifier: &str) -> Result<String> {
        let path = self.root.join(identifier);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::DocumentReadFailure(format!("{}: {}", path.display(), e)))
    }
}
