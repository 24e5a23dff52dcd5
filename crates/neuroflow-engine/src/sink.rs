use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::debug;

use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::traits::{Publication, Sink};
use neuroflow_core::types::Value;

/// Apply ordered literal substitutions to a relative path.
///
/// Pairs are tried in order against the text no earlier pair replaced; a
/// replacement is never matched again by a later pattern. Empty path
/// components left behind are dropped, so substituting a whole directory
/// name away collapses the path.
pub fn apply_substitutions(path: &str, substitutions: &[(String, String)]) -> String {
    // (text, replaced)
    let mut segments: Vec<(String, bool)> = vec![(path.to_string(), false)];
    for (pattern, replacement) in substitutions {
        if pattern.is_empty() {
            continue;
        }
        let mut next = Vec::with_capacity(segments.len());
        for (text, replaced) in segments {
            if replaced || !text.contains(pattern.as_str()) {
                next.push((text, replaced));
                continue;
            }
            let mut pieces = text.split(pattern.as_str()).peekable();
            while let Some(piece) = pieces.next() {
                if !piece.is_empty() {
                    next.push((piece.to_string(), false));
                }
                if pieces.peek().is_some() {
                    next.push((replacement.clone(), true));
                }
            }
        }
        segments = next;
    }
    let out: String = segments.into_iter().map(|(text, _)| text).collect();
    out.split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

// ── MemorySink ──────────────────────────────────────────────────

/// One output held by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredOutput {
    pub container: String,
    pub path: String,
    pub value: Value,
}

/// Keeps publications in memory. Used by tests and `plan` dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    stored: Mutex<Vec<StoredOutput>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in publication order.
    pub fn publications(&self) -> Vec<StoredOutput> {
        self.stored.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Distinct containers, sorted.
    pub fn containers(&self) -> Vec<String> {
        let mut containers: Vec<String> = self
            .publications()
            .into_iter()
            .map(|p| p.container)
            .collect();
        containers.sort();
        containers.dedup();
        containers
    }

    /// Published paths within one container, sorted.
    pub fn paths_in(&self, container: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .publications()
            .into_iter()
            .filter(|p| p.container == container)
            .map(|p| p.path)
            .collect();
        paths.sort();
        paths
    }
}

impl Sink for MemorySink {
    fn publish<'a>(&'a self, publication: Publication<'a>) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let path = apply_substitutions(publication.relative_path, publication.substitutions);
            let mut stored = self
                .stored
                .lock()
                .map_err(|e| FlowError::Sink(format!("memory sink poisoned: {}", e)))?;
            stored.push(StoredOutput {
                container: publication.container.to_string(),
                path: path.clone(),
                value: publication.value.clone(),
            });
            Ok(path)
        })
    }
}

// ── FsSink ──────────────────────────────────────────────────────

/// Publishes outputs under `<base_dir>/<container>/<path>`.
///
/// A string value naming an existing file is copied; any other value is
/// written as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct FsSink {
    base_dir: PathBuf,
}

impl FsSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl Sink for FsSink {
    fn publish<'a>(&'a self, publication: Publication<'a>) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let path = apply_substitutions(publication.relative_path, publication.substitutions);
            let dest = self.base_dir.join(publication.container).join(&path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let mut source = publication.value.as_str().map(Path::new);
            if let Some(src) = source {
                let is_file = tokio::fs::metadata(src)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false);
                if !is_file {
                    source = None;
                }
            }
            match source {
                Some(src) => {
                    tokio::fs::copy(src, &dest).await.map_err(|e| {
                        FlowError::Sink(format!(
                            "copy {} -> {}: {}",
                            src.display(),
                            dest.display(),
                            e
                        ))
                    })?;
                }
                _ => {
                    let body = serde_json::to_string_pretty(publication.value)?;
                    tokio::fs::write(&dest, body).await?;
                }
            }

            debug!(container = %publication.container, path = %path, "Published output");
            Ok(path)
        })
    }
}
