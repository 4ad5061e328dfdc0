use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::error::ControllerError;
use crate::source::{BoxFuture, SourceDocument, SourceRepo};

/// Serves revisions exported to a local directory tree.
///
/// Layout, with the repository URL naming a directory (optionally `file://`):
///
/// ```text
/// <repo>/<revision>/<path>/**/*.json   resource documents (object or array)
/// <repo>/refs/<name>                   symbolic ref holding a revision id
/// ```
#[derive(Debug, Clone, Default)]
pub struct DirectorySource;

impl DirectorySource {
    pub fn new() -> Self {
        Self
    }

    fn repo_root(repo_url: &str) -> PathBuf {
        PathBuf::from(repo_url.strip_prefix("file://").unwrap_or(repo_url))
    }

    async fn resolve_ref(repo_url: &str, target: &str) -> Result<String, ControllerError> {
        let root = Self::repo_root(repo_url);
        ensure_repo(&root).await?;
        check_segment(target)?;

        match tokio::fs::read_to_string(root.join("refs").join(target)).await {
            Ok(contents) => {
                let revision = contents.trim().to_string();
                if revision.is_empty() {
                    return Err(ControllerError::RevisionNotFound {
                        revision: target.to_string(),
                    });
                }
                tracing::debug!(target = %target, revision = %revision, "resolved ref");
                Ok(revision)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(target.to_string()),
            Err(e) => Err(ControllerError::SourceUnavailable(format!(
                "{}: {e}",
                root.display()
            ))),
        }
    }

    async fn read_documents(
        repo_url: &str,
        path: &str,
        revision: &str,
    ) -> Result<Vec<SourceDocument>, ControllerError> {
        let root = Self::repo_root(repo_url);
        ensure_repo(&root).await?;
        check_segment(revision)?;

        let revision_dir = root.join(revision);
        if !is_dir(&revision_dir).await {
            return Err(ControllerError::RevisionNotFound {
                revision: revision.to_string(),
            });
        }

        let rel = Path::new(path.trim_matches('/'));
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(ControllerError::PathNotFound {
                path: path.to_string(),
                revision: revision.to_string(),
            });
        }
        let base = revision_dir.join(rel);
        if !is_dir(&base).await {
            return Err(ControllerError::PathNotFound {
                path: path.to_string(),
                revision: revision.to_string(),
            });
        }

        let mut files = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
                ControllerError::SourceUnavailable(format!("{}: {e}", dir.display()))
            })?;
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry_path);
                } else if entry_path.extension().is_some_and(|ext| ext == "json") {
                    files.push(entry_path);
                }
            }
        }
        files.sort();

        let mut documents = Vec::new();
        for file in files {
            let display = file
                .strip_prefix(&revision_dir)
                .unwrap_or(&file)
                .display()
                .to_string();
            let contents = tokio::fs::read(&file).await?;
            let parsed: Value =
                serde_json::from_slice(&contents).map_err(|e| ControllerError::InvalidDocument {
                    file: display.clone(),
                    reason: e.to_string(),
                })?;
            match parsed {
                Value::Array(items) => {
                    for (i, manifest) in items.into_iter().enumerate() {
                        documents.push(SourceDocument {
                            file: format!("{display}[{i}]"),
                            manifest,
                        });
                    }
                }
                manifest => documents.push(SourceDocument {
                    file: display,
                    manifest,
                }),
            }
        }

        tracing::debug!(
            repo = %repo_url,
            path = %path,
            revision = %revision,
            documents = documents.len(),
            "read revision from directory"
        );
        Ok(documents)
    }
}

impl SourceRepo for DirectorySource {
    fn resolve<'a>(
        &'a self,
        repo_url: &'a str,
        target: &'a str,
    ) -> BoxFuture<'a, Result<String, ControllerError>> {
        Box::pin(Self::resolve_ref(repo_url, target))
    }

    fn list_resources<'a>(
        &'a self,
        repo_url: &'a str,
        path: &'a str,
        revision: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SourceDocument>, ControllerError>> {
        Box::pin(Self::read_documents(repo_url, path, revision))
    }
}

async fn ensure_repo(root: &Path) -> Result<(), ControllerError> {
    if is_dir(root).await {
        Ok(())
    } else {
        Err(ControllerError::SourceUnavailable(format!(
            "repository not reachable: {}",
            root.display()
        )))
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn check_segment(revision: &str) -> Result<(), ControllerError> {
    let mut components = Path::new(revision).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if revision != "refs" => Ok(()),
        _ => Err(ControllerError::RevisionNotFound {
            revision: revision.to_string(),
        }),
    }
}
