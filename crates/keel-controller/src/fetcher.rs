//! Desired-state fetcher: resolves a target revision and returns the
//! resources declared there, caching per immutable revision.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use keel_core::models::{DesiredResource, SourceRef};
use tokio::sync::RwLock;

use crate::error::ControllerError;
use crate::retry::RetryPolicy;
use crate::source::{SourceDocument, SourceRepo};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    repo_url: String,
    path: String,
    revision: String,
}

/// Resources declared at one resolved revision.
#[derive(Debug, Clone)]
pub struct FetchedRevision {
    pub revision: String,
    pub resources: Vec<DesiredResource>,
}

pub struct Fetcher {
    source: Arc<dyn SourceRepo>,
    retry: RetryPolicy,
    cache: RwLock<HashMap<CacheKey, Arc<Vec<SourceDocument>>>>,
}

impl Fetcher {
    pub fn new(source: Arc<dyn SourceRepo>, retry: RetryPolicy) -> Self {
        Self {
            source,
            retry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a symbolic target to an immutable revision. Never cached:
    /// branches move.
    pub async fn resolve(&self, source: &SourceRef, target: &str) -> Result<String, ControllerError> {
        self.retry
            .run("resolve revision", || self.source.resolve(&source.repo_url, target))
            .await
    }

    /// Resources under `source.path` at `revision` (already resolved).
    ///
    /// Namespaced resources without an explicit namespace are placed in
    /// `default_namespace`.
    pub async fn fetch(
        &self,
        source: &SourceRef,
        revision: &str,
        default_namespace: &str,
    ) -> Result<FetchedRevision, ControllerError> {
        let documents = self.documents(source, revision).await?;

        let mut seen = HashSet::new();
        let mut resources = Vec::with_capacity(documents.len());
        for doc in documents.iter() {
            let resource =
                DesiredResource::from_manifest(doc.manifest.clone(), revision, default_namespace)
                    .map_err(|e| ControllerError::InvalidDocument {
                        file: doc.file.clone(),
                        reason: e.to_string(),
                    })?;
            if !seen.insert(resource.key.clone()) {
                return Err(ControllerError::InvalidDocument {
                    file: doc.file.clone(),
                    reason: format!("duplicate resource {}", resource.key),
                });
            }
            resources.push(resource);
        }

        Ok(FetchedRevision {
            revision: revision.to_string(),
            resources,
        })
    }

    /// Resolve `target` then fetch it.
    pub async fn fetch_target(
        &self,
        source: &SourceRef,
        target: &str,
        default_namespace: &str,
    ) -> Result<FetchedRevision, ControllerError> {
        let revision = self.resolve(source, target).await?;
        self.fetch(source, &revision, default_namespace).await
    }

    async fn documents(
        &self,
        source: &SourceRef,
        revision: &str,
    ) -> Result<Arc<Vec<SourceDocument>>, ControllerError> {
        let key = CacheKey {
            repo_url: source.repo_url.clone(),
            path: source.path.clone(),
            revision: revision.to_string(),
        };

        if let Some(cached) = self.cache.read().await.get(&key) {
            tracing::debug!(repo = %key.repo_url, revision = %revision, "revision cache hit");
            return Ok(cached.clone());
        }

        let documents = self
            .retry
            .run("list resources", || {
                self.source
                    .list_resources(&source.repo_url, &source.path, revision)
            })
            .await?;
        let documents = Arc::new(documents);

        self.cache.write().await.insert(key, documents.clone());
        tracing::debug!(
            repo = %source.repo_url,
            path = %source.path,
            revision = %revision,
            documents = documents.len(),
            "revision fetched"
        );
        Ok(documents)
    }

    /// Drop cached revisions of `source` so the next fetch goes to the repository.
    pub async fn invalidate(&self, source: &SourceRef) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|k, _| !(k.repo_url == source.repo_url && k.path == source.path));
        tracing::debug!(
            repo = %source.repo_url,
            dropped = before - cache.len(),
            "revision cache invalidated"
        );
    }

    /// Drop cached revisions of `source` that are not in `keep`.
    pub async fn retain_revisions(&self, source: &SourceRef, keep: &HashSet<&str>) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|k, _| {
            k.repo_url != source.repo_url
                || k.path != source.path
                || keep.contains(k.revision.as_str())
        });
        let dropped = before - cache.len();
        if dropped > 0 {
            tracing::debug!(repo = %source.repo_url, dropped, "stale revisions evicted");
        }
    }

    /// Whether `revision` of `source` is currently cached.
    pub async fn is_cached(&self, source: &SourceRef, revision: &str) -> bool {
        self.cache.read().await.contains_key(&CacheKey {
            repo_url: source.repo_url.clone(),
            path: source.path.clone(),
            revision: revision.to_string(),
        })
    }
}
