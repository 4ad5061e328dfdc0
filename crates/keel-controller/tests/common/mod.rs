//! In-memory source repository and backend for behaviour tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_controller::{
    BoxFuture, ClusterBackend, Controller, ControllerConfig, ControllerError, SourceDocument,
    SourceRepo,
};
use keel_core::models::{
    Application, ApplicationState, ApplicationStatus, DesiredResource, Destination, LabelSelector,
    LiveObject, ResourceKey, SourceRef, SyncPolicy,
};
use serde_json::{Value, json};
use tempfile::TempDir;

pub const REPO: &str = "mem://platform";
pub const NAMESPACE: &str = "prod";
pub const LABEL: &str = "app.kubernetes.io/instance";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

pub fn deployment(name: &str, replicas: u64) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name },
        "spec": {
            "replicas": replicas,
            "template": { "spec": { "containers": [{ "name": name, "image": "nginx:1.27" }] } }
        }
    })
}

pub fn service(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name },
        "spec": { "ports": [{ "port": 80 }], "selector": { "app": name } }
    })
}

pub fn config_map(name: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name },
        "data": data
    })
}

pub fn namespace(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    })
}

pub fn key(kind: &str, name: &str) -> ResourceKey {
    ResourceKey::namespaced(kind, NAMESPACE, name)
}

pub fn application(name: &str, policy: SyncPolicy) -> Application {
    Application {
        name: name.to_string(),
        source: SourceRef {
            repo_url: REPO.to_string(),
            path: "apps/web".to_string(),
            target_revision: "main".to_string(),
        },
        destination: destination(),
        sync_policy: policy,
        ignore_differences: vec![],
        poll_interval_secs: None,
    }
}

pub fn destination() -> Destination {
    Destination {
        cluster: "local".to_string(),
        namespace: NAMESPACE.to_string(),
    }
}

pub fn auto_policy() -> SyncPolicy {
    SyncPolicy {
        automated: true,
        self_heal: true,
        prune: true,
        ..SyncPolicy::default()
    }
}

/// Config with fast retries and a poll interval long enough that only
/// explicit refreshes trigger follow-up cycles.
pub fn test_config(state_dir: &std::path::Path) -> ControllerConfig {
    let mut config = ControllerConfig::new(state_dir);
    config.poll_interval_secs = 3600;
    config.call_timeout_secs = 2;
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Controller harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub controller: Controller,
    pub source: Arc<MemorySource>,
    pub backend: Arc<MemoryBackend>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new();
        let backend = MemoryBackend::new();
        let controller =
            Controller::new(test_config(dir.path()), source.clone(), backend.clone()).unwrap();
        controller.start().await.unwrap();
        Self {
            controller,
            source,
            backend,
            dir,
        }
    }

    /// Shut down and start a fresh controller over the same state directory.
    pub async fn restart(self) -> Self {
        self.controller.shutdown().await;
        let controller = Controller::new(
            test_config(self.dir.path()),
            self.source.clone(),
            self.backend.clone(),
        )
        .unwrap();
        controller.start().await.unwrap();
        Self { controller, ..self }
    }

    pub async fn state(&self, app: &str) -> ApplicationState {
        self.controller.get_state(app).await.unwrap()
    }

    pub async fn status(&self, app: &str) -> ApplicationStatus {
        self.controller.get_status(app).await.unwrap()
    }

    /// Wait until `app` reaches `status`.
    pub async fn wait_for(&self, app: &str, status: ApplicationStatus) {
        let reached = eventually(|| async { self.status(app).await == status }).await;
        assert!(
            reached,
            "{app} never became {status}; state: {:?}",
            self.state(app).await
        );
    }

    /// Refresh `app` and wait for the cycle it triggers to record a plan.
    pub async fn refresh_and_wait(&self, app: &str) -> ApplicationState {
        let before = self.state(app).await.cycle;
        self.controller.refresh(app, false).await.unwrap();
        let advanced = eventually(|| async {
            let state = self.state(app).await;
            state.cycle > before && !state.progressing
        })
        .await;
        assert!(advanced, "no cycle completed after refresh");
        self.state(app).await
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Revisions published in memory. The repository path is ignored: every
/// path of a revision holds the same documents.
#[derive(Default)]
pub struct MemorySource {
    revisions: Mutex<HashMap<String, Vec<Value>>>,
    refs: Mutex<HashMap<String, String>>,
    fail_next: AtomicU32,
    list_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, revision: &str, manifests: Vec<Value>) {
        self.revisions
            .lock()
            .unwrap()
            .insert(revision.to_string(), manifests);
    }

    /// Publish `revision` and point `name` at it.
    pub fn push(&self, name: &str, revision: &str, manifests: Vec<Value>) {
        self.publish(revision, manifests);
        self.refs
            .lock()
            .unwrap()
            .insert(name.to_string(), revision.to_string());
    }

    /// The next `n` calls fail with `SourceUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), ControllerError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ControllerError::SourceUnavailable("connection reset".into()));
        }
        Ok(())
    }
}

impl SourceRepo for MemorySource {
    fn resolve<'a>(
        &'a self,
        _repo_url: &'a str,
        target: &'a str,
    ) -> BoxFuture<'a, Result<String, ControllerError>> {
        Box::pin(async move {
            self.take_failure()?;
            Ok(self
                .refs
                .lock()
                .unwrap()
                .get(target)
                .cloned()
                .unwrap_or_else(|| target.to_string()))
        })
    }

    fn list_resources<'a>(
        &'a self,
        _repo_url: &'a str,
        _path: &'a str,
        revision: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SourceDocument>, ControllerError>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.take_failure()?;
            let revisions = self.revisions.lock().unwrap();
            let manifests = revisions
                .get(revision)
                .ok_or_else(|| ControllerError::RevisionNotFound {
                    revision: revision.to_string(),
                })?;
            Ok(manifests
                .iter()
                .enumerate()
                .map(|(i, m)| SourceDocument {
                    file: format!("{revision}/{i}.json"),
                    manifest: m.clone(),
                })
                .collect())
        })
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// A single-cluster backend that behaves like a real API server: applied
/// objects come back with generated identifiers, a resource version,
/// timestamps and a status block.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<ResourceKey, Value>>,
    reject: Mutex<HashSet<ResourceKey>>,
    unreachable: AtomicBool,
    latency_ms: AtomicU64,
    next_version: AtomicU64,
    applies: AtomicUsize,
    deletes: AtomicUsize,
    applying: AtomicUsize,
    max_applying: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Place an object directly, as if created outside the controller.
    pub fn insert(&self, manifest: Value) -> ResourceKey {
        let resource = DesiredResource::from_manifest(manifest, "out-of-band", NAMESPACE).unwrap();
        let stored = self.materialize(&resource.key, resource.manifest);
        self.objects
            .lock()
            .unwrap()
            .insert(resource.key.clone(), stored);
        resource.key
    }

    /// Delete an object directly, bypassing the controller.
    pub fn remove(&self, key: &ResourceKey) -> bool {
        self.objects.lock().unwrap().remove(key).is_some()
    }

    /// Edit a live object in place, bypassing the controller.
    pub fn edit(&self, key: &ResourceKey, edit: impl FnOnce(&mut Value)) {
        if let Some(obj) = self.objects.lock().unwrap().get_mut(key) {
            edit(obj);
        }
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Value> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Reject every apply of `key`.
    pub fn reject(&self, key: ResourceKey) {
        self.reject.lock().unwrap().insert(key);
    }

    pub fn accept_all(&self) {
        self.reject.lock().unwrap().clear();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Most applies ever in progress at the same time.
    pub fn max_concurrent_applies(&self) -> usize {
        self.max_applying.load(Ordering::SeqCst)
    }

    fn materialize(&self, key: &ResourceKey, mut manifest: Value) -> Value {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        let existing_uid = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .and_then(|o| o.pointer("/metadata/uid").cloned());
        let uid = existing_uid.unwrap_or_else(|| json!(format!("uid-{version}")));

        if let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("uid".into(), uid);
            metadata.insert("resourceVersion".into(), json!(version.to_string()));
            metadata.insert("creationTimestamp".into(), json!("2026-01-01T00:00:00Z"));
            metadata.insert("generation".into(), json!(1));
        }
        if key.kind.as_str() == "Service" {
            if let Some(spec) = manifest.get_mut("spec").and_then(Value::as_object_mut) {
                spec.insert("clusterIP".into(), json!("10.0.0.10"));
            }
        }
        if let Some(obj) = manifest.as_object_mut() {
            obj.insert("status".into(), json!({ "observedGeneration": 1 }));
        }
        manifest
    }

    async fn call(&self) -> Result<(), ControllerError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ControllerError::DestinationUnreachable("connection refused".into()));
        }
        Ok(())
    }
}

impl ClusterBackend for MemoryBackend {
    fn get<'a>(
        &'a self,
        _destination: &'a Destination,
        key: &'a ResourceKey,
    ) -> BoxFuture<'a, Result<LiveObject, ControllerError>> {
        Box::pin(async move {
            self.call().await?;
            Ok(match self.object(key) {
                Some(obj) => LiveObject::Present(obj),
                None => LiveObject::NotFound,
            })
        })
    }

    fn apply<'a>(
        &'a self,
        _destination: &'a Destination,
        resource: &'a DesiredResource,
    ) -> BoxFuture<'a, Result<Value, ControllerError>> {
        Box::pin(async move {
            let now = self.applying.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_applying.fetch_max(now, Ordering::SeqCst);
            let result = self.call().await;
            self.applying.fetch_sub(1, Ordering::SeqCst);
            result?;
            if self.reject.lock().unwrap().contains(&resource.key) {
                return Err(ControllerError::ApplyFailed("admission webhook denied the request".into()));
            }
            self.applies.fetch_add(1, Ordering::SeqCst);
            let stored = self.materialize(&resource.key, resource.manifest.clone());
            self.objects
                .lock()
                .unwrap()
                .insert(resource.key.clone(), stored.clone());
            Ok(stored)
        })
    }

    fn delete<'a>(
        &'a self,
        _destination: &'a Destination,
        key: &'a ResourceKey,
    ) -> BoxFuture<'a, Result<bool, ControllerError>> {
        Box::pin(async move {
            self.call().await?;
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(self.remove(key))
        })
    }

    fn list_by_label<'a>(
        &'a self,
        _destination: &'a Destination,
        selector: &'a LabelSelector,
    ) -> BoxFuture<'a, Result<Vec<ResourceKey>, ControllerError>> {
        Box::pin(async move {
            self.call().await?;
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, obj)| selector.matches(obj))
                .map(|(key, _)| key.clone())
                .collect())
        })
    }
}
