use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use keel_controller::fetcher::Fetcher;
use keel_controller::{ControllerError, DirectorySource, RetryPolicy, SourceRepo};
use keel_core::models::SourceRef;
use serde_json::json;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        root,
        "a1b2c3/apps/web/deployment.json",
        &json!({"kind": "Deployment", "metadata": {"name": "web"}, "spec": {"replicas": 2}}).to_string(),
    );
    write(
        root,
        "a1b2c3/apps/web/extra/services.json",
        &json!([
            {"kind": "Service", "metadata": {"name": "web"}},
            {"kind": "Service", "metadata": {"name": "web-internal"}}
        ])
        .to_string(),
    );
    write(root, "a1b2c3/apps/web/README.md", "not a resource");
    write(root, "refs/main", "a1b2c3\n");
    dir
}

#[tokio::test]
async fn reads_documents_recursively_in_path_order() {
    let dir = repo();
    let url = dir.path().to_str().unwrap();
    let docs = DirectorySource::new()
        .list_resources(url, "apps/web", "a1b2c3")
        .await
        .unwrap();

    let files: Vec<&str> = docs.iter().map(|d| d.file.as_str()).collect();
    assert_eq!(
        files,
        vec![
            "apps/web/deployment.json",
            "apps/web/extra/services.json[0]",
            "apps/web/extra/services.json[1]",
        ]
    );
    assert_eq!(docs[2].manifest["metadata"]["name"], "web-internal");
}

#[tokio::test]
async fn resolves_symbolic_refs() {
    let dir = repo();
    let url = format!("file://{}", dir.path().display());
    let source = DirectorySource::new();
    assert_eq!(source.resolve(&url, "main").await.unwrap(), "a1b2c3");
    // Anything without a ref file is taken as a revision id.
    assert_eq!(source.resolve(&url, "a1b2c3").await.unwrap(), "a1b2c3");
}

#[tokio::test]
async fn missing_revision_and_path_are_permanent() {
    let dir = repo();
    let url = dir.path().to_str().unwrap();
    let source = DirectorySource::new();

    let err = source.list_resources(url, "apps/web", "ffff").await.unwrap_err();
    assert!(matches!(err, ControllerError::RevisionNotFound { .. }));

    let err = source.list_resources(url, "apps/api", "a1b2c3").await.unwrap_err();
    assert!(matches!(err, ControllerError::PathNotFound { .. }));

    let err = source.list_resources(url, "apps/web", "../a1b2c3").await.unwrap_err();
    assert!(matches!(err, ControllerError::RevisionNotFound { .. }));
}

#[tokio::test]
async fn missing_repository_is_transient() {
    let err = DirectorySource::new()
        .list_resources("/nonexistent/keel-repo", "", "a1b2c3")
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn malformed_document_names_the_file() {
    let dir = repo();
    write(dir.path(), "a1b2c3/apps/web/broken.json", "{ not json");
    let err = DirectorySource::new()
        .list_resources(dir.path().to_str().unwrap(), "apps/web", "a1b2c3")
        .await
        .unwrap_err();
    match err {
        ControllerError::InvalidDocument { file, .. } => assert_eq!(file, "apps/web/broken.json"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn fetcher_caches_by_resolved_revision() {
    let dir = repo();
    let source = SourceRef {
        repo_url: dir.path().to_str().unwrap().to_string(),
        path: "apps/web".into(),
        target_revision: "main".into(),
    };
    let fetcher = Fetcher::new(Arc::new(DirectorySource::new()), RetryPolicy::default());

    let fetched = fetcher.fetch_target(&source, "main", "prod").await.unwrap();
    assert_eq!(fetched.revision, "a1b2c3");
    assert_eq!(fetched.resources.len(), 3);
    assert!(fetched.resources.iter().all(|r| r.revision == "a1b2c3"));
    assert!(
        fetched
            .resources
            .iter()
            .all(|r| r.key.namespace.as_deref() == Some("prod"))
    );
    assert!(fetcher.is_cached(&source, "a1b2c3").await);

    // Cached content is served even if the directory changes underneath.
    std::fs::remove_file(dir.path().join("a1b2c3/apps/web/deployment.json")).unwrap();
    let again = fetcher.fetch(&source, "a1b2c3", "prod").await.unwrap();
    assert_eq!(again.resources.len(), 3);

    fetcher.invalidate(&source).await;
    assert!(!fetcher.is_cached(&source, "a1b2c3").await);
    let fresh = fetcher.fetch(&source, "a1b2c3", "prod").await.unwrap();
    assert_eq!(fresh.resources.len(), 2);
}

#[tokio::test]
async fn duplicate_resources_are_rejected() {
    let dir = repo();
    write(
        dir.path(),
        "a1b2c3/apps/web/zz-dup.json",
        &json!({"kind": "Service", "metadata": {"name": "web"}}).to_string(),
    );
    let source = SourceRef {
        repo_url: dir.path().to_str().unwrap().to_string(),
        path: "apps/web".into(),
        target_revision: "a1b2c3".into(),
    };
    let fetcher = Fetcher::new(Arc::new(DirectorySource::new()), RetryPolicy::default());
    let err = fetcher.fetch(&source, "a1b2c3", "prod").await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidDocument { .. }));
}

#[tokio::test]
async fn stale_revisions_are_evicted_from_cache() {
    let dir = repo();
    write(
        dir.path(),
        "d4e5f6/apps/web/deployment.json",
        &json!({"kind": "Deployment", "metadata": {"name": "web"}, "spec": {"replicas": 3}}).to_string(),
    );
    let source = SourceRef {
        repo_url: dir.path().to_str().unwrap().to_string(),
        path: "apps/web".into(),
        target_revision: "main".into(),
    };
    let fetcher = Fetcher::new(Arc::new(DirectorySource::new()), RetryPolicy::default());
    fetcher.fetch(&source, "a1b2c3", "prod").await.unwrap();
    fetcher.fetch(&source, "d4e5f6", "prod").await.unwrap();

    let other = SourceRef {
        path: "apps/api".into(),
        ..source.clone()
    };
    fetcher
        .retain_revisions(&other, &HashSet::from(["nothing"]))
        .await;
    assert!(fetcher.is_cached(&source, "a1b2c3").await, "other paths untouched");

    fetcher
        .retain_revisions(&source, &HashSet::from(["d4e5f6"]))
        .await;
    assert!(!fetcher.is_cached(&source, "a1b2c3").await);
    assert!(fetcher.is_cached(&source, "d4e5f6").await);
}
