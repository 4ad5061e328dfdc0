mod common;

use keel_controller::{ControllerError, SyncRequest};
use keel_core::models::{ApplicationStatus, Initiator, SyncPolicy};
use serde_json::json;

use common::{Harness, application, deployment, key, service};

async fn deploy(h: &Harness, revision: &str, replicas: u64) {
    h.source
        .push("main", revision, vec![deployment("web", replicas), service("web")]);
    let result = h
        .controller
        .request_sync("web", SyncRequest::default())
        .await
        .unwrap();
    assert_eq!(result.revision, revision);
}

async fn manual_app() -> Harness {
    let h = Harness::start().await;
    h.source.push("main", "r1", vec![deployment("web", 1), service("web")]);
    h.controller
        .create_application(application("web", SyncPolicy::default()))
        .await
        .unwrap();
    h
}

#[tokio::test]
async fn every_sync_appends_one_entry() {
    let h = manual_app().await;
    deploy(&h, "r1", 1).await;
    deploy(&h, "r2", 2).await;
    deploy(&h, "r3", 3).await;

    let history = h.controller.list_history("web").await.unwrap();
    let revisions: Vec<&str> = history.iter().map(|e| e.revision.as_str()).collect();
    assert_eq!(revisions, vec!["r1", "r2", "r3"]);
    let ids: Vec<u64> = history.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(history.windows(2).all(|w| w[0].deployed_at <= w[1].deployed_at));
    assert!(history.iter().all(|e| e.source.target_revision == "main"));
}

#[tokio::test]
async fn rollback_redeploys_earlier_revision() {
    let h = manual_app().await;
    deploy(&h, "r1", 1).await;
    deploy(&h, "r2", 4).await;
    assert_eq!(
        h.backend.object(&key("Deployment", "web")).unwrap()["spec"]["replicas"],
        json!(4)
    );

    let result = h.controller.rollback("web", "r1").await.unwrap();
    assert_eq!(result.revision, "r1");
    assert!(!result.has_failures());
    assert_eq!(
        h.backend.object(&key("Deployment", "web")).unwrap()["spec"]["replicas"],
        json!(1)
    );

    // Diffing against the rolled-back revision again finds nothing.
    let plan = h.controller.preview("web", Some("r1")).await.unwrap();
    assert!(plan.is_empty(), "{:?}", plan.entries);
    assert_eq!(h.status("web").await, ApplicationStatus::Synced);

    let last = h.controller.list_history("web").await.unwrap().pop().unwrap();
    assert_eq!(last.revision, "r1");
    assert!(matches!(last.initiated_by, Initiator::Rollback(_)));

    // The target still points at r2, so the next poll reports drift.
    let state = h.refresh_and_wait("web").await;
    assert_eq!(state.status(), ApplicationStatus::OutOfSync);
}

#[tokio::test]
async fn rollback_to_unknown_revision_fails() {
    let h = manual_app().await;
    deploy(&h, "r1", 1).await;

    let err = h.controller.rollback("web", "r0").await.unwrap_err();
    assert!(matches!(err, ControllerError::RevisionNotFound { ref revision } if revision == "r0"));
    assert_eq!(h.controller.list_history("web").await.unwrap().len(), 1);
}

#[tokio::test]
async fn rollback_past_retention_fails() {
    let h = manual_app().await;
    let limit = h.controller.config().history_limit;
    for i in 1..=limit + 2 {
        deploy(&h, &format!("r{i}"), i as u64).await;
    }

    let history = h.controller.list_history("web").await.unwrap();
    assert_eq!(history.len(), limit);
    assert_eq!(history[0].revision, "r3");
    assert_eq!(history[0].id, 3);

    assert!(matches!(
        h.controller.rollback("web", "r1").await,
        Err(ControllerError::RevisionNotFound { .. })
    ));
    assert!(h.controller.rollback("web", "r3").await.is_ok());
}

#[tokio::test]
async fn rollback_rejected_while_automated() {
    let h = Harness::start().await;
    h.source.push("main", "r1", vec![service("web")]);
    h.controller
        .create_application(application("web", common::auto_policy()))
        .await
        .unwrap();
    h.wait_for("web", ApplicationStatus::Synced).await;

    let err = h.controller.rollback("web", "r1").await.unwrap_err();
    assert!(matches!(err, ControllerError::PolicyViolation(_)));
    assert_eq!(h.controller.list_history("web").await.unwrap().len(), 1);
}

#[tokio::test]
async fn history_survives_restart() {
    let h = manual_app().await;
    deploy(&h, "r1", 1).await;
    deploy(&h, "r2", 2).await;
    let before = h.controller.list_history("web").await.unwrap();

    let h = h.restart().await;
    let after = h.controller.list_history("web").await.unwrap();
    assert_eq!(before, after);

    deploy(&h, "r3", 3).await;
    let ids: Vec<u64> = h
        .controller
        .list_history("web")
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}
