//! Trait contract tests for Build.
//!
//! These tests verify the behavioral contract of the event log using the
//! in-memory fake. Any conforming implementation must pass these.

use std::sync::Arc;

use build_ledger::fakes::MemoryBuild;
use build_ledger::*;

fn log(plan: &str, payload: &str) -> BuildEvent {
    BuildEvent::Log(LogEvent {
        origin: Origin::stdout(PlanId::from(plan)),
        time: 0,
        payload: payload.to_string(),
    })
}

#[tokio::test]
async fn build_identity_is_exposed() {
    let build = MemoryBuild::new("main", "deploy").with_id(7, "12");

    assert_eq!(build.id(), BuildId(7));
    assert_eq!(build.name(), "12");
    assert_eq!(build.team_name(), "main");
    assert_eq!(build.pipeline_name(), "deploy");
}

#[tokio::test]
async fn tracing_attrs_carry_team_and_pipeline() {
    let build = MemoryBuild::new("main", "deploy");
    let attrs = build.tracing_attrs();

    assert_eq!(attrs.get("team").map(String::as_str), Some("main"));
    assert_eq!(attrs.get("pipeline").map(String::as_str), Some("deploy"));
    assert_eq!(attrs.get("build_id").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn events_keep_append_order() {
    let build = MemoryBuild::new("t", "p");
    for chunk in ["a", "b", "c"] {
        build.save_event(log("step1", chunk)).await.unwrap();
    }

    let records = build.records();
    let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2]);

    let payloads: Vec<String> = build
        .events()
        .into_iter()
        .filter_map(|e| match e {
            BuildEvent::Log(l) => Some(l.payload),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn events_for_filters_by_origin() {
    let build = MemoryBuild::new("t", "p");
    build.save_event(log("step1", "one")).await.unwrap();
    build.save_event(log("step2", "two")).await.unwrap();
    build.save_event(log("step1", "three")).await.unwrap();

    assert_eq!(build.events_for(&PlanId::from("step1")).len(), 2);
    assert_eq!(build.events_for(&PlanId::from("step2")).len(), 1);
    assert!(build.events_for(&PlanId::from("step3")).is_empty());
}

#[tokio::test]
async fn rejected_save_appends_nothing() {
    let build = MemoryBuild::new("t", "p");
    build.reject_events(true);

    let err = build.save_event(log("step1", "lost")).await.unwrap_err();
    assert!(matches!(err, StorageError::SaveRejected { .. }));
    assert!(build.events().is_empty());

    build.reject_events(false);
    build.save_event(log("step1", "kept")).await.unwrap();
    assert_eq!(build.records()[0].sequence, 0);
}

#[tokio::test]
async fn image_versions_are_recorded() {
    let build = MemoryBuild::new("t", "p");
    let cache = UsedResourceCache {
        id: 3,
        resource_type: "registry-image".to_string(),
        version: [("digest".to_string(), "sha256:abc".to_string())]
            .into_iter()
            .collect(),
    };

    build.save_image_resource_version(&cache).await.unwrap();
    assert_eq!(build.image_versions(), vec![cache.clone()]);

    build.reject_image_versions(true);
    let err = build.save_image_resource_version(&cache).await.unwrap_err();
    assert!(err.to_string().contains("resource cache 3"));
}

#[tokio::test]
async fn concurrent_steps_append_safely() {
    let build = Arc::new(MemoryBuild::new("t", "p"));

    let mut tasks = Vec::new();
    for step in 0..8 {
        let build = Arc::clone(&build);
        tasks.push(tokio::spawn(async move {
            let plan = format!("step{step}");
            for i in 0..10 {
                build
                    .save_event(log(&plan, &i.to_string()))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(build.records().len(), 80);
    for step in 0..8 {
        let payloads: Vec<String> = build
            .events_for(&PlanId::new(format!("step{step}")))
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::Log(l) => Some(l.payload),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(payloads, expected);
    }
}
