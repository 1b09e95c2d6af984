//! Image fetching: policy gate, check/get sub-plans, provenance and wiring.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use build_ledger::{PlanId, UsedResourceCache};
use common::Harness;
use serde_json::json;
use step_delegate::fakes::{FakeArtifactSourcer, FakePolicyChecker, ScriptedRun};
use step_delegate::{
    Artifact, CheckPlan, DelegateError, GetPlan, GetResult, Plan, PlanStep, PolicyCheckOutput,
    Source, StepContext, ACTION_USE_IMAGE,
};

const CHECK_ID: &str = "img-check";
const GET_ID: &str = "img-get";

fn image_source() -> Source {
    let mut source = Source::new();
    source.insert("repository".into(), json!("registry.local/alpine"));
    source.insert("username".into(), json!("u"));
    source.insert("password".into(), json!("pw"));
    source
}

fn get_plan() -> Plan {
    Plan::new(
        GET_ID,
        PlanStep::Get(GetPlan {
            name: "image".into(),
            resource_type: "registry-image".into(),
            source: image_source(),
            params: None,
            version: None,
        }),
    )
}

fn check_plan() -> Plan {
    Plan::new(
        CHECK_ID,
        PlanStep::Check(CheckPlan {
            name: "image".into(),
            resource_type: "registry-image".into(),
            source: image_source(),
        }),
    )
}

fn resource_cache() -> UsedResourceCache {
    UsedResourceCache {
        id: 42,
        resource_type: "registry-image".into(),
        version: BTreeMap::from([("digest".to_string(), "sha256:abc".to_string())]),
    }
}

fn volume() -> Artifact {
    Artifact {
        handle: "vol-1".into(),
        worker_name: Some("worker-1".into()),
    }
}

/// Script a get that leaves its result and artifact behind.
fn script_successful_get(h: &Harness) {
    let result = serde_json::to_value(GetResult {
        name: "image".into(),
        resource_cache: resource_cache(),
    })
    .unwrap();
    h.journal.script(
        GET_ID,
        ScriptedRun::succeed()
            .with_result(result)
            .with_artifact("image", volume()),
    );
}

fn enforcing_policy() -> FakePolicyChecker {
    FakePolicyChecker::checking(&[ACTION_USE_IMAGE])
}

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_runs_check_then_get_in_one_child_scope() {
    let h = Harness::new();
    script_successful_get(&h);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let (spec, cache) = delegate
        .fetch_image(&ctx, &get_plan(), Some(&check_plan()), true)
        .await
        .unwrap();

    assert_eq!(
        h.journal.runs(),
        vec![PlanId::from(CHECK_ID), PlanId::from(GET_ID)]
    );
    assert_eq!(h.journal.scopes_created(), 1);
    // image scopes are not var source scopes
    assert!(h
        .journal
        .runs_with_lineage()
        .iter()
        .all(|(_, lineage)| lineage.is_empty()));

    assert_eq!(cache, resource_cache());
    assert_eq!(h.build.image_versions(), vec![resource_cache()]);

    assert!(spec.privileged);
    assert_eq!(spec.image_artifact_source.artifact, volume());
    assert_eq!(spec.image_artifact_source.volume_handle, "vol-1-rootfs");
    assert_eq!(h.sourcer.sourced(), vec![volume()]);
}

#[tokio::test]
async fn fetch_without_check_plan_only_gets() {
    let h = Harness::new();
    script_successful_get(&h);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let (spec, _) = delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap();

    assert_eq!(h.journal.runs(), vec![PlanId::from(GET_ID)]);
    assert!(!spec.privileged);
}

#[tokio::test]
async fn fetch_records_no_build_events() {
    let h = Harness::new();
    script_successful_get(&h);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    delegate
        .fetch_image(&ctx, &get_plan(), Some(&check_plan()), false)
        .await
        .unwrap();

    assert!(h.build.events().is_empty());
}

// ---------------------------------------------------------------------------
// Policy gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unchecked_action_skips_policy_engine() {
    let h = Harness::new().with_policy(FakePolicyChecker::checking(&["SetPipeline"]));
    script_successful_get(&h);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap();

    assert!(h.policy.inputs().is_empty());
}

#[tokio::test]
async fn policy_input_has_redacted_source() {
    let h = Harness::new().with_policy(enforcing_policy());
    h.state.track_credential("registry_password", "pw");
    h.state.track_credential("registry_user", "u");
    script_successful_get(&h);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    delegate
        .fetch_image(&ctx, &get_plan(), None, true)
        .await
        .unwrap();

    let inputs = h.policy.inputs();
    assert_eq!(inputs.len(), 1);
    let input = &inputs[0];
    assert_eq!(input.action, ACTION_USE_IMAGE);
    assert_eq!(input.team, "t");
    assert_eq!(input.pipeline, "p");
    assert_eq!(input.data["image_type"], json!("registry-image"));
    assert_eq!(input.data["privileged"], json!(true));
    assert_eq!(
        input.data["image_source"],
        json!({
            "repository": "registry.local/alpine",
            // single characters are never treated as secrets
            "username": "u",
            "password": "((redacted))",
        })
    );
}

#[tokio::test]
async fn policy_denial_stops_before_any_sub_plan() {
    let h = Harness::new().with_policy(
        enforcing_policy().with_verdict(PolicyCheckOutput::deny(["privileged images are forbidden"])),
    );
    script_successful_get(&h);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), Some(&check_plan()), true)
        .await
        .unwrap_err();

    match &err {
        DelegateError::PolicyCheckNotPass { reasons } => {
            assert_eq!(reasons, &vec!["privileged images are forbidden".to_string()])
        }
        other => panic!("expected PolicyCheckNotPass, got {:?}", other),
    }
    assert_eq!(
        err.to_string(),
        "policy check failed: privileged images are forbidden"
    );
    assert_eq!(h.journal.scopes_created(), 0);
    assert!(h.journal.runs().is_empty());
    assert!(h.build.image_versions().is_empty());
    assert!(h.sourcer.sourced().is_empty());
}

#[tokio::test]
async fn policy_engine_failure_is_wrapped() {
    let h = Harness::new().with_policy(enforcing_policy().failing("opa unreachable"));
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::PolicyCheck(_)));
    assert!(err.to_string().starts_with("perform check:"));
    assert!(h.journal.runs().is_empty());
}

// ---------------------------------------------------------------------------
// Sub-plan failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_check_skips_get() {
    let h = Harness::new();
    h.journal.script(CHECK_ID, ScriptedRun::Fail);
    script_successful_get(&h);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), Some(&check_plan()), false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::ImageCheckFailed));
    assert_eq!(h.journal.runs(), vec![PlanId::from(CHECK_ID)]);
}

#[tokio::test]
async fn erroring_check_is_propagated() {
    let h = Harness::new();
    h.journal
        .script(CHECK_ID, ScriptedRun::Error("worker lost".into()));
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), Some(&check_plan()), false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::Exec(_)));
    assert!(err.to_string().contains("worker lost"));
}

#[tokio::test]
async fn failed_get_is_image_fetch_failure() {
    let h = Harness::new();
    h.journal.script(GET_ID, ScriptedRun::Fail);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::ImageFetchFailed));
    assert!(h.build.image_versions().is_empty());
}

#[tokio::test]
async fn get_without_result_is_reported() {
    let h = Harness::new();
    // unscripted plans succeed without leaving anything behind
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::GetNoResult));
}

#[tokio::test]
async fn version_save_failure_stops_before_wiring() {
    let h = Harness::new();
    script_successful_get(&h);
    h.build.reject_image_versions(true);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::SaveImageVersion(_)));
    assert!(h.sourcer.sourced().is_empty());
}

#[tokio::test]
async fn missing_artifact_is_named() {
    let h = Harness::new();
    let result = serde_json::to_value(GetResult {
        name: "image".into(),
        resource_cache: resource_cache(),
    })
    .unwrap();
    h.journal
        .script(GET_ID, ScriptedRun::succeed().with_result(result));
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap_err();

    match err {
        DelegateError::FetchedArtifactNotFound { name } => assert_eq!(name, "image"),
        other => panic!("expected FetchedArtifactNotFound, got {:?}", other),
    }
    // provenance is recorded before wiring is attempted
    assert_eq!(h.build.image_versions(), vec![resource_cache()]);
}

#[tokio::test]
async fn wiring_failure_is_wrapped() {
    let h = Harness::new().with_sourcer(FakeArtifactSourcer::failing("volume gone"));
    script_successful_get(&h);
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::WireImage(_)));
    assert!(err.to_string().contains("volume gone"));
}

#[tokio::test]
async fn non_get_plan_is_rejected() {
    let h = Harness::new();
    let delegate = h.delegate();
    let ctx = StepContext::background();

    let err = delegate
        .fetch_image(&ctx, &check_plan(), None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::InvalidPlan { .. }));
    assert_eq!(h.journal.scopes_created(), 0);
}

#[tokio::test]
async fn cancellation_interrupts_hanging_get() {
    let h = Harness::new();
    h.journal.script(GET_ID, ScriptedRun::Hang);
    let delegate = h.delegate();
    let (handle, ctx) = StepContext::new();

    let plan = get_plan();
    let fetch = delegate.fetch_image(&ctx, &plan, None, false);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(fetch, cancel)
    })
    .await
    .expect("cancelled fetch must not hang");

    assert!(matches!(result, Err(DelegateError::Cancelled)));
    assert!(h.build.image_versions().is_empty());
}

#[tokio::test]
async fn already_cancelled_context_runs_nothing() {
    let h = Harness::new();
    script_successful_get(&h);
    let delegate = h.delegate();
    let (handle, ctx) = StepContext::new();
    handle.cancel();

    let err = delegate
        .fetch_image(&ctx, &get_plan(), None, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DelegateError::Cancelled));
    assert!(h.journal.runs().is_empty());
}
