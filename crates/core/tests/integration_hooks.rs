//! Integration tests for hook pipeline ordering and failure aggregation
//!
//! Uses the in-memory runtime, so no daemon is needed.

mod common;

use common::{controller, expected_pairs, recording_bundle, Recorder};
use scuttle_core::container_spec::ContainerSpec;
use scuttle_core::docker::mock::{MockOperation, MockRuntime};
use scuttle_core::errors::{ConfigError, ScuttleError};
use scuttle_core::hooks::{HandleHook, HookPhase, LifecycleHookBundle, SpecHook};
use std::sync::Arc;

fn spec_with_user_bundles(recorder: &Recorder, count: usize) -> ContainerSpec {
    (0..count).fold(ContainerSpec::new("alpine:3"), |spec, i| {
        spec.with_hooks(recording_bundle(recorder, &format!("user{}", i)))
    })
}

fn default_bundles(recorder: &Recorder, count: usize) -> Vec<LifecycleHookBundle> {
    (0..count)
        .map(|i| recording_bundle(recorder, &format!("default{}", i)))
        .collect()
}

#[tokio::test]
async fn test_pre_hooks_run_defaults_first_and_post_hooks_user_first() {
    let runtime = Arc::new(MockRuntime::new());
    let recorder = Recorder::default();

    let container = controller(&runtime, "hooks")
        .create(
            spec_with_user_bundles(&recorder, 3),
            &default_bundles(&recorder, 2),
        )
        .await
        .unwrap();

    let pre = expected_pairs(&["default0", "default1", "user0", "user1", "user2"]);
    let post = expected_pairs(&["user0", "user1", "user2", "default0", "default1"]);
    assert_eq!(pre.len(), 10);

    assert_eq!(recorder.with_prefix("pre-create:"), pre);
    assert_eq!(recorder.with_prefix("post-create:"), post);

    container.start().await.unwrap();
    assert_eq!(recorder.with_prefix("pre-start:"), pre);
    assert_eq!(recorder.with_prefix("post-start:"), post);
    assert_eq!(recorder.with_prefix("post-ready:"), post);

    container.stop(None).await.unwrap();
    assert_eq!(recorder.with_prefix("pre-stop:"), pre);
    assert_eq!(recorder.with_prefix("post-stop:"), post);

    container.terminate().await.unwrap();
    assert_eq!(recorder.with_prefix("pre-terminate:"), pre);
    assert_eq!(recorder.with_prefix("post-terminate:"), post);

    // Ready has no pre form
    assert!(recorder.with_prefix("pre-ready:").is_empty());
    assert_eq!(recorder.entries().len(), 9 * 10);
}

#[tokio::test]
async fn test_every_hook_runs_when_one_fails() {
    let runtime = Arc::new(MockRuntime::new());
    let recorder = Recorder::default();

    let mut bundle = LifecycleHookBundle::new();
    for i in 0..5 {
        let recorder = recorder.clone();
        bundle = bundle.pre_start(HandleHook::from_fn(move |_| {
            recorder.push(format!("hook{}", i));
            if i == 2 {
                Err(ScuttleError::hook("third hook failed"))
            } else {
                Ok(())
            }
        }));
    }

    let container = controller(&runtime, "aggregate")
        .create(ContainerSpec::new("alpine").with_hooks(bundle), &[])
        .await
        .unwrap();

    let err = container.start().await.unwrap_err();
    assert_eq!(recorder.entries(), ["hook0", "hook1", "hook2", "hook3", "hook4"]);
    match err {
        ScuttleError::Hooks(aggregate) => {
            assert_eq!(aggregate.phase, HookPhase::PreStart);
            assert_eq!(aggregate.failures.len(), 1);
            assert!(aggregate.to_string().contains("third hook failed"));
        }
        other => panic!("expected hook aggregate, got {other:?}"),
    }

    // A failed pre-start edge never reaches the engine
    assert_eq!(runtime.call_count(MockOperation::Start), 0);
    assert!(!container.is_running());
}

#[tokio::test]
async fn test_pre_create_hook_mutates_spec() {
    let runtime = Arc::new(MockRuntime::new());
    let bundle = LifecycleHookBundle::new().pre_create(SpecHook::from_fn(|spec| {
        spec.env.insert("MODE".to_string(), "test".to_string());
        spec.labels.insert("team".to_string(), "infra".to_string());
        Ok(())
    }));

    let container = controller(&runtime, "mutate")
        .create(ContainerSpec::new("alpine").with_hooks(bundle), &[])
        .await
        .unwrap();

    let created = runtime.container(container.id()).unwrap();
    assert_eq!(created.env.get("MODE").map(String::as_str), Some("test"));
    assert_eq!(created.labels.get("team").map(String::as_str), Some("infra"));
    assert_eq!(
        created
            .labels
            .get("org.testcontainers.sessionId")
            .map(String::as_str),
        Some("mutate")
    );
}

#[tokio::test]
async fn test_pre_create_failure_aborts_creation() {
    let runtime = Arc::new(MockRuntime::new());
    let bundle = LifecycleHookBundle::new()
        .pre_create(SpecHook::from_fn(|_| Err(ScuttleError::hook("no"))))
        .pre_create(SpecHook::from_fn(|_| Err(ScuttleError::hook("still no"))));

    let err = controller(&runtime, "abort")
        .create(ContainerSpec::new("alpine").with_hooks(bundle), &[])
        .await
        .unwrap_err();

    match err {
        ScuttleError::Hooks(aggregate) => {
            assert_eq!(aggregate.phase, HookPhase::PreCreate);
            assert_eq!(aggregate.failures.len(), 2);
        }
        other => panic!("expected hook aggregate, got {other:?}"),
    }
    assert_eq!(runtime.call_count(MockOperation::Create), 0);
}

#[tokio::test]
async fn test_post_create_failure_removes_container() {
    let runtime = Arc::new(MockRuntime::new());
    let bundle = LifecycleHookBundle::new()
        .post_create(HandleHook::from_fn(|_| Err(ScuttleError::hook("bad"))));

    let err = controller(&runtime, "cleanup")
        .create(ContainerSpec::new("alpine").with_hooks(bundle), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, ScuttleError::Hooks(_)));
    assert!(runtime.containers().is_empty());
    assert_eq!(runtime.call_count(MockOperation::Remove), 1);
}

#[tokio::test]
async fn test_reserved_label_is_rejected() {
    let runtime = Arc::new(MockRuntime::new());
    let spec = ContainerSpec::new("alpine").with_label("org.testcontainers.sessionId", "spoofed");

    let err = controller(&runtime, "labels")
        .create(spec, &[])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ScuttleError::Config(ConfigError::Validation { .. })
    ));
    assert!(runtime.containers().is_empty());
}
