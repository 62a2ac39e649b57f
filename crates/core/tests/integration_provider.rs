//! Integration tests for the provider's parallel runs

use scuttle_core::config::Config;
use scuttle_core::container_spec::ContainerSpec;
use scuttle_core::docker::mock::{MockOperation, MockRuntime};
use scuttle_core::errors::ScuttleError;
use scuttle_core::hooks::{HandleHook, LifecycleHookBundle, SpecHook};
use scuttle_core::provider::{ParallelOptions, Provider};
use scuttle_core::session::SessionId;
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn provider(runtime: &Arc<MockRuntime>) -> Provider {
    let config = Config {
        ryuk_disabled: true,
        ..Config::default()
    };
    Provider::new(runtime.clone(), config, SessionId::new("parallel"))
}

#[tokio::test]
async fn test_run_parallel_reports_failures_and_keeps_the_rest() {
    let runtime = Arc::new(MockRuntime::new());
    let specs: Vec<ContainerSpec> = (0..5)
        .map(|i| {
            let spec = ContainerSpec::new(format!("img{}", i));
            if i == 3 {
                spec.with_hooks(
                    LifecycleHookBundle::new()
                        .pre_create(SpecHook::from_fn(|_| Err(ScuttleError::hook("bad image")))),
                )
            } else {
                spec
            }
        })
        .collect();

    let err = provider(&runtime)
        .run_parallel(specs, ParallelOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.started.len(), 4);
    assert!(err.started.iter().all(|c| c.is_running()));
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].index, 3);
    assert_eq!(err.failures[0].image, "img3");
    assert!(err.to_string().contains("bad image"));
}

#[tokio::test]
async fn test_run_parallel_bounds_concurrency() {
    let runtime = Arc::new(MockRuntime::new());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let specs: Vec<ContainerSpec> = (0..6)
        .map(|i| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let slow_start = HandleHook::new(move |_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            });
            ContainerSpec::new(format!("svc{}", i))
                .with_hooks(LifecycleHookBundle::new().pre_start(slow_start))
        })
        .collect();

    let started = provider(&runtime)
        .run_parallel(specs, ParallelOptions { workers: 2 })
        .await
        .unwrap();

    assert_eq!(started.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(runtime.call_count(MockOperation::Start), 6);
}

#[tokio::test]
async fn test_run_container_terminates_on_start_failure() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.fail_on(MockOperation::Start, "cannot start");

    let err = provider(&runtime)
        .run_container(ContainerSpec::new("broken"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("cannot start"));
    assert!(runtime.containers().is_empty());
}

#[tokio::test]
async fn test_run_parallel_with_no_requests() {
    let runtime = Arc::new(MockRuntime::new());
    let started = provider(&runtime)
        .run_parallel(Vec::new(), ParallelOptions { workers: 0 })
        .await
        .unwrap();
    assert!(started.is_empty());
}
