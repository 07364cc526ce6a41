mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use durakit::runtime::Runtime;
use durakit::{
    ActivityRegistry, Client, ErrorKind, EventKind, OrchestrationContext, OrchestrationRegistry,
    OrchestrationStatus, RetryPolicy,
};

#[tokio::test]
async fn retries_are_invisible_and_only_the_final_success_is_recorded() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Flaky", move |_ctx, _input: String| {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("transient failure {n}"))
                    } else {
                        Ok(format!("succeeded on attempt {n}"))
                    }
                }
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("RetryUntilOk", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(5).with_first_retry_delay_ms(10).with_max_retry_delay_ms(50);
            ctx.schedule_task_with_retry("Flaky", "", policy).await
        })
        .build();

    let store = Arc::new(durakit::providers::InMemoryProvider::new()) as Arc<dyn durakit::providers::Provider>;
    let rt = Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-retry-ok", "RetryUntilOk", "").await.unwrap();
    let status = client
        .wait_for_orchestration("inst-retry-ok", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed { output: "succeeded on attempt 3".to_string() }
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // two failed attempts happened but history holds one schedule + one completion
    let hist = client.get_execution_history("inst-retry-ok", 1).await.unwrap();
    let schedules = hist.iter().filter(|e| matches!(e.kind, EventKind::TaskScheduled { .. })).count();
    let completions = hist.iter().filter(|e| matches!(e.kind, EventKind::TaskCompleted { .. })).count();
    let failures = hist.iter().filter(|e| matches!(e.kind, EventKind::TaskFailed { .. })).count();
    assert_eq!((schedules, completions, failures), (1, 1, 0));
    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_error() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("AlwaysFails", move |_ctx, _input: String| {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    Err::<String, String>(format!("failure {n}"))
                }
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("RetryExhausted", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(3).with_first_retry_delay_ms(5);
            ctx.schedule_task_with_retry("AlwaysFails", "", policy).await
        })
        .build();

    let store = Arc::new(durakit::providers::InMemoryProvider::new()) as Arc<dyn durakit::providers::Provider>;
    let rt = Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-retry-fail", "RetryExhausted", "").await.unwrap();
    let status = client
        .wait_for_orchestration("inst-retry-fail", Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Failed { details } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(details.kind, ErrorKind::AppError);
    assert!(details.message.contains("failure 3"), "last attempt's error wins: {}", details.message);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let hist = client.get_execution_history("inst-retry-fail", 1).await.unwrap();
    let failures = hist.iter().filter(|e| matches!(e.kind, EventKind::TaskFailed { .. })).count();
    assert_eq!(failures, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn activity_context_reports_the_attempt_number() {
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("ReportAttempt", |ctx: durakit::ActivityContext, _input: String| async move {
                if ctx.attempt < 2 {
                    Err(format!("attempt {} too early", ctx.attempt))
                } else {
                    Ok(format!("attempt {}", ctx.attempt))
                }
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("AttemptAware", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(4).with_first_retry_delay_ms(5);
            ctx.schedule_task_with_retry("ReportAttempt", "", policy).await
        })
        .build();

    let store = Arc::new(durakit::providers::InMemoryProvider::new()) as Arc<dyn durakit::providers::Provider>;
    let rt = Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-attempt", "AttemptAware", "").await.unwrap();
    let status = client
        .wait_for_orchestration("inst-attempt", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "attempt 2".to_string() });
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_without_retry() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsMissing", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_task("DoesNotExist", "").await
        })
        .build();

    let store = Arc::new(durakit::providers::InMemoryProvider::new()) as Arc<dyn durakit::providers::Provider>;
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-missing-act", "CallsMissing", "").await.unwrap();
    let status = client
        .wait_for_orchestration("inst-missing-act", Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Failed { details } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(details.kind, ErrorKind::AppError);
    assert!(details.message.contains("DoesNotExist"));
    rt.shutdown().await;
}
