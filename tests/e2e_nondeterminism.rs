mod common;

use std::sync::Arc;
use std::time::Duration;

use durakit::runtime::Runtime;
use durakit::{
    ActivityRegistry, Client, ErrorKind, EventKind, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus,
};

fn echo_activities() -> Arc<ActivityRegistry> {
    Arc::new(
        ActivityRegistry::builder()
            .register("Echo", |_ctx, input: String| async move { Ok(input) })
            .build(),
    )
}

#[tokio::test]
async fn code_swap_between_turns_fails_with_nondeterminism() {
    let store = Arc::new(durakit::providers::InMemoryProvider::new()) as Arc<dyn durakit::providers::Provider>;

    // first deployment schedules Echo then waits for a signal
    let v1 = OrchestrationRegistry::builder()
        .register("Swapped", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_task("Echo", "one").await?;
            let payload = ctx.wait_for_event("Signal").await;
            Ok(payload)
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), echo_activities(), v1).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-swap", "Swapped", "").await.unwrap();
    assert!(
        common::wait_for_task_completed(store.clone(), "inst-swap", 5_000).await,
        "first deployment makes progress"
    );
    rt.shutdown().await;

    // second deployment replays the same history with different code
    let v2 = OrchestrationRegistry::builder()
        .register("Swapped", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_task("Echo", "something else").await?;
            let payload = ctx.wait_for_event("Signal").await;
            Ok(payload)
        })
        .build();
    let rt2 = Runtime::start_with_store(store.clone(), echo_activities(), v2).await;

    client.raise_event("inst-swap", "Signal", "go").await.unwrap();
    let status = client
        .wait_for_orchestration("inst-swap", Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Failed { details } = status else {
        panic!("expected nondeterminism failure, got {status:?}");
    };
    assert_eq!(details.kind, ErrorKind::Nondeterminism);
    rt2.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_from_recorded_history() {
    let store = Arc::new(durakit::providers::InMemoryProvider::new()) as Arc<dyn durakit::providers::Provider>;

    let registry = || {
        OrchestrationRegistry::builder()
            .register("Resumable", |ctx: OrchestrationContext, _input: String| async move {
                let step1 = ctx.schedule_task("Echo", "step1").await?;
                let payload = ctx.wait_for_event("Resume").await;
                let step2 = ctx.schedule_task("Echo", "step2").await?;
                Ok(format!("{step1},{payload},{step2}"))
            })
            .build()
    };

    let rt = Runtime::start_with_store(store.clone(), echo_activities(), registry()).await;
    let client = Client::new(store.clone());
    client.start_orchestration("inst-resume", "Resumable", "").await.unwrap();
    assert!(common::wait_for_task_completed(store.clone(), "inst-resume", 5_000).await);
    rt.shutdown().await;

    // a new runtime picks up from durable state; progress is not repeated
    let rt2 = Runtime::start_with_store(store.clone(), echo_activities(), registry()).await;
    client.raise_event("inst-resume", "Resume", "back").await.unwrap();
    let status = client
        .wait_for_orchestration("inst-resume", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed { output: "step1,back,step2".to_string() }
    );

    // step1 ran exactly once across both runtimes
    let hist = client.get_execution_history("inst-resume", 1).await.unwrap();
    let step1_schedules = hist
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::TaskScheduled { input, .. } if input == "step1"))
        .count();
    assert_eq!(step1_schedules, 1);
    rt2.shutdown().await;
}

#[tokio::test]
async fn panicking_orchestration_fails_instead_of_wedging() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Panics", |_ctx: OrchestrationContext, _input: String| async move {
            if true {
                panic!("boom in user code");
            }
            Ok(String::new())
        })
        .build();

    let store = Arc::new(durakit::providers::InMemoryProvider::new()) as Arc<dyn durakit::providers::Provider>;
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-panic", "Panics", "").await.unwrap();
    let status = client
        .wait_for_orchestration("inst-panic", Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Failed { details } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(details.message.contains("panic"));
    rt.shutdown().await;
}
