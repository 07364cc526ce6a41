//! Property-based checks over the replay engine and history store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use durakit::providers::sqlite::SqliteProvider;
use durakit::runtime::Runtime;
use durakit::{
    ActivityRegistry, Client, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, RetryPolicy,
};
use proptest::prelude::*;

fn unique_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn arb_orch_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9]{0,20}").unwrap()
}

fn arb_input() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{0,10}").unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    /// History seq numbers are strictly increasing within an execution,
    /// whatever the orchestration name and input.
    #[test]
    fn prop_history_seq_strictly_increasing(
        orch_name in arb_orch_name(),
        input in arb_input(),
    ) {
        let ordered = tokio::runtime::Runtime::new().unwrap().block_on(async {
            let activities = ActivityRegistry::builder()
                .register("Echo", |_ctx, input: String| async move { Ok(input) })
                .build();
            let orchestrations = OrchestrationRegistry::builder()
                .register(orch_name.clone(), |ctx: OrchestrationContext, input: String| async move {
                    let _ = ctx.schedule_task("Echo", input.clone()).await;
                    Ok(input)
                })
                .build();

            let provider = Arc::new(SqliteProvider::new_in_memory().await.expect("provider"));
            let rt = Runtime::start_with_store(provider.clone(), Arc::new(activities), orchestrations).await;
            let client = Client::new(provider.clone());

            let instance = format!("prop-seq-{orch_name}-{}", unique_suffix());
            client.start_orchestration(&instance, &orch_name, input).await.expect("start");
            let _ = client.wait_for_orchestration(&instance, Duration::from_secs(5)).await;

            let history = client.get_execution_history(&instance, 1).await.expect("history");
            rt.shutdown().await;
            !history.is_empty() && history.windows(2).all(|w| w[0].seq < w[1].seq)
        });
        prop_assert!(ordered);
    }

    /// Joined fan-out outputs always come back in call order, independent of
    /// task completion timing.
    #[test]
    fn prop_join_outputs_follow_call_order(width in 1usize..6) {
        let outputs = tokio::runtime::Runtime::new().unwrap().block_on(async {
            let activities = ActivityRegistry::builder()
                .register("Jittery", |_ctx, input: String| async move {
                    let n: u64 = input.parse().map_err(|e| format!("parse: {e}"))?;
                    tokio::time::sleep(Duration::from_millis((n * 7) % 23)).await;
                    Ok(input)
                })
                .build();
            let orchestrations = OrchestrationRegistry::builder()
                .register("FanOut", |ctx: OrchestrationContext, input: String| async move {
                    let width: usize = input.parse().map_err(|e| format!("parse: {e}"))?;
                    let branches: Vec<_> = (0..width)
                        .map(|n| ctx.schedule_task("Jittery", n.to_string()))
                        .collect();
                    let results = ctx.join(branches).await;
                    let mut out = Vec::new();
                    for r in results {
                        out.push(r?);
                    }
                    Ok(out.join(","))
                })
                .build();

            let provider = Arc::new(durakit::providers::InMemoryProvider::new());
            let rt = Runtime::start_with_store(provider.clone(), Arc::new(activities), orchestrations).await;
            let client = Client::new(provider.clone());

            let instance = format!("prop-join-{width}-{}", unique_suffix());
            client.start_orchestration(&instance, "FanOut", width.to_string()).await.expect("start");
            let status = client
                .wait_for_orchestration(&instance, Duration::from_secs(5))
                .await
                .expect("terminal status");
            rt.shutdown().await;
            match status {
                OrchestrationStatus::Completed { output } => output,
                other => panic!("expected completion, got {other:?}"),
            }
        });
        let expected: Vec<String> = (0..width).map(|n| n.to_string()).collect();
        prop_assert_eq!(outputs, expected.join(","));
    }

    /// Retry backoff never exceeds the cap and never shrinks between attempts.
    #[test]
    fn prop_retry_delay_is_capped_and_monotone(
        first in 1u64..1_000,
        coeff in 1.0f64..4.0,
        cap in 1u64..60_000,
        attempts in 2u32..12,
    ) {
        let policy = RetryPolicy::new(attempts)
            .with_first_retry_delay_ms(first)
            .with_backoff_coefficient(coeff)
            .with_max_retry_delay_ms(cap);
        let mut last = 0u64;
        for attempt in 1..=attempts {
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay <= cap);
            prop_assert!(delay >= last);
            last = delay;
        }
    }
}
