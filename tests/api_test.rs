//! Integration tests for the API-facing request/response helpers and
//! configuration loading

use std::collections::HashMap;

use offload_dispatcher::config::DispatcherConfig;
use offload_dispatcher::core::{Dispatcher, FnExecutor, TaskFailure, ThreadWorkerFactory};
use offload_dispatcher::runtime::{health, submit_request, SubmitRequest, TaskOutcome};

fn square(n: u64) -> Result<u64, TaskFailure> {
    if n > u64::from(u32::MAX) {
        return Err(TaskFailure::new("input too large"));
    }
    std::thread::sleep(std::time::Duration::from_millis(n.min(500)));
    Ok(n * n)
}

async fn start(pool_size: usize) -> Dispatcher<u64, u64> {
    let config = DispatcherConfig::new()
        .with_pool_size(pool_size)
        .with_worker_grace_shutdown_ms(1_000);
    let factory = ThreadWorkerFactory::from_config(
        FnExecutor::new(square as fn(u64) -> Result<u64, TaskFailure>),
        &config,
    );
    Dispatcher::start(config, factory).await.unwrap()
}

#[tokio::test]
async fn test_submit_request_ok() {
    let dispatcher = start(1).await;

    let req: SubmitRequest<u64> = serde_json::from_str(r#"{"payload": 12}"#).unwrap();
    let resp = submit_request(&dispatcher, req).await;
    assert_eq!(resp.outcome, TaskOutcome::Ok { value: 144 });

    let json = serde_json::to_value(&resp).unwrap();
    assert_eq!(json["task_id"], resp.task_id.to_string());
    assert_eq!(json["outcome"]["status"], "ok");
    assert_eq!(json["outcome"]["value"], 144);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_submit_request_errors_carry_kind() {
    let dispatcher = start(1).await;

    let failed = submit_request(
        &dispatcher,
        SubmitRequest {
            payload: u64::MAX,
            timeout_ms: None,
        },
    )
    .await;
    match failed.outcome {
        TaskOutcome::Err { kind, message, retryable } => {
            assert_eq!(kind, "task_error");
            assert!(message.contains("input too large"));
            assert!(!retryable);
        }
        TaskOutcome::Ok { .. } => panic!("expected task failure"),
    }

    let timed_out = submit_request(
        &dispatcher,
        SubmitRequest {
            payload: 400,
            timeout_ms: Some(20),
        },
    )
    .await;
    assert!(matches!(
        timed_out.outcome,
        TaskOutcome::Err { ref kind, retryable: true, .. } if kind == "timeout"
    ));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_health_reflects_state() {
    let dispatcher = start(2).await;

    let report = health(&dispatcher);
    assert!(report.ok);
    assert_eq!(report.idle_workers, 2);
    assert_eq!(report.busy_workers, 0);
    assert_eq!(report.queued_tasks, 0);

    dispatcher.shutdown().await;
    assert!(!health(&dispatcher).ok);
}

#[tokio::test]
async fn test_config_from_lookup_drives_dispatcher() {
    let vars: HashMap<&str, &str> = [
        ("OFFLOAD_POOL_SIZE", "3"),
        ("OFFLOAD_WAITER_QUEUE_CAP", "8"),
        ("OFFLOAD_TASK_TIMEOUT_MS", "2500"),
    ]
    .into_iter()
    .collect();
    let config =
        DispatcherConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string())).unwrap();
    assert_eq!(config.pool_size, 3);
    assert_eq!(config.waiter_queue_cap, 8);
    assert_eq!(config.task_timeout_ms, 2_500);

    let factory = ThreadWorkerFactory::from_config(
        FnExecutor::new(square as fn(u64) -> Result<u64, TaskFailure>),
        &config,
    );
    let dispatcher: Dispatcher<u64, u64> = Dispatcher::start(config, factory).await.unwrap();
    assert_eq!(health(&dispatcher).idle_workers, 3);
    dispatcher.shutdown().await;
}

#[test]
fn test_config_from_lookup_rejects_bad_values() {
    let err = DispatcherConfig::from_lookup(|key| {
        (key == "OFFLOAD_POOL_SIZE").then(|| "many".to_string())
    })
    .unwrap_err();
    assert!(err.contains("OFFLOAD_POOL_SIZE"));

    let err = DispatcherConfig::from_lookup(|key| {
        (key == "OFFLOAD_POOL_SIZE").then(|| "0".to_string())
    })
    .unwrap_err();
    assert!(err.contains("pool_size"));
}
