//! Dispatcher and supervisor behaviour against a mock control plane.

mod common;

use common::{ACCOUNT, Harness, ok_package, package, wait_until};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tether_agent::dispatcher::DispatchDecision;
use tether_core::ids::{InstanceId, TaskId};
use tether_core::task::{EncryptedSecretRef, TaskEvent, TaskOutcome};

const LIMIT: Duration = Duration::from_secs(120);

#[tokio::test(start_paused = true)]
async fn test_duplicate_assign_runs_once() {
    let h = Harness::new(4);
    h.control_plane
        .add_package(package("t1", json!({ "mode": "ok", "sleepSecs": 1 })));

    assert_eq!(
        h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT)),
        DispatchDecision::Submitted
    );
    assert_eq!(
        h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT)),
        DispatchDecision::Duplicate
    );

    wait_until(LIMIT, || h.registry.is_empty()).await;
    assert_eq!(h.control_plane.acquire_count(), 1);
    assert_eq!(h.runner_calls(), 1);

    let reports = h.control_plane.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].outcome.is_success());
    assert_eq!(h.metrics.snapshot().tasks_duplicate, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assign_storm_executes_once() {
    let h = Harness::new(4);
    h.control_plane
        .add_package(package("storm", json!({ "mode": "ok", "sleepSecs": 1 })));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let dispatcher = h.dispatcher.clone();
            tokio::spawn(async move { dispatcher.on_task_event(TaskEvent::assign("storm", ACCOUNT)) })
        })
        .collect();

    let mut submitted = 0;
    for handle in handles {
        if handle.await.unwrap() == DispatchDecision::Submitted {
            submitted += 1;
        }
    }
    assert_eq!(submitted, 1);

    wait_until(Duration::from_secs(10), || h.registry.is_empty()).await;
    assert_eq!(h.control_plane.acquire_count(), 1);
    assert_eq!(h.runner_calls(), 1);
    assert_eq!(h.control_plane.reports().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_then_reassign_is_new_work() {
    let h = Harness::new(4);
    h.control_plane
        .add_package(package("t1", json!({ "mode": "ok", "sleepSecs": 60 })));

    h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT));
    wait_until(LIMIT, || h.registry.executing_count() == 1).await;

    assert_eq!(
        h.dispatcher.on_task_event(TaskEvent::abort("t1", ACCOUNT)),
        DispatchDecision::Aborted
    );
    wait_until(LIMIT, || h.registry.is_empty()).await;
    assert!(h.control_plane.reports().is_empty());

    // A second abort is a no-op.
    assert_eq!(
        h.dispatcher.on_task_event(TaskEvent::abort("t1", ACCOUNT)),
        DispatchDecision::NotTracked
    );

    assert_eq!(
        h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT)),
        DispatchDecision::Submitted
    );
    wait_until(LIMIT, || h.control_plane.reports().len() == 1).await;
    wait_until(LIMIT, || h.registry.is_empty()).await;

    assert_eq!(h.control_plane.acquire_count(), 2);
    assert_eq!(h.runner_calls(), 2);
    assert_eq!(h.metrics.snapshot().tasks_cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_acquisition_leaves_nothing_behind() {
    let h = Harness::new(4);
    h.control_plane.add_package(ok_package("t1"));
    *h.control_plane.acquire_delay.lock().unwrap() = Some(Duration::from_secs(5));

    h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT));
    wait_until(LIMIT, || h.registry.acquiring_count() == 1).await;

    h.dispatcher.on_task_event(TaskEvent::abort("t1", ACCOUNT));
    wait_until(LIMIT, || h.registry.is_empty()).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.registry.is_empty());
    assert_eq!(h.control_plane.acquire_count(), 1);
    assert_eq!(h.runner_calls(), 0);
    assert!(h.control_plane.reports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_timed_out_once() {
    let h = Harness::new(4);
    let mut slow = package("slow", json!({ "mode": "ok", "sleepSecs": 3600 }));
    if let Some(data) = slow.data.as_mut() {
        data.timeout_ms = 1_000;
    }
    h.control_plane.add_package(slow);

    h.dispatcher.on_task_event(TaskEvent::assign("slow", ACCOUNT));
    wait_until(LIMIT, || !h.control_plane.reports().is_empty()).await;
    wait_until(LIMIT, || h.registry.is_empty()).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    let reports = h.control_plane.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, TaskOutcome::TimedOut { timeout_ms: 1_000 });
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.tasks_timed_out, 1);
    assert_eq!(snapshot.tasks_failed, 1);
    assert_eq!(snapshot.tasks_succeeded, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reject_flag_drops_assign() {
    let h = Harness::new(4);
    h.control_plane.add_package(ok_package("t1"));
    assert!(h.state.resources.try_set_reject());

    assert_eq!(
        h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT)),
        DispatchDecision::Rejected
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.control_plane.acquire_count(), 0);
    assert!(h.registry.is_empty());
    assert_eq!(h.metrics.snapshot().tasks_rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_self_destruct_drops_assign() {
    let h = Harness::new(4);
    h.state.initiate_self_destruct();
    assert_eq!(
        h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT)),
        DispatchDecision::SelfDestructing
    );
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_and_panic_are_reported() {
    let h = Harness::new(4);
    h.control_plane
        .add_package(package("fails", json!({ "mode": "fail" })));
    h.control_plane
        .add_package(package("panics", json!({ "mode": "panic" })));
    h.control_plane.add_package(ok_package("after"));

    h.dispatcher.on_task_event(TaskEvent::assign("fails", ACCOUNT));
    h.dispatcher.on_task_event(TaskEvent::assign("panics", ACCOUNT));
    wait_until(LIMIT, || h.control_plane.reports().len() == 2).await;

    // The dispatcher keeps working after a panicking task.
    h.dispatcher.on_task_event(TaskEvent::assign("after", ACCOUNT));
    wait_until(LIMIT, || h.control_plane.reports().len() == 3).await;
    wait_until(LIMIT, || h.registry.is_empty()).await;

    let outcome = |id: &str| {
        h.control_plane
            .reports()
            .into_iter()
            .find(|r| r.task_id == TaskId::from(id))
            .map(|r| r.outcome)
            .unwrap()
    };
    assert!(matches!(outcome("fails"), TaskOutcome::StepException { exit_code: Some(1), .. }));
    match outcome("panics") {
        TaskOutcome::StepException { message, exit_code } => {
            assert!(message.contains("boom"));
            assert_eq!(exit_code, None);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(outcome("after").is_success());

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.tasks_failed, 2);
    assert_eq!(snapshot.tasks_succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_package_for_other_instance_is_dropped() {
    let h = Harness::new(4);
    let mut targeted = ok_package("t1");
    targeted.target_instance_id = Some(InstanceId::new().as_uuid().to_string());
    h.control_plane.add_package(targeted);

    h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT));
    wait_until(LIMIT, || h.registry.is_empty()).await;

    assert_eq!(h.control_plane.acquire_count(), 1);
    assert_eq!(h.runner_calls(), 0);
    assert!(h.control_plane.reports().is_empty());
    assert_eq!(h.metrics.snapshot().tasks_acquired, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_package_is_a_miss() {
    let h = Harness::new(4);
    h.dispatcher.on_task_event(TaskEvent::assign("ghost", ACCOUNT));
    wait_until(LIMIT, || h.registry.is_empty()).await;

    assert_eq!(h.control_plane.acquire_count(), 1);
    assert!(h.control_plane.reports().is_empty());
    assert_eq!(h.metrics.snapshot().acquire_misses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_task_type_reports_parameters_failure() {
    let h = Harness::new(4);
    let mut http = ok_package("t1");
    if let Some(data) = http.data.as_mut() {
        data.task_type = "HTTP".into();
    }
    h.control_plane.add_package(http);

    h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT));
    wait_until(LIMIT, || h.control_plane.reports().len() == 1).await;

    assert_eq!(h.runner_calls(), 0);
    assert!(matches!(
        h.control_plane.reports()[0].outcome,
        TaskOutcome::ParametersFailure { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_secret_injection_failure_is_reported() {
    let h = Harness::new(4);
    let mut broken = ok_package("t1");
    broken.secret_references.push(EncryptedSecretRef {
        name: "db".into(),
        encryption_config_id: "missing".into(),
        encrypted_value: "AAAA".into(),
    });
    h.control_plane.add_package(broken);

    h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT));
    wait_until(LIMIT, || h.control_plane.reports().len() == 1).await;
    wait_until(LIMIT, || h.registry.is_empty()).await;

    assert_eq!(h.runner_calls(), 0);
    assert!(matches!(
        h.control_plane.reports()[0].outcome,
        TaskOutcome::ParametersFailure { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_report_gives_up_after_five_attempts() {
    let h = Harness::new(4);
    h.control_plane.add_package(ok_package("t1"));
    h.control_plane
        .report_failures_left
        .store(100, Ordering::SeqCst);

    let started = tokio::time::Instant::now();
    h.dispatcher.on_task_event(TaskEvent::assign("t1", ACCOUNT));
    wait_until(LIMIT, || h.metrics.snapshot().report_failures == 1).await;

    assert_eq!(h.control_plane.report_calls.load(Ordering::SeqCst), 5);
    // 1 + 1 + 2 + 3 seconds between the five attempts.
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert!(started.elapsed() < Duration::from_secs(8));
    wait_until(LIMIT, || h.registry.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let h = Harness::new(2);
    for i in 0..5 {
        let id = format!("t{i}");
        h.control_plane
            .add_package(package(&id, json!({ "mode": "ok", "sleepSecs": 10 })));
        h.dispatcher.on_task_event(TaskEvent::assign(id, ACCOUNT));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.registry.executing_count(), 2);
    assert_eq!(h.registry.in_flight_count(), 5);

    wait_until(LIMIT, || h.registry.is_empty()).await;
    assert_eq!(h.control_plane.reports().len(), 5);
    assert!(h.metrics.snapshot().tasks_succeeded == 5);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_after_grace() {
    let h = Harness::new(2);
    h.control_plane
        .add_package(package("long", json!({ "mode": "ok", "sleepSecs": 3600 })));

    h.dispatcher.on_task_event(TaskEvent::assign("long", ACCOUNT));
    wait_until(LIMIT, || h.registry.executing_count() == 1).await;

    h.dispatcher.shutdown(Duration::from_secs(1)).await;
    wait_until(LIMIT, || h.registry.is_empty()).await;

    assert!(!h.state.is_acquiring());
    assert!(h.control_plane.reports().is_empty());
}
