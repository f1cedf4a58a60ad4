// tests/cancel_behaviour.rs

mod common;

use std::error::Error;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{
    error_events, harness, parse_envelopes, sample_row, step_events_for, suite_with,
    task_states_for, wait_until, BlockingStep, FailStep, HarnessOptions,
};
use mailfleet::engine::task::TaskError;
use mailfleet::protocol::{ErrorCode, Step, StepPhase, TaskState};
use tokio::time::timeout;

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn cancel_task_mid_run_leaves_other_row_untouched() -> TestResult {
    let blocking = Arc::new(BlockingStep::new());
    let entered = Arc::clone(&blocking.entered);
    let release = Arc::clone(&blocking.release);

    let harness = harness(
        vec![sample_row(1), sample_row(2)],
        suite_with(Step::ServerPrepare, blocking),
        HarnessOptions {
            workers: 2,
            ..HarnessOptions::default()
        },
    );
    harness.scheduler.start();

    // Both rows reach server_prepare and block there.
    wait_until(|| entered.load(Ordering::SeqCst) == 2).await;

    harness.scheduler.cancel_task(1);

    // Wait for row 1 to settle as cancelled, then let row 2 finish.
    {
        let scheduler = Arc::clone(&harness.scheduler);
        wait_until(move || scheduler.task_state(1) == Some(TaskState::Cancelled)).await;
    }

    release.notify_waiters();
    timeout(Duration::from_secs(5), harness.scheduler.wait_complete()).await?;
    harness.scheduler.shutdown();

    let envelopes = parse_envelopes(&harness.buf);

    assert_eq!(
        task_states_for(&envelopes, 1).last(),
        Some(&TaskState::Cancelled)
    );
    assert_eq!(
        task_states_for(&envelopes, 2).last(),
        Some(&TaskState::Success)
    );

    // Row 1 never started a step past the cancellation point.
    let row1_started: Vec<Step> = step_events_for(&envelopes, 1)
        .into_iter()
        .filter(|event| event.phase == StepPhase::Start)
        .map(|event| event.step)
        .collect();
    assert_eq!(row1_started.last(), Some(&Step::ServerPrepare));

    // START/END counts stay balanced for both rows.
    for row_id in [1, 2] {
        let steps = step_events_for(&envelopes, row_id);
        let starts = steps.iter().filter(|e| e.phase == StepPhase::Start).count();
        let ends = steps.iter().filter(|e| e.phase == StepPhase::End).count();
        assert_eq!(starts, ends);
    }

    // Cancelled tasks emit a dedicated CANCELLED error.
    let errors = error_events(&envelopes);
    assert!(errors
        .iter()
        .any(|event| event.code == ErrorCode::Cancelled && event.row_id == Some(1)));

    let progress = harness.scheduler.progress();
    assert_eq!(progress.cancelled, 1);
    assert_eq!(progress.success, 1);

    Ok(())
}

#[tokio::test]
async fn cancel_during_backoff_ends_cancelled_not_failed() -> TestResult {
    let harness = harness(
        vec![sample_row(1)],
        suite_with(
            Step::SshConnectTest,
            Arc::new(FailStep(TaskError::new(
                ErrorCode::SshConn,
                "connection refused",
            ))),
        ),
        HarnessOptions {
            retry_max: 5,
            // Long enough that the task is parked in backoff when we cancel.
            retry_backoff_ms: 60_000,
            ..HarnessOptions::default()
        },
    );
    harness.scheduler.start();

    {
        let scheduler = Arc::clone(&harness.scheduler);
        wait_until(move || scheduler.task_state(1) == Some(TaskState::Retrying)).await;
    }

    harness.scheduler.cancel_task(1);
    timeout(Duration::from_secs(5), harness.scheduler.wait_complete()).await?;
    harness.scheduler.shutdown();

    let envelopes = parse_envelopes(&harness.buf);
    let states = task_states_for(&envelopes, 1);
    assert_eq!(states.last(), Some(&TaskState::Cancelled));
    assert!(!states.contains(&TaskState::Failed));

    // No further step events after entering backoff.
    let ssh_starts = step_events_for(&envelopes, 1)
        .iter()
        .filter(|e| e.phase == StepPhase::Start && e.step == Step::SshConnectTest)
        .count();
    assert_eq!(ssh_starts, 1);

    Ok(())
}

#[tokio::test]
async fn cancel_run_cancels_everything_nonterminal() -> TestResult {
    let blocking = Arc::new(BlockingStep::new());
    let entered = Arc::clone(&blocking.entered);

    let harness = harness(
        vec![sample_row(1), sample_row(2), sample_row(3)],
        suite_with(Step::DeployMailstack, blocking),
        HarnessOptions {
            workers: 1,
            ..HarnessOptions::default()
        },
    );
    harness.scheduler.start();

    // With one worker, row 1 blocks in deploy while rows 2 and 3 queue.
    wait_until(|| entered.load(Ordering::SeqCst) == 1).await;

    harness.scheduler.cancel_run();
    timeout(Duration::from_secs(5), harness.scheduler.wait_complete()).await?;
    harness.scheduler.shutdown();

    let progress = harness.scheduler.progress();
    assert_eq!(progress.cancelled, 3);
    assert_eq!(progress.done, 3);

    let envelopes = parse_envelopes(&harness.buf);
    for row_id in [1, 2, 3] {
        assert_eq!(
            task_states_for(&envelopes, row_id).last(),
            Some(&TaskState::Cancelled)
        );
    }

    Ok(())
}
