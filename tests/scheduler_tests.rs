mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use pretty_assertions::assert_eq;

use arbiter::model::{SubmissionStatus, Verdict};
use arbiter::scheduler::{JudgeOutcome, JudgeState};
use arbiter::scoring::{ScoreStore, ScoreUpdate};
use arbiter::store::ResultSink;

use common::{BrokenScores, FlakyResults, Harness};

const WAIT: Duration = Duration::from_secs(10);

async fn wait_until_running(harness: &Harness, id: i64) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(JudgeState::Running { .. }) = harness.scheduler.state_of(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("submission never started running");
}

#[tokio::test]
async fn test_judge_blocking_stores_verdict() {
    let harness = Harness::start("blocking", 2).await;
    harness
        .insert_problem(&common::problem(1, 1000, &[("3\n", "3"), ("4\n", "4")]))
        .await;
    let submission = common::create_submission(&harness.pool, 1, 1, None, "echo").await;

    let outcome = harness
        .scheduler
        .judge_blocking(submission.judge_request())
        .await;

    let JudgeOutcome::Finished { report, score } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(report.verdict, Verdict::Accepted);
    assert_eq!(report.cases.len(), 2);
    assert_eq!(score, None);

    let stored = harness.fetch(submission.id).await;
    assert_eq!(stored.status, SubmissionStatus::Judged(Verdict::Accepted));
    assert_eq!(stored.memory_kb, 1024);
    assert!(stored.judged_time.is_some());
    assert_eq!(stored.infrastructure_fault, None);
    assert!(harness.scheduler.state_of(submission.id).is_none());
}

#[tokio::test]
async fn test_wrong_answer_is_stored() {
    let harness = Harness::start("wrong_answer", 1).await;
    harness
        .insert_problem(&common::problem(1, 1000, &[("1\n", "2")]))
        .await;
    let submission = common::create_submission(&harness.pool, 1, 1, None, "echo").await;

    let outcome = harness
        .scheduler
        .judge_blocking(submission.judge_request())
        .await;

    assert_eq!(outcome.verdict(), Some(Verdict::WrongAnswer));
    assert_eq!(
        harness.fetch(submission.id).await.status,
        SubmissionStatus::Judged(Verdict::WrongAnswer)
    );
}

#[tokio::test]
async fn test_resubmitting_in_flight_submission_coalesces() {
    let harness = Harness::start("coalesce", 1).await;
    harness
        .insert_problem(&common::problem(1, 5000, &[("", "done")]))
        .await;
    let submission =
        common::create_submission(&harness.pool, 1, 1, None, "sleep:200\nprint:done").await;

    let first = harness.scheduler.submit(submission.judge_request());
    let second = harness.scheduler.submit(submission.judge_request());
    assert_eq!(first.submission_id(), second.submission_id());

    let (first, second) = tokio::join!(first.wait(), second.wait());
    assert_eq!(first, second);
    assert_eq!(first.verdict(), Some(Verdict::Accepted));
    assert_eq!(harness.runner.executions_of(submission.id), 1);
}

#[tokio::test]
async fn test_single_worker_judges_in_submission_order() {
    let harness = Harness::start("fifo", 1).await;
    harness
        .insert_problem(&common::problem(1, 5000, &[("", "ok")]))
        .await;

    let mut handles = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..4 {
        let submission =
            common::create_submission(&harness.pool, 1, 1, None, "sleep:20\nprint:ok").await;
        ids.push(submission.id);
        handles.push(harness.scheduler.submit(submission.judge_request()));
    }
    for handle in handles {
        assert_eq!(handle.wait().await.verdict(), Some(Verdict::Accepted));
    }

    assert_eq!(*harness.runner.executions.lock(), ids);
}

#[tokio::test]
async fn test_cancel_queued_submission() {
    let harness = Harness::start("cancel_queued", 1).await;
    harness
        .insert_problem(&common::problem(1, 60_000, &[("", "ok")]))
        .await;
    let blocker = common::create_submission(&harness.pool, 1, 1, None, "block").await;
    let queued = common::create_submission(&harness.pool, 2, 1, None, "print:ok").await;

    let blocker_handle = harness.scheduler.submit(blocker.judge_request());
    wait_until_running(&harness, blocker.id).await;
    let queued_handle = harness.scheduler.submit(queued.judge_request());
    assert_eq!(queued_handle.state(), JudgeState::Queued);

    assert!(harness.scheduler.cancel(queued.id));
    assert_eq!(queued_handle.wait().await, JudgeOutcome::Cancelled);
    assert!(!harness.scheduler.cancel(queued.id));

    assert!(harness.scheduler.cancel(blocker.id));
    assert_eq!(blocker_handle.wait().await, JudgeOutcome::Cancelled);

    assert_eq!(harness.runner.executions_of(queued.id), 0);
    assert_eq!(
        harness.fetch(queued.id).await.status,
        SubmissionStatus::Pending
    );
}

#[tokio::test]
async fn test_cancel_running_submission_discards_verdict() {
    let harness = Harness::start("cancel_running", 1).await;
    harness
        .insert_problem(&common::problem(1, 60_000, &[("", "ok")]))
        .await;
    let submission = common::create_submission(&harness.pool, 1, 1, None, "block").await;

    let handle = harness.scheduler.submit(submission.judge_request());
    wait_until_running(&harness, submission.id).await;

    assert!(harness.scheduler.cancel(submission.id));
    let outcome = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
    assert_eq!(outcome, JudgeOutcome::Cancelled);

    let stored = harness.fetch(submission.id).await;
    assert_eq!(stored.status, SubmissionStatus::Pending);
    assert!(stored.judged_time.is_none());

    // The worker is free again
    let next = common::create_submission(&harness.pool, 1, 1, None, "print:ok").await;
    let outcome = harness.scheduler.judge_blocking(next.judge_request()).await;
    assert_eq!(outcome.verdict(), Some(Verdict::Accepted));
}

#[tokio::test]
async fn test_cancel_unknown_submission() {
    let harness = Harness::start("cancel_unknown", 1).await;
    assert!(!harness.scheduler.cancel(404));
}

#[tokio::test]
async fn test_sandbox_failure_is_recorded_as_infrastructure_fault() {
    let harness = Harness::start("sandbox_failure", 1).await;
    harness
        .insert_problem(&common::problem(1, 1000, &[("", "ok")]))
        .await;
    let broken = common::create_submission(&harness.pool, 1, 1, None, "fail").await;
    let healthy = common::create_submission(&harness.pool, 1, 1, None, "print:ok").await;

    let outcome = harness.scheduler.judge_blocking(broken.judge_request()).await;
    assert!(matches!(outcome, JudgeOutcome::Faulted { .. }));

    let stored = harness.fetch(broken.id).await;
    assert_eq!(stored.status, SubmissionStatus::Judged(Verdict::RuntimeError));
    assert!(
        stored
            .infrastructure_fault
            .is_some_and(|reason| reason.contains("sandbox unavailable"))
    );

    let outcome = harness.scheduler.judge_blocking(healthy.judge_request()).await;
    assert_eq!(outcome.verdict(), Some(Verdict::Accepted));
}

#[tokio::test]
async fn test_panicking_judge_does_not_take_down_worker() {
    let harness = Harness::start("panic", 1).await;
    harness
        .insert_problem(&common::problem(1, 1000, &[("", "ok")]))
        .await;
    let broken = common::create_submission(&harness.pool, 1, 1, None, "panic").await;
    let healthy = common::create_submission(&harness.pool, 1, 1, None, "print:ok").await;

    let outcome = harness.scheduler.judge_blocking(broken.judge_request()).await;
    assert!(matches!(outcome, JudgeOutcome::Faulted { .. }));

    let outcome = harness.scheduler.judge_blocking(healthy.judge_request()).await;
    assert_eq!(outcome.verdict(), Some(Verdict::Accepted));
}

#[tokio::test]
async fn test_missing_problem_is_infrastructure_fault() {
    let harness = Harness::start("missing_problem", 1).await;
    // Stands in for a problem removed after intake; the pool has one connection
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&harness.pool)
        .await
        .unwrap();
    let submission = common::create_submission(&harness.pool, 1, 99, None, "print:ok").await;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&harness.pool)
        .await
        .unwrap();

    let outcome = harness
        .scheduler
        .judge_blocking(submission.judge_request())
        .await;

    assert!(matches!(outcome, JudgeOutcome::Faulted { .. }));
    assert_eq!(
        harness.fetch(submission.id).await.status,
        SubmissionStatus::Judged(Verdict::RuntimeError)
    );
}

#[tokio::test]
async fn test_time_limit_and_memory_verdicts() {
    let harness = Harness::start("limits", 2).await;
    harness
        .insert_problem(&common::problem(1, 100, &[("", "ok")]))
        .await;
    let slow = common::create_submission(&harness.pool, 1, 1, None, "sleep:5000").await;
    let hungry = common::create_submission(&harness.pool, 1, 1, None, "memory").await;
    let crashing = common::create_submission(&harness.pool, 1, 1, None, "crash").await;

    let (slow, hungry, crashing) = tokio::join!(
        harness.scheduler.judge_blocking(slow.judge_request()),
        harness.scheduler.judge_blocking(hungry.judge_request()),
        harness.scheduler.judge_blocking(crashing.judge_request()),
    );

    assert_eq!(slow.verdict(), Some(Verdict::TimeLimitExceeded));
    assert_eq!(hungry.verdict(), Some(Verdict::MemoryLimitExceeded));
    assert_eq!(crashing.verdict(), Some(Verdict::RuntimeError));
}

#[tokio::test]
async fn test_already_judged_submission_is_not_run_again() {
    let harness = Harness::start("judged_once", 1).await;
    harness
        .insert_problem(&common::problem(1, 1000, &[("", "ok")]))
        .await;
    let submission = common::create_submission(&harness.pool, 1, 1, None, "print:ok").await;

    let first = harness
        .scheduler
        .judge_blocking(submission.judge_request())
        .await;
    let judged_time = harness.fetch(submission.id).await.judged_time;

    let mut rejudge = submission.judge_request();
    rejudge.source_code = "print:wrong".to_string();
    let second = harness.scheduler.judge_blocking(rejudge).await;

    assert_eq!(first.verdict(), Some(Verdict::Accepted));
    let JudgeOutcome::AlreadyJudged { result } = second else {
        panic!("unexpected outcome {second:?}");
    };
    assert_eq!(result.verdict, Verdict::Accepted);
    assert_eq!(result.infrastructure_fault, None);
    assert_eq!(harness.runner.executions_of(submission.id), 1);

    let stored = harness.fetch(submission.id).await;
    assert_eq!(stored.status, SubmissionStatus::Judged(Verdict::Accepted));
    assert_eq!(stored.judged_time, judged_time);
}

#[tokio::test]
async fn test_failed_terminal_write_is_retried() {
    let harness = Harness::start_with_stores("write_retry", 1, |store| {
        let results = FlakyResults {
            inner: store.clone(),
            failures: AtomicU32::new(1),
        };
        (
            Arc::new(results) as Arc<dyn ResultSink>,
            store as Arc<dyn ScoreStore>,
        )
    })
    .await;
    harness
        .insert_problem(&common::problem(1, 1000, &[("", "ok")]))
        .await;
    let submission = common::create_submission(&harness.pool, 1, 1, None, "print:ok").await;

    let outcome = harness
        .scheduler
        .judge_blocking(submission.judge_request())
        .await;

    assert_eq!(outcome.verdict(), Some(Verdict::Accepted));
    let stored = harness.fetch(submission.id).await;
    assert_eq!(stored.status, SubmissionStatus::Judged(Verdict::Accepted));
}

#[tokio::test]
async fn test_unstored_verdict_is_reported_as_fault() {
    let harness = Harness::start_with_stores("write_lost", 1, |store| {
        let results = FlakyResults {
            inner: store.clone(),
            failures: AtomicU32::new(2),
        };
        (
            Arc::new(results) as Arc<dyn ResultSink>,
            store as Arc<dyn ScoreStore>,
        )
    })
    .await;
    harness
        .insert_problem(&common::problem(1, 1000, &[("", "ok")]))
        .await;
    let submission = common::create_submission(&harness.pool, 1, 1, None, "print:ok").await;

    let outcome = harness
        .scheduler
        .judge_blocking(submission.judge_request())
        .await;

    let JudgeOutcome::Faulted { reason } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert!(reason.contains("database is locked"));
    assert_eq!(harness.fetch(submission.id).await.status, SubmissionStatus::Pending);
}

#[tokio::test]
async fn test_scoring_failure_is_recorded_with_verdict() {
    let harness = Harness::start_with_stores("scoring_fault", 1, |store| {
        (
            store as Arc<dyn ResultSink>,
            Arc::new(BrokenScores) as Arc<dyn ScoreStore>,
        )
    })
    .await;
    harness
        .insert_problem(&common::problem(1, 1000, &[("", "ok")]))
        .await;
    let now = chrono::Utc::now();
    let contest = arbiter::database::create_contest(
        "round",
        now - chrono::Duration::hours(1),
        now + chrono::Duration::hours(1),
        &harness.pool,
    )
    .await
    .unwrap();
    arbiter::database::add_contest_problem(contest, 1, None, 0, &harness.pool)
        .await
        .unwrap();
    arbiter::database::register_participant(contest, 1, &harness.pool)
        .await
        .unwrap();
    let submission =
        common::create_submission(&harness.pool, 1, 1, Some(contest), "print:ok").await;

    let outcome = harness
        .scheduler
        .judge_blocking(submission.judge_request())
        .await;

    let JudgeOutcome::Finished { report, score } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(report.verdict, Verdict::Accepted);
    let Some(ScoreUpdate::Faulted { reason }) = score else {
        panic!("unexpected score {score:?}");
    };
    assert!(reason.contains("scoreboard unavailable"));

    let stored = harness.fetch(submission.id).await;
    assert_eq!(stored.status, SubmissionStatus::Judged(Verdict::Accepted));
    assert_eq!(stored.infrastructure_fault, Some(reason));
}

#[tokio::test]
async fn test_cancel_contest() {
    let harness = Harness::start("cancel_contest", 1).await;
    harness
        .insert_problem(&common::problem(1, 60_000, &[("", "ok")]))
        .await;
    let now = chrono::Utc::now();
    let contest = arbiter::database::create_contest(
        "round",
        now - chrono::Duration::hours(1),
        now + chrono::Duration::hours(1),
        &harness.pool,
    )
    .await
    .unwrap();

    let running = common::create_submission(&harness.pool, 1, 1, Some(contest), "block").await;
    let queued = common::create_submission(&harness.pool, 2, 1, Some(contest), "block").await;
    let outside = common::create_submission(&harness.pool, 3, 1, None, "print:ok").await;

    let running_handle = harness.scheduler.submit(running.judge_request());
    wait_until_running(&harness, running.id).await;
    let queued_handle = harness.scheduler.submit(queued.judge_request());
    let outside_handle = harness.scheduler.submit(outside.judge_request());

    assert_eq!(harness.scheduler.cancel_contest(contest), 2);
    assert_eq!(running_handle.wait().await, JudgeOutcome::Cancelled);
    assert_eq!(queued_handle.wait().await, JudgeOutcome::Cancelled);
    assert_eq!(
        outside_handle.wait().await.verdict(),
        Some(Verdict::Accepted)
    );
}

#[tokio::test]
async fn test_shutdown_cancels_outstanding_work() {
    let harness = Harness::start("shutdown", 1).await;
    harness
        .insert_problem(&common::problem(1, 60_000, &[("", "ok")]))
        .await;
    let running = common::create_submission(&harness.pool, 1, 1, None, "block").await;
    let queued = common::create_submission(&harness.pool, 2, 1, None, "print:ok").await;

    let running_handle = harness.scheduler.submit(running.judge_request());
    wait_until_running(&harness, running.id).await;
    let queued_handle = harness.scheduler.submit(queued.judge_request());

    tokio::time::timeout(WAIT, harness.scheduler.shutdown())
        .await
        .unwrap();

    assert_eq!(running_handle.wait().await, JudgeOutcome::Cancelled);
    assert_eq!(queued_handle.wait().await, JudgeOutcome::Cancelled);

    let late = common::create_submission(&harness.pool, 3, 1, None, "print:ok").await;
    let handle = harness.scheduler.submit(late.judge_request());
    assert_eq!(handle.wait().await, JudgeOutcome::Cancelled);

    for id in [running.id, queued.id, late.id] {
        assert_eq!(harness.fetch(id).await.status, SubmissionStatus::Pending);
    }
    std::fs::read_dir(&harness.scratch_root)
        .map(|entries| assert_eq!(entries.count(), 0))
        .unwrap();
}
