use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{self, JudgeError};
use crate::judge::Judge;
use crate::model::{SubmissionId, Verdict};
use crate::queue::JudgeTicket;
use crate::sandbox::SandboxRunner;
use crate::scheduler::{JudgeOutcome, JudgeScheduler, JudgeServices, JudgeState};
use crate::scoring::ScoreUpdate;
use crate::store::TerminalResult;

const RECORD_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) async fn worker(
    id: usize,
    runner: Box<dyn SandboxRunner>,
    services: Arc<JudgeServices>,
    scheduler: Arc<JudgeScheduler>,
    token: CancellationToken,
) {
    let runner: Arc<dyn SandboxRunner> = Arc::from(runner);
    log::info!("Worker {id} initialized with {} sandbox", runner.name());

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            ticket = scheduler.queue.pop() => {
                let submission_id = ticket.request.submission_id;
                log::info!("Worker {id} got submission {submission_id} from queue");

                let outcome = judge_ticket(id, &ticket, runner.clone(), &services).await;
                let outcome = persist(&ticket, outcome, &services).await;

                log::info!(
                    "Submission {submission_id} finished on worker {id}: {:?}",
                    outcome.verdict()
                );
                scheduler.complete(&ticket, outcome);
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
}

/// Runs the judge pipeline for one ticket on a blocking thread
async fn judge_ticket(
    id: usize,
    ticket: &JudgeTicket,
    runner: Arc<dyn SandboxRunner>,
    services: &JudgeServices,
) -> JudgeOutcome {
    let submission_id = ticket.request.submission_id;
    if ticket.cancel.is_cancelled() {
        return JudgeOutcome::Cancelled;
    }

    // 1. A stored verdict is final, so user code is not run again
    match services.results.terminal_result(submission_id).await {
        Ok(Some(result)) => {
            log::info!("Submission {submission_id} already judged as {}", result.verdict);
            return JudgeOutcome::AlreadyJudged { result };
        }
        Ok(None) => {}
        Err(e) => {
            log::error!("Failed to look up submission {submission_id}: {e}");
            return JudgeOutcome::Faulted {
                reason: e.to_string(),
            };
        }
    }

    // 2. Get the problem with its ordered test cases
    let problem = match services.problems.fetch_problem(ticket.request.problem_id).await {
        Ok(problem) => problem,
        Err(e) => {
            log::error!("Failed to fetch problem for submission {submission_id}: {e}");
            return JudgeOutcome::Faulted {
                reason: e.to_string(),
            };
        }
    };

    // 3. Spawn blocking judge and get its handle
    let context = services.context.clone();
    let request = ticket.request.clone();
    let cancel = ticket.cancel.clone();
    let state = ticket.state.clone();
    let result_handle = tokio::task::spawn_blocking(move || {
        let judge = Judge {
            runner: runner.as_ref(),
            ctx: &context,
        };
        judge.run(&request, &problem, &cancel, &|stage| {
            state.send_replace(JudgeState::from(stage));
        })
    });

    // 4. Give back control to the runtime until judging is done
    let outcome = match result_handle.await {
        Ok(Ok(report)) => JudgeOutcome::Finished {
            report,
            score: None,
        },
        Ok(Err(JudgeError::Cancelled)) => JudgeOutcome::Cancelled,
        Ok(Err(e)) => {
            log::error!("Judging submission {submission_id} failed on worker {id}: {e}");
            JudgeOutcome::Faulted {
                reason: e.to_string(),
            }
        }
        Err(e) => {
            log::error!("Judge task for submission {submission_id} failed on worker {id}: {e}");
            JudgeOutcome::Faulted {
                reason: "judge task panicked".to_string(),
            }
        }
    };

    // A verdict racing a cancellation is discarded
    if ticket.cancel.is_cancelled() {
        return JudgeOutcome::Cancelled;
    }
    outcome
}

/// Stores the terminal result, then applies scoring to a stored acceptance.
/// Cancelled runs store nothing.
async fn persist(
    ticket: &JudgeTicket,
    outcome: JudgeOutcome,
    services: &JudgeServices,
) -> JudgeOutcome {
    let submission_id = ticket.request.submission_id;

    let result = match &outcome {
        JudgeOutcome::Cancelled | JudgeOutcome::AlreadyJudged { .. } => return outcome,
        JudgeOutcome::Finished { report, .. } => TerminalResult {
            verdict: report.verdict,
            time_ms: report.time_ms,
            memory_kb: report.memory_kb,
            infrastructure_fault: None,
        },
        JudgeOutcome::Faulted { reason } => TerminalResult {
            verdict: Verdict::RuntimeError,
            time_ms: 0,
            memory_kb: 0,
            infrastructure_fault: Some(reason.clone()),
        },
    };

    match record_terminal(submission_id, &result, services).await {
        Ok(true) => {}
        Ok(false) => {
            log::warn!("Submission {submission_id} got a verdict elsewhere, result dropped");
            return match services.results.terminal_result(submission_id).await {
                Ok(Some(result)) => JudgeOutcome::AlreadyJudged { result },
                Ok(None) => JudgeOutcome::Faulted {
                    reason: "verdict was not stored".to_string(),
                },
                Err(e) => JudgeOutcome::Faulted {
                    reason: e.to_string(),
                },
            };
        }
        Err(e) => {
            // The row stays pending and is swept on the next start
            log::error!("Failed to save submission {submission_id} result: {e}");
            return JudgeOutcome::Faulted {
                reason: format!("failed to store verdict: {e}"),
            };
        }
    }

    let JudgeOutcome::Finished { report, .. } = outcome else {
        return outcome;
    };
    let score = match services.scoring.apply(&ticket.request, report.verdict).await {
        Ok(score) => score,
        Err(e) => {
            let reason = format!("scoring failed: {e}");
            log::error!("Failed to apply score of submission {submission_id}: {e}");
            if let Err(e) = services.results.record_fault(submission_id, &reason).await {
                log::error!("Failed to record scoring fault of submission {submission_id}: {e}");
            }
            Some(ScoreUpdate::Faulted { reason })
        }
    };
    JudgeOutcome::Finished { report, score }
}

/// Writes the terminal result, retrying once after a failed write
async fn record_terminal(
    submission_id: SubmissionId,
    result: &TerminalResult,
    services: &JudgeServices,
) -> error::Result<bool> {
    match services.results.record_terminal(submission_id, result).await {
        Err(e) => {
            log::warn!("Saving submission {submission_id} result failed, retrying: {e}");
            tokio::time::sleep(RECORD_RETRY_DELAY).await;
            services.results.record_terminal(submission_id, result).await
        }
        recorded => recorded,
    }
}
