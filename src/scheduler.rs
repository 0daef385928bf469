use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::judge::{JudgeContext, Stage};
use crate::model::{JudgeReport, JudgeRequest, SubmissionId, Verdict};
use crate::queue::{JobQueue, JudgeTicket};
use crate::sandbox::SandboxRunner;
use crate::scoring::{ScoreUpdate, ScoringApplier};
use crate::store::{ProblemStore, ResultSink, TerminalResult};
use crate::worker::worker;

/// How a submission's judging ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JudgeOutcome {
    Finished {
        report: JudgeReport,
        score: Option<ScoreUpdate>,
    },
    /// The judging system failed; stored as a runtime error when storage
    /// itself is reachable
    Faulted { reason: String },
    /// Discarded before a verdict was stored
    Cancelled,
    /// The submission already had a verdict; nothing was run or stored
    AlreadyJudged { result: TerminalResult },
}

impl JudgeOutcome {
    /// The verdict stored for this outcome, if any
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Self::Finished { report, .. } => Some(report.verdict),
            Self::Faulted { .. } => Some(Verdict::RuntimeError),
            Self::Cancelled => None,
            Self::AlreadyJudged { result } => Some(result.verdict),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JudgeState {
    Queued,
    Compiling,
    Running { test_index: usize },
    Done { outcome: JudgeOutcome },
}

impl JudgeState {
    pub fn outcome(&self) -> Option<&JudgeOutcome> {
        match self {
            Self::Done { outcome } => Some(outcome),
            _ => None,
        }
    }
}

impl From<Stage> for JudgeState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Compiling => Self::Compiling,
            Stage::Running(test_index) => Self::Running { test_index },
        }
    }
}

/// Everything a worker needs besides its sandbox
pub struct JudgeServices {
    pub context: Arc<JudgeContext>,
    pub problems: Arc<dyn ProblemStore>,
    pub results: Arc<dyn ResultSink>,
    pub scoring: ScoringApplier,
}

/// Observes one submission's judging
#[derive(Debug, Clone)]
pub struct JudgeHandle {
    submission_id: SubmissionId,
    state: watch::Receiver<JudgeState>,
}

impl JudgeHandle {
    pub fn submission_id(&self) -> SubmissionId {
        self.submission_id
    }

    pub fn state(&self) -> JudgeState {
        self.state.borrow().clone()
    }

    /// Waits until judging is done
    pub async fn wait(mut self) -> JudgeOutcome {
        match self.state.wait_for(|s| s.outcome().is_some()).await {
            Ok(state) => state.outcome().cloned().unwrap_or(JudgeOutcome::Cancelled),
            Err(_) => JudgeOutcome::Faulted {
                reason: "judge stopped before finishing".to_string(),
            },
        }
    }
}

struct InFlight {
    state: Arc<watch::Sender<JudgeState>>,
    cancel: CancellationToken,
    contest_id: Option<i64>,
}

/// Runs submissions on a fixed pool of workers, one sandbox each
///
/// At most one judging run exists per submission id: submitting an id that
/// is still queued or running returns a handle to that run, and an id that
/// already has a stored verdict ends as [`JudgeOutcome::AlreadyJudged`]
/// without running the program again.
pub struct JudgeScheduler {
    pub(crate) queue: JobQueue,
    in_flight: Mutex<HashMap<SubmissionId, InFlight>>,
    shutdown: CancellationToken,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl JudgeScheduler {
    /// Starts one worker per runner on the current tokio runtime
    pub fn start(services: JudgeServices, runners: Vec<Box<dyn SandboxRunner>>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            queue: JobQueue::new(),
            in_flight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(None),
        });

        let services = Arc::new(services);
        let mut workers = JoinSet::new();
        for (i, runner) in runners.into_iter().enumerate() {
            workers.spawn(worker(
                i + 1,
                runner,
                services.clone(),
                scheduler.clone(),
                scheduler.shutdown.clone(),
            ));
        }
        log::info!("Judge scheduler started with {} worker(s)", workers.len());
        *scheduler.workers.lock() = Some(workers);

        scheduler
    }

    /// Queues a submission without waiting for it
    pub fn submit(&self, request: JudgeRequest) -> JudgeHandle {
        let submission_id = request.submission_id;
        let mut in_flight = self.in_flight.lock();

        if let Some(entry) = in_flight.get(&submission_id) {
            log::debug!("Submission {submission_id} already in flight, coalescing");
            return JudgeHandle {
                submission_id,
                state: entry.state.subscribe(),
            };
        }

        if self.shutdown.is_cancelled() {
            log::warn!("Submission {submission_id} rejected, scheduler is shut down");
            let (_, state) = watch::channel(JudgeState::Done {
                outcome: JudgeOutcome::Cancelled,
            });
            return JudgeHandle {
                submission_id,
                state,
            };
        }

        let (sender, receiver) = watch::channel(JudgeState::Queued);
        let sender = Arc::new(sender);
        let cancel = self.shutdown.child_token();
        in_flight.insert(
            submission_id,
            InFlight {
                state: sender.clone(),
                cancel: cancel.clone(),
                contest_id: request.contest_id,
            },
        );
        self.queue.push(JudgeTicket {
            request,
            state: sender,
            cancel,
        });
        log::info!(
            "Submission {submission_id} queued, {} waiting",
            self.queue.len()
        );

        JudgeHandle {
            submission_id,
            state: receiver,
        }
    }

    /// Queues a submission and waits for its outcome
    pub async fn judge_blocking(&self, request: JudgeRequest) -> JudgeOutcome {
        self.submit(request).wait().await
    }

    /// Cancels a queued or running submission, discarding any partial verdict.
    ///
    /// Returns `false` if the submission is not in flight.
    pub fn cancel(&self, submission_id: SubmissionId) -> bool {
        let Some(token) = self
            .in_flight
            .lock()
            .get(&submission_id)
            .map(|e| e.cancel.clone())
        else {
            return false;
        };

        token.cancel();
        if let Some(ticket) = self.queue.remove(submission_id) {
            self.complete(&ticket, JudgeOutcome::Cancelled);
        }
        log::info!("Submission {submission_id} cancelled");
        true
    }

    /// Cancels every queued or running submission of a contest
    pub fn cancel_contest(&self, contest_id: i64) -> usize {
        let ids: Vec<SubmissionId> = self
            .in_flight
            .lock()
            .iter()
            .filter(|(_, e)| e.contest_id == Some(contest_id))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// State of an in-flight submission
    pub fn state_of(&self, submission_id: SubmissionId) -> Option<JudgeState> {
        self.in_flight
            .lock()
            .get(&submission_id)
            .map(|e| e.state.borrow().clone())
    }

    /// Publishes a ticket's outcome and retires it from the in-flight table
    pub(crate) fn complete(&self, ticket: &JudgeTicket, outcome: JudgeOutcome) {
        let id = ticket.request.submission_id;
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&id)
                .is_some_and(|e| Arc::ptr_eq(&e.state, &ticket.state))
            {
                in_flight.remove(&id);
            }
        }
        ticket.state.send_replace(JudgeState::Done { outcome });
    }

    /// Stops every worker, cancelling queued and running submissions
    pub async fn shutdown(&self) {
        {
            // Ordered with `submit`, so nothing is queued after the final drain
            let _in_flight = self.in_flight.lock();
            self.shutdown.cancel();
        }
        log::info!("Shutdown signal sent to workers, waiting for them to finish...");

        let workers = self.workers.lock().take();
        if let Some(mut workers) = workers {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        log::error!("Worker handle panicked: {:?}", e);
                    } else {
                        log::error!("Worker handle finished with error: {:?}", e);
                    }
                }
            }
        }

        for ticket in self.queue.drain() {
            self.complete(&ticket, JudgeOutcome::Cancelled);
        }
        log::info!("Judge scheduler stopped");
    }
}
