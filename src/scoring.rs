use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error;
use crate::model::{JudgeRequest, SubmissionId, Verdict};

/// What an accepted contest submission did to the participant's score
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScoreUpdate {
    Awarded { points: i64, total: i64 },
    /// The participant already solved this problem in this contest
    AlreadySolved,
    OutsideContestWindow,
    /// The user is not a participant or the problem is not in the contest
    NotScored,
    /// Scoring could not be applied; the fault is stored with the verdict
    Faulted { reason: String },
}

/// A first-acceptance claim for one (contest, participant, problem)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Award {
    pub contest_id: i64,
    pub user_id: i64,
    pub problem_id: i64,
    pub submission_id: SubmissionId,
    pub submitted_at: DateTime<Utc>,
}

#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Awards the problem's points unless this participant already solved it.
    ///
    /// The check and the increment must be one atomic step, so concurrent
    /// claims for the same key award at most once.
    async fn award_first_acceptance(&self, award: &Award) -> error::Result<ScoreUpdate>;
}

pub struct ScoringApplier {
    store: Arc<dyn ScoreStore>,
}

impl ScoringApplier {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self { store }
    }

    /// Applies contest scoring for a judged submission.
    ///
    /// Returns `None` unless the submission is accepted and contest-scoped.
    pub async fn apply(
        &self,
        request: &JudgeRequest,
        verdict: Verdict,
    ) -> error::Result<Option<ScoreUpdate>> {
        let Some(contest_id) = request.contest_id else {
            return Ok(None);
        };
        if verdict != Verdict::Accepted {
            return Ok(None);
        }

        let award = Award {
            contest_id,
            user_id: request.user_id,
            problem_id: request.problem_id,
            submission_id: request.submission_id,
            submitted_at: request.submitted_at,
        };
        let update = self.store.award_first_acceptance(&award).await?;
        log::info!(
            "Submission {} in contest {contest_id}: {update:?}",
            request.submission_id
        );
        Ok(Some(update))
    }
}
