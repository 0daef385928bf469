//! Seams between the judging core and persistence.

use async_trait::async_trait;
use serde::Serialize;

use crate::error;
use crate::model::{Problem, SubmissionId, Verdict};

/// Read-only access to problems, their ordered test cases and limits
#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn fetch_problem(&self, problem_id: i64) -> error::Result<Problem>;
}

/// Terminal result of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalResult {
    pub verdict: Verdict,
    pub time_ms: u64,
    pub memory_kb: u64,
    /// Set when the judging system failed rather than the submission
    pub infrastructure_fault: Option<String>,
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Stores the terminal result of a pending submission.
    ///
    /// Returns `false` when the submission already had one, which is then
    /// left untouched.
    async fn record_terminal(&self, id: SubmissionId, result: &TerminalResult) -> error::Result<bool>;

    /// The stored terminal result, `None` while the submission is pending
    async fn terminal_result(&self, id: SubmissionId) -> error::Result<Option<TerminalResult>>;

    /// Notes an infrastructure fault on a stored result, keeping its verdict
    async fn record_fault(&self, id: SubmissionId, reason: &str) -> error::Result<()>;
}
