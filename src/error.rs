use std::fmt::Display;

/// Errors raised by the judging core.
///
/// User-code outcomes (compile errors, crashes, exceeded limits, wrong
/// answers) are never errors: they are folded into a [`crate::model::Verdict`].
/// Everything here means the judging system itself could not produce one.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    /// The sandbox, toolchain or host failed (missing binary, disk full, ...)
    #[error("infrastructure fault: {0}")]
    Infrastructure(String),

    /// The run was cancelled; any partial verdict must be discarded
    #[error("judging cancelled")]
    Cancelled,

    #[error("problem {0} not found")]
    ProblemNotFound(i64),

    #[error("submission {0} not found")]
    SubmissionNotFound(i64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl JudgeError {
    pub fn infra(message: impl Display) -> Self {
        Self::Infrastructure(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;
