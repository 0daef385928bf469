use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SubmissionId = i64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    C,
    Cpp,
    Python,
    Pascal,
}

impl Language {
    pub const ALL: [Language; 4] = [Self::C, Self::Cpp, Self::Python, Self::Pascal];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Python => "python",
            Self::Pascal => "pascal",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown language: {s}"))
    }
}

/// Final judging outcome.
///
/// Variants are declared from lowest to highest priority, so the derived
/// `Ord` is the combination rule: the worst (greatest) verdict wins.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
}

impl Verdict {
    pub const ALL: [Verdict; 6] = [
        Self::Accepted,
        Self::WrongAnswer,
        Self::TimeLimitExceeded,
        Self::MemoryLimitExceeded,
        Self::RuntimeError,
        Self::CompilationError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::WrongAnswer => "wrong_answer",
            Self::TimeLimitExceeded => "time_limit_exceeded",
            Self::MemoryLimitExceeded => "memory_limit_exceeded",
            Self::RuntimeError => "runtime_error",
            Self::CompilationError => "compilation_error",
        }
    }

    /// Whether judging stops as soon as a test case produces this verdict.
    /// Wrong answers depend on [`crate::config::WrongAnswerMode`].
    pub fn halts_judging(self) -> bool {
        matches!(
            self,
            Self::CompilationError
                | Self::RuntimeError
                | Self::MemoryLimitExceeded
                | Self::TimeLimitExceeded
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown verdict: {s}"))
    }
}

/// Status column of a stored submission: `pending` until judged exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Judged(Verdict),
}

impl SubmissionStatus {
    pub const PENDING: &'static str = "pending";

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => Self::PENDING,
            Self::Judged(v) => v.as_str(),
        }
    }
}

impl FromStr for SubmissionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::PENDING {
            Ok(Self::Pending)
        } else {
            s.parse().map(Self::Judged)
        }
    }
}

impl Serialize for SubmissionStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SubmissionStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }
}

impl FromStr for Difficulty {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            _ => Err(anyhow::anyhow!("Unknown difficulty: {s}")),
        }
    }
}

/// How a test case's captured stdout is compared with its expected output.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComparePolicy {
    /// Trailing whitespace per line and trailing blank lines are ignored
    #[default]
    Trimmed,
    /// Whitespace-separated token sequences must be equal
    Tokens,
    /// Byte-for-byte equality
    Exact,
}

impl ComparePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trimmed => "trimmed",
            Self::Tokens => "tokens",
            Self::Exact => "exact",
        }
    }
}

impl FromStr for ComparePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trimmed" => Ok(Self::Trimmed),
            "tokens" => Ok(Self::Tokens),
            "exact" => Ok(Self::Exact),
            _ => Err(anyhow::anyhow!("Unknown compare policy: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    pub is_sample: bool,
    pub order: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Problem {
    pub id: i64,
    pub title: String,
    pub statement: String,
    pub difficulty: Difficulty,
    pub tags: Vec<String>,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    pub is_public: bool,
    pub compare_policy: ComparePolicy,
    pub test_cases: Vec<TestCase>,
}

impl Problem {
    pub const DEFAULT_TIME_LIMIT_MS: u64 = 1000;
    pub const DEFAULT_MEMORY_LIMIT_KB: u64 = 262144;

    /// Test cases in judging order: ascending order index, stable for ties
    pub fn ordered_cases(&self) -> Vec<&TestCase> {
        let mut cases: Vec<&TestCase> = self.test_cases.iter().collect();
        cases.sort_by_key(|c| c.order);
        cases
    }
}

/// Everything the judging core needs to know about one submission
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JudgeRequest {
    pub submission_id: SubmissionId,
    pub user_id: i64,
    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub language: Language,
    pub source_code: String,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of one test case; transient, folded into the [`JudgeReport`]
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CaseResult {
    pub index: usize,
    pub verdict: Verdict,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct JudgeReport {
    pub verdict: Verdict,
    /// Worst case over the test cases actually run
    pub time_ms: u64,
    /// Worst case over the test cases actually run
    pub memory_kb: u64,
    pub cases: Vec<CaseResult>,
    /// Compiler output, kept when compilation fails
    pub diagnostics: String,
}

impl JudgeReport {
    pub fn compilation_error(diagnostics: String) -> Self {
        Self {
            verdict: Verdict::CompilationError,
            time_ms: 0,
            memory_kb: 0,
            cases: Vec::new(),
            diagnostics,
        }
    }
}
