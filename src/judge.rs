//! One submission's pipeline: compile, run every test case, aggregate.

use std::fs;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::compare::outputs_match;
use crate::config::{JudgeConfig, LanguageTable, WrongAnswerMode};
use crate::error::{self, JudgeError};
use crate::model::{CaseResult, JudgeReport, JudgeRequest, Problem, TestCase, Verdict};
use crate::sandbox::{
    Artifact, CompileOutcome, Compiler, ExecStatus, Execution, Limits, RunSpec, SandboxRunner,
    ScratchDir, excerpt,
};

/// Immutable judging configuration, built once at startup and shared
#[derive(Debug)]
pub struct JudgeContext {
    pub config: JudgeConfig,
    pub languages: LanguageTable,
    pub scratch_root: PathBuf,
}

impl JudgeContext {
    pub fn new(config: JudgeConfig, languages: LanguageTable) -> anyhow::Result<Self> {
        let scratch_root = config.scratch_root()?;
        fs::create_dir_all(&scratch_root)?;
        log::info!("Scratch directories under {}", scratch_root.display());

        Ok(Self {
            config,
            languages,
            scratch_root,
        })
    }
}

/// Where a running judge currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compiling,
    /// Index of the test case, in judging order
    Running(usize),
}

/// Judges submissions on one sandbox runner
pub struct Judge<'a> {
    pub runner: &'a dyn SandboxRunner,
    pub ctx: &'a JudgeContext,
}

impl Judge<'_> {
    /// Runs the whole pipeline for `request` against `problem`.
    ///
    /// Blocks until judging ends. The scratch directory is removed on every
    /// return path. `Err(Cancelled)` means the partial verdict was discarded.
    pub fn run(
        &self,
        request: &JudgeRequest,
        problem: &Problem,
        cancel: &CancellationToken,
        progress: &dyn Fn(Stage),
    ) -> error::Result<JudgeReport> {
        if problem.test_cases.is_empty() {
            return Err(JudgeError::infra(format!(
                "problem {} has no test cases",
                problem.id
            )));
        }

        let scratch = ScratchDir::create(&self.ctx.scratch_root, request.submission_id)?;
        self.runner.prepare_scratch(scratch.path())?;

        progress(Stage::Compiling);
        let compiler = Compiler {
            runner: self.runner,
            languages: &self.ctx.languages,
            config: &self.ctx.config,
        };
        let artifact = match compiler.compile(
            request.language,
            &request.source_code,
            scratch.path(),
            cancel,
        )? {
            CompileOutcome::Ready(artifact) => artifact,
            CompileOutcome::Failed { diagnostics } => {
                return Ok(JudgeReport::compilation_error(diagnostics));
            }
        };

        let limits = Limits::for_test_case(problem, &self.ctx.config);
        let mut report = JudgeReport {
            verdict: Verdict::Accepted,
            time_ms: 0,
            memory_kb: 0,
            cases: Vec::new(),
            diagnostics: String::new(),
        };

        for (index, case) in problem.ordered_cases().into_iter().enumerate() {
            progress(Stage::Running(index));

            let spec = RunSpec {
                argv: &artifact.argv,
                work_dir: scratch.path(),
                stdin: case.input.as_bytes(),
                limits: &limits,
            };
            let execution = self.runner.execute(&spec, cancel)?;
            let result = self.case_result(index, case, problem, &artifact, execution)?;

            report.time_ms = report.time_ms.max(result.time_ms);
            report.memory_kb = report.memory_kb.max(result.memory_kb);
            report.verdict = report.verdict.max(result.verdict);

            let verdict = result.verdict;
            report.cases.push(result);

            if verdict.halts_judging()
                || (verdict == Verdict::WrongAnswer
                    && self.ctx.config.wrong_answer_mode == WrongAnswerMode::FailFast)
            {
                break;
            }
        }

        log::debug!(
            "Submission {} judged {} over {} case(s)",
            request.submission_id,
            report.verdict,
            report.cases.len()
        );
        Ok(report)
    }

    fn case_result(
        &self,
        index: usize,
        case: &TestCase,
        problem: &Problem,
        artifact: &Artifact,
        execution: Execution,
    ) -> error::Result<CaseResult> {
        let verdict = match execution.status {
            ExecStatus::Cancelled => return Err(JudgeError::Cancelled),
            ExecStatus::TimedOut => Verdict::TimeLimitExceeded,
            ExecStatus::MemoryExceeded => Verdict::MemoryLimitExceeded,
            ExecStatus::Crashed { signal, exit_code } => {
                log::debug!(
                    "Case {index} of {:?} crashed (signal {signal:?}, exit code {exit_code:?})",
                    artifact.argv
                );
                Verdict::RuntimeError
            }
            // The cut-off tail cannot be compared, so it never counts as matching
            ExecStatus::RanToCompletion { .. } if execution.stdout_truncated => {
                Verdict::WrongAnswer
            }
            ExecStatus::RanToCompletion { .. } => {
                if outputs_match(
                    problem.compare_policy,
                    &execution.stdout,
                    &case.expected_output,
                ) {
                    Verdict::Accepted
                } else {
                    Verdict::WrongAnswer
                }
            }
        };

        let limit = self.ctx.config.excerpt_limit_bytes;
        Ok(CaseResult {
            index,
            verdict,
            time_ms: execution.usage.time_ms,
            memory_kb: execution.usage.memory_kb,
            stdout: excerpt(&execution.stdout, limit),
            stderr: excerpt(&execution.stderr, limit),
        })
    }
}
