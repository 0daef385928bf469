use std::fs;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::config::{EXECUTABLE_NAME, JudgeConfig, LanguageTable};
use crate::error::{self, JudgeError};
use crate::model::Language;

use super::{ExecStatus, Limits, RunSpec, SandboxRunner, excerpt};

/// A runnable program inside the scratch directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Command line relative to the scratch directory
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Ready(Artifact),
    /// The submission did not compile; diagnostics are truncated
    Failed { diagnostics: String },
}

/// Turns source code into an [`Artifact`] using the language's toolchain
pub struct Compiler<'a> {
    pub runner: &'a dyn SandboxRunner,
    pub languages: &'a LanguageTable,
    pub config: &'a JudgeConfig,
}

impl Compiler<'_> {
    /// Writes the source into `scratch` and compiles it there.
    ///
    /// Compilation runs in the sandbox under its own limits. Only a sandbox
    /// or toolchain failure is an `Err`; anything wrong with the submission
    /// itself is [`CompileOutcome::Failed`].
    pub fn compile(
        &self,
        language: Language,
        source_code: &str,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> error::Result<CompileOutcome> {
        let toolchain = self.languages.get(language);
        fs::write(scratch.join(&toolchain.file_name), format!("{source_code}\n"))?;

        let Some(compile_command) = toolchain.compile_command() else {
            return Ok(CompileOutcome::Ready(Artifact {
                argv: toolchain.run_command(),
            }));
        };

        let limits = Limits::for_compile(self.config);
        let spec = RunSpec {
            argv: &compile_command,
            work_dir: scratch,
            stdin: b"",
            limits: &limits,
        };
        let execution = self.runner.execute(&spec, cancel).map_err(|e| match e {
            JudgeError::Infrastructure(reason) => {
                JudgeError::infra(format!("{language} toolchain unavailable: {reason}"))
            }
            e => e,
        })?;

        let mut diagnostics = execution.stderr;
        diagnostics.extend_from_slice(&execution.stdout);
        let diagnostics = excerpt(&diagnostics, self.config.diagnostics_limit_bytes);

        let failure = match execution.status {
            ExecStatus::Cancelled => return Err(JudgeError::Cancelled),
            ExecStatus::RanToCompletion { .. } => {
                if scratch.join(EXECUTABLE_NAME).is_file() {
                    log::debug!("Compiled {language} in {}ms", execution.usage.time_ms);
                    return Ok(CompileOutcome::Ready(Artifact {
                        argv: toolchain.run_command(),
                    }));
                }
                "compiler produced no executable"
            }
            ExecStatus::TimedOut => "compilation timed out",
            ExecStatus::MemoryExceeded => "compilation exceeded its memory limit",
            ExecStatus::Crashed { .. } => "",
        };

        let diagnostics = match (failure.is_empty(), diagnostics.is_empty()) {
            (true, _) => diagnostics,
            (false, true) => failure.to_string(),
            (false, false) => format!("{diagnostics}\n{failure}"),
        };
        Ok(CompileOutcome::Failed { diagnostics })
    }
}
