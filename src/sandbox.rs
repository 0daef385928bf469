mod compile;
mod isolate_runner;
mod process_runner;
mod process_tree;
mod runner;

pub use compile::{Artifact, CompileOutcome, Compiler};
pub use isolate_runner::IsolateRunner;
pub use process_runner::ProcessRunner;
pub use runner::{ExecStatus, Execution, Limits, RunSpec, SandboxRunner, Usage};

use std::path::Path;

use crate::config::{JudgeConfig, SandboxKind};
use crate::model::SubmissionId;

/// Creates a sandbox runner according to the configured backend
///
/// With [`SandboxKind::Auto`], an [`IsolateRunner`] is used when `isolate` is
/// found on PATH and a [`ProcessRunner`] otherwise.
pub fn create_sandbox_runner(
    id: u8,
    config: &JudgeConfig,
) -> anyhow::Result<Box<dyn SandboxRunner>> {
    let use_isolate = match config.sandbox {
        SandboxKind::Isolate => true,
        SandboxKind::Process => false,
        SandboxKind::Auto => std::process::Command::new("which")
            .arg("isolate")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false),
    };

    if use_isolate {
        log::info!("Creating IsolateRunner {id} (full isolation mode)");
        Ok(Box::new(IsolateRunner::build(id)?))
    } else {
        log::info!("Creating ProcessRunner {id} (rlimit mode)");
        Ok(Box::new(ProcessRunner::build(id)))
    }
}

/// Per-submission working directory, removed when dropped
pub struct ScratchDir {
    dir: Option<tempfile::TempDir>,
}

impl ScratchDir {
    pub fn create(root: &Path, submission_id: SubmissionId) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("sub-{submission_id}-"))
            .tempdir_in(root)?;
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        // only taken in drop
        self.dir.as_ref().map_or(Path::new(""), |d| d.path())
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                log::error!("Failed to remove scratch directory {}: {e}", path.display());
            }
        }
    }
}

/// Lossy UTF-8 text of at most `limit` bytes, cut on a character boundary
pub fn excerpt(bytes: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= limit {
        return text.into_owned();
    }

    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
