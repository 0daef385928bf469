use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::JudgeConfig;
use crate::error;
use crate::model::Problem;

const RUNTIME_PROCESSES: u32 = 4;
const RUNTIME_FILE_SIZE_KB: u64 = 16384;
const COMPILE_PROCESSES: u32 = 16;
const COMPILE_FILE_SIZE_KB: u64 = 65536;

/// Resource ceilings of one sandboxed execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Hard wall-clock ceiling, grace margin included
    pub wall_time: Duration,
    pub memory_kb: u64,
    /// Captured stdout beyond this is discarded
    pub output_bytes: usize,
    pub processes: u32,
    pub file_size_kb: u64,
}

impl Limits {
    pub fn for_test_case(problem: &Problem, config: &JudgeConfig) -> Self {
        Self {
            wall_time: Duration::from_millis(problem.time_limit_ms) + config.time_grace(),
            memory_kb: problem.memory_limit_kb,
            output_bytes: config.output_limit_bytes,
            processes: RUNTIME_PROCESSES,
            file_size_kb: RUNTIME_FILE_SIZE_KB,
        }
    }

    pub fn for_compile(config: &JudgeConfig) -> Self {
        Self {
            wall_time: config.compile_timeout(),
            memory_kb: config.compile_memory_kb,
            output_bytes: config.diagnostics_limit_bytes,
            processes: COMPILE_PROCESSES,
            file_size_kb: COMPILE_FILE_SIZE_KB,
        }
    }
}

/// One program invocation inside a scratch directory.
///
/// `argv[0]` is either a bare command looked up on `PATH` or a path
/// relative to `work_dir`.
#[derive(Debug)]
pub struct RunSpec<'a> {
    pub argv: &'a [String],
    pub work_dir: &'a Path,
    pub stdin: &'a [u8],
    pub limits: &'a Limits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub time_ms: u64,
    pub memory_kb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    RanToCompletion { exit_code: i32 },
    TimedOut,
    MemoryExceeded,
    /// Killed by a signal or exited with a non-zero code
    Crashed {
        signal: Option<i32>,
        exit_code: Option<i32>,
    },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub status: ExecStatus,
    pub usage: Usage,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
}

impl Execution {
    pub fn cancelled(usage: Usage) -> Self {
        Self {
            status: ExecStatus::Cancelled,
            usage,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
        }
    }
}

/// Trait for different sandbox execution implementations
///
/// Implementations run one untrusted program under the given limits and
/// report how it ended. Exceeding a limit is an [`ExecStatus`], never an
/// error; `Err` is reserved for failures of the sandbox itself.
pub trait SandboxRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes a fresh scratch directory usable by sandboxed programs
    fn prepare_scratch(&self, _dir: &Path) -> error::Result<()> {
        Ok(())
    }

    /// Runs one program to completion, a ceiling, or cancellation.
    ///
    /// Blocks the calling thread; no process started here outlives the call.
    fn execute(&self, spec: &RunSpec<'_>, cancel: &CancellationToken) -> error::Result<Execution>;
}

/// Reads everything from `reader`, keeping at most `cap` bytes.
///
/// The rest is drained and dropped so a chatty program never blocks on a
/// full pipe. Returns whether anything was dropped.
pub(super) fn read_capped(mut reader: impl Read, cap: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }

    Ok((kept, truncated))
}
