#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePool;
use tokio_util::sync::CancellationToken;

use arbiter::config::{JudgeConfig, LanguageTable};
use arbiter::database::{self as db, NewSubmission, SqliteStore, SubmissionRecord};
use arbiter::error::{self, JudgeError};
use arbiter::judge::JudgeContext;
use arbiter::model::{ComparePolicy, Difficulty, Language, Problem, SubmissionId, TestCase};
use arbiter::sandbox::{ExecStatus, Execution, RunSpec, SandboxRunner, Usage};
use arbiter::scheduler::{JudgeScheduler, JudgeServices};
use arbiter::scoring::{Award, ScoreStore, ScoreUpdate, ScoringApplier};
use arbiter::store::{ResultSink, TerminalResult};

// Global counter to ensure unique test database names
static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

// Test guard that ensures cleanup on drop
pub struct TestDbGuard {
    db_path: String,
}

impl Drop for TestDbGuard {
    fn drop(&mut self) {
        db::remove_db(&self.db_path);
    }
}

/// Creates an isolated database with users 1, 2 and 3
pub async fn create_test_db(prefix: &str) -> (SqlitePool, TestDbGuard) {
    let test_id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_path = format!(
        "{}/test_{prefix}_{}_{test_id}.db",
        env!("CARGO_TARGET_TMPDIR"),
        std::process::id()
    );

    // Remove existing test database if it exists
    let _ = fs::remove_file(&db_path);

    let db_pool = db::init_db(&db_path).await.unwrap();
    for i in 1..=3 {
        db::create_user(&format!("test_user_{i}"), &db_pool)
            .await
            .unwrap();
    }

    (db_pool, TestDbGuard { db_path })
}

pub fn scratch_root() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("scratch")
        .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
        .unwrap()
}

pub fn problem(id: i64, time_limit_ms: u64, cases: &[(&str, &str)]) -> Problem {
    Problem {
        id,
        title: format!("problem {id}"),
        statement: String::new(),
        difficulty: Difficulty::Easy,
        tags: vec![],
        time_limit_ms,
        memory_limit_kb: Problem::DEFAULT_MEMORY_LIMIT_KB,
        is_public: true,
        compare_policy: ComparePolicy::Trimmed,
        test_cases: cases
            .iter()
            .enumerate()
            .map(|(i, (input, output))| TestCase {
                input: input.to_string(),
                expected_output: output.to_string(),
                is_sample: i == 0,
                order: i as i64,
            })
            .collect(),
    }
}

pub async fn create_submission(
    pool: &SqlitePool,
    user_id: i64,
    problem_id: i64,
    contest_id: Option<i64>,
    source_code: &str,
) -> SubmissionRecord {
    db::create_submission(
        &NewSubmission {
            user_id,
            problem_id,
            contest_id,
            language: Language::Python,
            source_code: source_code.to_string(),
        },
        pool,
    )
    .await
    .unwrap()
}

/// A deterministic sandbox that interprets `main.py` as a tiny script
///
/// One command per line: `echo` copies stdin to stdout, `print:<text>`
/// prints a line, `sleep:<ms>` and `block` wait (honouring the wall limit
/// and cancellation), `crash`, `memory`, `fail` and `panic` end the run.
#[derive(Default, Clone)]
pub struct MockRunner {
    /// Submission id of every execution, in order
    pub executions: Arc<Mutex<Vec<SubmissionId>>>,
}

impl MockRunner {
    pub fn executions_of(&self, id: SubmissionId) -> usize {
        self.executions.lock().iter().filter(|e| **e == id).count()
    }
}

fn submission_of(work_dir: &Path) -> SubmissionId {
    let name = work_dir.file_name().unwrap().to_string_lossy();
    name.strip_prefix("sub-")
        .and_then(|rest| rest.split('-').next())
        .and_then(|id| id.parse().ok())
        .unwrap()
}

enum Waited {
    Done,
    TimedOut,
    Cancelled,
}

fn wait(duration: Duration, started: Instant, wall: Duration, cancel: &CancellationToken) -> Waited {
    let until = Instant::now().checked_add(duration);
    loop {
        if cancel.is_cancelled() {
            return Waited::Cancelled;
        }
        if started.elapsed() >= wall {
            return Waited::TimedOut;
        }
        if until.is_some_and(|until| Instant::now() >= until) {
            return Waited::Done;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

impl SandboxRunner for MockRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute(&self, spec: &RunSpec<'_>, cancel: &CancellationToken) -> error::Result<Execution> {
        self.executions.lock().push(submission_of(spec.work_dir));
        let script = fs::read_to_string(spec.work_dir.join("main.py"))?;

        let started = Instant::now();
        let mut stdout = Vec::new();
        let mut status = ExecStatus::RanToCompletion { exit_code: 0 };

        for line in script.lines() {
            let (command, arg) = line.split_once(':').unwrap_or((line, ""));
            let waited = match command.trim() {
                "" => continue,
                "echo" => {
                    stdout.extend_from_slice(spec.stdin);
                    continue;
                }
                "print" => {
                    stdout.extend_from_slice(arg.as_bytes());
                    stdout.push(b'\n');
                    continue;
                }
                "sleep" => wait(
                    Duration::from_millis(arg.parse().unwrap()),
                    started,
                    spec.limits.wall_time,
                    cancel,
                ),
                "block" => wait(Duration::MAX, started, spec.limits.wall_time, cancel),
                "crash" => {
                    status = ExecStatus::Crashed {
                        signal: None,
                        exit_code: Some(1),
                    };
                    break;
                }
                "memory" => {
                    status = ExecStatus::MemoryExceeded;
                    break;
                }
                "fail" => return Err(JudgeError::infra("sandbox unavailable")),
                "panic" => panic!("sandbox bug"),
                other => panic!("unknown mock command {other}"),
            };

            match waited {
                Waited::Done => {}
                Waited::TimedOut => {
                    status = ExecStatus::TimedOut;
                    break;
                }
                Waited::Cancelled => {
                    status = ExecStatus::Cancelled;
                    break;
                }
            }
        }

        Ok(Execution {
            status,
            usage: Usage {
                time_ms: started.elapsed().as_millis() as u64,
                memory_kb: 1024,
            },
            stdout,
            stderr: Vec::new(),
            stdout_truncated: false,
        })
    }
}

/// A scheduler over mock runners and a fresh database
pub struct Harness {
    pub scheduler: Arc<JudgeScheduler>,
    pub pool: SqlitePool,
    pub runner: MockRunner,
    pub scratch_root: PathBuf,
    _scratch: tempfile::TempDir,
    _guard: TestDbGuard,
}

impl Harness {
    pub async fn start(prefix: &str, workers: usize) -> Self {
        Self::start_with_stores(prefix, workers, |store| {
            (
                store.clone() as Arc<dyn ResultSink>,
                store as Arc<dyn ScoreStore>,
            )
        })
        .await
    }

    /// Starts with result and score stores built around the SQLite one
    pub async fn start_with_stores<F>(prefix: &str, workers: usize, stores: F) -> Self
    where
        F: FnOnce(Arc<SqliteStore>) -> (Arc<dyn ResultSink>, Arc<dyn ScoreStore>),
    {
        let (pool, guard) = create_test_db(prefix).await;
        let scratch = scratch_root();

        let context = JudgeContext {
            config: JudgeConfig {
                workers,
                ..JudgeConfig::default()
            },
            languages: LanguageTable::default(),
            scratch_root: scratch.path().to_path_buf(),
        };
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let (results, scores) = stores(store.clone());
        let services = JudgeServices {
            context: Arc::new(context),
            problems: store,
            results,
            scoring: ScoringApplier::new(scores),
        };

        let runner = MockRunner::default();
        let runners: Vec<Box<dyn SandboxRunner>> = (0..workers)
            .map(|_| Box::new(runner.clone()) as Box<dyn SandboxRunner>)
            .collect();

        Self {
            scheduler: JudgeScheduler::start(services, runners),
            pool,
            runner,
            scratch_root: scratch.path().to_path_buf(),
            _scratch: scratch,
            _guard: guard,
        }
    }

    pub async fn insert_problem(&self, problem: &Problem) {
        db::insert_problem(problem, &self.pool).await.unwrap();
    }

    pub async fn fetch(&self, id: SubmissionId) -> SubmissionRecord {
        db::fetch_submission(id, &self.pool).await.unwrap().unwrap()
    }
}

/// Fails the first `failures` terminal writes, then writes to SQLite
pub struct FlakyResults {
    pub inner: Arc<SqliteStore>,
    pub failures: AtomicU32,
}

#[async_trait]
impl ResultSink for FlakyResults {
    async fn record_terminal(&self, id: SubmissionId, result: &TerminalResult) -> error::Result<bool> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(JudgeError::infra("database is locked"));
        }
        self.inner.record_terminal(id, result).await
    }

    async fn terminal_result(&self, id: SubmissionId) -> error::Result<Option<TerminalResult>> {
        self.inner.terminal_result(id).await
    }

    async fn record_fault(&self, id: SubmissionId, reason: &str) -> error::Result<()> {
        self.inner.record_fault(id, reason).await
    }
}

/// A scoreboard that is never reachable
pub struct BrokenScores;

#[async_trait]
impl ScoreStore for BrokenScores {
    async fn award_first_acceptance(&self, _award: &Award) -> error::Result<ScoreUpdate> {
        Err(JudgeError::infra("scoreboard unavailable"))
    }
}
