use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::error::{self, JudgeError};
use crate::model::{
    ComparePolicy, Language, Problem, SubmissionId, SubmissionStatus, TestCase, Verdict,
};
use crate::scoring::{Award, ScoreStore, ScoreUpdate};
use crate::store::{ProblemStore, ResultSink, TerminalResult};
use crate::{create_timestamp, format_timestamp};

const DATABASE_NAME: &str = "arbiter.sqlite3";
/// Infrastructure fault stored for submissions left pending by a stopped judge
pub const ABANDONED_REASON: &str = "no verdict was stored before the judge stopped";

/// Default database location under the user's local data directory
pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "arbiter")
        .ok_or_else(|| anyhow::anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(0) // Allow pool to shrink when idle
        .connect(&db_url)
        .await?;

    // Execute PRAGMA statements first (these cannot be run inside a transaction)
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    // Use a transaction for table creation and data initialization
    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS users (
            id            INTEGER PRIMARY KEY,
            username      TEXT    NOT NULL UNIQUE
        );",
        r"
        CREATE TABLE IF NOT EXISTS problems (
            id              INTEGER PRIMARY KEY,
            title           TEXT    NOT NULL,
            statement       TEXT    NOT NULL,
            difficulty      TEXT    NOT NULL,
            tags            TEXT    NOT NULL DEFAULT '[]',
            time_limit_ms   INTEGER NOT NULL DEFAULT 1000,
            memory_limit_kb INTEGER NOT NULL DEFAULT 262144,
            is_public       INTEGER NOT NULL DEFAULT 1,
            compare_policy  TEXT    NOT NULL DEFAULT 'trimmed'
        );",
        r"
        CREATE TABLE IF NOT EXISTS test_cases (
            id              INTEGER PRIMARY KEY,
            problem_id      INTEGER NOT NULL,
            input           TEXT    NOT NULL,
            expected_output TEXT    NOT NULL,
            is_sample       INTEGER NOT NULL DEFAULT 0,
            order_index     INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (problem_id) REFERENCES problems (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS contests (
            id            INTEGER PRIMARY KEY,
            name          TEXT    NOT NULL,
            start_time    TEXT    NOT NULL,
            end_time      TEXT    NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS contest_problems (
            contest_id    INTEGER NOT NULL,
            problem_id    INTEGER NOT NULL,
            points        INTEGER NOT NULL DEFAULT 100,
            order_index   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (contest_id, problem_id),
            FOREIGN KEY (contest_id) REFERENCES contests (id),
            FOREIGN KEY (problem_id) REFERENCES problems (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS contest_participants (
            contest_id    INTEGER NOT NULL,
            user_id       INTEGER NOT NULL,
            score         INTEGER NOT NULL DEFAULT 0,
            joined_time   TEXT    NOT NULL,
            PRIMARY KEY (contest_id, user_id),
            FOREIGN KEY (contest_id) REFERENCES contests (id),
            FOREIGN KEY (user_id)    REFERENCES users (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS contest_solves (
            contest_id    INTEGER NOT NULL,
            user_id       INTEGER NOT NULL,
            problem_id    INTEGER NOT NULL,
            submission_id INTEGER NOT NULL,
            solved_time   TEXT    NOT NULL,
            PRIMARY KEY (contest_id, user_id, problem_id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id                   INTEGER PRIMARY KEY,
            user_id              INTEGER NOT NULL,
            problem_id           INTEGER NOT NULL,
            contest_id           INTEGER,
            language             TEXT    NOT NULL,
            source_code          TEXT    NOT NULL,
            status               TEXT    NOT NULL DEFAULT 'pending',
            time_ms              INTEGER NOT NULL DEFAULT 0,
            memory_kb            INTEGER NOT NULL DEFAULT 0,
            infrastructure_fault TEXT,
            submitted_time       TEXT    NOT NULL,
            judged_time          TEXT,
            FOREIGN KEY (user_id)    REFERENCES users (id),
            FOREIGN KEY (problem_id) REFERENCES problems (id),
            FOREIGN KEY (contest_id) REFERENCES contests (id)
        );",
        "INSERT OR IGNORE INTO users (id, username) VALUES (0, 'root');",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    // Remove main database file
    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

fn decode<T: FromStr<Err = anyhow::Error>>(value: &str) -> sqlx::Result<T> {
    value.parse().map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))
}

fn decode_time(value: &str) -> sqlx::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(e.into()))
}

pub async fn create_user(username: &str, pool: &SqlitePool) -> sqlx::Result<i64> {
    let result = sqlx::query("INSERT INTO users (username) VALUES (?)")
        .bind(username)
        .execute(pool)
        .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_user(id: i64, pool: &SqlitePool) -> sqlx::Result<bool> {
    let result = sqlx::query("SELECT 1 FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(result.is_some())
}

/// Inserts a problem with its test cases under the problem's own id
pub async fn insert_problem(problem: &Problem, pool: &SqlitePool) -> sqlx::Result<()> {
    let tags = serde_json::to_string(&problem.tags).map_err(|e| sqlx::Error::Encode(e.into()))?;
    let mut tx = pool.begin().await?;

    sqlx::query(
        r"
        INSERT INTO problems (id, title, statement, difficulty, tags, time_limit_ms, memory_limit_kb, is_public, compare_policy)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(problem.id)
    .bind(&problem.title)
    .bind(&problem.statement)
    .bind(problem.difficulty.as_str())
    .bind(tags)
    .bind(problem.time_limit_ms as i64)
    .bind(problem.memory_limit_kb as i64)
    .bind(problem.is_public)
    .bind(problem.compare_policy.as_str())
    .execute(tx.as_mut())
    .await?;

    for case in &problem.test_cases {
        sqlx::query(
            r"
            INSERT INTO test_cases (problem_id, input, expected_output, is_sample, order_index)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(problem.id)
        .bind(&case.input)
        .bind(&case.expected_output)
        .bind(case.is_sample)
        .bind(case.order)
        .execute(tx.as_mut())
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn find_problem(id: i64, pool: &SqlitePool) -> sqlx::Result<bool> {
    let result = sqlx::query("SELECT 1 FROM problems WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(result.is_some())
}

#[derive(sqlx::FromRow)]
struct ProblemRow {
    id: i64,
    title: String,
    statement: String,
    difficulty: String,
    tags: String,
    time_limit_ms: i64,
    memory_limit_kb: i64,
    is_public: bool,
    compare_policy: String,
}

#[derive(sqlx::FromRow)]
struct TestCaseRow {
    input: String,
    expected_output: String,
    is_sample: bool,
    order_index: i64,
}

/// Fetches a problem with its test cases in judging order
pub async fn fetch_problem(id: i64, pool: &SqlitePool) -> sqlx::Result<Problem> {
    log::debug!("Trying to fetch problem {id} from database");

    let row: ProblemRow = sqlx::query_as(
        r"
        SELECT id, title, statement, difficulty, tags, time_limit_ms, memory_limit_kb, is_public, compare_policy
        FROM problems
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;

    // Insertion order breaks ties between equal order indexes
    let cases: Vec<TestCaseRow> = sqlx::query_as(
        r"
        SELECT input, expected_output, is_sample, order_index
        FROM test_cases
        WHERE problem_id = ?
        ORDER BY order_index, id
        ",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    Ok(Problem {
        id: row.id,
        title: row.title,
        statement: row.statement,
        difficulty: decode(&row.difficulty)?,
        tags: serde_json::from_str(&row.tags).map_err(|e| sqlx::Error::Decode(e.into()))?,
        time_limit_ms: row.time_limit_ms.max(0) as u64,
        memory_limit_kb: row.memory_limit_kb.max(0) as u64,
        is_public: row.is_public,
        compare_policy: decode::<ComparePolicy>(&row.compare_policy)?,
        test_cases: cases
            .into_iter()
            .map(|c| TestCase {
                input: c.input,
                expected_output: c.expected_output,
                is_sample: c.is_sample,
                order: c.order_index,
            })
            .collect(),
    })
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Contest {
    pub id: i64,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContestPhase {
    Upcoming,
    Ongoing,
    Ended,
}

impl Contest {
    /// Whether `at` falls inside the contest window, both ends included
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.start_time <= at && at <= self.end_time
    }

    pub fn phase_at(&self, at: DateTime<Utc>) -> ContestPhase {
        if at < self.start_time {
            ContestPhase::Upcoming
        } else if at <= self.end_time {
            ContestPhase::Ongoing
        } else {
            ContestPhase::Ended
        }
    }
}

pub async fn create_contest(
    name: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    pool: &SqlitePool,
) -> sqlx::Result<i64> {
    let result = sqlx::query("INSERT INTO contests (name, start_time, end_time) VALUES (?, ?, ?)")
        .bind(name)
        .bind(format_timestamp(&start_time))
        .bind(format_timestamp(&end_time))
        .execute(pool)
        .await?;

    Ok(result.last_insert_rowid())
}

/// Adds a problem to a contest; `points` defaults to 100
pub async fn add_contest_problem(
    contest_id: i64,
    problem_id: i64,
    points: Option<i64>,
    order_index: i64,
    pool: &SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO contest_problems (contest_id, problem_id, points, order_index)
        VALUES (?, ?, COALESCE(?, 100), ?)
        ",
    )
    .bind(contest_id)
    .bind(problem_id)
    .bind(points)
    .bind(order_index)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn register_participant(
    contest_id: i64,
    user_id: i64,
    pool: &SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO contest_participants (contest_id, user_id, joined_time) VALUES (?, ?, ?)",
    )
    .bind(contest_id)
    .bind(user_id)
    .bind(create_timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn fetch_contest(id: i64, pool: &SqlitePool) -> sqlx::Result<Option<Contest>> {
    let row = sqlx::query("SELECT id, name, start_time, end_time FROM contests WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(|row| -> sqlx::Result<Contest> {
        Ok(Contest {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            start_time: decode_time(row.try_get("start_time")?)?,
            end_time: decode_time(row.try_get("end_time")?)?,
        })
    })
    .transpose()
}

pub async fn is_participant(contest_id: i64, user_id: i64, pool: &SqlitePool) -> sqlx::Result<bool> {
    let result =
        sqlx::query("SELECT 1 FROM contest_participants WHERE contest_id = ? AND user_id = ?")
            .bind(contest_id)
            .bind(user_id)
            .fetch_optional(pool)
            .await?;

    Ok(result.is_some())
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ContestScore {
    pub user_id: i64,
    pub username: String,
    pub score: i64,
}

/// Participants of a contest, highest score first
pub async fn fetch_scores(contest_id: i64, pool: &SqlitePool) -> sqlx::Result<Vec<ContestScore>> {
    sqlx::query_as(
        r"
        SELECT p.user_id, u.username, p.score
        FROM contest_participants p JOIN users u ON u.id = p.user_id
        WHERE p.contest_id = ?
        ORDER BY p.score DESC, p.user_id
        ",
    )
    .bind(contest_id)
    .fetch_all(pool)
    .await
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ContestStats {
    pub total: i64,
    /// Every status, including the ones without submissions
    pub by_status: BTreeMap<&'static str, i64>,
    pub participants_with_submissions: i64,
    pub problems_with_accepted: i64,
}

pub async fn fetch_contest_stats(contest_id: i64, pool: &SqlitePool) -> sqlx::Result<ContestStats> {
    let counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM submissions WHERE contest_id = ? GROUP BY status",
    )
    .bind(contest_id)
    .fetch_all(pool)
    .await?;

    let mut by_status: BTreeMap<&'static str, i64> =
        std::iter::once(SubmissionStatus::Pending)
            .chain(Verdict::ALL.map(SubmissionStatus::Judged))
            .map(|status| (status.as_str(), 0))
            .collect();
    for (status, count) in counts {
        let status: SubmissionStatus = decode(&status)?;
        by_status.insert(status.as_str(), count);
    }

    let (participants_with_submissions, problems_with_accepted): (i64, i64) = sqlx::query_as(
        r"
        SELECT COUNT(DISTINCT user_id),
               COUNT(DISTINCT CASE WHEN status = ? THEN problem_id END)
        FROM submissions
        WHERE contest_id = ?
        ",
    )
    .bind(Verdict::Accepted.as_str())
    .bind(contest_id)
    .fetch_one(pool)
    .await?;

    Ok(ContestStats {
        total: by_status.values().sum(),
        by_status,
        participants_with_submissions,
        problems_with_accepted,
    })
}

/// Awards points for the first acceptance of a problem by a participant.
///
/// The solve row and the score increment are written in one transaction, and
/// the solve row's primary key lets only one of several concurrent claims
/// through.
pub async fn award_first_acceptance(award: &Award, pool: &SqlitePool) -> sqlx::Result<ScoreUpdate> {
    let Some(contest) = fetch_contest(award.contest_id, pool).await? else {
        return Ok(ScoreUpdate::NotScored);
    };
    if !contest.is_active_at(award.submitted_at) {
        return Ok(ScoreUpdate::OutsideContestWindow);
    }

    let points: Option<i64> = sqlx::query_scalar(
        "SELECT points FROM contest_problems WHERE contest_id = ? AND problem_id = ?",
    )
    .bind(award.contest_id)
    .bind(award.problem_id)
    .fetch_optional(pool)
    .await?;
    let Some(points) = points else {
        return Ok(ScoreUpdate::NotScored);
    };
    if !is_participant(award.contest_id, award.user_id, pool).await? {
        return Ok(ScoreUpdate::NotScored);
    }

    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r"
        INSERT OR IGNORE INTO contest_solves (contest_id, user_id, problem_id, submission_id, solved_time)
        VALUES (?, ?, ?, ?, ?)
        ",
    )
    .bind(award.contest_id)
    .bind(award.user_id)
    .bind(award.problem_id)
    .bind(award.submission_id)
    .bind(format_timestamp(&award.submitted_at))
    .execute(tx.as_mut())
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        return Ok(ScoreUpdate::AlreadySolved);
    }

    let total: i64 = sqlx::query_scalar(
        r"
        UPDATE contest_participants
        SET score = score + ?
        WHERE contest_id = ? AND user_id = ?
        RETURNING score
        ",
    )
    .bind(points)
    .bind(award.contest_id)
    .bind(award.user_id)
    .fetch_one(tx.as_mut())
    .await?;

    tx.commit().await?;
    Ok(ScoreUpdate::Awarded { points, total })
}

/// A submission as received from intake
#[derive(Deserialize, Debug, Clone)]
pub struct NewSubmission {
    pub user_id: i64,
    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub language: Language,
    pub source_code: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub id: SubmissionId,
    pub user_id: i64,
    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub language: Language,
    pub source_code: String,
    pub status: SubmissionStatus,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub infrastructure_fault: Option<String>,
    pub submitted_time: DateTime<Utc>,
    pub judged_time: Option<DateTime<Utc>>,
}

impl SubmissionRecord {
    /// The stored verdict and usage, once judged
    pub fn terminal_result(&self) -> Option<TerminalResult> {
        let SubmissionStatus::Judged(verdict) = self.status else {
            return None;
        };
        Some(TerminalResult {
            verdict,
            time_ms: self.time_ms,
            memory_kb: self.memory_kb,
            infrastructure_fault: self.infrastructure_fault.clone(),
        })
    }

    pub fn judge_request(&self) -> crate::model::JudgeRequest {
        crate::model::JudgeRequest {
            submission_id: self.id,
            user_id: self.user_id,
            problem_id: self.problem_id,
            contest_id: self.contest_id,
            language: self.language,
            source_code: self.source_code.clone(),
            submitted_at: self.submitted_time,
        }
    }
}

/// Stores a new `pending` submission
pub async fn create_submission(
    submission: &NewSubmission,
    pool: &SqlitePool,
) -> sqlx::Result<SubmissionRecord> {
    let now = create_timestamp();

    let result = sqlx::query(
        r"
        INSERT INTO submissions (user_id, problem_id, contest_id, language, source_code, submitted_time)
        VALUES (?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(submission.user_id)
    .bind(submission.problem_id)
    .bind(submission.contest_id)
    .bind(submission.language.as_str())
    .bind(&submission.source_code)
    .bind(now)
    .execute(pool)
    .await?;

    fetch_submission(result.last_insert_rowid(), pool)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

const SUBMISSION_COLUMNS: &str = "id, user_id, problem_id, contest_id, language, source_code, \
     status, time_ms, memory_kb, infrastructure_fault, submitted_time, judged_time";

fn submission_from_row(row: &SqliteRow) -> sqlx::Result<SubmissionRecord> {
    let time_ms: i64 = row.try_get("time_ms")?;
    let memory_kb: i64 = row.try_get("memory_kb")?;
    let judged_time: Option<&str> = row.try_get("judged_time")?;

    Ok(SubmissionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        problem_id: row.try_get("problem_id")?,
        contest_id: row.try_get("contest_id")?,
        language: decode(row.try_get("language")?)?,
        source_code: row.try_get("source_code")?,
        status: decode(row.try_get("status")?)?,
        time_ms: time_ms.max(0) as u64,
        memory_kb: memory_kb.max(0) as u64,
        infrastructure_fault: row.try_get("infrastructure_fault")?,
        submitted_time: decode_time(row.try_get("submitted_time")?)?,
        judged_time: judged_time.map(decode_time).transpose()?,
    })
}

pub async fn fetch_submission(
    id: SubmissionId,
    pool: &SqlitePool,
) -> sqlx::Result<Option<SubmissionRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(submission_from_row).transpose()
}

/// Filters for listing submissions; every field is optional
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SubmissionFilter {
    pub user_id: Option<i64>,
    pub problem_id: Option<i64>,
    pub contest_id: Option<i64>,
    pub status: Option<SubmissionStatus>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

impl SubmissionFilter {
    pub const DEFAULT_LIMIT: u32 = 100;
}

/// Submissions matching `filter`, newest first
pub async fn fetch_submissions(
    filter: &SubmissionFilter,
    pool: &SqlitePool,
) -> sqlx::Result<Vec<SubmissionRecord>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE 1=1"
    ));

    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(problem_id) = filter.problem_id {
        qb.push(" AND problem_id = ").push_bind(problem_id);
    }
    if let Some(contest_id) = filter.contest_id {
        qb.push(" AND contest_id = ").push_bind(contest_id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    qb.push(" ORDER BY submitted_time DESC, id DESC LIMIT ")
        .push_bind(filter.limit.unwrap_or(SubmissionFilter::DEFAULT_LIMIT))
        .push(" OFFSET ")
        .push_bind(filter.skip.unwrap_or(0));

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(submission_from_row).collect()
}

/// The user's fastest accepted submission for a problem
pub async fn fetch_best_submission(
    problem_id: i64,
    user_id: i64,
    pool: &SqlitePool,
) -> sqlx::Result<Option<SubmissionRecord>> {
    let row = sqlx::query(&format!(
        r"
        SELECT {SUBMISSION_COLUMNS} FROM submissions
        WHERE problem_id = ? AND user_id = ? AND status = ?
        ORDER BY time_ms, id
        LIMIT 1
        "
    ))
    .bind(problem_id)
    .bind(user_id)
    .bind(Verdict::Accepted.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(submission_from_row).transpose()
}

/// Moves a `pending` submission to its terminal status.
///
/// Returns `false` if the submission was no longer pending.
pub async fn save_terminal(
    id: SubmissionId,
    result: &TerminalResult,
    pool: &SqlitePool,
) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        r"
        UPDATE submissions
        SET status = ?, time_ms = ?, memory_kb = ?, infrastructure_fault = ?, judged_time = ?
        WHERE id = ? AND status = ?
        ",
    )
    .bind(SubmissionStatus::Judged(result.verdict).as_str())
    .bind(result.time_ms as i64)
    .bind(result.memory_kb as i64)
    .bind(&result.infrastructure_fault)
    .bind(create_timestamp())
    .bind(id)
    .bind(SubmissionStatus::PENDING)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

/// Notes an infrastructure fault on a submission without touching its verdict
pub async fn save_fault(id: SubmissionId, reason: &str, pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query("UPDATE submissions SET infrastructure_fault = ? WHERE id = ?")
        .bind(reason)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Stores a runtime error with `reason` as the infrastructure fault for
/// every submission still `pending`.
///
/// Only safe while no worker is running: it is meant for submissions a
/// previous run of the judge left behind.
pub async fn sweep_pending(reason: &str, pool: &SqlitePool) -> sqlx::Result<u64> {
    let swept = sqlx::query(
        r"
        UPDATE submissions
        SET status = ?, infrastructure_fault = ?, judged_time = ?
        WHERE status = ?
        ",
    )
    .bind(Verdict::RuntimeError.as_str())
    .bind(reason)
    .bind(create_timestamp())
    .bind(SubmissionStatus::PENDING)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(swept)
}

/// The judging core's stores, backed by SQLite
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProblemStore for SqliteStore {
    async fn fetch_problem(&self, problem_id: i64) -> error::Result<Problem> {
        fetch_problem(problem_id, &self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => JudgeError::ProblemNotFound(problem_id),
                e => e.into(),
            })
    }
}

#[async_trait]
impl ResultSink for SqliteStore {
    async fn record_terminal(&self, id: SubmissionId, result: &TerminalResult) -> error::Result<bool> {
        if save_terminal(id, result, &self.pool).await? {
            return Ok(true);
        }
        if fetch_submission(id, &self.pool).await?.is_none() {
            return Err(JudgeError::SubmissionNotFound(id));
        }
        Ok(false)
    }

    async fn terminal_result(&self, id: SubmissionId) -> error::Result<Option<TerminalResult>> {
        fetch_submission(id, &self.pool)
            .await?
            .map(|record| record.terminal_result())
            .ok_or(JudgeError::SubmissionNotFound(id))
    }

    async fn record_fault(&self, id: SubmissionId, reason: &str) -> error::Result<()> {
        Ok(save_fault(id, reason, &self.pool).await?)
    }
}

#[async_trait]
impl ScoreStore for SqliteStore {
    async fn award_first_acceptance(&self, award: &Award) -> error::Result<ScoreUpdate> {
        Ok(award_first_acceptance(award, &self.pool).await?)
    }
}
