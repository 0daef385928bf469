use actix_web::{HttpResponse, Responder, get, post, web};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::{ErrorResponse, ErrorResponseWithMessage, external_error, not_found};
use crate::database::{self as db, NewSubmission, SubmissionFilter, SubmissionRecord};
use crate::model::SubmissionId;
use crate::scheduler::{JudgeScheduler, JudgeState};

#[derive(Deserialize, Debug)]
pub struct SubmitQuery {
    /// Block until the submission is judged
    #[serde(default)]
    pub wait: bool,
}

#[derive(Serialize, Debug)]
pub struct SubmissionResponse {
    pub submission: SubmissionRecord,
    /// Absent once the submission is no longer in flight
    pub judge: Option<JudgeState>,
}

#[post("/submissions")]
pub async fn post_submission_handler(
    pool: web::Data<SqlitePool>,
    scheduler: web::Data<JudgeScheduler>,
    query: web::Query<SubmitQuery>,
    body: web::Json<NewSubmission>,
) -> impl Responder {
    if let Some(response) = check_submission(&body, &pool).await {
        return response;
    }

    let record = match db::create_submission(&body, &pool).await {
        Ok(record) => {
            log::info!("Inserted submission {} into database", record.id);
            record
        }
        Err(e) => {
            log::error!("Failed to insert submission into database: {e}");
            return external_error();
        }
    };

    let handle = scheduler.submit(record.judge_request());
    if !query.wait {
        return HttpResponse::Ok().json(SubmissionResponse {
            judge: Some(handle.state()),
            submission: record,
        });
    }

    let outcome = handle.wait().await;
    log::info!("Received final result of blocking submission {}", record.id);

    match db::fetch_submission(record.id, &pool).await {
        Ok(Some(submission)) => HttpResponse::Ok().json(SubmissionResponse {
            submission,
            judge: Some(JudgeState::Done { outcome }),
        }),
        Ok(None) => not_found(format!("Submission {} not found.", record.id)),
        Err(e) => {
            log::error!("Failed to retrieve submission {}: {e}", record.id);
            external_error()
        }
    }
}

/// Validates the submitter, the problem and the contest scope
async fn check_submission(body: &NewSubmission, pool: &SqlitePool) -> Option<HttpResponse> {
    let checked = async {
        if !db::find_user(body.user_id, pool).await? {
            return Ok(Some(not_found(format!("User {} not found.", body.user_id))));
        }
        if !db::find_problem(body.problem_id, pool).await? {
            return Ok(Some(not_found(format!(
                "Problem {} not found.",
                body.problem_id
            ))));
        }

        let Some(contest_id) = body.contest_id else {
            return Ok(None);
        };
        let Some(contest) = db::fetch_contest(contest_id, pool).await? else {
            return Ok(Some(not_found(format!("Contest {contest_id} not found."))));
        };
        if !contest.is_active_at(Utc::now()) {
            return Ok(Some(HttpResponse::BadRequest().json(
                ErrorResponseWithMessage {
                    reason: "ERR_INVALID_STATE",
                    code: 2,
                    message: format!("Contest {contest_id} is not running."),
                },
            )));
        }
        if !db::is_participant(contest_id, body.user_id, pool).await? {
            return Ok(Some(HttpResponse::Forbidden().json(ErrorResponse {
                reason: "ERR_FORBIDDEN",
                code: 4,
            })));
        }

        Ok::<_, sqlx::Error>(None)
    };

    checked.await.unwrap_or_else(|e| {
        log::error!("Failed to validate submission: {e}");
        Some(external_error())
    })
}

#[get("/submissions/{id}")]
pub async fn get_submission_handler(
    pool: web::Data<SqlitePool>,
    scheduler: web::Data<JudgeScheduler>,
    path: web::Path<SubmissionId>,
) -> impl Responder {
    let id = path.into_inner();

    match db::fetch_submission(id, &pool).await {
        Ok(Some(submission)) => HttpResponse::Ok().json(SubmissionResponse {
            submission,
            judge: scheduler.state_of(id),
        }),
        Ok(None) => {
            log::info!("Got nothing with submission id {id} from database");
            not_found(format!("Submission {id} not found."))
        }
        Err(e) => {
            log::error!("Failed to retrieve submission {id} from database: {e}");
            external_error()
        }
    }
}

#[post("/submissions/{id}/cancel")]
pub async fn cancel_submission_handler(
    pool: web::Data<SqlitePool>,
    scheduler: web::Data<JudgeScheduler>,
    path: web::Path<SubmissionId>,
) -> impl Responder {
    let id = path.into_inner();

    if scheduler.cancel(id) {
        return HttpResponse::Ok().json(serde_json::json!({ "id": id, "cancelled": true }));
    }

    match db::fetch_submission(id, &pool).await {
        Ok(Some(_)) => HttpResponse::BadRequest().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_STATE",
            code: 2,
            message: format!("Submission {id} is not being judged."),
        }),
        Ok(None) => not_found(format!("Submission {id} not found.")),
        Err(e) => {
            log::error!("Failed to retrieve submission {id} from database: {e}");
            external_error()
        }
    }
}

/// Lists stored submissions, newest first
#[get("/submissions")]
pub async fn get_submissions_handler(
    pool: web::Data<SqlitePool>,
    query: web::Query<SubmissionFilter>,
) -> impl Responder {
    match db::fetch_submissions(&query, &pool).await {
        Ok(submissions) => {
            log::info!("Got {} submission(s) from database", submissions.len());
            HttpResponse::Ok().json(submissions)
        }
        Err(e) => {
            log::error!("Failed to list submissions: {e}");
            external_error()
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct BestQuery {
    pub user_id: i64,
}

/// The user's fastest accepted submission for a problem
#[get("/problems/{problem_id}/best_submission")]
pub async fn get_best_submission_handler(
    pool: web::Data<SqlitePool>,
    path: web::Path<i64>,
    query: web::Query<BestQuery>,
) -> impl Responder {
    let problem_id = path.into_inner();

    match db::fetch_best_submission(problem_id, query.user_id, &pool).await {
        Ok(Some(submission)) => HttpResponse::Ok().json(submission),
        Ok(None) => not_found(format!(
            "No accepted submission of user {} for problem {problem_id}.",
            query.user_id
        )),
        Err(e) => {
            log::error!("Failed to retrieve best submission for problem {problem_id}: {e}");
            external_error()
        }
    }
}
