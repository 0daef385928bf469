use actix_web::{HttpResponse, Responder, get, post, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::{external_error, not_found};
use crate::database::{self as db, Contest, ContestPhase};
use crate::scheduler::JudgeScheduler;

/// Ends judging for a contest: every queued or running submission is cancelled
#[post("/contests/{contest_id}/cancel")]
pub async fn cancel_contest_handler(
    pool: web::Data<SqlitePool>,
    scheduler: web::Data<JudgeScheduler>,
    path: web::Path<i64>,
) -> impl Responder {
    let contest_id = path.into_inner();

    match db::fetch_contest(contest_id, &pool).await {
        Ok(Some(_)) => {
            let cancelled = scheduler.cancel_contest(contest_id);
            log::info!("Cancelled {cancelled} submission(s) of contest {contest_id}");
            HttpResponse::Ok().json(serde_json::json!({
                "contest_id": contest_id,
                "cancelled": cancelled,
            }))
        }
        Ok(None) => not_found(format!("Contest {contest_id} not found.")),
        Err(e) => {
            log::error!("Failed to retrieve contest {contest_id}: {e}");
            external_error()
        }
    }
}

#[get("/contests/{contest_id}/scores")]
pub async fn get_scores_handler(
    pool: web::Data<SqlitePool>,
    path: web::Path<i64>,
) -> impl Responder {
    let contest_id = path.into_inner();
    if let Err(response) = contest_or_response(contest_id, &pool).await {
        return response;
    }

    match db::fetch_scores(contest_id, &pool).await {
        Ok(scores) => {
            log::info!("Got {} score(s) of contest {contest_id}", scores.len());
            HttpResponse::Ok().json(scores)
        }
        Err(e) => {
            log::error!("Failed to retrieve scores of contest {contest_id}: {e}");
            external_error()
        }
    }
}

async fn contest_or_response(contest_id: i64, pool: &SqlitePool) -> Result<Contest, HttpResponse> {
    match db::fetch_contest(contest_id, pool).await {
        Ok(Some(contest)) => Ok(contest),
        Ok(None) => Err(not_found(format!("Contest {contest_id} not found."))),
        Err(e) => {
            log::error!("Failed to retrieve contest {contest_id}: {e}");
            Err(external_error())
        }
    }
}

#[get("/contests/{contest_id}/stats")]
pub async fn get_contest_stats_handler(
    pool: web::Data<SqlitePool>,
    path: web::Path<i64>,
) -> impl Responder {
    let contest_id = path.into_inner();
    if let Err(response) = contest_or_response(contest_id, &pool).await {
        return response;
    }

    match db::fetch_contest_stats(contest_id, &pool).await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => {
            log::error!("Failed to compute stats of contest {contest_id}: {e}");
            external_error()
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct ContestStatusQuery {
    pub user_id: i64,
}

#[derive(Serialize, Debug)]
pub struct ContestStatusResponse {
    pub contest_id: i64,
    pub status: ContestPhase,
    pub is_registered: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Only set while the contest is ongoing
    pub seconds_remaining: Option<i64>,
}

#[get("/contests/{contest_id}/status")]
pub async fn get_contest_status_handler(
    pool: web::Data<SqlitePool>,
    path: web::Path<i64>,
    query: web::Query<ContestStatusQuery>,
) -> impl Responder {
    let contest_id = path.into_inner();
    let contest = match contest_or_response(contest_id, &pool).await {
        Ok(contest) => contest,
        Err(response) => return response,
    };

    let is_registered = match db::is_participant(contest_id, query.user_id, &pool).await {
        Ok(registered) => registered,
        Err(e) => {
            log::error!("Failed to check registration in contest {contest_id}: {e}");
            return external_error();
        }
    };

    let now = Utc::now();
    let status = contest.phase_at(now);
    HttpResponse::Ok().json(ContestStatusResponse {
        contest_id,
        status,
        is_registered,
        start_time: contest.start_time,
        end_time: contest.end_time,
        seconds_remaining: (status == ContestPhase::Ongoing)
            .then(|| (contest.end_time - now).num_seconds()),
    })
}
