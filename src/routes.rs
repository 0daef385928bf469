mod contests;
mod submissions;

pub use contests::*;
pub use submissions::*;

use actix_web::HttpRequest;
use actix_web::HttpResponse;
use actix_web::error::{InternalError, JsonPayloadError, PathError, QueryPayloadError};
use serde::Serialize;

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

fn invalid_argument() -> ErrorResponse {
    ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    }
}

fn not_found(message: String) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponseWithMessage {
        reason: "ERR_NOT_FOUND",
        code: 3,
        message,
    })
}

fn external_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(ErrorResponse {
        reason: "ERR_EXTERNAL",
        code: 5,
    })
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(invalid_argument());
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(invalid_argument());
    InternalError::from_response(err, response).into()
}

pub fn path_error_handler(err: PathError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(invalid_argument());
    InternalError::from_response(err, response).into()
}
