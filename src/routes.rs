mod mash;
mod sessions;

pub use mash::{get_latest_mash_handler, post_mash_handler};
pub use sessions::*;

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, get, web};
use serde::Serialize;

use crate::scheduler::{EngineError, Scheduler};

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

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponseWithMessage {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
        message: err.to_string(),
    });
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

fn engine_error_response(err: EngineError) -> HttpResponse {
    match err {
        EngineError::UnknownSession(id) => HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: format!("Session {id} not found."),
        }),
        EngineError::MissingVerdict(_) => HttpResponse::InternalServerError().json(ErrorResponse {
            reason: "ERR_INTERNAL",
            code: 6,
        }),
    }
}

#[get("/stats")]
pub async fn get_stats_handler(scheduler: web::Data<Scheduler>) -> impl Responder {
    HttpResponse::Ok().json(scheduler.stats())
}
