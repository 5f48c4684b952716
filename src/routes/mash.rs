use actix_web::http::header::{CacheControl, CacheDirective};
use actix_web::{HttpResponse, Responder, get, post, web};
use serde::Deserialize;

use super::ErrorResponseWithMessage;
use crate::compiler::CompileError;
use crate::mash::{LatestSource, NO_SOURCE};
use crate::scheduler::Scheduler;
use crate::source::SourceUnit;

#[derive(Deserialize, Debug)]
pub struct MashRequest {
    pub units: Vec<SourceUnit>,
    /// Name of the entry unit; overrides the flags on `units`
    pub main: Option<String>,
}

#[post("/mash")]
pub async fn post_mash_handler(
    scheduler: web::Data<Scheduler>,
    body: web::Json<MashRequest>,
) -> impl Responder {
    let MashRequest { mut units, main } = body.into_inner();
    if let Some(main) = main {
        for unit in &mut units {
            unit.entry_point = unit.name == main;
        }
    }

    match scheduler.masher().mash(units).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(CompileError::Invalid(e)) => HttpResponse::BadRequest().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
            message: e.to_string(),
        }),
        Err(e) => {
            log::warn!("Mash request failed: {e}");
            HttpResponse::InternalServerError().json(ErrorResponseWithMessage {
                reason: "ERR_INTERNAL",
                code: 6,
                message: e.to_string(),
            })
        }
    }
}

/// The last coalesced source of the watched directory that compiled
#[get("/mash/latest")]
pub async fn get_latest_mash_handler(latest: web::Data<LatestSource>) -> impl Responder {
    let source = latest.get().unwrap_or_else(|| NO_SOURCE.to_string());
    HttpResponse::Ok()
        .insert_header(CacheControl(vec![CacheDirective::NoCache]))
        .content_type("text/plain; charset=utf-8")
        .body(source)
}
