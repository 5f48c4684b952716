use actix_web::{HttpResponse, Responder, delete, get, post, web};
use serde::{Deserialize, Serialize};

use super::engine_error_response;
use crate::scheduler::Scheduler;
use crate::session::{Session, SessionId, SessionState, Submission};
use crate::verdict::Verdict;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: SessionId,
    pub state: SessionState,
    pub created_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id(),
            state: session.state(),
            created_time: session.created_at().to_string(),
            verdict: session.verdict().cloned(),
        }
    }
}

#[derive(Deserialize)]
pub struct SubmitQueryParams {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[post("/sessions")]
pub async fn post_session_handler(
    scheduler: web::Data<Scheduler>,
    query: web::Query<SubmitQueryParams>,
    body: web::Json<Submission>,
) -> impl Responder {
    let session = scheduler.admit(body.into_inner());
    log::debug!("Session {} submitted over HTTP", session.id());

    if query.wait {
        session.finished().await;
    }
    HttpResponse::Ok().json(SessionView::from(session.as_ref()))
}

#[get("/sessions/{id}")]
pub async fn get_session_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u64,)>,
) -> impl Responder {
    let id = SessionId(path.into_inner().0);
    match scheduler.session(id) {
        Ok(session) => HttpResponse::Ok().json(SessionView::from(session.as_ref())),
        Err(e) => engine_error_response(e),
    }
}

#[get("/sessions/{id}/verdict")]
pub async fn get_verdict_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u64,)>,
) -> impl Responder {
    let id = SessionId(path.into_inner().0);
    match scheduler.await_result(id).await {
        Ok(verdict) => HttpResponse::Ok().json(verdict),
        Err(e) => engine_error_response(e),
    }
}

#[delete("/sessions/{id}")]
pub async fn delete_session_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u64,)>,
) -> impl Responder {
    let id = SessionId(path.into_inner().0);
    match scheduler.cancel(id).await {
        Ok(cancelled) => {
            log::info!("Cancel request for session {id}: cancelled = {cancelled}");
            HttpResponse::Ok().json(CancelResponse { cancelled })
        }
        Err(e) => engine_error_response(e),
    }
}
