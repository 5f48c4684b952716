use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, test, web};
use assert_json_diff::assert_json_include;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use codemash::config::EngineConfig;
use codemash::mash::LatestSource;
use codemash::scheduler::Scheduler;
use codemash::web_server::configure;

// Starts the engine; the workers stop when the token is cancelled or the
// join set is dropped
fn start_engine(slots: usize) -> (Arc<Scheduler>, CancellationToken, JoinSet<anyhow::Result<()>>) {
    start_engine_with(EngineConfig {
        slots,
        ..EngineConfig::default()
    })
}

fn start_engine_with(
    config: EngineConfig,
) -> (Arc<Scheduler>, CancellationToken, JoinSet<anyhow::Result<()>>) {
    let token = CancellationToken::new();
    let (scheduler, workers) = Scheduler::start(config, token.clone());
    (scheduler, token, workers)
}

fn units(text: &str) -> serde_json::Value {
    json!([{ "name": "Main", "text": text, "entryPoint": true }])
}

#[actix_web::test]
async fn test_post_session_blocking_success() {
    let (scheduler, token, _workers) = start_engine(1);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(scheduler))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/sessions?wait=true")
        .set_json(json!({ "units": units("fn main() { println(\"hi\"); return 42; }"), "deadlineMs": 1000 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert!(body["id"].is_number());
    assert!(body["createdTime"].is_string());
    assert_json_include!(
        actual: body,
        expected: json!({
            "state": "completed",
            "verdict": { "kind": "success", "value": 42, "stdout": "hi\n", "stderr": "" }
        })
    );
    token.cancel();
}

#[actix_web::test]
async fn test_blocking_post_survives_eviction() {
    let (scheduler, token, _workers) = start_engine_with(EngineConfig {
        slots: 1,
        retained_sessions: 0,
        ..EngineConfig::default()
    });
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(scheduler))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/sessions?wait=true")
        .set_json(json!({ "units": units("fn main() { return 7; }") }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_json_include!(
        actual: body.clone(),
        expected: json!({ "state": "completed", "verdict": { "kind": "success", "value": 7 } })
    );

    // already evicted from the registry
    let id = body["id"].as_u64().unwrap();
    let req = test::TestRequest::get()
        .uri(&format!("/sessions/{id}"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
    token.cancel();
}

#[actix_web::test]
async fn test_post_session_nonblocking_then_verdict() {
    let (scheduler, token, _workers) = start_engine(1);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(scheduler))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/sessions")
        .set_json(json!({ "units": units("fn main() {\n  return 1 +;\n}") }))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    let id = body["id"].as_u64().unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/sessions/{id}/verdict"))
        .to_request();
    let verdict: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(verdict["kind"], "compileFailure");
    assert_json_include!(
        actual: verdict["diagnostics"][0].clone(),
        expected: json!({ "unit": "Main", "line": 2, "severity": "error" })
    );

    let req = test::TestRequest::get()
        .uri(&format!("/sessions/{id}"))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["state"], "completed");
    assert_eq!(body["verdict"]["kind"], "compileFailure");
    token.cancel();
}

#[actix_web::test]
async fn test_invalid_submissions() {
    let (scheduler, token, _workers) = start_engine(1);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(scheduler))
            .configure(configure),
    )
    .await;

    // malformed body
    let req = test::TestRequest::post()
        .uri("/sessions")
        .set_json(json!({ "code": "fn main() {}" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["reason"], "ERR_INVALID_ARGUMENT");
    assert_eq!(body["code"], 1);

    // well-formed but without an entry point
    let req = test::TestRequest::post()
        .uri("/sessions")
        .set_json(json!({ "units": [{ "name": "Lib", "text": "" }] }))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_json_include!(
        actual: body,
        expected: json!({
            "state": "rejected",
            "verdict": { "kind": "rejected", "reason": "no source unit is marked as entry point" }
        })
    );
    token.cancel();
}

#[actix_web::test]
async fn test_unknown_session_is_not_found() {
    let (scheduler, token, _workers) = start_engine(1);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(scheduler))
            .configure(configure),
    )
    .await;

    for req in [
        test::TestRequest::get().uri("/sessions/404").to_request(),
        test::TestRequest::get().uri("/sessions/404/verdict").to_request(),
        test::TestRequest::delete().uri("/sessions/404").to_request(),
    ] {
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_json_include!(
            actual: body,
            expected: json!({ "reason": "ERR_NOT_FOUND", "code": 3, "message": "Session 404 not found." })
        );
    }
    token.cancel();
}

#[actix_web::test]
async fn test_delete_running_session() {
    let (scheduler, token, _workers) = start_engine(1);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(scheduler.clone()))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/sessions")
        .set_json(json!({ "units": units("fn main() { while true { } }"), "deadlineMs": 30000 }))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    let id = body["id"].as_u64().unwrap();

    while scheduler.stats().active == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let req = test::TestRequest::delete()
        .uri(&format!("/sessions/{id}"))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({ "cancelled": true }));

    let req = test::TestRequest::get()
        .uri(&format!("/sessions/{id}/verdict"))
        .to_request();
    let verdict: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(verdict, json!({ "kind": "cancelled" }));
    token.cancel();
}

#[actix_web::test]
async fn test_mash_and_stats() {
    let (scheduler, token, _workers) = start_engine(1);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(scheduler))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/mash")
        .set_json(json!({
            "units": [
                { "name": "util", "text": "fn twice(x) { return x * 2; }" },
                { "name": "main", "text": "fn main() { return twice(21); }" }
            ],
            "main": "main"
        }))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["compiles"], true);
    assert_eq!(body["diagnostics"], json!([]));
    let source = body["source"].as_str().unwrap();
    assert!(source.find("fn main()").unwrap() < source.find("// unit: util").unwrap());

    let req = test::TestRequest::post()
        .uri("/mash")
        .set_json(json!({ "units": [], "main": "main" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::get().uri("/stats").to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(
        body,
        json!({
            "queued": 0,
            "active": 0,
            "peakActive": 0,
            "compilations": 0,
            "executions": 0,
            "completed": 0
        })
    );
    token.cancel();
}

#[actix_web::test]
async fn test_latest_mash_source() {
    let (scheduler, token, _workers) = start_engine(1);
    let latest = Arc::new(LatestSource::default());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(scheduler))
            .app_data(web::Data::from(latest.clone()))
            .configure(configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/mash/latest").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(test::read_body(resp).await, "// No code :(\n");

    latest.publish("fn main() { }\n".to_string());
    let req = test::TestRequest::get().uri("/mash/latest").to_request();
    assert_eq!(test::call_and_read_body(&app, req).await, "fn main() { }\n");
    token.cancel();
}
