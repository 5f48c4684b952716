use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::mash::LatestSource;
use crate::routes::{
    delete_session_handler, get_latest_mash_handler, get_session_handler, get_stats_handler,
    get_verdict_handler, json_error_handler, post_mash_handler, post_session_handler,
    query_error_handler,
};
use crate::scheduler::Scheduler;

/// Registers every route and the payload error handlers
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .service(post_session_handler)
        .service(get_verdict_handler)
        .service(get_session_handler)
        .service(delete_session_handler)
        .service(post_mash_handler)
        .service(get_latest_mash_handler)
        .service(get_stats_handler);
}

pub fn build_server(
    server_config: ServerConfig,
    scheduler: Arc<Scheduler>,
    latest: Arc<LatestSource>,
) -> std::io::Result<Server> {
    let scheduler = web::Data::from(scheduler);
    let latest = web::Data::from(latest);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(scheduler.clone())
            .app_data(latest.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
