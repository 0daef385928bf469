use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::ServerConfig;
use crate::routes::{
    cancel_contest_handler, cancel_submission_handler, get_best_submission_handler,
    get_contest_stats_handler, get_contest_status_handler, get_scores_handler,
    get_submission_handler, get_submissions_handler, json_error_handler, path_error_handler,
    post_submission_handler, query_error_handler,
};
use crate::scheduler::JudgeScheduler;

/// Registers the HTTP routes and their shared state
pub fn configure_app(
    cfg: &mut web::ServiceConfig,
    db_pool: web::Data<SqlitePool>,
    scheduler: web::Data<JudgeScheduler>,
) {
    cfg.app_data(db_pool)
        .app_data(scheduler)
        .app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .app_data(web::PathConfig::default().error_handler(path_error_handler))
        .service(post_submission_handler)
        .service(get_submissions_handler)
        .service(get_submission_handler)
        .service(cancel_submission_handler)
        .service(get_best_submission_handler)
        .service(cancel_contest_handler)
        .service(get_scores_handler)
        .service(get_contest_stats_handler)
        .service(get_contest_status_handler);
}

pub fn build_server(
    server_config: ServerConfig,
    db_pool: SqlitePool,
    scheduler: Arc<JudgeScheduler>,
) -> std::io::Result<Server> {
    let db_pool = web::Data::new(db_pool);
    let scheduler = web::Data::from(scheduler);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .configure(|cfg| configure_app(cfg, db_pool.clone(), scheduler.clone()))
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
