use std::sync::Arc;

use clap::Parser;

use arbiter::config::{CliArgs, Config, LanguageTable};
use arbiter::database::{self as db, SqliteStore};
use arbiter::judge::JudgeContext;
use arbiter::sandbox::create_sandbox_runner;
use arbiter::scheduler::{JudgeScheduler, JudgeServices};
use arbiter::scoring::ScoringApplier;
use arbiter::web_server::build_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        database: database_config,
        judge: judge_config,
        languages,
    } = cli.to_config().expect("Failed to load configuration");

    let db_path = match database_config.path {
        Some(path) => path,
        None => db::get_db_path().expect("Failed to resolve database path"),
    };
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = db::init_db(&db_path)
        .await
        .expect("Failed to initialize database");

    // No worker exists yet, so anything pending was abandoned by an earlier run
    let swept = db::sweep_pending(db::ABANDONED_REASON, &db_pool)
        .await
        .expect("Failed to sweep pending submissions");
    if swept > 0 {
        log::warn!("Stored {swept} abandoned pending submission(s) as runtime errors");
    }

    let n_workers = judge_config.workers;
    let runners = (1..=n_workers)
        .map(|i| {
            let id = u8::try_from(i).expect("At most 255 judge workers are supported");
            create_sandbox_runner(id, &judge_config)
        })
        .collect::<anyhow::Result<Vec<_>>>()
        .expect("Failed to create sandbox runners");

    let context = JudgeContext::new(judge_config, LanguageTable::with_overrides(languages))
        .expect("Failed to prepare judge context");

    let store = Arc::new(SqliteStore::new(db_pool.clone()));
    let services = JudgeServices {
        context: Arc::new(context),
        problems: store.clone(),
        results: store.clone(),
        scoring: ScoringApplier::new(store),
    };

    // ======= PREPARATION END, EXECUTION START =======

    let scheduler = JudgeScheduler::start(services, runners);

    let server = build_server(server_config, db_pool, scheduler.clone())
        .expect("Failed to build server");

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Cancel in-flight judging and wait until every worker terminates
    scheduler.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}
