use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use gradebox::config::CliArgs;
use gradebox::database::{self as db, SqliteStore, SubmissionStore};
use gradebox::engine::Engine;
use gradebox::sandbox::{create_backend, default_work_root};
use gradebox::worker::{drain, poller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    let db_path = match &config.database.path {
        Some(path) => path.clone(),
        None => db::get_db_path()?,
    };
    if cli.flush_data {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;
    let store: Arc<dyn SubmissionStore> = Arc::new(SqliteStore::new(db_pool));

    let backend = create_backend(&config.backend, config.engine.max_concurrency)
        .context("Failed to create sandbox backend")?;
    let engine = Engine::start(&config, backend, Arc::clone(&store), default_work_root("workspaces")?)?;

    // ======= PREPARATION END, EXECUTION START =======

    if cli.once {
        let graded = tokio::select! {
            graded = drain(&engine, &store) => graded?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-c received, shutting down...");
                0
            }
        };
        engine.shutdown().await;
        log::info!("Graded {graded} submission(s)");
        return Ok(());
    }

    let shutdown_token = CancellationToken::new();
    let mut poll_task = tokio::spawn(poller(
        engine.clone(),
        Arc::clone(&store),
        Duration::from_millis(config.engine.poll_interval_ms),
        shutdown_token.clone(),
    ));

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    let poller_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
            None
        }
        res_poller = &mut poll_task => {
            log::error!("Poller terminated unexpectedly: {res_poller:?}");
            Some(res_poller)
        }
    };

    // 1. Stop feeding new submissions
    shutdown_token.cancel();
    if poller_result.is_none() {
        match poll_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Poller finished with error: {e:?}"),
            Err(e) => log::error!("Poller handle panicked: {e:?}"),
        }
    }

    // 2. Cancel in-flight gradings and wait for their sandboxes to go away
    engine.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}
