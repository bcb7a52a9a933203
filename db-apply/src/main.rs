use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use common_broker::AmqpConsumer;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use db_apply::config::{Args, Config};
use db_apply::database::{Database, PgDatabase};
use db_apply::executor::DbJobExecutor;
use db_apply::service::DbApplyService;

fn setup_tracing(config: &Config) {
    let console_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(config.console_level().into())
            .from_env_lossy(),
    );

    let file_layer = if config.file_level() == LevelFilter::OFF {
        None
    } else {
        let directory = if config.log_root_path.is_empty() {
            ".".to_string()
        } else {
            config.log_root_path.clone()
        };
        let path = format!("{}/{}.log", directory, config.service_title);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap_or_else(|err| panic!("failed to open log file {path}: {err}"));
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_filter(config.file_level()),
        )
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
}

async fn shutdown_signal() {
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    setup_tracing(&config);
    info!(service = %config.service_title, "starting");
    debug!(
        write_interval_ms = config.write_interval,
        "log writer settings loaded"
    );

    let database = match PgDatabase::connect(&config.postgres_conn, config.max_pg_connections).await
    {
        Ok(database) => database,
        Err(err) => {
            error!("database connection failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = database.execute_command("SELECT 1;").await {
        error!("database connectivity check failed: {err}");
        return ExitCode::FAILURE;
    }

    let executor = Arc::new(DbJobExecutor::new(
        Arc::new(database),
        config.allowed_ops.clone(),
        config.allowed_tables.clone(),
    ));
    let consumer = Arc::new(AmqpConsumer::new(config.broker_config()));
    let service = DbApplyService::new(
        consumer,
        executor,
        config.consume_queue_name.clone(),
        config.requeue_on_failure,
        config.queue_policies(),
    );

    if let Err(err) = service.start().await {
        error!("consumer start failed: {err}");
        return ExitCode::FAILURE;
    }
    info!("db-apply is running, send SIGINT or SIGTERM to stop");

    let mut exit = ExitCode::SUCCESS;
    tokio::select! {
        _ = shutdown_signal() => info!("stop requested"),
        _ = service.wait_stop() => {
            warn!("consumer stopped on its own");
            exit = ExitCode::FAILURE;
        }
    }

    service.stop().await;
    service.wait_stop().await;
    info!("db-apply stopped");
    exit
}
