use std::process::ExitCode;
use std::sync::Arc;

use cache_ingest::config::{Args, Config};
use cache_ingest::service::CacheIngestService;
use clap::Parser;
use common_broker::AmqpPublisher;
use common_kv::RedisKv;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

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
        Ok(config) => Arc::new(config),
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

    let kv = Arc::new(RedisKv::new(
        &config.redis_host,
        config.redis_port,
        config.redis_db_index,
    ));
    let publisher = Arc::new(AmqpPublisher::new(config.broker_config()));
    let service = CacheIngestService::new(config.clone(), kv, publisher);

    if let Err(err) = service.start().await {
        error!("start failed: {err}");
        return ExitCode::FAILURE;
    }
    info!("cache-ingest is running, send SIGINT or SIGTERM to stop");

    shutdown_signal().await;
    info!("stop requested");
    service.stop().await;
    service.wait_stop().await;
    info!("cache-ingest stopped");
    ExitCode::SUCCESS
}
