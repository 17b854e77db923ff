use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, PayloadConfig},
    App, HttpServer,
};
use config::Config;
use edge::{RateLimit, RateLimiter};
use service::Service;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod broker;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod db;
pub mod edge;
pub mod error;
pub mod message;
pub mod queue;
pub mod service;
pub mod utils;

/// Returns a builder for the main application. Without an explicit `config`, the
/// configuration is read from `SLUICE_*` environment variables.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SLUICE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SLUICE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let service = Arc::new(Service::connect().config(config).call().await?);
    let config = service.config().clone();

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit,
        config.rate_limit_window(),
    ));

    let shutdown = CancellationToken::new();
    let mut workers = service.spawn_workers(Some(limiter.clone()), shutdown.clone())?;

    let data = Data::from(service.clone());
    let clock = service.clock().clone();
    let max_body_bytes = config.max_body_bytes;
    let admin_api = config.admin_api;
    let trust_forwarded_for = config.trust_forwarded_for;

    tracing::info!(
        host = %config.host,
        port = config.port,
        channels = ?config.channels,
        backend = %config.backend,
        admin_api,
        "Starting server"
    );

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_header()
            .allow_any_method();

        App::new()
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(
                RateLimit::new(limiter.clone())
                    .with_clock(clock.clone())
                    .trust_forwarded(trust_forwarded_for),
            )
            .wrap(cors)
            .wrap(TracingLogger::default())
            .app_data(data.clone())
            .app_data(PayloadConfig::new(max_body_bytes))
            .configure(|cfg| api::configure(cfg, admin_api))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    shutdown.cancel();
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            tracing::error!("Worker task failed: {e}");
        }
    }

    server?;

    Ok(())
}
