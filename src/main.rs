//! Reviewer roulette — GitLab review orchestration service.
//!
//! Reacts to merge-request webhooks, draws reviewers on `/roulette`,
//! tracks each review's lifecycle, aggregates engagement metrics daily,
//! and awards gamification badges.

mod cache;
mod config;
mod db;
mod events;
mod metrics;
mod migrations;
mod models;
mod routes;
mod schema;
mod services;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::{AppConfig, TeamsFile};
use crate::services::gitlab::HttpGitLabClient;
use crate::services::notifier::ChatClient;

#[derive(Parser)]
#[command(name = "reviewer-roulette", about = "GitLab reviewer roulette service")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "PORT", default_value = "8080")]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and scheduler (default)
    Serve,
    /// Reconcile configured team rosters into the user table
    Init,
    /// Run the metrics aggregator for one date (backfill)
    Aggregate {
        /// Target date, YYYY-MM-DD
        #[arg(long)]
        date: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let app_config = AppConfig::from_env();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.port, app_config).await,
        Command::Init => init_rosters(app_config).await,
        Command::Aggregate { date } => aggregate(app_config, &date).await,
    }
}

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn serve(port: u16, app_config: AppConfig) -> anyhow::Result<()> {
    tracing::info!("Starting reviewer roulette server...");

    let pool = db::connect(&app_config.database_url, app_config.db_pool_size).await?;

    {
        let mut conn = pool.get().await.map_err(|e| anyhow::anyhow!("pool: {e}"))?;
        tracing::info!("Running database migrations...");
        migrations::run_migrations(&mut conn).await?;
        tracing::info!("Database migrations completed.");
    }

    let cache = cache::Cache::connect(&app_config.redis_url).await?;

    let gitlab = Arc::new(HttpGitLabClient::new(
        &app_config.gitlab.url,
        &app_config.gitlab.token,
    ));
    let notifier = Arc::new(ChatClient::new(&app_config.chat));

    // Observability scrape endpoint lives on its own port.
    metrics::init_metrics(app_config.metrics_port);

    services::scheduler::spawn(
        pool.clone(),
        cache.clone(),
        notifier.clone(),
        &app_config.scheduler,
    )?;

    let state = routes::AppState {
        pool,
        cache,
        gitlab,
        notifier,
        config: app_config,
    };
    let app = routes::app_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Reviewer roulette listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn init_rosters(app_config: AppConfig) -> anyhow::Result<()> {
    let roster = TeamsFile::load(&app_config.teams_file)?;
    let pool = db::connect(&app_config.database_url, 2).await?;
    let mut conn = pool.get().await.map_err(|e| anyhow::anyhow!("pool: {e}"))?;

    migrations::run_migrations(&mut conn).await?;
    let synced = services::user_service::reconcile_rosters(&mut conn, &roster.teams).await?;
    tracing::info!(users = synced, "Init complete");
    Ok(())
}

async fn aggregate(app_config: AppConfig, date: &str) -> anyhow::Result<()> {
    let date = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("invalid date {date:?}: {e}"))?;
    let tz: chrono_tz::Tz = app_config
        .scheduler
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid timezone: {e}"))?;

    let pool = db::connect(&app_config.database_url, 2).await?;
    let mut conn = pool.get().await.map_err(|e| anyhow::anyhow!("pool: {e}"))?;

    let outcome = services::aggregator::run_for_date(&mut conn, tz, date).await?;
    if !outcome.succeeded() {
        anyhow::bail!("aggregation finished with {} failures", outcome.failures);
    }
    tracing::info!(
        team_rows = outcome.team_rows,
        user_rows = outcome.user_rows,
        "Aggregation complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
