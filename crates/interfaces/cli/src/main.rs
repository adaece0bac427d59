use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use coachkb_config::AppConfig;
use coachkb_core::KnowledgeBase;
use coachkb_credit::CreditLedger;
use coachkb_engine::{MockEngine, UserContext};
use coachkb_idempotency::IdempotencyState;
use coachkb_orchestrator::{Notifier, TaskOrchestrator};
use tracing_subscriber::EnvFilter;

/// Serves the knowledge base's HTTP surface (spec §6.2): refresh, per-profile
/// cleanup/sync, and prune, backed by an in-memory engine stand-in.
///
/// Wiring a production deployment against the real vector+graph engine and a
/// real Google Drive client is out of scope here (spec §6.3, §4.H Non-goals)
/// — this binary is the composition root for everything this workspace does
/// implement.
#[derive(Debug, Parser)]
#[command(name = "coachkb", version, about = "Knowledge base service")]
struct Cli {
    /// TOML config file; falls back to defaults plus environment overrides
    /// (spec §6.6) when absent.
    #[arg(long, default_value = "config/default.toml")]
    config: String,

    /// Address the HTTP surface listens on.
    #[arg(long, default_value = "0.0.0.0:8081")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let redis_client = redis::Client::open(config.redis.url.clone()).context("invalid redis url")?;
    let redis_conn = redis_client.get_connection_manager().await.context("connecting to redis")?;

    let idem = IdempotencyState::new(redis_conn.clone(), Duration::from_secs(config.task.ai_qa_dedup_ttl_s));
    let credit = if config.profile_api.base_url.is_empty() {
        None
    } else {
        Some(CreditLedger::new(
            &config.profile_api,
            config.task.ai_qa_max_retries,
            Duration::from_secs_f64(config.task.ai_qa_retry_backoff_s),
        )?)
    };
    let notifier = Notifier::new(&config.bot_callback, &config.internal_auth, config.task.ai_qa_max_retries)?;
    let orchestrator = TaskOrchestrator::new(
        idem,
        credit,
        notifier,
        config.task.ai_qa_max_retries,
        Duration::from_secs_f64(config.task.ai_qa_retry_backoff_s),
    );

    let engine = Arc::new(MockEngine::new());
    let system_user = UserContext("system".to_string());
    let kb = KnowledgeBase::new(config.clone(), engine, redis_conn, orchestrator, system_user);

    let router = coachkb_api::build_router(kb, &config);
    let listener = tokio::net::TcpListener::bind(&cli.bind).await.with_context(|| format!("binding {}", cli.bind))?;
    tracing::info!(addr = %cli.bind, "coachkb_cli.listening");
    axum::serve(listener, router).await?;
    Ok(())
}
