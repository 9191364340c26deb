mod engine;
mod notifier;
mod problem;
mod router;
mod scheduler;
mod service;
mod telemetry;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use domwatch_storage::{BookmarkStore, Database, HistoryStore, SubscriptionStore};
use domwatch_upstream::{HttpStatusChecker, LookupClient, StatusChecker, TelegramClient};
use domwatch_util::{load_env_file, AppConfig};

use crate::engine::SubscriptionEngine;
use crate::notifier::{LogNotifier, Notifier, TelegramNotifier};
use crate::scheduler::{parse_timezone, Schedule, Scheduler};
use crate::service::SubscriptionService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    let store: Arc<dyn SubscriptionStore> = Arc::new(database.subscriptions());
    let history: Arc<dyn HistoryStore> = Arc::new(database.history());
    let bookmarks: Arc<dyn BookmarkStore> = Arc::new(database.bookmarks());

    let user_agent = concat!("domwatch/", env!("CARGO_PKG_VERSION"));
    let http = reqwest::Client::builder().user_agent(user_agent).build()?;
    let lookup = LookupClient::new(Url::parse(&config.lookup_base_url)?, http);
    let checker: Arc<dyn StatusChecker> =
        Arc::new(HttpStatusChecker::new(lookup, config.lookup_timeout));

    let timezone = parse_timezone(&config.monitor.timezone)?;
    let notifier: Arc<dyn Notifier> = match &config.telegram_bot_token {
        Some(token) => {
            let http = reqwest::Client::builder()
                .user_agent(user_agent)
                .timeout(config.telegram_timeout)
                .build()?;
            let client =
                TelegramClient::new(token.clone(), Url::parse(&config.telegram_api_base)?, http);
            Arc::new(TelegramNotifier::new(client, timezone))
        }
        None => {
            info!(stage = "app", "TELEGRAM_BOT_TOKEN not set; notifications go to the log");
            Arc::new(LogNotifier::new(timezone))
        }
    };

    let engine = SubscriptionEngine::new(store.clone(), checker.clone(), notifier)
        .with_concurrency(config.monitor.concurrency)
        .with_spacing(config.monitor.spacing)
        .with_delivery_timeout(config.telegram_timeout)
        .with_history(history.clone());
    let schedule = Schedule::from_config(&config.monitor)?;
    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(engine, schedule, shutdown.clone());
    let scheduler_task = scheduler.clone().spawn();
    info!(stage = "scheduler", schedule = ?scheduler.schedule(), "monitoring scheduler started");

    let service = SubscriptionService::new(
        store,
        history,
        bookmarks,
        checker,
        config.subscription_limit,
    );
    let state = router::AppState::new(metrics, scheduler.clone(), service);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal_token = shutdown.clone();
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!(stage = "app", "shutdown requested");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    scheduler_task.await?;
    scheduler.wait_idle().await;
    database.close().await;
    info!(stage = "app", "shutdown complete");
    Ok(())
}
