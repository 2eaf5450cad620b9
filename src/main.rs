//! Escrow Desk service
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────────┐    ┌──────────────┐
//! │  Config  │───▶│   Ledger    │───▶│  Coordinator │───▶│ Notification │
//! │  (YAML)  │    │ (gateway +  │    │ (orders and  │    │  dispatcher  │
//! └──────────┘    │  escrow db) │    │   trades)    │    └──────────────┘
//!                 └─────────────┘    └──────────────┘
//!                                           ▲
//!                                    ┌──────┴──────┐
//!                                    │   Reaper    │
//!                                    └─────────────┘
//! ```
//!
//! This binary wires the components, runs the background tasks and shuts them
//! down on Ctrl-C. It serves no requests itself: an embedding server builds the
//! same wiring and hands the `TradeCoordinator` to its request handlers.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use escrow_desk::config::AppConfig;
use escrow_desk::escrow::EscrowLedger;
use escrow_desk::funding::{HttpTransferGateway, TransferGateway};
use escrow_desk::notify::{LoggingNotifier, NotificationDispatcher, notification_channel};
use escrow_desk::persistence::{MemoryStore, PgStore, Repositories};
use escrow_desk::shutdown::ShutdownSignal;
use escrow_desk::trade::{TradeCoordinator, TradeReaper};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Repositories> {
    match &config.postgres_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store
                .init_schema()
                .await
                .context("Failed to initialize schema")?;
            info!("PostgreSQL connected and schema initialized");
            Ok(Repositories::from_store(Arc::new(store)))
        }
        None => {
            warn!("No postgres_url configured, records are kept in memory only");
            Ok(Repositories::from_store(Arc::new(MemoryStore::new())))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("Loading config/{}.yaml", env))?;
    let _log_guard = escrow_desk::logging::init_logging(&config);

    info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        build = env!("ESCROW_DESK_BUILD"),
        escrow = ?config.escrow,
        "Starting escrow desk"
    );

    let repos = open_store(&config).await?;

    let gateway: Arc<dyn TransferGateway> = Arc::new(
        HttpTransferGateway::from_config(&config.escrow)
            .context("Failed to build transfer gateway client")?,
    );
    let ledger = Arc::new(EscrowLedger::new(config.escrow.clone(), gateway, &repos));

    let shutdown = Arc::new(ShutdownSignal::new());

    let (queue, outbox) = notification_channel(config.notifications.queue_capacity);
    let dispatcher = NotificationDispatcher::new(Arc::new(LoggingNotifier), &config.notifications);
    let dispatcher_task = tokio::spawn(dispatcher.run(outbox, shutdown.clone()));

    // Shared with request handlers when embedded; here it only owns the queue sender
    let coordinator = Arc::new(TradeCoordinator::new(
        repos.clone(),
        ledger,
        queue,
        config.trades.clone(),
    ));

    let reaper = TradeReaper::new(repos.trades.clone(), &config.reaper);
    let reaper_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reaper.run(shutdown).await })
    };

    info!("Escrow desk running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutdown requested");
    shutdown.request_shutdown();
    // Closes the queue so the dispatcher sees the end of input
    drop(coordinator);

    reaper_task.await.context("Reaper task panicked")?;
    let stats = dispatcher_task
        .await
        .context("Notification dispatcher panicked")?;
    info!(%stats, "Escrow desk stopped");

    Ok(())
}
