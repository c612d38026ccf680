use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::Cli;
use crate::config::{BlockList, Config};
use crate::error::TelegramError;
use crate::ingest::Ingestor;
use crate::scoring::Scorer;
use crate::supervisor::Supervisor;
use crate::translate::{HttpTranslator, Translate};
use crate::transport::LiveEvent;
use crate::{db, telegram};

/// Size of the update bus between the pump and live streams.
const UPDATE_BUS_CAPACITY: usize = 1024;

/// One full run of the ingestion engine, driven by the CLI flags:
/// optional discovery, crawl (when enabled), join + backfill, and with
/// `--run` a live stream plus the periodic maintenance loop until SIGINT or
/// SIGTERM.
pub async fn run(cli: &Cli, config: Config) -> Result<()> {
    let pool = db::create_pool(&config.sqlite_path).await.context("creating database")?;
    info!(db_path = %config.sqlite_path.display(), "database ready");

    let scorer = Arc::new(Scorer::new(&config.keywords, &config.negatives));
    let translator: Arc<dyn Translate> = Arc::new(HttpTranslator::new(config.translation.clone()));
    let ingestor = Arc::new(Ingestor::new(
        pool.clone(),
        scorer.clone(),
        translator,
        BlockList::new(&config.block_channels),
        config.score_threshold,
    ));

    let client = telegram::connect(&config).await.context("connecting to Telegram")?;
    match client.is_authorized().await {
        Ok(true) => {}
        Ok(false) => return Err(TelegramError::NotAuthorized.into()),
        Err(e) => anyhow::bail!("Telegram auth check failed: {e}"),
    }
    telegram::save_session(&client, &config);

    let (events, _) = broadcast::channel::<LiveEvent>(UPDATE_BUS_CAPACITY);
    let pump_cancel = CancellationToken::new();
    let pump = telegram::spawn_update_pump(client.clone(), events.clone(), pump_cancel.clone());

    let transport = Arc::new(telegram::TelegramTransport::new(client.clone()));
    let config = Arc::new(config);
    let supervisor = Supervisor::new(transport, config.clone(), ingestor, scorer, events);
    supervisor.init().await;

    let mut found: Vec<String> = Vec::new();
    if cli.discover {
        info!("discovery: keyword search");
        found = supervisor.discover().await;
        info!(hits = found.len(), "discovery done");
    }

    let seeds: BTreeSet<String> = config.seed_channels.iter().cloned().collect();

    let mut crawl_found: Vec<String> = Vec::new();
    if config.discovery.crawl.enabled {
        info!("discovery: crawling links and mentions");
        let crawl_seeds: Vec<String> = seeds
            .iter()
            .cloned()
            .chain(found.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        crawl_found = supervisor.crawl(&crawl_seeds).await;
        info!(hits = crawl_found.len(), "crawl done");
    }

    let targets: Vec<String> = seeds
        .into_iter()
        .chain(found)
        .chain(crawl_found)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let entities = if targets.is_empty() {
        Vec::new()
    } else {
        supervisor.join_targets(&targets).await;
        supervisor.entities_from_refs(&targets).await
    };

    if cli.backfill {
        supervisor.backfill_targets(&targets, cli.new_only).await;
    }

    if cli.run {
        supervisor.start_live(entities).await;
        supervisor.start_maintenance();

        info!("running, press Ctrl+C to stop");
        wait_for_shutdown().await;
        info!("shutdown signal received");

        supervisor.shutdown().await;
    }

    pump_cancel.cancel();
    pump.abort();
    let _ = pump.await;

    telegram::save_session(&client, &config);
    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
