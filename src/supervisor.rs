use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backfill::backfill_chat;
use crate::config::{BlockList, Config};
use crate::crawl::discover_by_crawl;
use crate::discovery::{ChannelFilters, discover_public_channels};
use crate::ingest::Ingestor;
use crate::quality::CooldownMap;
use crate::resolver::{ChatRef, EntityResolver};
use crate::scoring::Scorer;
use crate::stream::LiveStream;
use crate::transport::{ChatEntity, LiveEvent, Transport};

/// How long a live stream gets to wind down cooperatively before it is
/// cancelled outright.
const LIVE_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Maintenance loop polling granularity.
const MAINTENANCE_POLL: Duration = Duration::from_secs(5);

struct LiveHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct MaintenanceHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Live-stream handle and target list. Behind its own lock so start/stop
/// never wait on an in-flight discovery pass.
#[derive(Default)]
struct LiveState {
    handle: Option<LiveHandle>,
    targets: Vec<ChatEntity>,
}

/// Discovery-side state (dialog cache, low-quality cooldowns). The lock is
/// held for a full maintenance pass, which keeps passes mutually exclusive.
#[derive(Default)]
struct DiscoveryState {
    resolver: EntityResolver,
    cooldowns: CooldownMap,
}

/// Owns the live-stream handle, the maintenance task, and the process-wide
/// mutable maps (dialog cache, low-quality cooldowns). A maintenance cycle
/// holds the discovery lock end to end: live is provably stopped before
/// rediscovery starts and restarted before the lock is released, except when
/// shutdown has already begun.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    cfg: Arc<Config>,
    ingestor: Arc<Ingestor>,
    scorer: Arc<Scorer>,
    filters: ChannelFilters,
    block: BlockList,
    events: broadcast::Sender<LiveEvent>,
    live: tokio::sync::Mutex<LiveState>,
    discovery: tokio::sync::Mutex<DiscoveryState>,
    maintenance: std::sync::Mutex<Option<MaintenanceHandle>>,
}

impl Supervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        cfg: Arc<Config>,
        ingestor: Arc<Ingestor>,
        scorer: Arc<Scorer>,
        events: broadcast::Sender<LiveEvent>,
    ) -> Self {
        let filters = ChannelFilters::new(&cfg.discovery.filters);
        let block = BlockList::new(&cfg.block_channels);
        Self {
            shared: Arc::new(Shared {
                transport,
                cfg,
                ingestor,
                scorer,
                filters,
                block,
                events,
                live: tokio::sync::Mutex::new(LiveState::default()),
                discovery: tokio::sync::Mutex::new(DiscoveryState::default()),
                maintenance: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.shared.ingestor.pool()
    }

    /// Warm the dialog cache from the account's joined chats.
    pub async fn init(&self) {
        let mut st = self.shared.discovery.lock().await;
        st.resolver.prime(self.shared.transport.as_ref()).await;
    }

    pub async fn discover(&self) -> Vec<String> {
        let mut st = self.shared.discovery.lock().await;
        self.discover_locked(&mut st).await
    }

    pub async fn crawl(&self, seeds: &[String]) -> Vec<String> {
        let mut st = self.shared.discovery.lock().await;
        self.crawl_locked(&mut st, seeds).await
    }

    pub async fn join_targets(&self, targets: &[String]) {
        let mut st = self.shared.discovery.lock().await;
        self.join_targets_locked(&mut st, targets).await;
    }

    pub async fn entities_from_refs(&self, refs: &[String]) -> Vec<ChatEntity> {
        let mut st = self.shared.discovery.lock().await;
        self.entities_from_refs_locked(&mut st, refs).await
    }

    pub async fn backfill_targets(&self, refs: &[String], new_only: bool) {
        let mut st = self.shared.discovery.lock().await;
        self.backfill_targets_locked(&mut st, refs, new_only).await;
    }

    /// Start (or no-op if already running) the live stream over the given
    /// chats; an empty list listens globally.
    pub async fn start_live(&self, targets: Vec<ChatEntity>) {
        let mut ls = self.shared.live.lock().await;
        ls.targets = targets;
        self.start_live_locked(&mut ls);
    }

    pub async fn stop_live(&self) {
        let mut ls = self.shared.live.lock().await;
        self.stop_live_locked(&mut ls).await;
    }

    /// One maintenance pass: rediscover, re-crawl, re-join, new-only
    /// backfill, refresh the cached live target list.
    pub async fn maintenance_once(&self) {
        let mut discovery = self.shared.discovery.lock().await;
        let targets = self.maintenance_once_locked(&mut discovery).await;
        self.shared.live.lock().await.targets = targets;
    }

    /// {stop live, maintenance, restart live} with the discovery lock held
    /// throughout. The restart is skipped once shutdown has begun.
    pub(crate) async fn maintenance_cycle(&self, cancel: &CancellationToken) {
        let mut discovery = self.shared.discovery.lock().await;
        info!("maintenance: stopping live");
        self.stop_live().await;

        info!("maintenance: running");
        let targets = self.maintenance_once_locked(&mut discovery).await;

        let mut live = self.shared.live.lock().await;
        live.targets = targets;
        if cancel.is_cancelled() {
            info!("maintenance: shutdown in progress, leaving live stopped");
            return;
        }
        info!("maintenance: restarting live");
        self.start_live_locked(&mut live);
    }

    /// Spawn the periodic maintenance loop. No-op when already running or
    /// when `maintenance.interval_sec` is 0.
    pub fn start_maintenance(&self) {
        let mut guard = self
            .shared
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = guard.as_ref()
            && !handle.task.is_finished()
        {
            return;
        }
        let cancel = CancellationToken::new();
        let supervisor = self.clone();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move { supervisor.maintenance_loop(loop_cancel).await });
        *guard = Some(MaintenanceHandle { cancel, task });
    }

    /// Stop the live stream, then cancel the maintenance task and await it
    /// with errors swallowed. An in-flight cycle is dropped at its next
    /// suspension point and, with the cancel flag set, will not restart live.
    pub async fn shutdown(&self) {
        self.stop_live().await;

        let maintenance = self
            .shared
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = maintenance {
            handle.cancel.cancel();
            handle.task.abort();
            let _ = handle.task.await;
        }
    }

    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let interval_sec = self.shared.cfg.maintenance.interval_sec;
        if interval_sec == 0 {
            info!("maintenance loop disabled");
            return;
        }
        let interval = Duration::from_secs(interval_sec);
        info!(interval_sec, "maintenance loop enabled");

        let mut last_started: Option<Instant> = None;
        loop {
            if last_started.is_none_or(|t| t.elapsed() >= interval) {
                last_started = Some(Instant::now());
                self.maintenance_cycle(&cancel).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("maintenance loop stopping");
                    return;
                }
                _ = tokio::time::sleep(MAINTENANCE_POLL) => {}
            }
        }
    }

    fn start_live_locked(&self, ls: &mut LiveState) {
        if ls.handle.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let targets = if ls.targets.is_empty() {
            None
        } else {
            Some(ls.targets.as_slice())
        };
        let stream = LiveStream::new(self.shared.events.subscribe(), targets, cancel.clone());
        let ingestor = self.shared.ingestor.clone();
        let task = tokio::spawn(stream.run(ingestor));
        ls.handle = Some(LiveHandle { cancel, task });
    }

    async fn stop_live_locked(&self, ls: &mut LiveState) {
        let Some(handle) = ls.handle.take() else {
            return;
        };
        handle.cancel.cancel();
        let mut task = handle.task;
        if tokio::time::timeout(LIVE_STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("live stream did not stop in time, cancelling");
            task.abort();
            let _ = task.await;
        }
    }

    async fn discover_locked(&self, st: &mut DiscoveryState) -> Vec<String> {
        discover_public_channels(
            self.shared.transport.as_ref(),
            &self.shared.cfg,
            &mut st.resolver,
            &self.shared.filters,
            &self.shared.block,
        )
        .await
    }

    async fn crawl_locked(&self, st: &mut DiscoveryState, seeds: &[String]) -> Vec<String> {
        let DiscoveryState { resolver, cooldowns } = st;
        discover_by_crawl(
            self.shared.transport.as_ref(),
            &self.shared.cfg,
            &self.shared.scorer,
            &self.shared.filters,
            &self.shared.block,
            resolver,
            cooldowns,
            seeds,
        )
        .await
    }

    async fn join_targets_locked(&self, st: &mut DiscoveryState, targets: &[String]) {
        let crawl = &self.shared.cfg.discovery.crawl;
        for target in targets {
            let Some(reference) = ChatRef::parse(target) else {
                continue;
            };
            st.resolver
                .ensure_join(self.shared.transport.as_ref(), &reference, crawl)
                .await;
            if crawl.join_sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(crawl.join_sleep_ms)).await;
            }
        }
    }

    async fn entities_from_refs_locked(&self, st: &mut DiscoveryState, refs: &[String]) -> Vec<ChatEntity> {
        let crawl = &self.shared.cfg.discovery.crawl;
        let mut entities = Vec::new();
        for r in refs {
            let Some(reference) = ChatRef::parse(r) else {
                continue;
            };
            if let Some(entity) = st
                .resolver
                .get_entity_safe(self.shared.transport.as_ref(), &reference, crawl)
                .await
            {
                entities.push(entity);
            }
        }
        entities
    }

    async fn backfill_targets_locked(&self, st: &mut DiscoveryState, refs: &[String], new_only: bool) {
        let mode = if new_only { "new-only" } else { "all" };
        for r in refs {
            let Some(reference) = ChatRef::parse(r) else {
                continue;
            };
            info!(reference = %reference, mode, "backfill");
            if let Err(e) = backfill_chat(
                self.shared.transport.as_ref(),
                &self.shared.ingestor,
                &self.shared.cfg,
                &mut st.resolver,
                &self.shared.block,
                &reference,
                new_only,
            )
            .await
            {
                warn!(reference = %reference, error = format!("{e:#}"), "backfill failed, skipping chat");
            }
        }
    }

    /// Returns the refreshed live target list; storing it is the caller's
    /// job, since only the caller holds the live lock.
    async fn maintenance_once_locked(&self, st: &mut DiscoveryState) -> Vec<ChatEntity> {
        let maintenance = &self.shared.cfg.maintenance;
        let seeds: BTreeSet<String> = self.shared.cfg.seed_channels.iter().cloned().collect();

        let mut found: Vec<String> = Vec::new();
        if maintenance.run_discover {
            info!("maintenance: discovery");
            found = self.discover_locked(st).await;
        }

        let mut crawl_found: Vec<String> = Vec::new();
        if maintenance.run_crawl {
            info!("maintenance: crawl");
            let crawl_seeds: Vec<String> = seeds.iter().cloned().chain(found.iter().cloned()).collect::<BTreeSet<_>>().into_iter().collect();
            crawl_found = self.crawl_locked(st, &crawl_seeds).await;
        }

        let targets: Vec<String> = seeds
            .into_iter()
            .chain(found)
            .chain(crawl_found)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if !targets.is_empty() {
            info!(targets = targets.len(), "maintenance: joining targets");
            self.join_targets_locked(st, &targets).await;

            if maintenance.backfill_new_only {
                self.backfill_targets_locked(st, &targets, true).await;
            }
        }

        self.entities_from_refs_locked(st, &targets).await
    }

    #[cfg(test)]
    pub(crate) async fn live_is_running(&self) -> bool {
        self.shared.live.lock().await.handle.is_some()
    }

    #[cfg(test)]
    pub(crate) async fn live_target_count(&self) -> usize {
        self.shared.live.lock().await.targets.len()
    }

    #[cfg(test)]
    pub(crate) fn live_receiver_count(&self) -> usize {
        self.shared.events.receiver_count()
    }
}
