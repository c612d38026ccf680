use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingest::{IngestOutcome, Ingestor};
use crate::transport::{ChatEntity, LiveEvent};

/// Event-driven tail of the update bus. Every event goes through the same
/// ingest path as backfill; a failure on one message is logged and the
/// subscription keeps running.
pub struct LiveStream {
    events: broadcast::Receiver<LiveEvent>,
    targets: Option<HashSet<i64>>,
    stop: CancellationToken,
}

impl LiveStream {
    /// `targets = None` listens to everything; otherwise only events from the
    /// given chats are ingested.
    pub fn new(
        events: broadcast::Receiver<LiveEvent>,
        targets: Option<&[ChatEntity]>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            events,
            targets: targets.map(|list| list.iter().map(|e| e.chat_id).collect()),
            stop,
        }
    }

    pub async fn run(mut self, ingestor: Arc<Ingestor>) {
        info!(scoped = self.targets.is_some(), "live stream listening");

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    info!("live stream stopping");
                    break;
                }
                event = self.events.recv() => {
                    match event {
                        Ok(event) => self.handle(&ingestor, event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "live stream lagged behind the update bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("update bus closed, live stream exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, ingestor: &Ingestor, event: LiveEvent) {
        if let Some(targets) = &self.targets
            && !targets.contains(&event.chat.chat_id)
        {
            return;
        }

        match ingestor.ingest(&event.chat, &event.message).await {
            Ok(IngestOutcome::Persisted { score }) => {
                debug!(chat_id = event.chat.chat_id, message_id = event.message.id, score, "live hit");
            }
            Ok(_) => {}
            Err(e) => {
                // Never let a bad message tear down the subscription.
                warn!(
                    chat_id = event.chat.chat_id,
                    message_id = event.message.id,
                    error = format!("{e:#}"),
                    "live ingest failed"
                );
            }
        }
    }
}
