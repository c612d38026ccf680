use anyhow::{Context, Result};
use tracing::debug;

use crate::config::{BlockList, Config};
use crate::ingest::{IngestOutcome, Ingestor};
use crate::resolver::{ChatRef, EntityResolver};
use crate::store;
use crate::transport::Transport;

/// Fetch and ingest recent history for one chat, newest-first, bounded by
/// `collect.backfill_limit`. In new-only mode the stored watermark caps how
/// far back we go; the per-message id check stays as defense in depth against
/// a transport that ignores the bound.
#[allow(clippy::too_many_arguments)]
pub async fn backfill_chat(
    transport: &dyn Transport,
    ingestor: &Ingestor,
    cfg: &Config,
    resolver: &mut EntityResolver,
    block: &BlockList,
    reference: &ChatRef,
    new_only: bool,
) -> Result<()> {
    let Some(entity) = resolver
        .get_entity_safe(transport, reference, &cfg.discovery.crawl)
        .await
    else {
        debug!(reference = %reference, "backfill skip: unresolved");
        return Ok(());
    };

    if block.contains(entity.username_lower().as_deref()) {
        debug!(reference = %reference, "backfill skip: blocked");
        return Ok(());
    }

    let last_seen = if new_only {
        store::last_seen(ingestor.pool(), entity.chat_id).await?
    } else {
        0
    };
    let min_id = if new_only && last_seen > 0 { last_seen } else { 0 };

    let messages = transport
        .history(&entity, cfg.collect.backfill_limit, min_id)
        .await
        .with_context(|| format!("fetching history for {reference}"))?;

    let mut total = 0u32;
    let mut hits = 0u32;
    let mut skipped_scored = 0u32;
    let mut low_score = 0u32;

    for msg in &messages {
        total += 1;

        if new_only && last_seen > 0 && msg.id <= last_seen {
            continue;
        }

        match ingestor.ingest(&entity, msg).await? {
            IngestOutcome::Persisted { .. } => hits += 1,
            IngestOutcome::AlreadyScored => skipped_scored += 1,
            IngestOutcome::LowScore => low_score += 1,
            IngestOutcome::Empty | IngestOutcome::Blocked => {}
        }
    }

    debug!(
        reference = %reference,
        total,
        hits,
        skipped_scored,
        low_score,
        "backfill summary"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Keywords;
    use crate::ingest::testing::StubTranslator;
    use crate::models::StoredHit;
    use crate::scoring::Scorer;
    use crate::transport::ChatKind;
    use crate::transport::mock::{MockTransport, entity, message};

    struct Fixture {
        _dir: tempfile::TempDir,
        cfg: Config,
        ingestor: Ingestor,
        translator: Arc<StubTranslator>,
        transport: MockTransport,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::create_pool(&dir.path().join("backfill.db")).await.unwrap();

        let mut cfg: Config = toml::from_str(
            r#"
            api_id = 1
            api_hash = "x"
            session = "s"
            "#,
        )
        .unwrap();
        cfg.keywords = Keywords {
            en: vec!["drone".to_string()],
            ..Default::default()
        };

        let translator = Arc::new(StubTranslator::new("JA-TEXT"));
        let ingestor = Ingestor::new(
            pool,
            Arc::new(Scorer::new(&cfg.keywords, &cfg.negatives)),
            translator.clone(),
            BlockList::new(&cfg.block_channels),
            cfg.score_threshold,
        );

        Fixture {
            _dir: dir,
            cfg,
            ingestor,
            translator,
            transport: MockTransport::new(),
        }
    }

    async fn rows(ingestor: &Ingestor) -> Vec<StoredHit> {
        sqlx::query_as::<_, StoredHit>(
            "SELECT id, chat_id, chat_title, chat_username, date, message_id, text, lang,
             matched_keywords, score, url, text_ja FROM messages ORDER BY message_id",
        )
        .fetch_all(ingestor.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn backfill_is_idempotent_and_preserves_translations() {
        let fx = fixture().await;
        fx.transport.add_chat(
            entity(1, "chan", ChatKind::Channel),
            vec![
                message(3, "drone over the bridge"),
                message(2, "nothing relevant"),
                message(1, "another drone clip"),
            ],
        );
        let reference = ChatRef::parse("@chan").unwrap();
        let mut resolver = EntityResolver::new();
        let block = BlockList::default();

        backfill_chat(&fx.transport, &fx.ingestor, &fx.cfg, &mut resolver, &block, &reference, false)
            .await
            .unwrap();

        let first = rows(&fx.ingestor).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].text_ja.as_deref(), Some("JA-TEXT"));
        assert_eq!(store::last_seen(fx.ingestor.pool(), 1).await.unwrap(), 3);

        // Second pass: the translator now fails (empty) but nothing may
        // regress — same rows, same translations, same watermark.
        fx.translator.set_reply("");
        backfill_chat(&fx.transport, &fx.ingestor, &fx.cfg, &mut resolver, &block, &reference, false)
            .await
            .unwrap();

        let second = rows(&fx.ingestor).await;
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].text_ja.as_deref(), Some("JA-TEXT"));
        assert_eq!(store::last_seen(fx.ingestor.pool(), 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn new_only_mode_starts_at_the_watermark() {
        let fx = fixture().await;
        let chan = entity(1, "chan", ChatKind::Channel);
        fx.transport.add_chat(chan.clone(), vec![message(2, "drone two"), message(1, "drone one")]);
        let reference = ChatRef::parse("@chan").unwrap();
        let mut resolver = EntityResolver::new();
        let block = BlockList::default();

        backfill_chat(&fx.transport, &fx.ingestor, &fx.cfg, &mut resolver, &block, &reference, true)
            .await
            .unwrap();
        assert_eq!(rows(&fx.ingestor).await.len(), 2);
        assert_eq!(fx.translator.call_count(), 2);

        // New message arrives; a new-only pass must only touch it.
        fx.transport
            .add_chat(chan, vec![message(3, "drone three"), message(2, "drone two"), message(1, "drone one")]);
        backfill_chat(&fx.transport, &fx.ingestor, &fx.cfg, &mut resolver, &block, &reference, true)
            .await
            .unwrap();

        assert_eq!(rows(&fx.ingestor).await.len(), 3);
        assert_eq!(fx.translator.call_count(), 3);
        assert_eq!(store::last_seen(fx.ingestor.pool(), 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn blocked_chat_is_skipped_entirely() {
        let fx = fixture().await;
        fx.transport
            .add_chat(entity(1, "badchan", ChatKind::Channel), vec![message(1, "drone hit")]);
        let reference = ChatRef::parse("@badchan").unwrap();
        let mut resolver = EntityResolver::new();
        let block = BlockList::new(&["badchan".to_string()]);

        backfill_chat(&fx.transport, &fx.ingestor, &fx.cfg, &mut resolver, &block, &reference, false)
            .await
            .unwrap();
        assert!(rows(&fx.ingestor).await.is_empty());
    }

    #[tokio::test]
    async fn unresolved_reference_is_a_quiet_no_op() {
        let fx = fixture().await;
        let reference = ChatRef::parse("@ghost").unwrap();
        let mut resolver = EntityResolver::new();

        backfill_chat(
            &fx.transport,
            &fx.ingestor,
            &fx.cfg,
            &mut resolver,
            &BlockList::default(),
            &reference,
            false,
        )
        .await
        .unwrap();
        assert!(rows(&fx.ingestor).await.is_empty());
    }

    #[tokio::test]
    async fn backfill_limit_bounds_the_fetch() {
        let fx = fixture().await;
        let mut cfg = fx.cfg.clone();
        cfg.collect.backfill_limit = 2;

        let history = (1..=10).rev().map(|i| message(i, "drone sighting")).collect();
        fx.transport.add_chat(entity(1, "chan", ChatKind::Channel), history);

        let reference = ChatRef::parse("@chan").unwrap();
        let mut resolver = EntityResolver::new();
        backfill_chat(
            &fx.transport,
            &fx.ingestor,
            &cfg,
            &mut resolver,
            &BlockList::default(),
            &reference,
            false,
        )
        .await
        .unwrap();

        assert_eq!(rows(&fx.ingestor).await.len(), 2);
    }
}
