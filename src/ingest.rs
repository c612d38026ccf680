use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::BlockList;
use crate::models::HitRecord;
use crate::scoring::{Scorer, detect_lang};
use crate::store;
use crate::translate::Translate;
use crate::transport::{ChatEntity, MessageRecord};

/// What happened to a message offered to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Persisted { score: u32 },
    AlreadyScored,
    Empty,
    LowScore,
    Blocked,
}

/// The single scoring/persistence path shared by backfill and the live
/// stream: dedupe, score, threshold, block list, language detection,
/// translation, persist.
pub struct Ingestor {
    pool: SqlitePool,
    scorer: Arc<Scorer>,
    translator: Arc<dyn Translate>,
    block: BlockList,
    score_threshold: u32,
}

impl Ingestor {
    pub fn new(
        pool: SqlitePool,
        scorer: Arc<Scorer>,
        translator: Arc<dyn Translate>,
        block: BlockList,
        score_threshold: u32,
    ) -> Self {
        Self {
            pool,
            scorer,
            translator,
            block,
            score_threshold,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ingest(&self, chat: &ChatEntity, msg: &MessageRecord) -> Result<IngestOutcome> {
        if store::already_scored(&self.pool, chat.chat_id, msg.id).await? {
            return Ok(IngestOutcome::AlreadyScored);
        }

        if msg.text.is_empty() {
            return Ok(IngestOutcome::Empty);
        }

        let scored = self.scorer.score(&msg.text);
        if scored.score < self.score_threshold {
            return Ok(IngestOutcome::LowScore);
        }

        let username = chat.username_lower();
        if self.block.contains(username.as_deref()) {
            return Ok(IngestOutcome::Blocked);
        }

        let lang = detect_lang(&msg.text);
        let text_ja = self.translator.translate(&msg.text, &lang).await;
        let url = match &username {
            Some(u) => format!("https://t.me/{u}/{}", msg.id),
            None => String::new(),
        };

        let hit = HitRecord {
            chat_id: chat.chat_id,
            chat_title: chat.title.clone(),
            chat_username: username.unwrap_or_default(),
            date: msg.date,
            message_id: msg.id,
            text: msg.text.clone(),
            lang,
            matched_keywords: scored.matched_json(),
            score: scored.score as i64,
            url,
            text_ja,
        };

        if let Err(e) = store::persist_hit(&self.pool, &hit).await {
            if store::is_unique_violation(&e) {
                // Lost a race against a concurrent insert of the same message.
                debug!(chat_id = chat.chat_id, message_id = msg.id, "duplicate insert, treating as success");
            } else {
                return Err(e);
            }
        }

        debug!(
            chat_id = chat.chat_id,
            message_id = msg.id,
            score = scored.score,
            matched = %hit.matched_keywords,
            url = %hit.url,
            "hit persisted"
        );
        Ok(IngestOutcome::Persisted { score: scored.score })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StubTranslator;
    use super::*;
    use crate::config::Keywords;
    use crate::models::StoredHit;
    use crate::transport::ChatKind;
    use crate::transport::mock::{entity, message};

    struct Fixture {
        _dir: tempfile::TempDir,
        ingestor: Ingestor,
        translator: Arc<StubTranslator>,
    }

    async fn fixture(keywords: Keywords, negatives: Vec<String>, block: &[&str], reply: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::create_pool(&dir.path().join("ingest.db")).await.unwrap();
        let translator = Arc::new(StubTranslator::new(reply));
        let block = BlockList::new(&block.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        let ingestor = Ingestor::new(
            pool,
            Arc::new(Scorer::new(&keywords, &negatives)),
            translator.clone(),
            block,
            1,
        );
        Fixture {
            _dir: dir,
            ingestor,
            translator,
        }
    }

    fn en_keywords(words: &[&str]) -> Keywords {
        Keywords {
            en: words.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
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
    async fn empty_keyword_config_persists_nothing() {
        let fx = fixture(Keywords::default(), vec![], &[], "").await;
        let chat = entity(1, "chan", ChatKind::Channel);

        let outcome = fx.ingestor.ingest(&chat, &message(1, "hello")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::LowScore);
        assert!(rows(&fx.ingestor).await.is_empty());
    }

    #[tokio::test]
    async fn negative_match_persists_nothing() {
        let fx = fixture(en_keywords(&["drone"]), vec!["promo".to_string()], &[], "").await;
        let chat = entity(1, "chan", ChatKind::Channel);

        let outcome = fx.ingestor.ingest(&chat, &message(1, "Drone PROMO sale")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::LowScore);
        assert!(rows(&fx.ingestor).await.is_empty());
    }

    #[tokio::test]
    async fn mixed_language_hit_is_persisted_with_translation() {
        let keywords = Keywords {
            ja: vec!["無人機".to_string()],
            en: vec!["drone".to_string()],
            ..Default::default()
        };
        let fx = fixture(keywords, vec![], &[], "DRONE-JA").await;
        let chat = entity(1, "chan", ChatKind::Channel);

        let outcome = fx.ingestor.ingest(&chat, &message(7, "新型無人機 drone")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Persisted { score: 2 });

        let rows = rows(&fx.ingestor).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].score, 2);
        assert_eq!(rows[0].matched_keywords, "[\"drone\",\"無人機\"]");
        assert_eq!(rows[0].text_ja.as_deref(), Some("DRONE-JA"));
        assert_eq!(rows[0].url, "https://t.me/chan/7");
    }

    #[tokio::test]
    async fn already_scored_message_short_circuits() {
        let fx = fixture(en_keywords(&["drone"]), vec![], &[], "JA").await;
        let chat = entity(1, "chan", ChatKind::Channel);
        let msg = message(3, "drone update");

        assert_eq!(
            fx.ingestor.ingest(&chat, &msg).await.unwrap(),
            IngestOutcome::Persisted { score: 1 }
        );
        assert_eq!(fx.ingestor.ingest(&chat, &msg).await.unwrap(), IngestOutcome::AlreadyScored);
        // The second pass never reached scoring or translation.
        assert_eq!(fx.translator.call_count(), 1);
        assert_eq!(rows(&fx.ingestor).await.len(), 1);
    }

    #[tokio::test]
    async fn empty_text_is_skipped() {
        let fx = fixture(en_keywords(&["drone"]), vec![], &[], "").await;
        let chat = entity(1, "chan", ChatKind::Channel);
        assert_eq!(fx.ingestor.ingest(&chat, &message(1, "")).await.unwrap(), IngestOutcome::Empty);
    }

    #[tokio::test]
    async fn blocked_chat_is_never_persisted() {
        let fx = fixture(en_keywords(&["drone"]), vec![], &["@BadChan"], "").await;
        let chat = entity(1, "badchan", ChatKind::Channel);

        let outcome = fx.ingestor.ingest(&chat, &message(1, "drone hit")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Blocked);
        assert!(rows(&fx.ingestor).await.is_empty());
    }

    #[tokio::test]
    async fn chat_without_username_gets_empty_url() {
        let fx = fixture(en_keywords(&["drone"]), vec![], &[], "").await;
        let chat = entity(1, "", ChatKind::Supergroup);

        let outcome = fx.ingestor.ingest(&chat, &message(2, "drone report")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Persisted { score: 1 });
        let rows = rows(&fx.ingestor).await;
        assert_eq!(rows[0].url, "");
        assert_eq!(rows[0].chat_username, "");
    }
}
