use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::HitRecord;

const UPSERT_HIT_SQL: &str = "
INSERT INTO messages (id, chat_id, chat_title, chat_username, date, message_id, text, lang, matched_keywords, score, url, text_ja)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(chat_id, message_id) DO UPDATE SET
  chat_title       = excluded.chat_title,
  chat_username    = excluded.chat_username,
  date             = excluded.date,
  text             = excluded.text,
  lang             = excluded.lang,
  matched_keywords = excluded.matched_keywords,
  score            = excluded.score,
  url              = excluded.url,
  text_ja          = CASE
                       WHEN excluded.text_ja IS NOT NULL AND excluded.text_ja <> ''
                       THEN excluded.text_ja
                       ELSE messages.text_ja
                     END";

const UPSERT_STATE_SQL: &str = "
INSERT INTO state (chat_id, last_msg_id, last_date)
VALUES (?, ?, ?)
ON CONFLICT(chat_id) DO UPDATE SET
  last_msg_id = CASE WHEN excluded.last_msg_id > state.last_msg_id
                     THEN excluded.last_msg_id ELSE state.last_msg_id END,
  last_date   = CASE WHEN excluded.last_msg_id > state.last_msg_id
                     THEN excluded.last_date   ELSE state.last_date   END";

/// Derive the primary key for a hit from its identity pair. splitmix64-style
/// mixer, masked to a non-negative i64 so SQLite stores it as INTEGER.
pub fn hit_pk(chat_id: i64, message_id: i64) -> i64 {
    let mut x = (chat_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (message_id as u64);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x & 0x7FFF_FFFF_FFFF_FFFF) as i64
}

/// Has this message already been scored and persisted?
pub async fn already_scored(pool: &SqlitePool, chat_id: i64, message_id: i64) -> Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM messages WHERE chat_id = ? AND message_id = ? LIMIT 1")
            .bind(chat_id)
            .bind(message_id)
            .fetch_optional(pool)
            .await
            .context("checking for scored message")?;
    Ok(row.is_some())
}

/// Highest persisted message id for a chat, 0 if none.
pub async fn last_seen(pool: &SqlitePool, chat_id: i64) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_msg_id FROM state WHERE chat_id = ?")
        .bind(chat_id)
        .fetch_optional(pool)
        .await
        .context("reading watermark")?;
    Ok(row.map(|(id,)| id).unwrap_or(0))
}

/// Upsert a hit and advance the per-chat watermark in one transaction.
///
/// A non-empty stored `text_ja` is never replaced by an empty one, so a
/// translation that succeeded once survives later failed re-ingests. The
/// watermark only moves forward; `last_date` always pairs with the winning
/// `last_msg_id`.
pub async fn persist_hit(pool: &SqlitePool, hit: &HitRecord) -> Result<()> {
    let date_utc = hit.date.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut tx = pool.begin().await.context("starting persist transaction")?;

    sqlx::query(UPSERT_HIT_SQL)
        .bind(hit_pk(hit.chat_id, hit.message_id))
        .bind(hit.chat_id)
        .bind(&hit.chat_title)
        .bind(&hit.chat_username)
        .bind(&date_utc)
        .bind(hit.message_id)
        .bind(&hit.text)
        .bind(&hit.lang)
        .bind(&hit.matched_keywords)
        .bind(hit.score)
        .bind(&hit.url)
        .bind(&hit.text_ja)
        .execute(&mut *tx)
        .await
        .context("upserting message")?;

    sqlx::query(UPSERT_STATE_SQL)
        .bind(hit.chat_id)
        .bind(hit.message_id)
        .bind(&date_utc)
        .execute(&mut *tx)
        .await
        .context("upserting watermark")?;

    tx.commit().await.context("committing persist transaction")?;
    Ok(())
}

/// Concurrent inserts of the same message race on the unique index; the
/// loser's violation counts as success.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|db| db.kind() == sqlx::error::ErrorKind::UniqueViolation)
}
