use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A scored message ready to be persisted.
#[derive(Debug, Clone)]
pub struct HitRecord {
    pub chat_id: i64,
    pub chat_title: String,
    pub chat_username: String,
    pub date: DateTime<Utc>,
    pub message_id: i64,
    pub text: String,
    pub lang: String,
    pub matched_keywords: String,
    pub score: i64,
    pub url: String,
    pub text_ja: String,
}

/// Read model for persisted hits.
#[derive(Debug, Clone, FromRow)]
pub struct StoredHit {
    pub id: i64,
    pub chat_id: i64,
    pub chat_title: String,
    pub chat_username: String,
    pub date: String,
    pub message_id: i64,
    pub text: String,
    pub lang: String,
    pub matched_keywords: String,
    pub score: i64,
    pub url: String,
    pub text_ja: Option<String>,
}
