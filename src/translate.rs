use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::TranslationConfig;

const DEFAULT_DEEPL_URL: &str = "https://api-free.deepl.com/v2/translate";
const AUTO_PROVIDER_URL: &str = "https://translate.googleapis.com/translate_a/single";

/// Japanese-translation adapter. Implementations never fail: any provider
/// error, timeout, or skip condition yields an empty string, and the store's
/// monotone `text_ja` rule lets a later successful translation still land.
#[async_trait]
pub trait Translate: Send + Sync {
    async fn translate(&self, text: &str, src_lang_hint: &str) -> String;
}

/// HTTP-backed translator with two providers: a DeepL-style endpoint and a
/// generic auto-detect one.
pub struct HttpTranslator {
    http: reqwest::Client,
    cfg: TranslationConfig,
}

#[derive(Deserialize)]
struct DeeplResponse {
    translations: Vec<DeeplTranslation>,
}

#[derive(Deserialize)]
struct DeeplTranslation {
    text: String,
}

impl HttpTranslator {
    pub fn new(cfg: TranslationConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_sec.max(1)))
            .build()
            .unwrap_or_default();
        Self { http, cfg }
    }

    /// Config value wins; the environment fills in when the config is empty.
    fn deepl_api_key(&self) -> String {
        if !self.cfg.deepl_api_key.is_empty() {
            return self.cfg.deepl_api_key.clone();
        }
        std::env::var("DEEPL_API_KEY").unwrap_or_default()
    }

    fn deepl_api_url(&self) -> String {
        if !self.cfg.deepl_api_url.is_empty() {
            return self.cfg.deepl_api_url.clone();
        }
        match std::env::var("DEEPL_API_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => DEFAULT_DEEPL_URL.to_string(),
        }
    }

    async fn translate_deepl(&self, text: &str) -> String {
        let api_key = self.deepl_api_key();
        if api_key.is_empty() {
            return String::new();
        }

        let response = self
            .http
            .post(self.deepl_api_url())
            .header("Authorization", format!("DeepL-Auth-Key {api_key}"))
            .form(&[("text", text), ("target_lang", "JA")])
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = %r.status(), "deepl returned non-success status");
                return String::new();
            }
            Err(e) => {
                debug!(error = %e, "deepl request failed");
                return String::new();
            }
        };

        match response.json::<DeeplResponse>().await {
            Ok(body) => body.translations.into_iter().next().map(|t| t.text).unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "deepl response parse failed");
                String::new()
            }
        }
    }

    async fn translate_auto(&self, text: &str) -> String {
        let response = self
            .http
            .get(AUTO_PROVIDER_URL)
            .query(&[
                ("client", "gtx"),
                ("sl", "auto"),
                ("tl", "ja"),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = %r.status(), "auto provider returned non-success status");
                return String::new();
            }
            Err(e) => {
                debug!(error = %e, "auto provider request failed");
                return String::new();
            }
        };

        // Response shape: [[["translated", "source", ...], ...], ...]
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "auto provider response parse failed");
                return String::new();
            }
        };

        body.get(0)
            .and_then(|segments| segments.as_array())
            .map(|segments| {
                segments
                    .iter()
                    .filter_map(|seg| seg.get(0).and_then(|s| s.as_str()))
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Translate for HttpTranslator {
    async fn translate(&self, text: &str, src_lang_hint: &str) -> String {
        if !self.cfg.enabled || text.is_empty() {
            return String::new();
        }
        // Already Japanese — nothing to do.
        if src_lang_hint.to_lowercase().starts_with("ja") {
            return String::new();
        }

        match self.cfg.provider.as_str() {
            "deepl" => self.translate_deepl(text).await,
            "auto" => self.translate_auto(text).await,
            other => {
                warn!(provider = %other, "unknown translation provider");
                String::new()
            }
        }
    }
}
