use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api_id: i32,
    pub api_hash: String,
    pub session: PathBuf,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default)]
    pub seed_channels: Vec<String>,
    #[serde(default)]
    pub block_channels: Vec<String>,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: u32,
    #[serde(default)]
    pub keywords: Keywords,
    #[serde(default)]
    pub negatives: Vec<String>,
    #[serde(default)]
    pub collect: CollectConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./periscope.db")
}
fn default_score_threshold() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Per-language keyword buckets. The split exists for human curation only;
/// the scorer flattens them into a single combined set at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Keywords {
    #[serde(default)]
    pub ja: Vec<String>,
    #[serde(default)]
    pub en: Vec<String>,
    #[serde(default)]
    pub zh: Vec<String>,
    #[serde(default)]
    pub ru: Vec<String>,
    #[serde(default)]
    pub ar: Vec<String>,
}

impl Keywords {
    /// Union in curation order: ja, en, zh, ru, ar.
    pub fn combined(&self) -> impl Iterator<Item = &String> {
        self.ja
            .iter()
            .chain(&self.en)
            .chain(&self.zh)
            .chain(&self.ru)
            .chain(&self.ar)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectConfig {
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,
    /// Consumed by the external viewer; kept for config round-trip.
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            backfill_limit: default_backfill_limit(),
            poll_interval_sec: default_poll_interval_sec(),
        }
    }
}

fn default_backfill_limit() -> usize {
    1000
}
fn default_poll_interval_sec() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_translate_timeout")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub deepl_api_key: String,
    #[serde(default)]
    pub deepl_api_url: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            timeout_sec: default_translate_timeout(),
            deepl_api_key: String::new(),
            deepl_api_url: String::new(),
        }
    }
}

fn default_provider() -> String {
    "deepl".to_string()
}
fn default_translate_timeout() -> u64 {
    8
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default = "default_limit_per_query")]
    pub limit_per_query: usize,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
}

fn default_limit_per_query() -> usize {
    25
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiltersConfig {
    #[serde(default)]
    pub min_members: Option<i64>,
    #[serde(default)]
    pub name_must_include: Vec<String>,
    #[serde(default)]
    pub username_block_patterns: Vec<String>,
}

/// Crawl tuning. Every knob is resolved here, once, at load time —
/// downstream code reads plain typed fields.
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    #[serde(default = "default_true")]
    pub follow_mentions: bool,
    #[serde(default = "default_true")]
    pub follow_tme_links: bool,
    #[serde(default)]
    pub blocklist_keywords: Vec<String>,
    #[serde(default = "default_allow_types")]
    pub allow_types: Vec<String>,
    #[serde(default = "default_join_sleep_ms")]
    pub join_sleep_ms: u64,
    #[serde(default = "default_floodwait_padding")]
    pub floodwait_padding_s: u64,
    #[serde(default = "default_max_wait_on_flood")]
    pub max_wait_on_flood_s: u64,
    #[serde(default = "default_global_time_limit")]
    pub global_time_limit_s: u64,
    #[serde(default = "default_sample_messages")]
    pub sample_messages: usize,
    #[serde(default = "default_per_channel_time_limit")]
    pub per_channel_time_limit_s: u64,
    #[serde(default = "default_low_quality_cooldown")]
    pub low_quality_cooldown_s: u64,
    #[serde(default = "default_q_min_samples")]
    pub q_min_samples: u32,
    #[serde(default = "default_q_min_hit_rate")]
    pub q_min_hit_rate: f64,
    #[serde(default = "default_q_max_negative_rate")]
    pub q_max_negative_rate: f64,
    #[serde(default = "default_q_min_avg_len")]
    pub q_min_avg_len: f64,
    #[serde(default = "default_w_hit_rate")]
    pub w_hit_rate: f64,
    #[serde(default = "default_w_depth")]
    pub w_depth: f64,
    #[serde(default = "default_w_seed_bonus")]
    pub w_seed_bonus: f64,
    #[serde(default = "default_w_recent_bonus")]
    pub w_recent_bonus: f64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_depth: default_max_depth(),
            max_channels: default_max_channels(),
            follow_mentions: true,
            follow_tme_links: true,
            blocklist_keywords: Vec::new(),
            allow_types: default_allow_types(),
            join_sleep_ms: default_join_sleep_ms(),
            floodwait_padding_s: default_floodwait_padding(),
            max_wait_on_flood_s: default_max_wait_on_flood(),
            global_time_limit_s: default_global_time_limit(),
            sample_messages: default_sample_messages(),
            per_channel_time_limit_s: default_per_channel_time_limit(),
            low_quality_cooldown_s: default_low_quality_cooldown(),
            q_min_samples: default_q_min_samples(),
            q_min_hit_rate: default_q_min_hit_rate(),
            q_max_negative_rate: default_q_max_negative_rate(),
            q_min_avg_len: default_q_min_avg_len(),
            w_hit_rate: default_w_hit_rate(),
            w_depth: default_w_depth(),
            w_seed_bonus: default_w_seed_bonus(),
            w_recent_bonus: default_w_recent_bonus(),
        }
    }
}

fn default_max_depth() -> u32 {
    1
}
fn default_max_channels() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_allow_types() -> Vec<String> {
    vec!["channel".to_string(), "supergroup".to_string()]
}
fn default_join_sleep_ms() -> u64 {
    600
}
fn default_floodwait_padding() -> u64 {
    2
}
fn default_max_wait_on_flood() -> u64 {
    120
}
fn default_global_time_limit() -> u64 {
    600
}
fn default_sample_messages() -> usize {
    50
}
fn default_per_channel_time_limit() -> u64 {
    20
}
fn default_low_quality_cooldown() -> u64 {
    86_400
}
fn default_q_min_samples() -> u32 {
    10
}
fn default_q_min_hit_rate() -> f64 {
    0.05
}
fn default_q_max_negative_rate() -> f64 {
    0.50
}
fn default_q_min_avg_len() -> f64 {
    10.0
}
fn default_w_hit_rate() -> f64 {
    -1.0
}
fn default_w_depth() -> f64 {
    0.3
}
fn default_w_seed_bonus() -> f64 {
    -0.5
}
fn default_w_recent_bonus() -> f64 {
    -0.2
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// 0 disables the maintenance loop.
    #[serde(default)]
    pub interval_sec: u64,
    #[serde(default = "default_true")]
    pub run_discover: bool,
    #[serde(default = "default_true")]
    pub run_crawl: bool,
    #[serde(default = "default_true")]
    pub backfill_new_only: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_sec: 0,
            run_discover: true,
            run_crawl: true,
            backfill_new_only: true,
        }
    }
}

/// Normalized set of blocked usernames. Read-only after config load.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    usernames: HashSet<String>,
}

fn normalize_username(u: &str) -> String {
    u.trim().trim_start_matches('@').to_lowercase()
}

impl BlockList {
    pub fn new(entries: &[String]) -> Self {
        let usernames = entries
            .iter()
            .map(|u| normalize_username(u))
            .filter(|u| !u.is_empty())
            .collect();
        Self { usernames }
    }

    /// A missing or empty username is never blocked.
    pub fn contains(&self, username: Option<&str>) -> bool {
        match username {
            Some(u) => {
                let norm = normalize_username(u);
                !norm.is_empty() && self.usernames.contains(&norm)
            }
            None => false,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.api_id == 0 {
        return Err(ConfigError::Validation(
            "api_id is required (get one at https://my.telegram.org)".to_string(),
        )
        .into());
    }
    if config.api_hash.is_empty() {
        return Err(ConfigError::Validation("api_hash is required".to_string()).into());
    }
    if config.session.as_os_str().is_empty() {
        return Err(ConfigError::Validation("session path must not be empty".to_string()).into());
    }

    let crawl = &config.discovery.crawl;
    if crawl.max_channels == 0 {
        return Err(
            ConfigError::Validation("discovery.crawl.max_channels must be at least 1".to_string()).into(),
        );
    }
    if crawl.sample_messages == 0 {
        return Err(
            ConfigError::Validation("discovery.crawl.sample_messages must be at least 1".to_string()).into(),
        );
    }
    for rate in [
        ("q_min_hit_rate", crawl.q_min_hit_rate),
        ("q_max_negative_rate", crawl.q_max_negative_rate),
    ] {
        if !(0.0..=1.0).contains(&rate.1) {
            return Err(ConfigError::Validation(format!(
                "discovery.crawl.{} must be within 0.0..=1.0, got {}",
                rate.0, rate.1
            ))
            .into());
        }
    }

    if config.translation.enabled {
        match config.translation.provider.as_str() {
            "deepl" | "auto" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "translation.provider must be 'deepl' or 'auto', got '{other}'"
                ))
                .into());
            }
        }
        if config.translation.timeout_sec == 0 {
            return Err(
                ConfigError::Validation("translation.timeout_sec must be at least 1".to_string()).into(),
            );
        }
    }

    Ok(())
}
