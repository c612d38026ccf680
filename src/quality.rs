use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::CrawlConfig;
use crate::scoring::{Scorer, detect_lang};
use crate::transport::{ChatEntity, Transport};

/// Languages counted toward a probe's target-language rate.
pub const TARGET_LANGS: &[&str] = &["ja", "en", "zh", "ru", "ar", "es"];

/// Statistics over a bounded sample of a channel's recent messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeStats {
    pub total: u32,
    pub hits: u32,
    pub negatives: u32,
    pub target_lang_hits: u32,
    pub avg_len: f64,
}

impl ProbeStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total == 0 { 0.0 } else { self.hits as f64 / self.total as f64 }
    }

    pub fn negative_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.negatives as f64 / self.total as f64
        }
    }

    pub fn target_lang_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.target_lang_hits as f64 / self.total as f64
        }
    }

    fn observe(&mut self, text: &str, scorer: &Scorer, score_threshold: u32) {
        self.total += 1;
        if scorer.score(text).score >= score_threshold {
            self.hits += 1;
        }
        if scorer.matches_negative(text) {
            self.negatives += 1;
        }
        if TARGET_LANGS.contains(&detect_lang(text).as_str()) {
            self.target_lang_hits += 1;
        }
        // Incremental mean over character length.
        let len = text.chars().count() as f64;
        self.avg_len += (len - self.avg_len) / self.total as f64;
    }
}

/// Sample up to `sample_messages` recent messages and accumulate quality
/// statistics. A transport failure yields an empty probe, which the
/// sample-count gate then rejects.
pub async fn probe_channel(
    transport: &dyn Transport,
    scorer: &Scorer,
    entity: &ChatEntity,
    sample_messages: usize,
    score_threshold: u32,
) -> ProbeStats {
    let mut stats = ProbeStats::default();
    let messages = match transport.history(entity, sample_messages.max(1), 0).await {
        Ok(m) => m,
        Err(_) => return stats,
    };
    for msg in &messages {
        if msg.text.is_empty() {
            continue;
        }
        stats.observe(&msg.text, scorer, score_threshold);
    }
    stats
}

/// All gates must hold for a channel to enter the found set and be expanded.
/// The error carries a short reason for the crawl log.
pub fn passes_quality_gates(stats: &ProbeStats, cfg: &CrawlConfig) -> Result<(), String> {
    if stats.total < cfg.q_min_samples {
        return Err(format!("not_enough_samples({}<{})", stats.total, cfg.q_min_samples));
    }
    if stats.hit_rate() < cfg.q_min_hit_rate {
        return Err(format!("low_hit_rate({:.2}<{:.2})", stats.hit_rate(), cfg.q_min_hit_rate));
    }
    if stats.negative_rate() > cfg.q_max_negative_rate {
        return Err(format!(
            "high_negative_rate({:.2}>{:.2})",
            stats.negative_rate(),
            cfg.q_max_negative_rate
        ));
    }
    if stats.avg_len < cfg.q_min_avg_len {
        return Err(format!("text_too_short({:.1}<{})", stats.avg_len, cfg.q_min_avg_len));
    }
    Ok(())
}

/// Chats rejected by the quality gates, keyed by chat id, with the time at
/// which they may be probed again. Entries expire lazily on read.
#[derive(Debug, Default)]
pub struct CooldownMap {
    until: HashMap<i64, Instant>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, chat_id: i64, cooldown: Duration) {
        self.until.insert(chat_id, Instant::now() + cooldown);
    }

    pub fn is_blocked(&mut self, chat_id: i64) -> bool {
        match self.until.get(&chat_id) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                self.until.remove(&chat_id);
                false
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.until.len()
    }
}
