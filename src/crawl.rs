use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info};

use crate::config::{BlockList, Config, CrawlConfig};
use crate::discovery::{ChannelFilters, passes_channel_filters};
use crate::quality::{CooldownMap, passes_quality_gates, probe_channel};
use crate::resolver::{ChatRef, EntityResolver};
use crate::scoring::Scorer;
use crate::transport::Transport;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_]{4,32})").expect("valid mention pattern"));
static TME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://t\.me/([A-Za-z0-9_+]{4,64})(?:/\d+)?").expect("valid t.me pattern"));

/// How many recent messages to scan for neighbor references when expanding.
const EXPANSION_FETCH_LIMIT: usize = 200;

/// Pull candidate chat references out of a message text: @mentions and t.me
/// links, each behind its config switch. Sorted and unique.
pub fn extract_candidates(text: &str, cfg: &CrawlConfig) -> Vec<ChatRef> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut refs: Vec<ChatRef> = Vec::new();

    let mut push = |candidate: Option<ChatRef>| {
        if let Some(r) = candidate
            && seen.insert(r.to_string())
        {
            refs.push(r);
        }
    };

    if cfg.follow_mentions {
        for cap in MENTION_RE.captures_iter(text) {
            push(ChatRef::parse(&format!("@{}", &cap[1])));
        }
    }
    if cfg.follow_tme_links {
        for cap in TME_RE.captures_iter(text) {
            push(ChatRef::parse(&format!("https://t.me/{}", &cap[1])));
        }
    }

    refs.sort_by_key(|r| r.to_string());
    refs
}

/// Frontier priority: lower is earlier. Good signals carry negative weights.
pub fn compute_priority(hit_rate: f64, depth: u32, seed: bool, recent_bonus: f64, cfg: &CrawlConfig) -> f64 {
    cfg.w_hit_rate * hit_rate
        + cfg.w_depth * depth as f64
        + cfg.w_seed_bonus * if seed { 1.0 } else { 0.0 }
        + cfg.w_recent_bonus * recent_bonus
}

#[derive(Debug, Clone)]
struct FrontierEntry {
    priority: f64,
    seq: u64,
    depth: u32,
    reference: ChatRef,
    seed: bool,
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority.total_cmp(&other.priority) == Ordering::Equal && self.seq == other.seq
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the lowest (priority,
        // seq) pair out first. The seq tie-break keeps equal priorities in
        // insertion order.
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Stable best-first frontier keyed on `(priority, insertion_seq)`.
#[derive(Debug, Default)]
struct Frontier {
    heap: BinaryHeap<FrontierEntry>,
    seq: u64,
}

impl Frontier {
    fn push(&mut self, priority: f64, depth: u32, reference: ChatRef, seed: bool) {
        self.heap.push(FrontierEntry {
            priority,
            seq: self.seq,
            depth,
            reference,
            seed,
        });
        self.seq += 1;
    }

    fn pop(&mut self) -> Option<FrontierEntry> {
        self.heap.pop()
    }
}

/// Best-first expansion over mentions and t.me links, bounded by depth,
/// channel count, per-channel probe time, and a global wall clock. Channels
/// failing the quality gates go on cooldown and are not expanded.
#[allow(clippy::too_many_arguments)]
pub async fn discover_by_crawl(
    transport: &dyn Transport,
    cfg: &Config,
    scorer: &Scorer,
    filters: &ChannelFilters,
    block: &BlockList,
    resolver: &mut EntityResolver,
    cooldowns: &mut CooldownMap,
    seeds: &[String],
) -> Vec<String> {
    let crawl = &cfg.discovery.crawl;
    if !crawl.enabled {
        return Vec::new();
    }

    let start = Instant::now();
    let global_limit = Duration::from_secs(crawl.global_time_limit_s);
    let per_channel_limit = Duration::from_secs(crawl.per_channel_time_limit_s);
    let cooldown = Duration::from_secs(crawl.low_quality_cooldown_s);
    let allow_types: HashSet<String> = crawl.allow_types.iter().map(|t| t.to_lowercase()).collect();

    let seed_refs: BTreeSet<ChatRef> = seeds.iter().filter_map(|s| ChatRef::parse(s)).collect();
    let mut frontier = Frontier::default();
    for seed in &seed_refs {
        let priority = compute_priority(0.0, 0, true, 0.0, crawl);
        frontier.push(priority, 0, seed.clone(), true);
    }

    let mut visited: HashSet<ChatRef> = HashSet::new();
    let mut found: BTreeSet<String> = BTreeSet::new();

    while found.len() < crawl.max_channels {
        if start.elapsed() > global_limit {
            info!(limit_s = crawl.global_time_limit_s, "crawl reached global time limit");
            break;
        }
        let Some(entry) = frontier.pop() else {
            break;
        };

        if !visited.insert(entry.reference.clone()) {
            continue;
        }

        if block.contains(entry.reference.username()) {
            debug!(reference = %entry.reference, "crawl skip: blocked (pre-resolve)");
            continue;
        }

        resolver.ensure_join(transport, &entry.reference, crawl).await;
        if crawl.join_sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(crawl.join_sleep_ms)).await;
        }

        let Some(entity) = resolver.get_entity_safe(transport, &entry.reference, crawl).await else {
            continue;
        };

        let username = entity.username_lower();
        if block.contains(username.as_deref()) {
            debug!(reference = %entry.reference, "crawl skip: blocked (post-resolve)");
            continue;
        }
        if cooldowns.is_blocked(entity.chat_id) {
            debug!(reference = %entry.reference, chat_id = entity.chat_id, "crawl skip: low-quality cooldown");
            continue;
        }

        if !allow_types.is_empty() && !allow_types.contains(entity.kind.canonical()) {
            continue;
        }
        if !passes_channel_filters(transport, filters, block, &entity).await {
            continue;
        }

        let probe_started = Instant::now();
        let probe = probe_channel(transport, scorer, &entity, crawl.sample_messages, cfg.score_threshold).await;
        let verdict = passes_quality_gates(&probe, crawl);
        debug!(
            reference = %entry.reference,
            depth = entry.depth,
            total = probe.total,
            hit_rate = format!("{:.2}", probe.hit_rate()),
            negative_rate = format!("{:.2}", probe.negative_rate()),
            target_lang_rate = format!("{:.2}", probe.target_lang_rate()),
            avg_len = format!("{:.1}", probe.avg_len),
            verdict = %verdict.as_ref().err().map(String::as_str).unwrap_or("ok"),
            "probe"
        );

        let recent_bonus = if probe.total > 0 { 1.0 } else { 0.0 };

        if verdict.is_err() {
            cooldowns.mark(entity.chat_id, cooldown);
            continue;
        }

        if let Some(username) = &username {
            found.insert(format!("@{username}"));
        }

        if probe_started.elapsed() > per_channel_limit {
            debug!(reference = %entry.reference, "probe over time budget, not expanding");
            continue;
        }
        if entry.depth >= crawl.max_depth {
            continue;
        }

        let messages = transport
            .history(&entity, EXPANSION_FETCH_LIMIT, 0)
            .await
            .unwrap_or_default();

        let mut neighbors: BTreeSet<String> = BTreeSet::new();
        let mut neighbor_refs: Vec<ChatRef> = Vec::new();
        for msg in &messages {
            if msg.text.is_empty() {
                continue;
            }
            let lowered = msg.text.to_lowercase();
            if crawl
                .blocklist_keywords
                .iter()
                .any(|b| !b.is_empty() && lowered.contains(&b.to_lowercase()))
            {
                continue;
            }
            for candidate in extract_candidates(&msg.text, crawl) {
                if neighbors.insert(candidate.to_string()) {
                    neighbor_refs.push(candidate);
                }
            }
        }
        neighbor_refs.sort_by_key(|r| r.to_string());

        for neighbor in neighbor_refs {
            if visited.contains(&neighbor) {
                continue;
            }
            if block.contains(neighbor.username()) {
                debug!(reference = %neighbor, "neighbor skip: blocked");
                continue;
            }
            let is_seed = seed_refs.contains(&neighbor);
            let priority = compute_priority(probe.hit_rate(), entry.depth + 1, is_seed, recent_bonus, crawl);
            frontier.push(priority, entry.depth + 1, neighbor, is_seed);
        }
    }

    found.into_iter().collect()
}
