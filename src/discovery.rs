use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{BlockList, Config, FiltersConfig};
use crate::resolver::{ChatRef, EntityResolver};
use crate::transport::{ChatEntity, Transport, TransportError};

/// Wall-clock budget for a single search query.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Channel acceptance filters, compiled once at startup. Invalid
/// user-supplied block patterns are dropped with a warning and treated as
/// non-matching.
pub struct ChannelFilters {
    name_must_include: Vec<String>,
    username_block_patterns: Vec<Regex>,
    min_members: Option<i64>,
}

impl ChannelFilters {
    pub fn new(cfg: &FiltersConfig) -> Self {
        let username_block_patterns = cfg
            .username_block_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "ignoring invalid username block pattern");
                    None
                }
            })
            .collect();

        Self {
            name_must_include: cfg.name_must_include.iter().map(|s| s.to_lowercase()).collect(),
            username_block_patterns,
            min_members: cfg.min_members,
        }
    }
}

/// Decide whether a resolved entity is worth ingesting. A channel without a
/// public username never passes; a failed member-count fetch does not reject.
pub async fn passes_channel_filters(
    transport: &dyn Transport,
    filters: &ChannelFilters,
    block: &BlockList,
    entity: &ChatEntity,
) -> bool {
    let Some(username) = entity.username_lower() else {
        return false;
    };
    let title = entity.title.to_lowercase();

    if block.contains(Some(&username)) {
        debug!(username = %username, "rejected: block list");
        return false;
    }

    if !filters.name_must_include.is_empty()
        && !filters
            .name_must_include
            .iter()
            .any(|needle| title.contains(needle) || username.contains(needle))
    {
        return false;
    }

    if filters.username_block_patterns.iter().any(|re| re.is_match(&username)) {
        debug!(username = %username, "rejected: username block pattern");
        return false;
    }

    if let Some(min_members) = filters.min_members
        && let Ok(Some(count)) = transport.participant_count(entity).await
        && count < min_members
    {
        debug!(username = %username, count, min_members, "rejected: too few members");
        return false;
    }

    true
}

/// Run every configured search query and collect the usernames of channels
/// that pass the filters. Output is sorted and unique.
pub async fn discover_public_channels(
    transport: &dyn Transport,
    cfg: &Config,
    resolver: &mut EntityResolver,
    filters: &ChannelFilters,
    block: &BlockList,
) -> Vec<String> {
    let crawl = &cfg.discovery.crawl;
    let mut found: BTreeSet<String> = BTreeSet::new();
    let total = cfg.discovery.queries.len();

    for (i, query) in cfg.discovery.queries.iter().enumerate() {
        let search = tokio::time::timeout(
            SEARCH_TIMEOUT,
            transport.search_channels(query, cfg.discovery.limit_per_query),
        )
        .await;

        let results = match search {
            Ok(Ok(results)) => results,
            Ok(Err(TransportError::FloodWait(wait_s))) => {
                if wait_s <= crawl.max_wait_on_flood_s {
                    info!(query = %query, wait_s, "flood wait on search");
                    tokio::time::sleep(Duration::from_secs(wait_s + crawl.floodwait_padding_s)).await;
                } else {
                    info!(query = %query, wait_s, "skipping query, flood wait over budget");
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!(query = %query, error = %e, "search failed");
                continue;
            }
            Err(_) => {
                info!(query = %query, "search timed out, skipping");
                continue;
            }
        };

        for candidate in results {
            let Some(username) = candidate.username_lower() else {
                continue;
            };
            let Some(reference) = ChatRef::parse(&format!("@{username}")) else {
                continue;
            };
            let Some(entity) = resolver.get_entity_safe(transport, &reference, crawl).await else {
                continue;
            };
            if passes_channel_filters(transport, filters, block, &entity).await {
                found.insert(format!("@{username}"));
            }
        }

        info!(query = %query, progress = format!("{}/{}", i + 1, total), found = found.len(), "search query done");
    }

    found.into_iter().collect()
}
