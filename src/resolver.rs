use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::CrawlConfig;
use crate::transport::{ChatEntity, Transport, TransportError};

/// A textual chat reference: `@name`, `t.me/name[/id]`, or an invite link.
/// Usernames are normalized to lowercase at parse time; invite hashes keep
/// their case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChatRef {
    Username(String),
    Invite(String),
}

impl ChatRef {
    pub fn parse(raw: &str) -> Option<ChatRef> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(name) = trimmed.strip_prefix('@') {
            return Self::from_username(name);
        }

        if let Some((_, tail)) = trimmed.split_once("t.me/") {
            let tail = tail.trim_matches('/');
            if let Some(hash) = tail.strip_prefix('+') {
                return (!hash.is_empty()).then(|| ChatRef::Invite(hash.to_string()));
            }
            if let Some(hash) = tail.strip_prefix("joinchat/") {
                return (!hash.is_empty()).then(|| ChatRef::Invite(hash.to_string()));
            }
            let name = tail.split('/').next().unwrap_or_default();
            return Self::from_username(name);
        }

        Self::from_username(trimmed)
    }

    fn from_username(name: &str) -> Option<ChatRef> {
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        Some(ChatRef::Username(name.to_lowercase()))
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            ChatRef::Username(u) => Some(u),
            ChatRef::Invite(_) => None,
        }
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Username(u) => write!(f, "@{u}"),
            ChatRef::Invite(h) => write!(f, "https://t.me/+{h}"),
        }
    }
}

/// Resolves references to chat entities with a process-lifetime cache keyed
/// by lowercase username. FloodWait is absorbed here: a bounded wait earns a
/// single retry, anything beyond the budget is treated as unresolved.
/// Resolution never errors — failures only show up as `None`.
#[derive(Debug, Default)]
pub struct EntityResolver {
    cache: HashMap<String, ChatEntity>,
}

impl EntityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache from the account's joined dialogs.
    pub async fn prime(&mut self, transport: &dyn Transport) {
        match transport.joined_dialogs().await {
            Ok(dialogs) => {
                let mut count = 0;
                for entity in dialogs {
                    if let Some(key) = entity.username_lower() {
                        self.cache.insert(key, entity);
                        count += 1;
                    }
                }
                info!(cached = count, "dialog cache primed");
            }
            Err(e) => {
                warn!(error = %e, "failed to enumerate dialogs for cache");
            }
        }
    }

    pub async fn get_entity_safe(
        &mut self,
        transport: &dyn Transport,
        reference: &ChatRef,
        crawl: &CrawlConfig,
    ) -> Option<ChatEntity> {
        if let Some(key) = reference.username()
            && let Some(entity) = self.cache.get(key)
        {
            return Some(entity.clone());
        }

        match transport.resolve(reference).await {
            Ok(found) => self.remember(found),
            Err(TransportError::FloodWait(wait_s)) => {
                if wait_s > crawl.max_wait_on_flood_s {
                    debug!(reference = %reference, wait_s, "skipping resolve, flood wait over budget");
                    return None;
                }
                debug!(reference = %reference, wait_s, "flood wait on resolve");
                tokio::time::sleep(Duration::from_secs(wait_s + crawl.floodwait_padding_s)).await;
                match transport.resolve(reference).await {
                    Ok(found) => self.remember(found),
                    Err(e) => {
                        debug!(reference = %reference, error = %e, "resolve retry failed");
                        None
                    }
                }
            }
            Err(e) => {
                debug!(reference = %reference, error = %e, "resolve failed");
                None
            }
        }
    }

    fn remember(&mut self, found: Option<ChatEntity>) -> Option<ChatEntity> {
        if let Some(entity) = &found
            && let Some(key) = entity.username_lower()
        {
            self.cache.insert(key, entity.clone());
        }
        found
    }

    /// Best-effort membership: import the invite, or resolve and join.
    /// Never raises — a failed join is observable only as a later
    /// unresolved/unreadable chat.
    pub async fn ensure_join(&mut self, transport: &dyn Transport, reference: &ChatRef, crawl: &CrawlConfig) {
        match reference {
            ChatRef::Invite(hash) => {
                if let Err(e) = transport.accept_invite(hash).await {
                    debug!(reference = %reference, error = %e, "invite import failed");
                }
            }
            ChatRef::Username(_) => {
                let Some(entity) = self.get_entity_safe(transport, reference, crawl).await else {
                    return;
                };
                if !entity.kind.joinable() {
                    return;
                }
                if let Err(e) = transport.join(&entity).await {
                    debug!(reference = %reference, error = %e, "join failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChatKind;
    use crate::transport::mock::{MockTransport, entity};

    fn crawl_cfg() -> CrawlConfig {
        CrawlConfig {
            max_wait_on_flood_s: 30,
            floodwait_padding_s: 2,
            ..Default::default()
        }
    }

    #[test]
    fn parse_normalizes_references() {
        assert_eq!(ChatRef::parse("@SomeName"), Some(ChatRef::Username("somename".into())));
        assert_eq!(ChatRef::parse("somename"), Some(ChatRef::Username("somename".into())));
        assert_eq!(
            ChatRef::parse("https://t.me/SomeName/123"),
            Some(ChatRef::Username("somename".into()))
        );
        assert_eq!(
            ChatRef::parse("http://t.me/other_chan"),
            Some(ChatRef::Username("other_chan".into()))
        );
        assert_eq!(
            ChatRef::parse("https://t.me/+AbCdEf123"),
            Some(ChatRef::Invite("AbCdEf123".into()))
        );
        assert_eq!(
            ChatRef::parse("https://t.me/joinchat/XyZ"),
            Some(ChatRef::Invite("XyZ".into()))
        );
        assert_eq!(ChatRef::parse(""), None);
        assert_eq!(ChatRef::parse("has spaces"), None);
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(ChatRef::Username("abc".into()).to_string(), "@abc");
        assert_eq!(ChatRef::Invite("H4sh".into()).to_string(), "https://t.me/+H4sh");
    }

    #[tokio::test]
    async fn cache_hit_skips_the_transport() {
        let transport = MockTransport::new();
        transport.add_chat(entity(1, "cached", ChatKind::Channel), vec![]);

        let mut resolver = EntityResolver::new();
        let reference = ChatRef::parse("@cached").unwrap();

        let first = resolver.get_entity_safe(&transport, &reference, &crawl_cfg()).await;
        assert!(first.is_some());
        let second = resolver.get_entity_safe(&transport, &reference, &crawl_cfg()).await;
        assert!(second.is_some());
        // Only the first lookup reached the transport.
        assert_eq!(transport.resolve_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prime_caches_dialog_usernames() {
        let transport = MockTransport::new();
        transport
            .dialogs
            .lock()
            .unwrap()
            .push(entity(7, "AlreadyJoined", ChatKind::Supergroup));

        let mut resolver = EntityResolver::new();
        resolver.prime(&transport).await;

        let reference = ChatRef::parse("@alreadyjoined").unwrap();
        assert!(resolver.get_entity_safe(&transport, &reference, &crawl_cfg()).await.is_some());
        assert!(transport.resolve_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn small_flood_wait_sleeps_and_retries_once() {
        let transport = MockTransport::new();
        transport.add_chat(entity(1, "target", ChatKind::Channel), vec![]);
        transport.script_resolve_error("target", TransportError::FloodWait(3));

        let mut resolver = EntityResolver::new();
        let reference = ChatRef::parse("@target").unwrap();

        let started = tokio::time::Instant::now();
        let resolved = resolver.get_entity_safe(&transport, &reference, &crawl_cfg()).await;

        assert!(resolved.is_some());
        assert_eq!(transport.resolve_calls.lock().unwrap().len(), 2);
        // Slept wait + padding before retrying.
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_retry_after_flood_wait_is_unresolved() {
        let transport = MockTransport::new();
        transport.add_chat(entity(1, "target", ChatKind::Channel), vec![]);
        transport.script_resolve_error("target", TransportError::FloodWait(3));
        transport.script_resolve_error("target", TransportError::Unavailable("still down".into()));

        let mut resolver = EntityResolver::new();
        let reference = ChatRef::parse("@target").unwrap();

        let resolved = resolver.get_entity_safe(&transport, &reference, &crawl_cfg()).await;
        assert!(resolved.is_none());
        assert_eq!(transport.resolve_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn oversized_flood_wait_skips_without_retry() {
        let transport = MockTransport::new();
        transport.add_chat(entity(1, "target", ChatKind::Channel), vec![]);
        transport.script_resolve_error("target", TransportError::FloodWait(999));

        let mut resolver = EntityResolver::new();
        let reference = ChatRef::parse("@target").unwrap();

        let resolved = resolver.get_entity_safe(&transport, &reference, &crawl_cfg()).await;
        assert!(resolved.is_none());
        assert_eq!(transport.resolve_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_join_joins_channels_and_imports_invites() {
        let transport = MockTransport::new();
        transport.add_chat(entity(5, "chan", ChatKind::Channel), vec![]);

        let mut resolver = EntityResolver::new();
        resolver
            .ensure_join(&transport, &ChatRef::parse("@chan").unwrap(), &crawl_cfg())
            .await;
        assert_eq!(*transport.joined.lock().unwrap(), vec![5]);

        resolver
            .ensure_join(&transport, &ChatRef::parse("https://t.me/+SecretHash").unwrap(), &crawl_cfg())
            .await;
        assert_eq!(*transport.accepted_invites.lock().unwrap(), vec!["SecretHash"]);
    }

    #[tokio::test]
    async fn ensure_join_skips_users() {
        let transport = MockTransport::new();
        transport.add_chat(entity(9, "someuser", ChatKind::User), vec![]);

        let mut resolver = EntityResolver::new();
        resolver
            .ensure_join(&transport, &ChatRef::parse("@someuser").unwrap(), &crawl_cfg())
            .await;
        assert!(transport.joined.lock().unwrap().is_empty());
    }
}
