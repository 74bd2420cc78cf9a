//! Inbound/Outbound Integration Adapter (C7): trait boundaries only. No
//! concrete Slack/Telegram adapters ship here (out of scope per SPEC_FULL
//! §1); a real deployment implements `InboundIntegrationAdapter` to call
//! into `swarm::SwarmManager::handle_user_message` and
//! `OutboundIntegrationAdapter` to render `conversation_message` events.

use crate::domain::{Attachment, SourceContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Parameters an inbound adapter hands to `SwarmManager::handle_user_message`.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub text: String,
    pub target_agent_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub source_context: Option<SourceContext>,
}

/// One external-channel event, as seen before dedupe. `event_id` is the
/// provider's own idempotency key if it has one.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub event_id: Option<String>,
    pub channel: String,
    pub ts: String,
    pub message: InboundMessage,
}

#[async_trait]
pub trait InboundIntegrationAdapter: Send + Sync {
    /// Returns `Ok(true)` if the event was accepted and forwarded, `Ok(false)`
    /// if it was dropped as a duplicate.
    async fn handle_event(&self, event: InboundEvent) -> Result<bool, String>;
}

#[async_trait]
pub trait OutboundIntegrationAdapter: Send + Sync {
    /// Called for every `conversation_message` whose `sourceContext.channel`
    /// is not `web`.
    async fn deliver(&self, agent_id: &str, text: &str, source: &SourceContext) -> Result<(), String>;
}

/// Reference in-memory dedupe cache (spec §6: "suggested TTL 30 minutes"),
/// keyed by `event_id` when present, else `"{type}:{channel}:{ts}"`.
pub struct DedupeCache {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DedupeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }

    pub fn key_for(event_type: &str, event: &InboundEvent) -> String {
        match &event.event_id {
            Some(id) => id.clone(),
            None => format!("{event_type}:{}:{}", event.channel, event.ts),
        }
    }

    /// Returns `true` if `key` has not been seen within the TTL window
    /// (and records it as seen), `false` if it's a duplicate.
    pub fn check_and_record(&self, key: String) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        if seen.contains_key(&key) {
            false
        } else {
            seen.insert(key, now);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_accepted_repeat_is_rejected() {
        let cache = DedupeCache::new(Duration::from_secs(60));
        assert!(cache.check_and_record("k1".to_string()));
        assert!(!cache.check_and_record("k1".to_string()));
    }

    #[test]
    fn expired_entries_are_evicted() {
        let cache = DedupeCache::new(Duration::from_millis(1));
        assert!(cache.check_and_record("k1".to_string()));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.check_and_record("k1".to_string()));
    }

    #[test]
    fn key_for_prefers_event_id() {
        let event = InboundEvent {
            event_id: Some("evt-1".to_string()),
            channel: "C1".to_string(),
            ts: "123.456".to_string(),
            message: InboundMessage::default(),
        };
        assert_eq!(DedupeCache::key_for("message", &event), "evt-1");

        let event_no_id = InboundEvent {
            event_id: None,
            ..event
        };
        assert_eq!(
            DedupeCache::key_for("message", &event_no_id),
            "message:C1:123.456"
        );
    }
}
