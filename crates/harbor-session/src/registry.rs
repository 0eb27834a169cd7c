//! Transport-session to agent-id registry.
//!
//! The transport layer hands the broker an opaque connection key; this
//! registry derives a stable agent id from it and owns the disconnect hook.
//! A periodic sweep drops mappings that have gone quiet; whether the
//! underlying sandbox survives is the orchestrator's decision, driven by
//! the session's binding.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use harbor_core::AgentId;

#[derive(Debug, Clone)]
struct Mapping {
    agent_id: AgentId,
    created_at: i64,
    last_activity: i64,
}

/// Maps transport session keys to agent ids.
pub struct SessionRegistry {
    mappings: Mutex<HashMap<String, Mapping>>,
    stale_after: Duration,
}

impl SessionRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            mappings: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Resolve a transport session key to its agent id, deterministically
    /// deriving and recording one on first sight.
    pub fn resolve_or_create(&self, session_key: &str) -> AgentId {
        let now = chrono::Utc::now().timestamp();
        let mut mappings = self.mappings.lock();

        if let Some(mapping) = mappings.get_mut(session_key) {
            mapping.last_activity = now;
            debug!(session_key, agent_id = %mapping.agent_id, "resolved existing mapping");
            return mapping.agent_id.clone();
        }

        let agent_id = AgentId::from_session_key(session_key);
        mappings.insert(
            session_key.to_string(),
            Mapping {
                agent_id: agent_id.clone(),
                created_at: now,
                last_activity: now,
            },
        );

        info!(session_key, agent_id = %agent_id, "registered session mapping");
        agent_id
    }

    /// Record activity on a mapping without creating one.
    pub fn touch(&self, session_key: &str) {
        if let Some(mapping) = self.mappings.lock().get_mut(session_key) {
            mapping.last_activity = chrono::Utc::now().timestamp();
        }
    }

    /// Drop the mapping for a disconnected transport session, returning the
    /// agent id so the orchestrator can decide whether to detach or evict.
    pub fn end(&self, session_key: &str) -> Option<AgentId> {
        let removed = self.mappings.lock().remove(session_key);
        if let Some(mapping) = &removed {
            info!(
                session_key,
                agent_id = %mapping.agent_id,
                age_secs = chrono::Utc::now().timestamp() - mapping.created_at,
                "ended session mapping"
            );
        }
        removed.map(|m| m.agent_id)
    }

    /// Remove mappings idle past the registry timeout. Returns the dropped
    /// agent ids; only the mapping is gone, never the sandbox.
    pub fn sweep_stale(&self) -> Vec<AgentId> {
        let now = chrono::Utc::now().timestamp();
        let cutoff = self.stale_after.as_secs() as i64;
        let mut mappings = self.mappings.lock();

        let stale_keys: Vec<String> = mappings
            .iter()
            .filter(|(_, m)| now - m.last_activity > cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        let mut dropped = Vec::with_capacity(stale_keys.len());
        for key in stale_keys {
            if let Some(mapping) = mappings.remove(&key) {
                info!(session_key = %key, agent_id = %mapping.agent_id, "swept stale mapping");
                dropped.push(mapping.agent_id);
            }
        }
        dropped
    }

    pub fn active_count(&self) -> usize {
        self.mappings.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_stable_per_key() {
        let registry = SessionRegistry::new(Duration::from_secs(3600));
        let a = registry.resolve_or_create("conn-1");
        let b = registry.resolve_or_create("conn-1");
        assert_eq!(a, b);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn different_keys_get_different_agents() {
        let registry = SessionRegistry::new(Duration::from_secs(3600));
        let a = registry.resolve_or_create("conn-1");
        let b = registry.resolve_or_create("conn-2");
        assert_ne!(a, b);
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn end_returns_the_agent_once() {
        let registry = SessionRegistry::new(Duration::from_secs(3600));
        let agent = registry.resolve_or_create("conn-1");

        assert_eq!(registry.end("conn-1"), Some(agent));
        assert_eq!(registry.end("conn-1"), None);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn sweep_only_drops_idle_mappings() {
        let registry = SessionRegistry::new(Duration::from_secs(0));
        registry.resolve_or_create("conn-1");

        // Zero timeout still requires last_activity to be strictly older.
        assert!(registry.sweep_stale().is_empty());

        {
            let mut mappings = registry.mappings.lock();
            mappings.get_mut("conn-1").unwrap().last_activity -= 10;
        }
        let dropped = registry.sweep_stale();
        assert_eq!(dropped.len(), 1);
        assert_eq!(registry.active_count(), 0);
    }
}
