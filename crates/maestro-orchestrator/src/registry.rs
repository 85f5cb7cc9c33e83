use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

struct AgentEntry {
    capabilities: BTreeSet<String>,
    load: Arc<AtomicUsize>,
}

/// Point-in-time view of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    /// Tasks currently dispatched to the agent.
    pub in_flight: usize,
}

/// Capability sets and in-flight counters for every schedulable agent.
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, AgentEntry>>,
    max_tasks_per_agent: Option<usize>,
}

impl AgentRegistry {
    pub fn new(max_tasks_per_agent: Option<usize>) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            max_tasks_per_agent,
        }
    }

    /// Register or replace an agent's capability set. The load counter of an
    /// already known agent is kept.
    pub fn register(&self, agent_id: &str, capabilities: impl IntoIterator<Item = String>) {
        let capabilities: BTreeSet<String> = capabilities.into_iter().collect();
        info!(agent = %agent_id, capabilities = ?capabilities, "Registered agent capabilities");
        let mut agents = self.agents.write();
        match agents.get_mut(agent_id) {
            Some(entry) => entry.capabilities = capabilities,
            None => {
                agents.insert(
                    agent_id.to_string(),
                    AgentEntry {
                        capabilities,
                        load: Arc::new(AtomicUsize::new(0)),
                    },
                );
            }
        }
    }

    /// Returns whether the agent was known.
    pub fn unregister(&self, agent_id: &str) -> bool {
        let removed = self.agents.write().remove(agent_id).is_some();
        if removed {
            info!(agent = %agent_id, "Unregistered agent");
        }
        removed
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn capabilities(&self, agent_id: &str) -> Option<Vec<String>> {
        self.agents
            .read()
            .get(agent_id)
            .map(|e| e.capabilities.iter().cloned().collect())
    }

    /// Agents declaring the given capability, sorted by id.
    pub fn agents_with_capability(&self, capability: &str) -> Vec<String> {
        self.agents
            .read()
            .iter()
            .filter(|(_, e)| e.capabilities.contains(capability))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether the agent is registered and below the in-flight cap.
    pub fn has_capacity(&self, agent_id: &str) -> bool {
        self.agents
            .read()
            .get(agent_id)
            .is_some_and(|e| self.below_cap(e))
    }

    /// The least-loaded agent whose capabilities cover `required`. Ties go to
    /// the lexicographically smallest agent id.
    pub fn find_suitable_agent(&self, required: &[String]) -> Option<String> {
        let agents = self.agents.read();
        let mut best: Option<(&String, usize)> = None;
        for (id, entry) in agents.iter() {
            if !required.iter().all(|cap| entry.capabilities.contains(cap)) {
                continue;
            }
            if !self.below_cap(entry) {
                continue;
            }
            let load = entry.load.load(Ordering::SeqCst);
            // BTreeMap iterates in id order, so strict < keeps the smallest id on ties
            if best.map_or(true, |(_, best_load)| load < best_load) {
                best = Some((id, load));
            }
        }
        best.map(|(id, _)| id.clone())
    }

    pub fn increment(&self, agent_id: &str) {
        if let Some(entry) = self.agents.read().get(agent_id) {
            entry.load.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Decrement the in-flight counter, never going below zero.
    pub fn decrement(&self, agent_id: &str) {
        if let Some(entry) = self.agents.read().get(agent_id) {
            let _ = entry
                .load
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    pub fn load(&self, agent_id: &str) -> usize {
        self.agents
            .read()
            .get(agent_id)
            .map_or(0, |e| e.load.load(Ordering::SeqCst))
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// Get a snapshot of all agents, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentLoad> {
        self.agents
            .read()
            .iter()
            .map(|(id, e)| AgentLoad {
                agent_id: id.clone(),
                capabilities: e.capabilities.iter().cloned().collect(),
                in_flight: e.load.load(Ordering::SeqCst),
            })
            .collect()
    }

    fn below_cap(&self, entry: &AgentEntry) -> bool {
        self.max_tasks_per_agent
            .map_or(true, |cap| entry.load.load(Ordering::SeqCst) < cap)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_superset_matching() {
        let registry = AgentRegistry::default();
        registry.register("writer", caps(&["write"]));
        registry.register("researcher", caps(&["search", "summarize"]));

        assert_eq!(
            registry.find_suitable_agent(&caps(&["search"])).as_deref(),
            Some("researcher")
        );
        assert!(registry.find_suitable_agent(&caps(&["search", "write"])).is_none());
    }

    #[test]
    fn test_least_loaded_wins() {
        let registry = AgentRegistry::default();
        registry.register("a", caps(&["x"]));
        registry.register("b", caps(&["x"]));
        registry.increment("a");

        assert_eq!(registry.find_suitable_agent(&caps(&["x"])).as_deref(), Some("b"));
    }

    #[test]
    fn test_tie_broken_by_id() {
        let registry = AgentRegistry::default();
        registry.register("zeta", caps(&["x"]));
        registry.register("alpha", caps(&["x"]));
        registry.register("mid", caps(&["x"]));

        assert_eq!(registry.find_suitable_agent(&[]).as_deref(), Some("alpha"));
    }

    #[test]
    fn test_capacity_cap() {
        let registry = AgentRegistry::new(Some(1));
        registry.register("solo", caps(&["x"]));
        assert!(registry.has_capacity("solo"));

        registry.increment("solo");
        assert!(!registry.has_capacity("solo"));
        assert!(registry.find_suitable_agent(&caps(&["x"])).is_none());

        registry.decrement("solo");
        assert_eq!(registry.find_suitable_agent(&caps(&["x"])).as_deref(), Some("solo"));
    }

    #[test]
    fn test_decrement_saturates() {
        let registry = AgentRegistry::default();
        registry.register("a", caps(&[]));
        registry.decrement("a");
        assert_eq!(registry.load("a"), 0);
    }

    #[test]
    fn test_reregister_keeps_load() {
        let registry = AgentRegistry::default();
        registry.register("a", caps(&["x"]));
        registry.increment("a");
        registry.register("a", caps(&["y"]));

        assert_eq!(registry.load("a"), 1);
        assert_eq!(registry.capabilities("a").unwrap(), caps(&["y"]));
        assert_eq!(registry.agents_with_capability("y"), caps(&["a"]));
    }

    #[test]
    fn test_unregister() {
        let registry = AgentRegistry::default();
        registry.register("a", caps(&["x"]));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(!registry.is_registered("a"));
        assert_eq!(registry.agent_count(), 0);
        assert!(registry.find_suitable_agent(&[]).is_none());
    }

    #[test]
    fn test_snapshot() {
        let registry = AgentRegistry::default();
        registry.register("b", caps(&["x"]));
        registry.register("a", caps(&["y"]));
        registry.increment("b");

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].agent_id, "a");
        assert_eq!(snap[1].in_flight, 1);
    }
}
