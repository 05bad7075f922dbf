//! Live-agent registry for the dockway broker
//!
//! Tracks the set of agents currently holding a tunnel open to the broker,
//! keyed by agent id. Synchronization is per-key, so operations on distinct
//! agents never contend, and insert/remove are atomic with respect to
//! concurrent readers.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// A currently-connected agent.
///
/// Created once per successful authentication and removed when the owning
/// tunnel connection is torn down. Consumers always get clones, never
/// references into the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Stable identifier supplied as the authentication username.
    pub id: String,
    /// Best-effort client network origin; informational only.
    pub remote_address: String,
    /// When the agent last authenticated.
    pub connected_at: DateTime<Utc>,
}

impl Agent {
    /// Build a record for an agent that authenticated just now.
    pub fn connected_now(id: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote_address: remote_address.into(),
            connected_at: Utc::now(),
        }
    }
}

/// Concurrent map of agent id to live [`Agent`] record.
///
/// At most one record exists per id at any time: a re-authentication under
/// the same id overwrites rather than duplicates.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Insert or replace the record keyed by `agent.id`. Always succeeds.
    pub fn put(&self, agent: Agent) {
        let id = agent.id.clone();
        if self.agents.insert(id.clone(), agent).is_some() {
            debug!(agent_id = %id, "replaced existing agent record");
        } else {
            debug!(agent_id = %id, "added agent record");
        }
    }

    /// Remove the record for `id`, if any.
    ///
    /// Removing an absent id is a no-op, not an error: disconnect cleanup
    /// may race with a second authentication attempt for the same id.
    pub fn remove(&self, id: &str) -> bool {
        self.agents.remove(id).is_some()
    }

    /// Point lookup by agent id.
    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all live agents. Order is unspecified, and the view is
    /// not linearizable with concurrent put/remove.
    pub fn list(&self) -> Vec<Agent> {
        self.agents
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
