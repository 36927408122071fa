//! Agent registry and directive queue.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::health::StaleAgent;
use crate::error::{Result, SyncError};
use crate::types::{Agent, Directive};

/// Registered agents keyed by id. Stale agents are flagged, never removed.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Agent>,
}

impl AgentRegistry {
    pub fn from_agents(agents: impl IntoIterator<Item = Agent>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    /// Register, or refresh an existing registration.
    pub fn register(&mut self, id: &str, status: &str, now: DateTime<Utc>) -> Agent {
        let agent = self
            .agents
            .entry(id.to_string())
            .and_modify(|agent| {
                agent.status = status.to_string();
                agent.last_seen_at = now;
            })
            .or_insert_with(|| Agent {
                id: id.to_string(),
                status: status.to_string(),
                registered_at: now,
                last_seen_at: now,
            });
        agent.clone()
    }

    pub fn heartbeat(&mut self, id: &str, status: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found("Agent", id))?;
        agent.last_seen_at = now;
        if let Some(status) = status {
            agent.status = status.to_string();
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn list(&self) -> Vec<Agent> {
        self.agents.values().cloned().collect()
    }

    /// Agents silent for longer than `window`.
    pub fn stale(&self, now: DateTime<Utc>, window: Duration) -> Vec<StaleAgent> {
        self.agents
            .values()
            .filter(|agent| now - agent.last_seen_at > window)
            .map(|agent| StaleAgent {
                id: agent.id.clone(),
                idle_secs: (now - agent.last_seen_at).num_seconds(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Pending directives in insertion order.
#[derive(Debug, Clone, Default)]
pub struct DirectiveQueue {
    directives: Vec<Directive>,
}

impl DirectiveQueue {
    pub fn from_directives(directives: Vec<Directive>) -> Self {
        Self { directives }
    }

    pub fn add(&mut self, directive: Directive) {
        self.directives.push(directive);
    }

    pub fn complete(&mut self, id: &Uuid) -> Result<Directive> {
        let index = self
            .directives
            .iter()
            .position(|d| &d.id == id)
            .ok_or_else(|| SyncError::not_found("Directive", id.to_string()))?;
        Ok(self.directives.remove(index))
    }

    /// Directives for one agent, highest priority then oldest first.
    pub fn for_agent(&self, agent_id: &str) -> Vec<Directive> {
        let mut directives: Vec<Directive> = self
            .directives
            .iter()
            .filter(|d| d.agent_id == agent_id)
            .cloned()
            .collect();
        directives.sort_by_key(|d| (d.priority, d.created_at));
        directives
    }

    /// Remove and return directives whose deadline has passed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> Vec<Directive> {
        let (expired, live): (Vec<Directive>, Vec<Directive>) =
            std::mem::take(&mut self.directives)
                .into_iter()
                .partition(|d| d.is_expired(now));
        self.directives = live;
        expired
    }

    /// Mark critical directives not yet issued as issued and return them.
    pub fn take_unissued_critical(&mut self) -> Vec<Directive> {
        self.directives
            .iter_mut()
            .filter(|d| d.priority == crate::types::Priority::Critical && !d.issued)
            .map(|d| {
                d.issued = true;
                d.clone()
            })
            .collect()
    }

    pub fn all(&self) -> &[Directive] {
        &self.directives
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}
