//! Endpoint failover state machine.
//!
//! ```text
//! Disconnected ─▶ ProbingPrimary ─▶ ProbingSecondary ─▶ ProbingFallback
//!       ▲               │                  │                   │
//!       │               └──────────────────┴─────────┬─────────┘
//!       │                                            ▼
//!       └───────────── probe failed ─────────────  Connected
//! ```
//!
//! Probing always walks the roles in order. Once connected the endpoint is
//! kept until one of its own probes fails.

use std::fmt;

use serde::Serialize;

use crate::types::{Endpoint, EndpointRole};

/// Link state toward the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    ProbingPrimary,
    ProbingSecondary,
    ProbingFallback,
    Connected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::ProbingPrimary => "probing_primary",
            LinkState::ProbingSecondary => "probing_secondary",
            LinkState::ProbingFallback => "probing_fallback",
            LinkState::Connected => "connected",
        }
    }

    pub fn probing(role: EndpointRole) -> Self {
        match role {
            EndpointRole::Primary => LinkState::ProbingPrimary,
            EndpointRole::Secondary => LinkState::ProbingSecondary,
            EndpointRole::Fallback => LinkState::ProbingFallback,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered candidate endpoints plus the sticky selection.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
    active: Option<usize>,
    state: LinkState,
}

impl EndpointSet {
    /// Endpoints are sorted by role so probing order never depends on
    /// configuration order.
    pub fn new(mut endpoints: Vec<Endpoint>) -> Self {
        endpoints.sort_by_key(|e| e.role);
        Self {
            endpoints,
            active: None,
            state: LinkState::Disconnected,
        }
    }

    /// Candidates in probe order.
    pub fn candidates(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn active(&self) -> Option<&Endpoint> {
        self.active.and_then(|i| self.endpoints.get(i))
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Enter the probing state for the candidate at `index`.
    pub fn probing(&mut self, index: usize) {
        if let Some(endpoint) = self.endpoints.get(index) {
            self.state = LinkState::probing(endpoint.role);
        }
    }

    /// Make the candidate at `index` the sticky endpoint.
    pub fn connect(&mut self, index: usize) -> Option<&Endpoint> {
        let endpoint = self.endpoints.get(index)?;
        self.active = Some(index);
        self.state = LinkState::Connected;
        Some(endpoint)
    }

    /// Drop the active endpoint. Returns the one that was lost, if any.
    pub fn disconnect(&mut self) -> Option<Endpoint> {
        self.state = LinkState::Disconnected;
        self.active
            .take()
            .and_then(|i| self.endpoints.get(i).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> EndpointSet {
        EndpointSet::new(vec![
            Endpoint::new("https://c", EndpointRole::Fallback),
            Endpoint::new("https://a", EndpointRole::Primary),
            Endpoint::new("https://b", EndpointRole::Secondary),
        ])
    }

    #[test]
    fn test_candidates_sorted_by_role() {
        let set = set();
        let roles: Vec<EndpointRole> = set.candidates().iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![EndpointRole::Primary, EndpointRole::Secondary, EndpointRole::Fallback]
        );
        assert_eq!(set.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_probe_connect_disconnect() {
        let mut set = set();
        set.probing(0);
        assert_eq!(set.state(), LinkState::ProbingPrimary);
        set.probing(1);
        assert_eq!(set.state(), LinkState::ProbingSecondary);

        let url = set.connect(1).map(|e| e.url.clone());
        assert_eq!(url.as_deref(), Some("https://b"));
        assert!(set.state().is_connected());

        let lost = set.disconnect().unwrap();
        assert_eq!(lost.role, EndpointRole::Secondary);
        assert!(set.active().is_none());
        assert_eq!(set.state(), LinkState::Disconnected);
        assert!(set.disconnect().is_none());
    }
}
