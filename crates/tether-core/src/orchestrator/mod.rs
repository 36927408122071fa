//! Unified Orchestrator.
//!
//! Owns both sync managers and drives them together:
//!
//! - restores every cache and runs one combined sync at startup, then
//!   spawns the three periodic loops (AI, dashboard, orchestrator);
//! - drains manager events each tick and cross-propagates them (AI
//!   failures become dashboard pushes, inbound operator commands become AI
//!   dispatches, directives or forced resyncs);
//! - computes the composite health score and pushes a status snapshot;
//! - keeps the agent registry and the directive queue.
//!
//! Managers are only ever touched through their public API.

mod agents;
mod health;

pub use agents::{AgentRegistry, DirectiveQueue};
pub use health::{
    AI_OFFLINE_PENALTY, DASHBOARD_OFFLINE_PENALTY, ERROR_RATE_PENALTY, HealthInputs,
    HealthReport, HealthStatus, QUEUE_DEPTH_PENALTY, QUOTA_PENALTY, STALE_CRITICAL_PENALTY,
    STALE_WARN_PENALTY, StaleAgent, assess,
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai::{AiStatus, AiSyncManager};
use crate::cache::{AI_CACHE_FILE, DASHBOARD_CACHE_FILE, ORCHESTRATOR_CACHE_FILE, StateCache};
use crate::clock::{SharedClock, system_clock};
use crate::config::{OrchestratorConfig, SyncConfig};
use crate::dashboard::{DashboardStatus, DashboardSyncManager};
use crate::error::{Result, SyncError};
use crate::events::{self, SyncEvent};
use crate::scheduler::{Shutdown, Tickable, spawn_loop};
use crate::transport::{AiTransport, DashboardTransport};
use crate::types::{Agent, CommandType, Directive, InboundCommand, Priority, UpdateType};

/// Buffered events per subscriber before it starts lagging.
const BROADCAST_CAPACITY: usize = 256;

/// Event broadcast to agents and other listeners.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Forwarded manager event.
    Sync(SyncEvent),
    /// Critical directive ready for immediate execution.
    DirectiveIssued(Directive),
    DirectiveExpired(Directive),
    /// Inbound operator command without a built-in handler.
    InboundCommand(InboundCommand),
    HealthUpdated(HealthReport),
}

/// One entry of the in-memory event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

/// Persisted orchestrator state (`orchestrator.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub directives: Vec<Directive>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health: Option<HealthReport>,
}

/// Combined view of everything the orchestrator knows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedStatus {
    pub health: HealthReport,
    pub ai: AiStatus,
    pub dashboard: DashboardStatus,
    pub agents: Vec<Agent>,
    pub directives: Vec<Directive>,
}

/// Payload of an inbound `dispatch-to-ai` command.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiDispatchRequest {
    #[serde(rename = "type", alias = "commandType")]
    command_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    priority: Option<String>,
}

/// Payload of an inbound `directive` command.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectiveRequest {
    agent_id: String,
    directive: String,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    deadline: Option<DateTime<Utc>>,
}

/// Latest instant at which both managers had completed a clean pass.
fn unified_sync(ai: &AiStatus, dashboard: &DashboardStatus) -> Option<DateTime<Utc>> {
    let ai = ai.metrics.last_successful_tick?;
    let dashboard = dashboard.last_clean_pass?;
    Some(ai.min(dashboard))
}

fn parse_priority(value: Option<&str>) -> Result<Priority> {
    value.map(str::parse::<Priority>).transpose().map(Option::unwrap_or_default)
}

struct Inner {
    agents: AgentRegistry,
    directives: DirectiveQueue,
    log: VecDeque<LogEntry>,
    last_full_sync: Option<DateTime<Utc>>,
    last_health: Option<HealthReport>,
    /// Window end of the last quota alert pushed, to avoid repeats.
    quota_alerted_until: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    dirty: bool,
}

impl Inner {
    fn snapshot(&self) -> OrchestratorState {
        OrchestratorState {
            agents: self.agents.list(),
            directives: self.directives.all().to_vec(),
            last_full_sync: self.last_full_sync,
            last_health: self.last_health.clone(),
        }
    }
}

/// Composes the AI and dashboard managers.
pub struct Orchestrator {
    config: OrchestratorConfig,
    ai: Arc<AiSyncManager>,
    dashboard: Arc<DashboardSyncManager>,
    cache: StateCache<OrchestratorState>,
    clock: SharedClock,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SyncEvent>>,
    broadcast: broadcast::Sender<OrchestratorEvent>,
    inner: Mutex<Inner>,
    tick_lock: tokio::sync::Mutex<()>,
    shutdown: Shutdown,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: SyncConfig,
        ai_transport: Arc<dyn AiTransport>,
        dashboard_transport: Arc<dyn DashboardTransport>,
    ) -> Self {
        Self::with_clock(config, ai_transport, dashboard_transport, system_clock())
    }

    /// Wire both managers onto one event channel, caching under
    /// `config.state_dir`.
    pub fn with_clock(
        config: SyncConfig,
        ai_transport: Arc<dyn AiTransport>,
        dashboard_transport: Arc<dyn DashboardTransport>,
        clock: SharedClock,
    ) -> Self {
        let (sender, rx) = events::channel();
        let dir = config.state_dir.clone();

        let ai = AiSyncManager::new(config.ai.clone(), ai_transport)
            .with_cache(StateCache::in_dir(&dir, AI_CACHE_FILE))
            .with_clock(clock.clone())
            .with_events(sender.clone());
        let dashboard =
            DashboardSyncManager::new(config.dashboard.clone(), config.project_id.clone(), dashboard_transport)
                .with_cache(StateCache::in_dir(&dir, DASHBOARD_CACHE_FILE))
                .with_clock(clock.clone())
                .with_events(sender);

        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        let inner = Inner {
            agents: AgentRegistry::default(),
            directives: DirectiveQueue::default(),
            log: VecDeque::new(),
            last_full_sync: None,
            last_health: None,
            quota_alerted_until: None,
            started_at: clock.now(),
            dirty: false,
        };

        Self {
            config: config.orchestrator,
            ai: Arc::new(ai),
            dashboard: Arc::new(dashboard),
            cache: StateCache::in_dir(&dir, ORCHESTRATOR_CACHE_FILE),
            clock,
            events_rx: tokio::sync::Mutex::new(rx),
            broadcast,
            inner: Mutex::new(inner),
            tick_lock: tokio::sync::Mutex::new(()),
            shutdown: Shutdown::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn ai(&self) -> &Arc<AiSyncManager> {
        &self.ai
    }

    pub fn dashboard(&self) -> &Arc<DashboardSyncManager> {
        &self.dashboard
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Reload all three caches. Unreadable caches are logged and skipped.
    pub fn restore(&self) {
        match self.ai.restore() {
            Ok(count) => debug!(count, "AI queue restored"),
            Err(e) => warn!(error = %e, "Could not restore AI state"),
        }
        match self.dashboard.restore() {
            Ok(count) => debug!(count, "Dashboard queue restored"),
            Err(e) => warn!(error = %e, "Could not restore dashboard state"),
        }

        match self.cache.load() {
            Ok(Some(saved)) => {
                let mut state = self.state();
                state.agents = AgentRegistry::from_agents(saved.agents);
                state.directives = DirectiveQueue::from_directives(saved.directives);
                state.last_full_sync = saved.last_full_sync;
                state.last_health = saved.last_health;
                info!(
                    agents = state.agents.len(),
                    directives = state.directives.len(),
                    "Restored orchestrator state"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not restore orchestrator state"),
        }
    }

    /// Restore, run one combined sync, then start the periodic loops.
    pub async fn initialize(self: &Arc<Self>) {
        if self.shutdown.is_triggered() {
            warn!("Orchestrator already shut down, not restarting");
            return;
        }
        if !self.lock_loops().is_empty() {
            warn!("Orchestrator already initialized");
            return;
        }

        self.restore();
        self.sync_all().await;
        self.tick().await;

        let handles = vec![
            spawn_loop(
                Arc::clone(&self.ai),
                self.ai.config().tick_interval(),
                Some(self.ai.wake_handle()),
                self.shutdown.subscribe(),
            ),
            spawn_loop(
                Arc::clone(&self.dashboard),
                self.dashboard.config().tick_interval(),
                Some(self.dashboard.wake_handle()),
                self.shutdown.subscribe(),
            ),
            spawn_loop(
                Arc::clone(self),
                self.config.tick_interval(),
                None,
                self.shutdown.subscribe(),
            ),
        ];
        self.lock_loops().extend(handles);
        info!("Orchestrator initialized");
    }

    /// Stop every loop between ticks, flush once more and persist.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.trigger();

        let handles = std::mem::take(&mut *self.lock_loops());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Loop task ended abnormally");
            }
        }

        self.sync_all().await;
        self.ai.persist();
        self.dashboard.persist();
        self.persist();

        let unsaved = self.unsaved();
        if unsaved.is_empty() {
            info!("Orchestrator stopped");
        } else {
            warn!(components = ?unsaved, "Orchestrator stopped with unsaved state");
        }
    }

    fn lock_loops(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Immediate resync of both managers.
    pub async fn sync_all(&self) {
        let (ai, dashboard) = tokio::join!(self.ai.tick(), self.dashboard.flush_all());
        info!(
            ai_online = ai.online,
            ai_completed = ai.completed,
            dashboard_endpoint = dashboard.endpoint.as_deref().unwrap_or("none"),
            dashboard_synced = dashboard.synced,
            "Full sync"
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.broadcast.subscribe()
    }

    fn announce(&self, event: OrchestratorEvent) {
        // No subscribers is fine
        let _ = self.broadcast.send(event);
    }

    fn record(&self, kind: &str, detail: String) {
        let at = self.clock.now();
        let mut state = self.state();
        state.log.push_back(LogEntry {
            at,
            kind: kind.to_string(),
            detail,
        });
        while state.log.len() > self.config.event_log_limit {
            state.log.pop_front();
        }
    }

    pub fn event_log(&self) -> Vec<LogEntry> {
        self.state().log.iter().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Façade
    // ─────────────────────────────────────────────────────────────────────────

    pub fn dispatch_to_ai(
        &self,
        command_type: CommandType,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid> {
        self.record("dispatch_to_ai", format!("{command_type} priority={priority}"));
        self.ai.dispatch(command_type, payload, priority)
    }

    pub fn push_to_dashboard(
        &self,
        update_type: UpdateType,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid> {
        self.record("push_to_dashboard", format!("{update_type} priority={priority}"));
        self.dashboard.push(update_type, payload, priority)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Agents & Directives
    // ─────────────────────────────────────────────────────────────────────────

    pub fn register_agent(&self, id: &str, status: &str) -> Result<Agent> {
        if id.trim().is_empty() {
            return Err(SyncError::InvalidPayload("agent id must not be empty".to_string()));
        }
        let now = self.clock.now();
        let agent = {
            let mut state = self.state();
            let agent = state.agents.register(id, status, now);
            self.persist_locked(&mut state);
            agent
        };
        self.record("agent_registered", format!("{id} status={status}"));
        info!(agent_id = %id, status = %status, "Agent registered");
        Ok(agent)
    }

    pub fn heartbeat(&self, id: &str, status: Option<&str>) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state();
        state.agents.heartbeat(id, status, now)?;
        self.persist_locked(&mut state);
        Ok(())
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.state().agents.list()
    }

    pub fn add_directive(
        &self,
        agent_id: &str,
        directive: &str,
        parameters: serde_json::Value,
        priority: Priority,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Uuid> {
        if agent_id.trim().is_empty() || directive.trim().is_empty() {
            return Err(SyncError::InvalidPayload(
                "directive needs an agent id and a directive".to_string(),
            ));
        }

        let directive = Directive {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            directive: directive.to_string(),
            parameters,
            priority,
            deadline,
            created_at: self.clock.now(),
            issued: false,
        };
        let id = directive.id;
        self.record(
            "directive_added",
            format!("{} for {agent_id} priority={priority}", directive.directive),
        );

        let mut state = self.state();
        state.directives.add(directive);
        self.persist_locked(&mut state);
        Ok(id)
    }

    pub fn complete_directive(&self, id: &Uuid) -> Result<Directive> {
        let mut state = self.state();
        let directive = state.directives.complete(id)?;
        self.persist_locked(&mut state);
        Ok(directive)
    }

    pub fn directives_for(&self, agent_id: &str) -> Vec<Directive> {
        self.state().directives.for_agent(agent_id)
    }

    fn maintain_directives(&self, now: DateTime<Utc>) {
        let (expired, issued) = {
            let mut state = self.state();
            (
                state.directives.prune_expired(now),
                state.directives.take_unissued_critical(),
            )
        };

        for directive in expired {
            debug!(directive_id = %directive.id, agent_id = %directive.agent_id, "Directive expired");
            self.record("directive_expired", directive.id.to_string());
            self.announce(OrchestratorEvent::DirectiveExpired(directive));
        }
        for directive in issued {
            info!(directive_id = %directive.id, agent_id = %directive.agent_id, "Critical directive issued");
            self.record("directive_issued", directive.id.to_string());
            self.announce(OrchestratorEvent::DirectiveIssued(directive));
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────────────────

    /// Drain manager events, maintain directives, recompute health.
    pub async fn tick(&self) -> HealthReport {
        let _tick = self.tick_lock.lock().await;

        let drained = {
            let mut rx = self.events_rx.lock().await;
            events::drain(&mut rx)
        };

        let mut force_sync = false;
        for event in drained {
            self.record(
                event.name(),
                serde_json::to_string(&event).unwrap_or_default(),
            );
            force_sync |= self.handle_event(&event);
            self.announce(OrchestratorEvent::Sync(event));
        }
        if force_sync {
            info!("Forced resync requested by operator");
            self.sync_all().await;
        }

        let now = self.clock.now();
        self.maintain_directives(now);

        let (report, last_full_sync) = self.compute_health(now);
        {
            let mut state = self.state();
            state.last_full_sync = last_full_sync;
            state.last_health = Some(report.clone());
        }
        if report.status == HealthStatus::Healthy {
            debug!(score = report.score, "Health computed");
        } else {
            warn!(
                score = report.score,
                status = %report.status,
                alerts = ?report.alerts,
                "Health degraded"
            );
        }

        {
            let mut state = self.state();
            self.persist_locked(&mut state);
        }
        self.announce(OrchestratorEvent::HealthUpdated(report.clone()));

        if self.config.push_status_snapshots {
            match serde_json::to_value(&report) {
                Ok(payload) => self.propagate(UpdateType::Status, payload, Priority::Normal),
                Err(e) => warn!(error = %e, "Failed to encode status snapshot"),
            }
        }
        report
    }

    /// Score the current state. Read-only: the caller decides whether to
    /// keep the report and the derived `last_full_sync`.
    fn compute_health(&self, now: DateTime<Utc>) -> (HealthReport, Option<DateTime<Utc>>) {
        let ai = self.ai.summary();
        let dashboard = self.dashboard.summary();
        let connected = dashboard.link_state.is_connected();

        let state = self.state();
        let last_full_sync = state.last_full_sync.max(unified_sync(&ai, &dashboard));
        let since = now - last_full_sync.unwrap_or(state.started_at);

        let inputs = HealthInputs {
            ai_online: ai.online,
            dashboard_connected: connected,
            ai_error_rate: ai.error_rate,
            quota_utilization: ai.quota_utilization,
            ai_queue_depth: ai.queue_depth,
            dashboard_queue_depth: dashboard.queue_depth,
            since_last_sync_secs: since.num_seconds().max(0),
            stale_agents: state.agents.stale(
                now,
                Duration::seconds(self.config.agent_stale_after_secs as i64),
            ),
        };
        (assess(&inputs, &self.config, now), last_full_sync)
    }

    /// Last computed health report.
    pub fn health(&self) -> Option<HealthReport> {
        self.state().last_health.clone()
    }

    /// Fresh combined view. Does not touch the stored health.
    pub fn status(&self) -> UnifiedStatus {
        let (health, _) = self.compute_health(self.clock.now());
        let state = self.state();
        UnifiedStatus {
            health,
            ai: self.ai.summary(),
            dashboard: self.dashboard.summary(),
            agents: state.agents.list(),
            directives: state.directives.all().to_vec(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cross-propagation
    // ─────────────────────────────────────────────────────────────────────────

    /// React to one manager event. Returns `true` when a forced resync was
    /// requested.
    fn handle_event(&self, event: &SyncEvent) -> bool {
        match event {
            SyncEvent::CommandFailed {
                id,
                command_type,
                priority,
                attempts,
                error,
            } => {
                self.propagate(
                    UpdateType::Alert,
                    serde_json::json!({
                        "kind": "command_failed",
                        "commandId": id,
                        "commandType": command_type,
                        "priority": priority,
                        "attempts": attempts,
                        "error": error,
                    }),
                    Priority::High,
                );
                false
            }
            SyncEvent::CommandAttemptFailed {
                id,
                command_type,
                attempt,
                error,
            } => {
                self.propagate(
                    UpdateType::Log,
                    serde_json::json!({
                        "level": "warn",
                        "kind": "command_retry",
                        "commandId": id,
                        "commandType": command_type,
                        "attempt": attempt,
                        "error": error,
                    }),
                    Priority::Low,
                );
                false
            }
            SyncEvent::QuotaExceeded {
                used,
                limit,
                resets_at,
            } => {
                let first = {
                    let mut state = self.state();
                    let first = state.quota_alerted_until != Some(*resets_at);
                    state.quota_alerted_until = Some(*resets_at);
                    first
                };
                if first {
                    self.propagate(
                        UpdateType::Alert,
                        serde_json::json!({
                            "kind": "quota_exceeded",
                            "used": used,
                            "limit": limit,
                            "resetsAt": resets_at,
                        }),
                        Priority::High,
                    );
                }
                false
            }
            SyncEvent::InboundCommand(command) => self.handle_inbound(command),
            _ => false,
        }
    }

    fn handle_inbound(&self, command: &InboundCommand) -> bool {
        let kind = command.command_type.trim().to_lowercase().replace('_', "-");
        match kind.as_str() {
            "dispatch-to-ai" => {
                match self.inbound_dispatch(command) {
                    Ok(id) => {
                        info!(inbound_id = %command.id, command_id = %id, "Inbound command dispatched to AI");
                        self.record("inbound_dispatch", format!("{} -> {id}", command.id));
                    }
                    Err(e) => self.reject_inbound(command, &e),
                }
                false
            }
            "force-sync" => {
                self.record("inbound_force_sync", command.id.clone());
                true
            }
            "directive" => {
                match self.inbound_directive(command) {
                    Ok(id) => debug!(inbound_id = %command.id, directive_id = %id, "Inbound directive queued"),
                    Err(e) => self.reject_inbound(command, &e),
                }
                false
            }
            _ => {
                debug!(inbound_id = %command.id, command_type = %command.command_type, "Rebroadcasting inbound command");
                self.announce(OrchestratorEvent::InboundCommand(command.clone()));
                false
            }
        }
    }

    fn inbound_dispatch(&self, command: &InboundCommand) -> Result<Uuid> {
        let request: AiDispatchRequest = serde_json::from_value(command.payload.clone())
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
        let priority = parse_priority(request.priority.as_deref())?;
        self.ai
            .dispatch_named(&request.command_type, request.payload, priority)
    }

    fn inbound_directive(&self, command: &InboundCommand) -> Result<Uuid> {
        let request: DirectiveRequest = serde_json::from_value(command.payload.clone())
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
        let priority = parse_priority(request.priority.as_deref())?;
        self.add_directive(
            &request.agent_id,
            &request.directive,
            request.parameters,
            priority,
            request.deadline,
        )
    }

    fn reject_inbound(&self, command: &InboundCommand, error: &SyncError) {
        warn!(inbound_id = %command.id, error = %error, "Inbound command rejected");
        self.propagate(
            UpdateType::Alert,
            serde_json::json!({
                "kind": "inbound_rejected",
                "commandId": command.id,
                "type": command.command_type,
                "error": error.to_string(),
            }),
            Priority::Normal,
        );
    }

    fn propagate(&self, update_type: UpdateType, payload: serde_json::Value, priority: Priority) {
        if let Err(e) = self.dashboard.push(update_type, payload, priority) {
            warn!(error = %e, update_type = %update_type, "Failed to propagate to dashboard");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    fn persist_locked(&self, state: &mut Inner) {
        match self.cache.save(&state.snapshot()) {
            Ok(()) => state.dirty = false,
            Err(e) => {
                warn!(error = %e, "Failed to persist orchestrator state, retrying next tick");
                state.dirty = true;
            }
        }
    }

    pub fn persist(&self) {
        let mut state = self.state();
        self.persist_locked(&mut state);
    }

    /// Whether the last cache write failed.
    pub fn needs_persist(&self) -> bool {
        self.state().dirty
    }

    /// Components whose last cache write failed.
    pub fn unsaved(&self) -> Vec<&'static str> {
        [
            ("ai", self.ai.needs_persist()),
            ("dashboard", self.dashboard.needs_persist()),
            ("orchestrator", self.needs_persist()),
        ]
        .into_iter()
        .filter_map(|(name, dirty)| dirty.then_some(name))
        .collect()
    }
}

#[async_trait]
impl Tickable for Orchestrator {
    fn name(&self) -> &'static str {
        "orchestrator"
    }

    async fn tick(&self) {
        Orchestrator::tick(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::transport::fake::{FakeAi, FakeDashboard};
    use crate::types::CommandStatus;
    use tempfile::TempDir;

    const PRIMARY: &str = "https://dash.example.com";

    struct Harness {
        orch: Arc<Orchestrator>,
        ai: Arc<FakeAi>,
        dash: Arc<FakeDashboard>,
        clock: Arc<ManualClock>,
        dir: TempDir,
    }

    fn config_in(dir: &TempDir) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.state_dir = dir.path().to_path_buf();
        config.dashboard.primary_url = PRIMARY.to_string();
        config.orchestrator.push_status_snapshots = false;
        config
    }

    fn harness(tweak: impl FnOnce(&mut SyncConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        tweak(&mut config);

        let ai = FakeAi::new();
        let dash = FakeDashboard::new();
        let clock = ManualClock::starting_now();
        let orch = Arc::new(Orchestrator::with_clock(
            config,
            ai.clone(),
            dash.clone(),
            clock.clone(),
        ));
        Harness {
            orch,
            ai,
            dash,
            clock,
            dir,
        }
    }

    fn inbound(id: &str, kind: &str, payload: serde_json::Value) -> InboundCommand {
        InboundCommand {
            id: id.to_string(),
            command_type: kind.to_string(),
            payload,
            created_at: None,
        }
    }

    fn drain_broadcast(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_stale_agent_alert_names_agent() {
        let h = harness(|_| {});
        h.orch.register_agent("agent-7", "idle").unwrap();

        let report = h.orch.tick().await;
        assert!(!report.alerts.iter().any(|a| a.contains("agent-7")));

        h.clock.advance(chrono::Duration::seconds(121));
        let report = h.orch.tick().await;
        assert!(report.alerts.iter().any(|a| a.contains("agent-7")));
        assert_eq!(report.stale_agents[0].id, "agent-7");
        assert_eq!(h.orch.agents().len(), 1);

        h.orch.heartbeat("agent-7", Some("busy")).unwrap();
        let report = h.orch.tick().await;
        assert!(report.stale_agents.is_empty());
    }

    #[tokio::test]
    async fn test_healthy_after_full_sync() {
        let h = harness(|_| {});
        h.orch.sync_all().await;
        let report = h.orch.tick().await;

        assert_eq!(report.score, 100);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.alerts.is_empty());
        assert_eq!(h.orch.health(), Some(report));
    }

    #[tokio::test]
    async fn test_both_services_offline_is_critical() {
        let h = harness(|_| {});
        h.ai.set_down(true);
        h.dash.set_down(PRIMARY, true);

        h.orch.sync_all().await;
        let report = h.orch.tick().await;
        assert_eq!(report.score, 100 - AI_OFFLINE_PENALTY - DASHBOARD_OFFLINE_PENALTY);
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.alerts.len(), 2);

        // Long outage adds the staleness penalty on top
        h.clock.advance(chrono::Duration::seconds(1_000));
        let later = h.orch.tick().await;
        assert!(later.score < report.score);
    }

    #[tokio::test]
    async fn test_full_sync_needs_accepted_flush() {
        let h = harness(|_| {});
        h.orch.sync_all().await;
        let stored = h.orch.tick().await;
        let critical = OrchestratorConfig::default().stale_sync_critical_secs as i64;
        let is_stale = |report: &HealthReport| {
            report.alerts.iter().any(|a| a.contains("critically stale"))
        };

        // Both services answer but every batch is refused
        h.dash.set_reject_sends(true);
        h.orch
            .push_to_dashboard(UpdateType::Log, serde_json::json!({}), Priority::Normal)
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(critical + 1));
        h.orch.sync_all().await;

        let fresh = h.orch.status().health;
        assert!(is_stale(&fresh));
        assert_eq!(h.orch.health(), Some(stored));

        let report = h.orch.tick().await;
        assert!(is_stale(&report));

        h.dash.set_reject_sends(false);
        h.orch.sync_all().await;
        let report = h.orch.tick().await;
        assert!(!is_stale(&report));
        assert_eq!(h.orch.health(), Some(report));
    }

    #[tokio::test]
    async fn test_ai_failures_propagate_to_dashboard() {
        let h = harness(|c| c.ai.max_retries = 1);
        h.ai.set_always_fail(true);
        h.orch
            .dispatch_to_ai(CommandType::Execute, serde_json::json!({}), Priority::Normal)
            .unwrap();

        h.orch.ai().tick().await;
        h.orch.tick().await;
        let pending = h.orch.dashboard().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].update_type, UpdateType::Log);
        assert_eq!(pending[0].priority, Priority::Low);

        h.orch.ai().tick().await;
        h.orch.tick().await;
        let alert = h
            .orch
            .dashboard()
            .pending()
            .into_iter()
            .find(|u| u.update_type == UpdateType::Alert)
            .unwrap();
        assert_eq!(alert.priority, Priority::High);
        assert_eq!(alert.payload["kind"], "command_failed");
        assert_eq!(alert.payload["attempts"], 2);
    }

    #[tokio::test]
    async fn test_inbound_dispatch_to_ai() {
        let h = harness(|_| {});
        h.dash.queue_inbound(inbound(
            "op-1",
            "dispatch-to-AI",
            serde_json::json!({
                "type": "analyze",
                "payload": { "path": "src" },
                "priority": "critical",
            }),
        ));

        h.orch.dashboard().tick().await;
        h.orch.tick().await;

        let pending = h.orch.ai().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_type, CommandType::Analyze);
        assert_eq!(pending[0].priority, Priority::Critical);
        assert_eq!(pending[0].payload["path"], "src");
    }

    #[tokio::test]
    async fn test_bad_inbound_dispatch_is_reported_not_queued() {
        let h = harness(|_| {});
        h.dash.queue_inbound(inbound(
            "op-2",
            "dispatch-to-ai",
            serde_json::json!({ "type": "teleport" }),
        ));

        h.orch.dashboard().tick().await;
        h.orch.tick().await;

        assert!(h.orch.ai().pending().is_empty());
        let pending = h.orch.dashboard().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["kind"], "inbound_rejected");
    }

    #[tokio::test]
    async fn test_force_sync_flushes_both_managers() {
        let h = harness(|c| c.dashboard.batch_size = 1);
        let updates: Vec<Uuid> = (0..3)
            .map(|i| {
                h.orch
                    .push_to_dashboard(UpdateType::Metric, serde_json::json!({ "i": i }), Priority::Normal)
                    .unwrap()
            })
            .collect();
        let command = h
            .orch
            .dispatch_to_ai(CommandType::Optimize, serde_json::json!({}), Priority::Normal)
            .unwrap();
        h.dash
            .queue_inbound(inbound("op-3", "force-sync", serde_json::Value::Null));

        // One batch of one, plus the inbound poll
        h.orch.dashboard().tick().await;
        assert_eq!(h.orch.dashboard().queue_depth(), 2);

        h.orch.tick().await;
        for id in updates {
            assert!(h.orch.dashboard().status(&id).unwrap().synced);
        }
        assert_eq!(
            h.orch.ai().status(&command).unwrap().status,
            CommandStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_inbound_directive_and_rebroadcast() {
        let h = harness(|_| {});
        let mut rx = h.orch.subscribe();
        h.dash.queue_inbound(inbound(
            "op-4",
            "directive",
            serde_json::json!({
                "agentId": "a1",
                "directive": "pause",
                "priority": "critical",
            }),
        ));
        h.dash
            .queue_inbound(inbound("op-5", "open-pr", serde_json::json!({ "branch": "x" })));

        h.orch.dashboard().tick().await;
        h.orch.tick().await;

        let directives = h.orch.directives_for("a1");
        assert_eq!(directives.len(), 1);
        assert!(directives[0].issued);

        let events = drain_broadcast(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::DirectiveIssued(d) if d.directive == "pause"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::InboundCommand(c) if c.command_type == "open-pr"
        )));
        assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::HealthUpdated(_))));

        // Issued once only
        h.orch.tick().await;
        let again = drain_broadcast(&mut rx);
        assert!(!again
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::DirectiveIssued(_))));
    }

    #[tokio::test]
    async fn test_expired_directives_are_dropped() {
        let h = harness(|_| {});
        let mut rx = h.orch.subscribe();
        let deadline = h.clock.now() + chrono::Duration::seconds(10);
        let id = h
            .orch
            .add_directive("a1", "compact", serde_json::json!({}), Priority::Normal, Some(deadline))
            .unwrap();
        let keep = h
            .orch
            .add_directive("a1", "report", serde_json::json!({}), Priority::Low, None)
            .unwrap();

        h.clock.advance(chrono::Duration::seconds(11));
        h.orch.tick().await;

        let remaining: Vec<Uuid> = h.orch.directives_for("a1").iter().map(|d| d.id).collect();
        assert_eq!(remaining, vec![keep]);
        assert!(drain_broadcast(&mut rx).iter().any(|e| matches!(
            e,
            OrchestratorEvent::DirectiveExpired(d) if d.id == id
        )));

        h.orch.complete_directive(&keep).unwrap();
        assert!(h.orch.directives_for("a1").is_empty());
        assert!(h.orch.complete_directive(&keep).is_err());
    }

    #[tokio::test]
    async fn test_status_snapshot_pushed_each_tick() {
        let h = harness(|c| c.orchestrator.push_status_snapshots = true);
        h.orch.tick().await;

        let pending = h.orch.dashboard().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].update_type, UpdateType::Status);
        assert!(pending[0].payload.get("score").is_some());
    }

    #[tokio::test]
    async fn test_quota_alert_pushed_once_per_window() {
        let h = harness(|c| c.ai.daily_quota = 1);
        for _ in 0..3 {
            h.orch
                .dispatch_to_ai(CommandType::Generate, serde_json::json!({}), Priority::Normal)
                .unwrap();
        }
        h.orch.ai().tick().await;
        h.orch
            .dispatch_to_ai(CommandType::Generate, serde_json::json!({}), Priority::Normal)
            .unwrap();
        h.orch.tick().await;

        let alerts = h
            .orch
            .dashboard()
            .pending()
            .into_iter()
            .filter(|u| u.payload["kind"] == "quota_exceeded")
            .count();
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_restart_restores_everything() {
        let h = harness(|_| {});
        h.ai.set_down(true);
        h.dash.set_down(PRIMARY, true);

        h.orch.register_agent("a1", "idle").unwrap();
        h.orch
            .add_directive("a1", "pause", serde_json::json!({}), Priority::High, None)
            .unwrap();
        let command = h
            .orch
            .dispatch_to_ai(CommandType::Monitor, serde_json::json!({}), Priority::High)
            .unwrap();
        let update = h
            .orch
            .push_to_dashboard(UpdateType::Log, serde_json::json!({}), Priority::Low)
            .unwrap();
        h.orch.sync_all().await;

        let restarted = Orchestrator::with_clock(
            config_in(&h.dir),
            h.ai.clone(),
            h.dash.clone(),
            h.clock.clone(),
        );
        restarted.restore();

        assert_eq!(restarted.agents()[0].id, "a1");
        assert_eq!(restarted.directives_for("a1").len(), 1);
        assert_eq!(restarted.ai().pending()[0].id, command);
        assert_eq!(restarted.dashboard().pending()[0].id, update);
    }

    #[tokio::test]
    async fn test_initialize_then_shutdown_flushes_and_persists() {
        let h = harness(|_| {});
        h.orch.initialize().await;
        assert!(h.orch.health().is_some());

        let command = h
            .orch
            .dispatch_to_ai(CommandType::Analyze, serde_json::json!({}), Priority::Low)
            .unwrap();
        h.orch.shutdown().await;

        assert_eq!(
            h.orch.ai().status(&command).unwrap().status,
            CommandStatus::Completed
        );
        for file in [AI_CACHE_FILE, DASHBOARD_CACHE_FILE, ORCHESTRATOR_CACHE_FILE] {
            assert!(h.dir.path().join(file).exists(), "{file} missing");
        }
        assert!(h.orch.unsaved().is_empty());

        // A stopped orchestrator stays stopped
        h.orch.initialize().await;
        assert!(h.orch.lock_loops().is_empty());
    }

    #[tokio::test]
    async fn test_failed_cache_writes_are_reported() {
        let h = harness(|config| {
            // A regular file where the state directory should be
            let blocker = config.state_dir.join("blocker");
            std::fs::write(&blocker, "x").unwrap();
            config.state_dir = blocker.join("state");
        });
        assert!(h.orch.unsaved().is_empty());

        h.orch
            .dispatch_to_ai(CommandType::Analyze, serde_json::json!({}), Priority::Low)
            .unwrap();
        h.orch
            .push_to_dashboard(UpdateType::Log, serde_json::json!({}), Priority::Low)
            .unwrap();
        h.orch.tick().await;

        assert_eq!(h.orch.unsaved(), vec!["ai", "dashboard", "orchestrator"]);
    }

    #[tokio::test]
    async fn test_facade_calls_are_logged() {
        let h = harness(|c| c.orchestrator.event_log_limit = 2);
        h.orch
            .dispatch_to_ai(CommandType::Analyze, serde_json::json!({}), Priority::Low)
            .unwrap();
        h.orch
            .push_to_dashboard(UpdateType::Log, serde_json::json!({}), Priority::Low)
            .unwrap();
        h.orch.register_agent("a1", "idle").unwrap();

        let kinds: Vec<String> = h.orch.event_log().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["push_to_dashboard", "agent_registered"]);
    }

    #[test]
    fn test_parse_priority_defaults_to_normal() {
        assert_eq!(parse_priority(None).unwrap(), Priority::Normal);
        assert_eq!(parse_priority(Some("HIGH")).unwrap(), Priority::High);
        assert!(parse_priority(Some("urgent")).is_err());
    }
}
