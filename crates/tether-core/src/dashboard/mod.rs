//! Dashboard Sync Manager.
//!
//! Buffers outbound telemetry in a bounded priority queue and keeps a
//! sticky connection to the first healthy endpoint (primary, then
//! secondary, then fallback). Each tick re-validates the link, flushes one
//! batch as a single request and polls for operator commands.
//!
//! Pushes never touch the network, so callers keep working while every
//! endpoint is down.

mod endpoints;

pub use endpoints::{EndpointSet, LinkState};

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::StateCache;
use crate::clock::{SharedClock, system_clock};
use crate::config::DashboardConfig;
use crate::error::{Result, SyncError};
use crate::events::{DropReason, EventSender, SyncEvent};
use crate::queue::WorkQueue;
use crate::scheduler::Tickable;
use crate::transport::{DashboardTransport, UpdateBatch};
use crate::types::{Endpoint, Priority, Update, UpdateType};

/// Dashboard counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardMetrics {
    pub pushed: u64,
    pub synced: u64,
    pub dropped: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub inbound: u64,
}

/// Persisted dashboard manager state (`dashboard-sync.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSyncState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending: Vec<Update>,
    #[serde(default)]
    pub history: Vec<Update>,
    #[serde(default)]
    pub metrics: DashboardMetrics,
    #[serde(default)]
    pub next_seq: u64,
}

/// Point-in-time view for the orchestrator and the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStatus {
    pub link_state: LinkState,
    pub active_endpoint: Option<Endpoint>,
    pub queue_depth: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_poll: Option<DateTime<Utc>>,
    /// Last pass where every batch was accepted and the poll succeeded.
    pub last_clean_pass: Option<DateTime<Utc>>,
    pub metrics: DashboardMetrics,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardTickReport {
    pub endpoint: Option<String>,
    pub synced: usize,
    pub failed_batches: usize,
    pub dropped: usize,
    pub inbound: usize,
}

struct Inner {
    queue: WorkQueue<Update>,
    history: VecDeque<Update>,
    endpoints: EndpointSet,
    metrics: DashboardMetrics,
    last_sync: Option<DateTime<Utc>>,
    last_poll: Option<DateTime<Utc>>,
    last_clean_pass: Option<DateTime<Utc>>,
    offline_announced: bool,
    /// Members of the batch currently being sent.
    in_flight: HashSet<Uuid>,
    dirty: bool,
}

impl Inner {
    fn snapshot(&self) -> DashboardSyncState {
        DashboardSyncState {
            last_sync: self.last_sync,
            last_poll: self.last_poll,
            pending: self.queue.to_vec(),
            history: self.history.iter().cloned().collect(),
            metrics: self.metrics.clone(),
            next_seq: self.queue.peek_seq(),
        }
    }
}

fn push_history(history: &mut VecDeque<Update>, update: Update, limit: usize) {
    history.push_back(update);
    while history.len() > limit {
        history.pop_front();
    }
}

/// Outbound update queue toward the dashboard.
pub struct DashboardSyncManager {
    config: DashboardConfig,
    project_id: String,
    transport: Arc<dyn DashboardTransport>,
    cache: Option<StateCache<DashboardSyncState>>,
    clock: SharedClock,
    events: EventSender,
    inner: Mutex<Inner>,
    tick_lock: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
}

impl DashboardSyncManager {
    pub fn new(
        config: DashboardConfig,
        project_id: impl Into<String>,
        transport: Arc<dyn DashboardTransport>,
    ) -> Self {
        let inner = Inner {
            queue: WorkQueue::new(config.queue_cap),
            history: VecDeque::new(),
            endpoints: EndpointSet::new(config.endpoints()),
            metrics: DashboardMetrics::default(),
            last_sync: None,
            last_poll: None,
            last_clean_pass: None,
            offline_announced: false,
            in_flight: HashSet::new(),
            dirty: false,
        };

        Self {
            config,
            project_id: project_id.into(),
            transport,
            cache: None,
            clock: system_clock(),
            events: EventSender::disconnected(),
            inner: Mutex::new(inner),
            tick_lock: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_cache(mut self, cache: StateCache<DashboardSyncState>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload unsynced updates, history and poll cursor from the cache.
    pub fn restore(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let Some(saved) = cache.load()? else {
            return Ok(0);
        };

        let pending = saved.pending.into_iter().filter(|u| !u.synced);

        let mut state = self.state();
        state.queue = WorkQueue::restore(self.config.queue_cap, pending, saved.next_seq);
        state.history = VecDeque::new();
        for update in saved.history {
            push_history(&mut state.history, update, self.config.history_limit);
        }
        state.metrics = saved.metrics;
        state.last_sync = saved.last_sync;
        state.last_poll = saved.last_poll;

        let restored = state.queue.len();
        info!(restored, path = %cache.path().display(), "Restored dashboard update queue");
        Ok(restored)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue an update and persist. Critical updates request an
    /// immediate pass (which also re-probes when offline).
    pub fn push(
        &self,
        update_type: UpdateType,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid> {
        let now = self.clock.now();

        let mut guard = self.state();
        let state = &mut *guard;
        let seq = state.queue.next_seq();
        let update = Update::new(update_type, payload, priority, now, seq);
        let id = update.id;

        let in_flight = &state.in_flight;
        let evicted = state
            .queue
            .push_except(update, |u| in_flight.contains(&u.id));
        state.metrics.pushed += 1;
        for dropped in evicted {
            self.retire_dropped(state, dropped, DropReason::Evicted);
        }

        debug!(
            update_id = %id,
            update_type = %update_type,
            priority = %priority,
            queue_depth = state.queue.len(),
            "Update queued"
        );
        self.persist_locked(state);
        drop(guard);

        if priority == Priority::Critical {
            self.wake.notify_one();
        }
        Ok(id)
    }

    /// String entry point; unknown names are rejected before anything is stored.
    pub fn push_named(
        &self,
        type_name: &str,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid> {
        let update_type: UpdateType = type_name.parse()?;
        self.push(update_type, payload, priority)
    }

    fn retire_dropped(&self, state: &mut Inner, update: Update, reason: DropReason) {
        state.metrics.dropped += 1;
        warn!(
            update_id = %update.id,
            priority = %update.priority,
            attempts = update.attempts,
            ?reason,
            "Update dropped"
        );
        self.events.emit(SyncEvent::UpdateDropped {
            id: update.id,
            priority: update.priority,
            reason,
        });
        push_history(&mut state.history, update, self.config.history_limit);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self, id: &Uuid) -> Option<Update> {
        let state = self.state();
        state
            .queue
            .get(id)
            .cloned()
            .or_else(|| state.history.iter().rev().find(|u| &u.id == id).cloned())
    }

    /// Unsynced updates in flush order.
    pub fn pending(&self) -> Vec<Update> {
        self.state().queue.to_vec()
    }

    pub fn queue_depth(&self) -> usize {
        self.state().queue.len()
    }

    pub fn active_endpoint(&self) -> Option<Endpoint> {
        self.state().endpoints.active().cloned()
    }

    pub fn link_state(&self) -> LinkState {
        self.state().endpoints.state()
    }

    pub fn summary(&self) -> DashboardStatus {
        let state = self.state();
        DashboardStatus {
            link_state: state.endpoints.state(),
            active_endpoint: state.endpoints.active().cloned(),
            queue_depth: state.queue.len(),
            last_sync: state.last_sync,
            last_poll: state.last_poll,
            last_clean_pass: state.last_clean_pass,
            metrics: state.metrics.clone(),
        }
    }

    /// Notified when a critical update wants an out-of-band pass.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────────────────

    /// Re-validate the link, flush one batch, poll inbound commands.
    pub async fn tick(&self) -> DashboardTickReport {
        let _tick = self.tick_lock.lock().await;
        self.run_pass(false).await
    }

    /// Like [`tick`](Self::tick) but keeps flushing batches until the queue
    /// is empty or a batch fails. Used for forced resyncs and shutdown.
    pub async fn flush_all(&self) -> DashboardTickReport {
        let _tick = self.tick_lock.lock().await;
        self.run_pass(true).await
    }

    /// Poll inbound commands from the active endpoint only.
    pub async fn pull_inbound(&self) -> Result<usize> {
        let _tick = self.tick_lock.lock().await;
        let endpoint = self
            .active_endpoint()
            .ok_or_else(|| SyncError::Unreachable("no active dashboard endpoint".to_string()))?;
        self.poll_inbound(&endpoint).await
    }

    async fn run_pass(&self, drain: bool) -> DashboardTickReport {
        let mut report = DashboardTickReport::default();

        {
            let mut state = self.state();
            if state.dirty {
                self.persist_locked(&mut state);
            }
        }

        let Some(endpoint) = self.ensure_endpoint().await else {
            return report;
        };
        report.endpoint = Some(endpoint.url.clone());

        let max_rounds = if drain {
            self.queue_depth() / self.config.batch_size.max(1) + 1
        } else {
            1
        };
        for _ in 0..max_rounds {
            if !self.flush_batch(&endpoint, &mut report).await {
                break;
            }
        }

        match self.poll_inbound(&endpoint).await {
            Ok(count) => {
                report.inbound = count;
                if report.failed_batches == 0 {
                    self.state().last_clean_pass = Some(self.clock.now());
                }
            }
            Err(e) => debug!(endpoint = %endpoint.url, error = %e, "Inbound poll failed"),
        }

        report
    }

    async fn probe(&self, endpoint: &Endpoint) -> bool {
        match tokio::time::timeout(self.config.probe_timeout(), self.transport.health(endpoint))
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint.url, error = %e, "Endpoint probe failed");
                false
            }
            Err(_) => {
                debug!(endpoint = %endpoint.url, "Endpoint probe timed out");
                false
            }
        }
    }

    /// Keep the sticky endpoint if it still answers; otherwise walk the
    /// candidates from the primary. A sticky endpoint that fails its probe
    /// costs this tick: selection restarts on the next one.
    async fn ensure_endpoint(&self) -> Option<Endpoint> {
        let active = self.state().endpoints.active().cloned();
        if let Some(endpoint) = active {
            if self.probe(&endpoint).await {
                return Some(endpoint);
            }
            let mut state = self.state();
            if let Some(lost) = state.endpoints.disconnect() {
                state.offline_announced = false;
                warn!(endpoint = %lost.url, role = %lost.role, "Dashboard endpoint lost");
                self.events.emit(SyncEvent::EndpointLost {
                    url: lost.url,
                    role: lost.role,
                });
            }
            return None;
        }

        let candidates = self.state().endpoints.candidates().to_vec();
        for (index, endpoint) in candidates.iter().enumerate() {
            self.state().endpoints.probing(index);
            if self.probe(endpoint).await {
                let mut state = self.state();
                state.endpoints.connect(index);
                state.offline_announced = false;
                info!(endpoint = %endpoint.url, role = %endpoint.role, "Dashboard endpoint connected");
                self.events.emit(SyncEvent::EndpointConnected {
                    url: endpoint.url.clone(),
                    role: endpoint.role,
                });
                return Some(endpoint.clone());
            }
        }

        let mut state = self.state();
        state.endpoints.disconnect();
        if !state.offline_announced {
            state.offline_announced = true;
            warn!(
                candidates = candidates.len(),
                queued = state.queue.len(),
                "All dashboard endpoints unreachable, buffering updates"
            );
            self.events.emit(SyncEvent::DashboardOffline);
        }
        None
    }

    /// Send one batch. Returns `true` when a non-empty batch was accepted.
    async fn flush_batch(&self, endpoint: &Endpoint, report: &mut DashboardTickReport) -> bool {
        let batch = {
            let mut state = self.state();
            let batch = state.queue.snapshot(self.config.batch_size, |u| !u.synced);
            state.in_flight = batch.iter().map(|u| u.id).collect();
            batch
        };
        if batch.is_empty() {
            return false;
        }

        let payload = UpdateBatch {
            updates: batch.clone(),
            project_id: self.project_id.clone(),
            timestamp: self.clock.now().timestamp_millis(),
        };
        let result = match tokio::time::timeout(
            self.config.request_timeout(),
            self.transport.send_updates(endpoint, &payload),
        )
        .await
        {
            Ok(Ok(ack)) if ack.success => Ok(()),
            Ok(Ok(_)) => Err(SyncError::Protocol("endpoint rejected batch".to_string())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::timeout(self.config.request_timeout())),
        };

        let now = self.clock.now();
        let mut state = self.state();
        let inner = &mut *state;
        inner.in_flight.clear();

        let accepted = match result {
            Ok(()) => {
                let mut synced_count = 0;
                for update in &batch {
                    if let Some(mut synced) = inner.queue.remove(&update.id) {
                        synced.synced = true;
                        synced.last_error = None;
                        push_history(&mut inner.history, synced, self.config.history_limit);
                        synced_count += 1;
                    }
                }
                inner.last_sync = Some(now);
                inner.metrics.synced += synced_count as u64;
                inner.metrics.batches_sent += 1;
                report.synced += synced_count;

                debug!(endpoint = %endpoint.url, synced = synced_count, "Update batch synced");
                self.events.emit(SyncEvent::SyncComplete {
                    synced: synced_count,
                    endpoint: endpoint.url.clone(),
                });
                true
            }
            Err(e) => {
                let error = e.to_string();
                inner.metrics.batches_failed += 1;
                report.failed_batches += 1;

                for update in &batch {
                    let exhausted = match inner.queue.get_mut(&update.id) {
                        Some(queued) => {
                            queued.attempts += 1;
                            queued.last_error = Some(error.clone());
                            queued.attempts > self.config.max_retries
                        }
                        None => false,
                    };
                    if exhausted {
                        if let Some(dropped) = inner.queue.remove(&update.id) {
                            report.dropped += 1;
                            self.retire_dropped(inner, dropped, DropReason::RetriesExhausted);
                        }
                    }
                }

                warn!(endpoint = %endpoint.url, batch = batch.len(), error = %error, "Update batch failed");
                self.events.emit(SyncEvent::SyncFailed {
                    batch: batch.len(),
                    error,
                });
                false
            }
        };

        self.persist_locked(inner);
        accepted
    }

    async fn poll_inbound(&self, endpoint: &Endpoint) -> Result<usize> {
        let since = self.state().last_poll;
        let started = self.clock.now();

        let commands = match tokio::time::timeout(
            self.config.request_timeout(),
            self.transport
                .poll_commands(endpoint, &self.project_id, since),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::timeout(self.config.request_timeout())),
        };

        let count = commands.len();
        let mut state = self.state();
        state.last_poll = Some(started);
        state.metrics.inbound += count as u64;
        for command in commands {
            debug!(command_id = %command.id, command_type = %command.command_type, "Inbound command");
            self.events.emit(SyncEvent::InboundCommand(command));
        }
        self.persist_locked(&mut state);
        Ok(count)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    fn persist_locked(&self, state: &mut Inner) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.save(&state.snapshot()) {
            Ok(()) => state.dirty = false,
            Err(e) => {
                warn!(error = %e, "Failed to persist dashboard state, retrying next tick");
                state.dirty = true;
            }
        }
    }

    /// Write the current state now.
    pub fn persist(&self) {
        let mut state = self.state();
        self.persist_locked(&mut state);
    }

    /// Whether the last cache write failed.
    pub fn needs_persist(&self) -> bool {
        self.state().dirty
    }
}

#[async_trait]
impl Tickable for DashboardSyncManager {
    fn name(&self) -> &'static str {
        "dashboard-sync"
    }

    async fn tick(&self) {
        DashboardSyncManager::tick(self).await;
    }
}
