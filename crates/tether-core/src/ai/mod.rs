//! AI Command Sync Manager.
//!
//! Holds the ordered queue of outbound commands for the AI service. Callers
//! enqueue synchronously; the periodic tick probes the service, takes a
//! bounded batch in priority order, executes it under the daily quota and
//! applies the results once the whole batch has run.
//!
//! The queue lives behind a std mutex that is never held across an
//! `.await`. A separate async lock serializes ticks, so a dispatch that
//! lands while a batch is in flight is simply picked up by the next tick.

mod metrics;
mod quota;

pub use metrics::{AiMetrics, ERROR_WINDOW};
pub use quota::{QuotaWindow, window_length};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::StateCache;
use crate::clock::{SharedClock, system_clock};
use crate::config::AiConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventSender, SyncEvent};
use crate::queue::WorkQueue;
use crate::scheduler::Tickable;
use crate::transport::AiTransport;
use crate::types::{Command, CommandStatus, CommandType, Priority};

/// Persisted AI manager state (`ai-sync.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSyncState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending: Vec<Command>,
    #[serde(default)]
    pub history: Vec<Command>,
    #[serde(default)]
    pub metrics: AiMetrics,
    #[serde(default)]
    pub quota: QuotaWindow,
    #[serde(default)]
    pub next_seq: u64,
}

/// Point-in-time view for the orchestrator and the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiStatus {
    /// `None` until the first probe has run.
    pub online: Option<bool>,
    pub queue_depth: usize,
    pub quota_used: u32,
    pub quota_limit: u32,
    pub quota_utilization: f64,
    pub quota_resets_at: Option<DateTime<Utc>>,
    pub error_rate: f64,
    pub last_sync: Option<DateTime<Utc>>,
    pub metrics: AiMetrics,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AiTickReport {
    pub online: bool,
    pub attempted: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub quota_blocked: bool,
}

struct Inner {
    queue: WorkQueue<Command>,
    history: VecDeque<Command>,
    metrics: AiMetrics,
    quota: QuotaWindow,
    online: Option<bool>,
    last_sync: Option<DateTime<Utc>>,
    dirty: bool,
}

impl Inner {
    fn snapshot(&self) -> AiSyncState {
        AiSyncState {
            last_sync: self.last_sync,
            pending: self.queue.to_vec(),
            history: self.history.iter().cloned().collect(),
            metrics: self.metrics.clone(),
            quota: self.quota.clone(),
            next_seq: self.queue.peek_seq(),
        }
    }
}

fn push_history(history: &mut VecDeque<Command>, command: Command, limit: usize) {
    history.push_back(command);
    while history.len() > limit {
        history.pop_front();
    }
}

fn validate_payload(payload: serde_json::Value) -> Result<serde_json::Value> {
    match payload {
        serde_json::Value::Null => Ok(serde_json::json!({})),
        serde_json::Value::Object(_) => Ok(payload),
        other => Err(SyncError::InvalidPayload(format!(
            "command payload must be a JSON object, got {other}"
        ))),
    }
}

/// Outbound command queue toward the AI service.
pub struct AiSyncManager {
    config: AiConfig,
    transport: Arc<dyn AiTransport>,
    cache: Option<StateCache<AiSyncState>>,
    clock: SharedClock,
    events: EventSender,
    inner: Mutex<Inner>,
    tick_lock: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
}

impl AiSyncManager {
    pub fn new(config: AiConfig, transport: Arc<dyn AiTransport>) -> Self {
        let inner = Inner {
            queue: WorkQueue::new(config.queue_cap),
            history: VecDeque::new(),
            metrics: AiMetrics::default(),
            quota: QuotaWindow::default(),
            online: None,
            last_sync: None,
            dirty: false,
        };

        Self {
            config,
            transport,
            cache: None,
            clock: system_clock(),
            events: EventSender::disconnected(),
            inner: Mutex::new(inner),
            tick_lock: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_cache(mut self, cache: StateCache<AiSyncState>) -> Self {
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

    /// Reload queue, history, metrics and quota from the cache.
    ///
    /// Commands caught mid-flight (`processing`) go back to `pending`.
    /// Returns the number of pending commands restored.
    pub fn restore(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let Some(saved) = cache.load()? else {
            return Ok(0);
        };

        let (pending, finished): (Vec<Command>, Vec<Command>) = saved
            .pending
            .into_iter()
            .partition(|c| !c.status.is_terminal());
        let pending = pending.into_iter().map(|mut command| {
            if command.status == CommandStatus::Processing {
                command.status = CommandStatus::Pending;
            }
            command
        });

        let mut state = self.state();
        state.queue = WorkQueue::restore(self.config.queue_cap, pending, saved.next_seq);
        state.history = VecDeque::new();
        for command in saved.history.into_iter().chain(finished) {
            push_history(&mut state.history, command, self.config.history_limit);
        }
        state.metrics = saved.metrics;
        state.quota = saved.quota;
        state.last_sync = saved.last_sync;

        let restored = state.queue.len();
        info!(restored, path = %cache.path().display(), "Restored AI command queue");
        Ok(restored)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue a command and persist. Never touches the network.
    pub fn dispatch(
        &self,
        command_type: CommandType,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid> {
        let payload = validate_payload(payload)?;
        let now = self.clock.now();

        let mut state = self.state();
        let seq = state.queue.next_seq();
        let command = Command::new(command_type, payload, priority, now, seq);
        let id = command.id;

        // Commands in flight belong to the running tick
        let evicted = state
            .queue
            .push_except(command, |c| c.status == CommandStatus::Processing);
        state.metrics.dispatched += 1;
        for dropped in evicted {
            self.retire_evicted(&mut state, dropped, now);
        }

        debug!(
            command_id = %id,
            command_type = %command_type,
            priority = %priority,
            queue_depth = state.queue.len(),
            "Command queued"
        );

        if state.quota.is_exhausted(self.config.daily_quota, now) {
            self.emit_quota_exceeded(&state.quota, now);
        }

        let wake = priority == Priority::Critical && state.online == Some(true);
        self.persist_locked(&mut state);
        drop(state);

        if wake {
            self.wake.notify_one();
        }
        Ok(id)
    }

    /// String entry point; unknown names are rejected before anything is stored.
    pub fn dispatch_named(
        &self,
        type_name: &str,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid> {
        let command_type: CommandType = type_name.parse()?;
        self.dispatch(command_type, payload, priority)
    }

    fn retire_evicted(&self, state: &mut Inner, mut command: Command, now: DateTime<Utc>) {
        command.status = CommandStatus::Failed;
        command.finished_at = Some(now);
        command.last_error = Some("evicted on queue overflow".to_string());
        state.metrics.failed += 1;

        warn!(command_id = %command.id, priority = %command.priority, "Command evicted on overflow");
        self.events.emit(SyncEvent::CommandFailed {
            id: command.id,
            command_type: command.command_type,
            priority: command.priority,
            attempts: command.retry_count,
            error: "evicted on queue overflow".to_string(),
        });
        push_history(&mut state.history, command, self.config.history_limit);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Look a command up in the pending set, then in history.
    pub fn status(&self, id: &Uuid) -> Option<Command> {
        let state = self.state();
        state
            .queue
            .get(id)
            .cloned()
            .or_else(|| state.history.iter().rev().find(|c| &c.id == id).cloned())
    }

    /// Pending commands in processing order.
    pub fn pending(&self) -> Vec<Command> {
        self.state().queue.to_vec()
    }

    pub fn history(&self) -> Vec<Command> {
        self.state().history.iter().cloned().collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_online(&self) -> Option<bool> {
        self.state().online
    }

    pub fn summary(&self) -> AiStatus {
        let now = self.clock.now();
        let state = self.state();
        AiStatus {
            online: state.online,
            queue_depth: state.queue.len(),
            quota_used: state.quota.used_at(now),
            quota_limit: self.config.daily_quota,
            quota_utilization: state.quota.utilization(self.config.daily_quota, now),
            quota_resets_at: state.quota.resets_at(),
            error_rate: state.metrics.error_rate(),
            last_sync: state.last_sync,
            metrics: state.metrics.clone(),
        }
    }

    /// Notified when a critical command wants an out-of-band tick.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn config(&self) -> &AiConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────────────────

    /// One synchronization pass. Failures end up in events and metrics.
    pub async fn tick(&self) -> AiTickReport {
        let _tick = self.tick_lock.lock().await;
        let mut report = AiTickReport::default();

        {
            let mut state = self.state();
            if state.dirty {
                self.persist_locked(&mut state);
            }
        }

        let online = match tokio::time::timeout(self.config.probe_timeout(), self.transport.health())
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "AI health probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.config.probe_timeout_ms, "AI health probe timed out");
                false
            }
        };
        report.online = online;
        self.set_online(online);
        if !online {
            return report;
        }

        let batch: Vec<Command> = {
            let mut state = self.state();
            let batch = state
                .queue
                .snapshot(self.config.batch_size, |c| c.status == CommandStatus::Pending);
            for command in &batch {
                if let Some(queued) = state.queue.get_mut(&command.id) {
                    queued.status = CommandStatus::Processing;
                }
            }
            if !batch.is_empty() {
                self.persist_locked(&mut state);
            }
            batch
        };

        let mut outcomes: Vec<(Uuid, Result<serde_json::Value>, u64)> =
            Vec::with_capacity(batch.len());
        for command in &batch {
            let allowed = self
                .state()
                .quota
                .try_consume(self.config.daily_quota, self.clock.now());
            if !allowed {
                report.quota_blocked = true;
                break;
            }

            let started = Instant::now();
            let result = match tokio::time::timeout(
                self.config.request_timeout(),
                self.transport.execute(command.command_type, &command.payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::timeout(self.config.request_timeout())),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            if matches!(result, Err(SyncError::QuotaExceeded { .. })) {
                self.state()
                    .quota
                    .mark_exhausted(self.config.daily_quota, self.clock.now());
                report.quota_blocked = true;
                break;
            }
            outcomes.push((command.id, result, latency_ms));
        }
        report.attempted = outcomes.len();

        let now = self.clock.now();
        let mut state = self.state();
        let inner = &mut *state;

        for (id, result, latency_ms) in outcomes {
            inner.metrics.record_attempt(result.is_err(), latency_ms);
            let Some(command) = inner.queue.get_mut(&id) else {
                continue;
            };

            match result {
                Ok(response) => {
                    command.status = CommandStatus::Completed;
                    command.response = Some(response.clone());
                    command.last_error = None;
                    command.finished_at = Some(now);
                    let command_type = command.command_type;

                    inner.metrics.completed += 1;
                    report.completed += 1;
                    self.events.emit(SyncEvent::CommandCompleted {
                        id,
                        command_type,
                        response,
                    });
                    if let Some(done) = inner.queue.remove(&id) {
                        push_history(&mut inner.history, done, self.config.history_limit);
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    command.retry_count += 1;
                    command.last_error = Some(error.clone());
                    let attempts = command.retry_count;
                    let command_type = command.command_type;
                    let priority = command.priority;

                    if attempts > self.config.max_retries {
                        command.status = CommandStatus::Failed;
                        command.finished_at = Some(now);
                        inner.metrics.failed += 1;
                        report.failed += 1;

                        warn!(command_id = %id, attempts, error = %error, "Command failed permanently");
                        self.events.emit(SyncEvent::CommandFailed {
                            id,
                            command_type,
                            priority,
                            attempts,
                            error,
                        });
                        if let Some(done) = inner.queue.remove(&id) {
                            push_history(&mut inner.history, done, self.config.history_limit);
                        }
                    } else {
                        command.status = CommandStatus::Pending;
                        report.retried += 1;

                        debug!(command_id = %id, attempt = attempts, error = %error, "Command attempt failed");
                        self.events.emit(SyncEvent::CommandAttemptFailed {
                            id,
                            command_type,
                            attempt: attempts,
                            error,
                        });
                    }
                }
            }
        }

        // Anything left unattempted (quota) goes back to the queue untouched.
        for command in &batch {
            if let Some(queued) = inner.queue.get_mut(&command.id) {
                if queued.status == CommandStatus::Processing {
                    queued.status = CommandStatus::Pending;
                }
            }
        }

        if report.quota_blocked {
            warn!(
                used = inner.quota.used_at(now),
                limit = self.config.daily_quota,
                "AI daily quota exhausted"
            );
            self.emit_quota_exceeded(&inner.quota, now);
        }

        if report.completed > 0 {
            inner.last_sync = Some(now);
        }
        inner.metrics.last_successful_tick = Some(now);
        self.persist_locked(inner);

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                remaining = inner.queue.len(),
                "AI sync tick"
            );
        }
        report
    }

    fn set_online(&self, online: bool) {
        let previous = self.state().online.replace(online);
        if previous == Some(online) {
            return;
        }
        if online {
            info!("AI service reachable");
        } else {
            warn!("AI service unreachable, commands stay queued");
        }
        self.events.emit(SyncEvent::AiConnectivityChanged { online });
    }

    fn emit_quota_exceeded(&self, quota: &QuotaWindow, now: DateTime<Utc>) {
        self.events.emit(SyncEvent::QuotaExceeded {
            used: quota.used_at(now),
            limit: self.config.daily_quota,
            resets_at: quota.resets_at().unwrap_or(now + window_length()),
        });
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
                warn!(error = %e, "Failed to persist AI state, retrying next tick");
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
impl Tickable for AiSyncManager {
    fn name(&self) -> &'static str {
        "ai-sync"
    }

    async fn tick(&self) {
        AiSyncManager::tick(self).await;
    }
}
