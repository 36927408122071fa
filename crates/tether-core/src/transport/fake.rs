//! Deterministic in-memory transports for tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{AiTransport, DashboardTransport, SendAck, UpdateBatch};
use crate::error::{Result, SyncError};
use crate::types::{CommandType, Endpoint, InboundCommand, Update};

/// Scripted outcome for one AI execution.
#[derive(Debug, Clone)]
pub enum AiOutcome {
    Ok(serde_json::Value),
    Unreachable,
    Protocol,
    Quota,
}

/// Holds transport calls open until released, to exercise mid-tick races.
#[derive(Debug, Default)]
struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    async fn entered(&self) {
        self.entered.notified().await;
    }

    fn open(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    async fn pass(&self) {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

/// AI service fake: healthy by default, succeeds unless scripted otherwise.
#[derive(Debug, Default)]
pub struct FakeAi {
    down: AtomicBool,
    always_fail: AtomicBool,
    script: Mutex<VecDeque<AiOutcome>>,
    calls: Mutex<Vec<(CommandType, serde_json::Value)>>,
    probes: AtomicUsize,
    gate: Gate,
}

impl FakeAi {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn push_outcome(&self, outcome: AiOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<(CommandType, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Make the next `execute` wait for [`release_execute`](Self::release_execute).
    pub fn hold_execute(&self) {
        self.gate.arm();
    }

    /// Resolves once a held `execute` is in flight.
    pub async fn execute_started(&self) {
        self.gate.entered().await;
    }

    pub fn release_execute(&self) {
        self.gate.open();
    }
}

#[async_trait]
impl AiTransport for FakeAi {
    async fn health(&self) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(SyncError::Unreachable("fake ai down".into()))
        } else {
            Ok(())
        }
    }

    async fn execute(
        &self,
        command_type: CommandType,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.calls
            .lock()
            .unwrap()
            .push((command_type, payload.clone()));
        self.gate.pass().await;

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(SyncError::Unreachable("fake ai failure".into()));
        }

        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            None => Ok(serde_json::json!({ "ok": true, "type": command_type.as_str() })),
            Some(AiOutcome::Ok(value)) => Ok(value),
            Some(AiOutcome::Unreachable) => Err(SyncError::Unreachable("scripted".into())),
            Some(AiOutcome::Protocol) => Err(SyncError::Protocol("scripted".into())),
            Some(AiOutcome::Quota) => Err(SyncError::QuotaExceeded { used: 0, limit: 0 }),
        }
    }
}

/// Dashboard fake with per-endpoint liveness.
#[derive(Debug, Default)]
pub struct FakeDashboard {
    down: Mutex<HashSet<String>>,
    reject_sends: AtomicBool,
    probes: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, Vec<Update>)>>,
    inbound: Mutex<Vec<InboundCommand>>,
    polls: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
    gate: Gate,
}

impl FakeDashboard {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn set_down(&self, url: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    pub fn set_reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    pub fn queue_inbound(&self, command: InboundCommand) {
        self.inbound.lock().unwrap().push(command);
    }

    pub fn probes(&self) -> Vec<String> {
        self.probes.lock().unwrap().clone()
    }

    pub fn clear_probes(&self) {
        self.probes.lock().unwrap().clear();
    }

    pub fn sent(&self) -> Vec<(String, Vec<Update>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn polls(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.polls.lock().unwrap().clone()
    }

    /// Make the next `send_updates` wait for [`release_sends`](Self::release_sends).
    pub fn hold_sends(&self) {
        self.gate.arm();
    }

    /// Resolves once a held `send_updates` is in flight.
    pub async fn send_started(&self) {
        self.gate.entered().await;
    }

    pub fn release_sends(&self) {
        self.gate.open();
    }

    fn is_down(&self, url: &str) -> bool {
        self.down.lock().unwrap().contains(url)
    }
}

#[async_trait]
impl DashboardTransport for FakeDashboard {
    async fn health(&self, endpoint: &Endpoint) -> Result<()> {
        self.probes.lock().unwrap().push(endpoint.url.clone());
        if self.is_down(&endpoint.url) {
            Err(SyncError::Unreachable(format!("{} down", endpoint.url)))
        } else {
            Ok(())
        }
    }

    async fn send_updates(&self, endpoint: &Endpoint, batch: &UpdateBatch) -> Result<SendAck> {
        if self.is_down(&endpoint.url) {
            return Err(SyncError::Unreachable(format!("{} down", endpoint.url)));
        }
        if self.reject_sends.load(Ordering::SeqCst) {
            return Ok(SendAck { success: false });
        }
        self.gate.pass().await;
        self.sent
            .lock()
            .unwrap()
            .push((endpoint.url.clone(), batch.updates.clone()));
        Ok(SendAck { success: true })
    }

    async fn poll_commands(
        &self,
        endpoint: &Endpoint,
        _project_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundCommand>> {
        if self.is_down(&endpoint.url) {
            return Err(SyncError::Unreachable(format!("{} down", endpoint.url)));
        }
        self.polls
            .lock()
            .unwrap()
            .push((endpoint.url.clone(), since));
        Ok(std::mem::take(&mut *self.inbound.lock().unwrap()))
    }
}
