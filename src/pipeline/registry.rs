//! Per-request state of live pipelines and records of finished ones.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::request::{PipelineRequest, PipelineStatus};
use super::tier::Tier;
use crate::quality::QualityReport;
use crate::state_machine::StateMachine;

/// Everything the runner tracks for one live request, in one entry.
#[derive(Debug)]
struct ActivePipeline {
    request: PipelineRequest,
    machine: StateMachine<PipelineStatus>,
    cancel: CancellationToken,
    tier: Option<Tier>,
    agents: Vec<String>,
    started_at: DateTime<Utc>,
}

/// Queryable snapshot of a pipeline, live or finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub request_id: String,
    pub branch: String,
    pub base_branch: String,
    pub status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub agents: Vec<String>,
    /// Set when the run was ended by `stop`.
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<QualityReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRecord {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub(crate) enum Termination {
    Approved(QualityReport),
    Failed(QualityReport),
    Stopped(Option<QualityReport>),
    Errored(String),
}

/// Terminal outcome class of a run, as counted in statistics and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineOutcome {
    Approved,
    Failed,
    Stopped,
    Error,
}

impl PipelineOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineOutcome::Approved => "approved",
            PipelineOutcome::Failed => "failed",
            PipelineOutcome::Stopped => "stopped",
            PipelineOutcome::Error => "error",
        }
    }
}

impl Termination {
    pub(crate) fn outcome(&self) -> PipelineOutcome {
        match self {
            Termination::Approved(_) => PipelineOutcome::Approved,
            Termination::Failed(_) => PipelineOutcome::Failed,
            Termination::Stopped(_) => PipelineOutcome::Stopped,
            Termination::Errored(_) => PipelineOutcome::Error,
        }
    }

    pub(crate) fn status(&self) -> PipelineStatus {
        match self {
            Termination::Approved(_) => PipelineStatus::Approved,
            Termination::Failed(_) | Termination::Stopped(_) => PipelineStatus::Failed,
            Termination::Errored(_) => PipelineStatus::Error,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    active: HashMap<String, ActivePipeline>,
    finished: HashMap<String, PipelineRecord>,
    /// Finished ids, oldest first.
    finished_order: VecDeque<String>,
}

/// Records of finished pipelines kept by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Owns the state of every pipeline request, keyed by request id.
///
/// The lock is never held across an await. At most `history_limit`
/// terminal records are kept; the oldest are dropped first.
#[derive(Debug)]
pub struct PipelineRegistry {
    inner: Mutex<RegistryInner>,
    history_limit: usize,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            history_limit: history_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a live pipeline in `accepted`.
    ///
    /// Returns `None` when a pipeline with the same id is already live. A
    /// finished record with the same id is replaced once the new run ends.
    pub(crate) fn register(&self, request: PipelineRequest) -> Option<CancellationToken> {
        let mut inner = self.lock();
        if inner.active.contains_key(&request.request_id) {
            return None;
        }
        let cancel = CancellationToken::new();
        let id = request.request_id.clone();
        let machine = StateMachine::new(PipelineStatus::Accepted, id.clone());
        inner.active.insert(
            id,
            ActivePipeline {
                request,
                machine,
                cancel: cancel.clone(),
                tier: None,
                agents: Vec::new(),
                started_at: Utc::now(),
            },
        );
        Some(cancel)
    }

    /// Attempts a transition of a live pipeline; rejections are logged.
    pub(crate) fn advance(&self, request_id: &str, to: PipelineStatus) -> bool {
        let mut inner = self.lock();
        match inner.active.get_mut(request_id) {
            Some(entry) => entry.machine.try_transition(to),
            None => {
                warn!(request_id = %request_id, to = %to, "Transition on unknown pipeline");
                false
            }
        }
    }

    pub(crate) fn set_tier(&self, request_id: &str, tier: Tier) {
        if let Some(entry) = self.lock().active.get_mut(request_id) {
            entry.tier = Some(tier);
        }
    }

    pub(crate) fn set_agents(&self, request_id: &str, agents: &[String]) {
        if let Some(entry) = self.lock().active.get_mut(request_id) {
            entry.agents = agents.to_vec();
        }
    }

    /// Moves a live pipeline to its terminal record.
    ///
    /// The FSM is forced toward the termination's state; an illegal move is
    /// logged and the record keeps the state the machine actually reached.
    pub(crate) fn finish(&self, request_id: &str, termination: Termination) -> Option<PipelineRecord> {
        let mut inner = self.lock();
        let mut entry = inner.active.remove(request_id)?;
        entry.machine.try_transition(termination.status());

        let stopped = matches!(termination, Termination::Stopped(_));
        let (report, error) = match termination {
            Termination::Approved(report) | Termination::Failed(report) => (Some(report), None),
            Termination::Stopped(report) => (report, None),
            Termination::Errored(message) => (None, Some(message)),
        };

        let record = PipelineRecord {
            request_id: request_id.to_string(),
            branch: entry.request.branch,
            base_branch: entry.request.base_branch,
            status: entry.machine.current(),
            tier: entry.tier,
            agents: entry.agents,
            stopped,
            report,
            error,
            started_at: entry.started_at,
            finished_at: Some(Utc::now()),
        };
        inner.finished_order.retain(|id| id != request_id);
        inner.finished_order.push_back(request_id.to_string());
        inner
            .finished
            .insert(request_id.to_string(), record.clone());
        while inner.finished_order.len() > self.history_limit {
            if let Some(oldest) = inner.finished_order.pop_front() {
                inner.finished.remove(&oldest);
            }
        }
        Some(record)
    }

    /// Fires the cancellation token of a live pipeline.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.lock().active.get(request_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Fires every live token; returns how many were fired.
    pub fn cancel_all(&self) -> usize {
        let inner = self.lock();
        for entry in inner.active.values() {
            entry.cancel.cancel();
        }
        inner.active.len()
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        self.lock().active.contains_key(request_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current snapshot of a live pipeline, or its terminal record.
    pub fn status(&self, request_id: &str) -> Option<PipelineRecord> {
        let inner = self.lock();
        if let Some(entry) = inner.active.get(request_id) {
            return Some(PipelineRecord {
                request_id: request_id.to_string(),
                branch: entry.request.branch.clone(),
                base_branch: entry.request.base_branch.clone(),
                status: entry.machine.current(),
                tier: entry.tier,
                agents: entry.agents.clone(),
                stopped: entry.cancel.is_cancelled(),
                report: None,
                error: None,
                started_at: entry.started_at,
                finished_at: None,
            });
        }
        inner.finished.get(request_id).cloned()
    }
}
