//! In-memory table of multi-expert interactions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::dispatch::types::SkippedExpert;
use crate::experts::ExpertResponse;

/// Overall state of one collaboration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationStatus {
    InProgress,
    Completed,
    Failed,
}

impl CollaborationStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for CollaborationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// How a single expert call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertOutcome {
    Pending,
    Succeeded,
    TimedOut,
    Failed,
}

/// Per-expert bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct ExpertSlot {
    pub outcome: ExpertOutcome,
    pub response: Option<ExpertResponse>,
    pub error: Option<String>,
    pub elapsed_ms: Option<u64>,
}

impl ExpertSlot {
    fn pending() -> Self {
        Self {
            outcome: ExpertOutcome::Pending,
            response: None,
            error: None,
            elapsed_ms: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.outcome != ExpertOutcome::Pending
    }
}

/// One end-to-end multi-expert interaction.
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationState {
    pub interaction_id: Uuid,
    pub correlation_id: String,
    pub tenant_id: String,
    pub question: String,
    /// Experts named by the analysis, as requested.
    pub required_experts: Vec<String>,
    /// Dispatched experts by canonical name.
    pub experts: BTreeMap<String, ExpertSlot>,
    pub skipped: Vec<SkippedExpert>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: CollaborationStatus,
    pub error: Option<String>,
}

impl CollaborationState {
    pub fn new(
        correlation_id: impl Into<String>,
        tenant_id: impl Into<String>,
        question: impl Into<String>,
        required_experts: Vec<String>,
    ) -> Self {
        Self {
            interaction_id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            tenant_id: tenant_id.into(),
            question: question.into(),
            required_experts,
            experts: BTreeMap::new(),
            skipped: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            status: CollaborationStatus::InProgress,
            error: None,
        }
    }

    /// Use a caller-chosen interaction id.
    pub fn with_interaction_id(mut self, interaction_id: Uuid) -> Self {
        self.interaction_id = interaction_id;
        self
    }

    pub(crate) fn launch(&mut self, expert: &str) {
        self.experts.insert(expert.to_string(), ExpertSlot::pending());
    }

    pub(crate) fn skip(&mut self, skipped: SkippedExpert) {
        self.skipped.push(skipped);
    }

    pub(crate) fn record_success(&mut self, expert: &str, response: ExpertResponse, elapsed_ms: u64) {
        let slot = self.slot(expert);
        slot.outcome = ExpertOutcome::Succeeded;
        slot.response = Some(response);
        slot.elapsed_ms = Some(elapsed_ms);
    }

    pub(crate) fn record_failure(
        &mut self,
        expert: &str,
        outcome: ExpertOutcome,
        error: String,
        elapsed_ms: u64,
    ) {
        let slot = self.slot(expert);
        slot.outcome = outcome;
        slot.error = Some(error);
        slot.elapsed_ms = Some(elapsed_ms);
    }

    fn slot(&mut self, expert: &str) -> &mut ExpertSlot {
        self.experts
            .entry(expert.to_string())
            .or_insert_with(ExpertSlot::pending)
    }

    /// True once every launched call has settled (vacuously true for none).
    pub fn all_settled(&self) -> bool {
        self.experts.values().all(ExpertSlot::is_settled)
    }

    /// Mark completed. Only valid once every launched call has settled.
    pub(crate) fn complete(&mut self) -> bool {
        if !self.all_settled() {
            return false;
        }
        self.status = CollaborationStatus::Completed;
        self.finished_at = Some(Utc::now());
        true
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        self.status = CollaborationStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Successful responses, in expert-name order.
    pub fn responses(&self) -> impl Iterator<Item = (&str, &ExpertResponse)> {
        self.experts
            .iter()
            .filter_map(|(name, slot)| slot.response.as_ref().map(|r| (name.as_str(), r)))
    }

    pub fn count_outcome(&self, outcome: ExpertOutcome) -> usize {
        self.experts.values().filter(|s| s.outcome == outcome).count()
    }
}

type States = Arc<RwLock<HashMap<Uuid, CollaborationState>>>;

/// Error recorded on a collaboration whose request was dropped mid-dispatch.
pub const CANCELLED: &str = "cancelled before all experts settled";

/// Collaborations owned by one coordinator.
///
/// On every insert, settled entries older than the retention TTL and
/// in-progress entries older than `stale_after` are swept, and the table is
/// capped by evicting the oldest settled entries.
pub struct CollaborationTable {
    states: States,
    retention: RetentionConfig,
}

impl CollaborationTable {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Guard that fails the collaboration if dropped while still armed.
    pub(crate) fn settle_guard(&self, interaction_id: Uuid) -> SettleGuard {
        SettleGuard {
            states: Arc::clone(&self.states),
            interaction_id,
            armed: true,
        }
    }

    /// Mark a collaboration failed, whatever its status. Returns false if it is gone.
    pub(crate) async fn fail(&self, interaction_id: Uuid, error: &str) -> bool {
        self.update(interaction_id, |state| state.fail(error)).await
    }

    pub(crate) async fn insert(&self, state: CollaborationState) {
        let mut states = self.states.write().await;
        states.insert(state.interaction_id, state);
        let evicted = Self::sweep(&mut states, &self.retention, Utc::now());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = states.len(), "Swept collaborations");
        }
    }

    /// Apply `f` to a state. Returns false if it is gone.
    pub(crate) async fn update<F>(&self, interaction_id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut CollaborationState),
    {
        match self.states.write().await.get_mut(&interaction_id) {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }

    /// Snapshot of one collaboration.
    pub async fn get(&self, interaction_id: Uuid) -> Option<CollaborationState> {
        self.states.read().await.get(&interaction_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    /// Number of collaborations in `status`.
    pub async fn count_status(&self, status: CollaborationStatus) -> usize {
        self.states
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .count()
    }

    fn sweep(
        states: &mut HashMap<Uuid, CollaborationState>,
        retention: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> usize {
        let before = states.len();

        let ttl = chrono::Duration::from_std(retention.ttl).ok();
        let stale_after = chrono::Duration::from_std(retention.stale_after).ok();
        states.retain(|_, s| match (s.status.is_settled(), s.finished_at) {
            (true, Some(finished)) => ttl.is_none_or(|ttl| now - finished < ttl),
            _ => stale_after.is_none_or(|stale| now - s.started_at < stale),
        });

        if states.len() > retention.max_entries {
            let mut settled: Vec<(DateTime<Utc>, Uuid)> = states
                .values()
                .filter(|s| s.status.is_settled())
                .map(|s| (s.finished_at.unwrap_or(s.started_at), s.interaction_id))
                .collect();
            settled.sort();
            let excess = states.len() - retention.max_entries;
            for (_, id) in settled.into_iter().take(excess) {
                states.remove(&id);
            }
        }

        before - states.len()
    }
}

/// Fails an in-progress collaboration when its request future is dropped.
pub(crate) struct SettleGuard {
    states: States,
    interaction_id: Uuid,
    armed: bool,
}

impl SettleGuard {
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.interaction_id;
        match self.states.try_write() {
            Ok(mut states) => fail_in_progress(&mut states, id),
            Err(_) => {
                // Lock is busy; settle it from a task instead.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let states = Arc::clone(&self.states);
                    handle.spawn(async move {
                        fail_in_progress(&mut *states.write().await, id);
                    });
                }
            }
        }
    }
}

fn fail_in_progress(states: &mut HashMap<Uuid, CollaborationState>, interaction_id: Uuid) {
    if let Some(state) = states.get_mut(&interaction_id)
        && !state.status.is_settled()
    {
        state.fail(CANCELLED);
        tracing::warn!(interaction_id = %interaction_id, "Collaboration abandoned mid-dispatch");
    }
}
