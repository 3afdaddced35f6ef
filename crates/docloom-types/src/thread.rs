//! Thread, work item and ledger types.
//!
//! A `Thread` is the durable, idempotent container for one unit of intent.
//! `WorkItem`s are the executable attempts inside it, and `LedgerEntry`s form
//! the append-only audit trail of what was sent, returned, parsed and mutated.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scope and target references
// ---------------------------------------------------------------------------

/// Tenancy scope a thread or document belongs to (e.g. `project:P1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpaceRef {
    pub space_type: String,
    pub space_id: String,
}

impl SpaceRef {
    pub fn new(space_type: impl Into<String>, space_id: impl Into<String>) -> Self {
        Self {
            space_type: space_type.into(),
            space_id: space_id.into(),
        }
    }
}

impl fmt::Display for SpaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space_type, self.space_id)
    }
}

/// What a thread operates on (e.g. `story_backlog:E7`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub target_type: String,
    pub target_id: String,
}

impl TargetRef {
    pub fn new(target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            target_id: target_id.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_type, self.target_id)
    }
}

/// Deterministic key identifying "the same logical request".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key from operation, scope and target.
    ///
    /// Renders `{operation}:{space_type}:{space_id}:{target_type}:{target_id}`.
    pub fn derive(operation: &str, space: &SpaceRef, target: &TargetRef) -> Self {
        Self(format!("{operation}:{space}:{target}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdempotencyKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl ThreadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadStatus::Complete | ThreadStatus::Failed)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadStatus::Pending => write!(f, "PENDING"),
            ThreadStatus::Running => write!(f, "RUNNING"),
            ThreadStatus::Complete => write!(f, "COMPLETE"),
            ThreadStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Durable container of one unit of user/system intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub kind: String,
    pub space: SpaceRef,
    pub target: TargetRef,
    pub idempotency_key: IdempotencyKey,
    pub status: ThreadStatus,
    /// Set for fan-out children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<Uuid>,
    pub created_by: String,
    /// Reason recorded when the thread failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Parameters for `get_or_create_thread`.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub kind: String,
    pub space: SpaceRef,
    pub target: TargetRef,
    pub idempotency_key: IdempotencyKey,
    pub parent_thread_id: Option<Uuid>,
    pub created_by: String,
}

impl NewThread {
    /// Build a thread request whose key is derived from `operation`, scope and target.
    pub fn derived(
        operation: &str,
        space: SpaceRef,
        target: TargetRef,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            kind: operation.to_string(),
            idempotency_key: IdempotencyKey::derive(operation, &space, &target),
            space,
            target,
            parent_thread_id: None,
            created_by: created_by.into(),
        }
    }

    pub fn with_parent(mut self, parent_thread_id: Uuid) -> Self {
        self.parent_thread_id = Some(parent_thread_id);
        self
    }

    /// Materialize a fresh `PENDING` thread.
    pub fn into_thread(self) -> Thread {
        Thread {
            id: Uuid::now_v7(),
            kind: self.kind,
            space: self.space,
            target: self.target,
            idempotency_key: self.idempotency_key,
            status: ThreadStatus::Pending,
            parent_thread_id: self.parent_thread_id,
            created_by: self.created_by,
            failure_reason: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }
}

/// Aggregate of child-thread statuses under one parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadChildSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
}

impl ThreadChildSummary {
    pub fn from_statuses(statuses: impl IntoIterator<Item = ThreadStatus>) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            summary.total += 1;
            match status {
                ThreadStatus::Pending => summary.pending += 1,
                ThreadStatus::Running => summary.running += 1,
                ThreadStatus::Complete => summary.complete += 1,
                ThreadStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Work item
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Created,
    Claimed,
    Running,
    Applied,
    Failed,
}

impl WorkItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemStatus::Applied | WorkItemStatus::Failed)
    }

    /// Statuses a work item may move to `self` from.
    ///
    /// Transitions are monotonic; `Failed` is reachable from any non-terminal state.
    pub fn allowed_from(self) -> &'static [WorkItemStatus] {
        match self {
            WorkItemStatus::Created => &[],
            WorkItemStatus::Claimed => &[WorkItemStatus::Created],
            WorkItemStatus::Running => &[WorkItemStatus::Claimed],
            WorkItemStatus::Applied => &[WorkItemStatus::Running],
            WorkItemStatus::Failed => &[
                WorkItemStatus::Created,
                WorkItemStatus::Claimed,
                WorkItemStatus::Running,
            ],
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItemStatus::Created => write!(f, "created"),
            WorkItemStatus::Claimed => write!(f, "claimed"),
            WorkItemStatus::Running => write!(f, "running"),
            WorkItemStatus::Applied => write!(f, "applied"),
            WorkItemStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One executable attempt within a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub thread_id: Uuid,
    /// 1-based, strictly increasing per thread.
    pub sequence: u32,
    /// Advisory label naming the resource being mutated.
    pub lock_scope: String,
    pub status: WorkItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Kind of audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    Prompt,
    Response,
    ParseReport,
    MutationReport,
    Error,
}

impl fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerEntryType::Prompt => write!(f, "PROMPT"),
            LedgerEntryType::Response => write!(f, "RESPONSE"),
            LedgerEntryType::ParseReport => write!(f, "PARSE_REPORT"),
            LedgerEntryType::MutationReport => write!(f, "MUTATION_REPORT"),
            LedgerEntryType::Error => write!(f, "ERROR"),
        }
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub thread_id: Uuid,
    /// `None` for thread-level errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<Uuid>,
    pub entry_type: LedgerEntryType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        thread_id: Uuid,
        work_item_id: Option<Uuid>,
        entry_type: LedgerEntryType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            thread_id,
            work_item_id,
            entry_type,
            payload,
            created_at: Utc::now(),
        }
    }
}
