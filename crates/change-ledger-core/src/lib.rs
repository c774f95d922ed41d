use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("tracked entity not found: {0}")]
    EntityNotFound(EntityId),
    #[error("audit entry not found: {0}")]
    AuditNotFound(AuditId),
    #[error("approval request not found: {0}")]
    RequestNotFound(RequestId),
    #[error("version {version_no} not found for entity {entity_id}")]
    VersionNotFound { entity_id: EntityId, version_no: u32 },
    #[error("approval request {0} is not pending")]
    NotPendingApproval(RequestId),
    #[error("audit entry {0} is already finalized")]
    AlreadyFinalized(AuditId),
    #[error("approver {approver} is not assigned to request {request_id}")]
    WrongApprover {
        request_id: RequestId,
        approver: String,
    },
    #[error("approver {0} cannot delegate a request to themselves")]
    SelfDelegation(String),
    #[error("escalation level {level} already at ceiling {ceiling}")]
    MaxLevelExceeded { level: u32, ceiling: u32 },
    #[error("a rejection reason is required")]
    MissingReason,
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("version number conflict for entity {entity_id} at version {version_no}")]
    VersionNumberConflict { entity_id: EntityId, version_no: u32 },
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId(pub Ulid);

impl EntityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AuditId(pub Ulid);

impl AuditId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AuditId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AuditId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SnapshotId(pub Ulid);

impl SnapshotId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub Ulid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    Restored,
    BulkUpdate,
    BulkDelete,
    Import,
    Export,
    Merge,
    Split,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Restored => "restored",
            Self::BulkUpdate => "bulk_update",
            Self::BulkDelete => "bulk_delete",
            Self::Import => "import",
            Self::Export => "export",
            Self::Merge => "merge",
            Self::Split => "split",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "restored" => Some(Self::Restored),
            "bulk_update" => Some(Self::BulkUpdate),
            "bulk_delete" => Some(Self::BulkDelete),
            "import" => Some(Self::Import),
            "export" => Some(Self::Export),
            "merge" => Some(Self::Merge),
            "split" => Some(Self::Split),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
}

impl ApprovalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::AutoApproved => "auto_approved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "auto_approved" => Some(Self::AutoApproved),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::AutoApproved)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalCriteria {
    AllLevelsSequential,
    AnyOneApprover,
    Majority,
}

impl ApprovalCriteria {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllLevelsSequential => "all_levels_sequential",
            Self::AnyOneApprover => "any_one_approver",
            Self::Majority => "majority",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all_levels_sequential" => Some(Self::AllLevelsSequential),
            "any_one_approver" => Some(Self::AnyOneApprover),
            "majority" => Some(Self::Majority),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    Automatic,
    Manual,
    Scheduled,
    Rollback,
    Merge,
}

impl VersionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Rollback => "rollback",
            Self::Merge => "merge",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(Self::Automatic),
            "manual" => Some(Self::Manual),
            "scheduled" => Some(Self::Scheduled),
            "rollback" => Some(Self::Rollback),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Archived,
}

impl EntityStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    Rejected,
    Delegated,
    Escalated,
    Expired,
    Cancelled,
}

impl RequestState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Delegated => "delegated",
            Self::Escalated => "escalated",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "delegated" => Some(Self::Delegated),
            "escalated" => Some(Self::Escalated),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Decision record for one approval request. The tagged representation makes
/// contradictory column combinations (approved and rejected annotations on
/// the same request) unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestOutcome {
    Pending,
    Approved {
        by: String,
        at: OffsetDateTime,
        comments: Option<String>,
    },
    Rejected {
        by: String,
        at: OffsetDateTime,
        reason: String,
    },
    Delegated {
        to: String,
        at: OffsetDateTime,
        reason: Option<String>,
    },
    Escalated {
        to: String,
        at: OffsetDateTime,
        reason: Option<String>,
    },
    Expired {
        at: OffsetDateTime,
    },
    Cancelled {
        at: OffsetDateTime,
        reason: String,
    },
}

impl RequestOutcome {
    #[must_use]
    pub fn state(&self) -> RequestState {
        match self {
            Self::Pending => RequestState::Pending,
            Self::Approved { .. } => RequestState::Approved,
            Self::Rejected { .. } => RequestState::Rejected,
            Self::Delegated { .. } => RequestState::Delegated,
            Self::Escalated { .. } => RequestState::Escalated,
            Self::Expired { .. } => RequestState::Expired,
            Self::Cancelled { .. } => RequestState::Cancelled,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorRef {
    pub user_id: String,
    pub role: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedEntity {
    pub entity_id: EntityId,
    pub name: String,
    pub payload: Value,
    pub current_version: u32,
    pub status: EntityStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub audit_id: AuditId,
    pub entity_id: EntityId,
    pub event_type: EventType,
    pub old_value: Value,
    pub new_value: Value,
    pub changed_fields: Vec<String>,
    pub actor: ActorRef,
    pub request_meta: RequestMeta,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
    pub approval_status: ApprovalStatus,
    pub approval_criteria: ApprovalCriteria,
    pub decided_by: Option<String>,
    pub decided_at: Option<OffsetDateTime>,
    pub decision_reason: Option<String>,
    pub batch_id: Option<String>,
    pub parent_audit_id: Option<AuditId>,
    pub policy_version: u32,
    pub checksum: String,
    pub tags: Vec<String>,
    /// Operation context consumed at commit time (rollback target, merge
    /// sources, conflict count). Empty object for plain attempts.
    pub context: Value,
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionSnapshot {
    pub snapshot_id: SnapshotId,
    pub entity_id: EntityId,
    pub audit_id: AuditId,
    pub version_no: u32,
    pub payload: Value,
    pub checksum: String,
    pub size_bytes: u64,
    pub compressed: bool,
    pub is_current: bool,
    pub version_type: VersionType,
    pub parent_snapshot_id: Option<SnapshotId>,
    pub merge_source_versions: Vec<u32>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub request_id: RequestId,
    pub audit_id: AuditId,
    pub approver: String,
    pub level: u32,
    pub priority: Priority,
    pub outcome: RequestOutcome,
    pub expires_at: OffsetDateTime,
    pub reminder_count: u32,
    pub created_at: OffsetDateTime,
}

/// Input for one attempted mutation of a tracked entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptInput {
    pub entity_id: EntityId,
    pub event_type: EventType,
    pub new_value: Value,
    pub actor: ActorRef,
    pub request_meta: RequestMeta,
    pub tags: Vec<String>,
    pub batch_id: Option<String>,
    pub parent_audit_id: Option<AuditId>,
    pub expected_checksum: Option<String>,
}

impl AttemptInput {
    /// Validates an attempt before it is recorded.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when required fields are missing
    /// or the event type cannot be submitted through this path.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if matches!(self.event_type, EventType::Created) {
            return Err(WorkflowError::Validation(
                "created events are recorded by entity creation, not record_attempt".to_string(),
            ));
        }

        if self.actor.user_id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "actor.user_id MUST be provided for every attempt".to_string(),
            ));
        }

        if self.actor.role.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "actor.role MUST be provided for every attempt".to_string(),
            ));
        }

        if matches!(self.event_type, EventType::BulkUpdate | EventType::BulkDelete)
            && self.batch_id.is_none()
        {
            return Err(WorkflowError::Validation(
                "bulk events require a batch_id".to_string(),
            ));
        }

        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(WorkflowError::Validation(
                "tags MUST be non-empty strings".to_string(),
            ));
        }

        Ok(())
    }
}

/// One approver assignment in a policy's escalation chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApproverLevel {
    pub level: u32,
    pub approver: String,
}

/// Versioned risk classification policy. The event/risk mapping and the
/// approval thresholds live here rather than in code so deployments can tune
/// them without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskPolicy {
    pub policy_version: u32,
    pub event_risk: Vec<(EventType, RiskLevel)>,
    pub protected_fields: Vec<String>,
    pub always_approve_events: Vec<EventType>,
    pub approval_required_min_risk: RiskLevel,
    pub default_criteria: ApprovalCriteria,
    pub default_priority: Priority,
    pub approver_chain: Vec<ApproverLevel>,
    pub max_escalation_level: u32,
    pub normal_expiry_days: i64,
    pub high_expiry_days: i64,
    pub urgent_expiry_days: i64,
    pub reminder_window_fraction: f32,
}

impl RiskPolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            policy_version: 1,
            event_risk: vec![
                (EventType::Created, RiskLevel::Low),
                (EventType::Updated, RiskLevel::Low),
                (EventType::Export, RiskLevel::Low),
                (EventType::Restored, RiskLevel::Medium),
                (EventType::Import, RiskLevel::Medium),
                (EventType::BulkUpdate, RiskLevel::High),
                (EventType::Merge, RiskLevel::High),
                (EventType::Split, RiskLevel::High),
                (EventType::Deleted, RiskLevel::Critical),
                (EventType::BulkDelete, RiskLevel::Critical),
            ],
            protected_fields: Vec::new(),
            always_approve_events: vec![
                EventType::Deleted,
                EventType::BulkDelete,
                EventType::Merge,
                EventType::Split,
            ],
            approval_required_min_risk: RiskLevel::High,
            default_criteria: ApprovalCriteria::AllLevelsSequential,
            default_priority: Priority::Normal,
            approver_chain: vec![ApproverLevel {
                level: 1,
                approver: "approver-1".to_string(),
            }],
            max_escalation_level: 3,
            normal_expiry_days: 30,
            high_expiry_days: 2,
            urgent_expiry_days: 1,
            reminder_window_fraction: 0.2,
        }
    }

    /// Validates policy bounds and the expiry ordering invariant.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Configuration`] when one or more policy
    /// fields are outside allowed bounds.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.policy_version == 0 {
            return Err(WorkflowError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for (event_type, _) in &self.event_risk {
            if !seen.insert(*event_type) {
                return Err(WorkflowError::Configuration(format!(
                    "duplicate event_risk entry for {}",
                    event_type.as_str()
                )));
            }
        }

        if self.approver_chain.is_empty() {
            return Err(WorkflowError::Configuration(
                "approver_chain MUST name at least one approver".to_string(),
            ));
        }

        for (index, entry) in self.approver_chain.iter().enumerate() {
            let expected = u32::try_from(index)
                .map_err(|_| WorkflowError::Configuration("approver_chain too long".to_string()))?
                + 1;
            if entry.level != expected {
                return Err(WorkflowError::Configuration(
                    "approver_chain levels MUST be contiguous starting at 1".to_string(),
                ));
            }
            if entry.approver.trim().is_empty() {
                return Err(WorkflowError::Configuration(
                    "approver_chain entries MUST name an approver".to_string(),
                ));
            }
        }

        if self.max_escalation_level == 0 {
            return Err(WorkflowError::Configuration(
                "max_escalation_level MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("normal_expiry_days", self.normal_expiry_days),
            ("high_expiry_days", self.high_expiry_days),
            ("urgent_expiry_days", self.urgent_expiry_days),
        ] {
            if value <= 0 {
                return Err(WorkflowError::Configuration(format!(
                    "{name} MUST be >= 1"
                )));
            }
        }

        if self.urgent_expiry_days >= self.high_expiry_days
            || self.high_expiry_days >= self.normal_expiry_days
        {
            return Err(WorkflowError::Configuration(
                "expiry windows MUST strictly shrink as priority rises".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.reminder_window_fraction)
            || self.reminder_window_fraction <= 0.0
        {
            return Err(WorkflowError::Configuration(
                "reminder_window_fraction MUST be in (0.0, 1.0)".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Configuration`] when JSON decoding fails or
    /// decoded values violate policy constraints.
    pub fn from_json(value: &Value) -> Result<Self, WorkflowError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            WorkflowError::Configuration(format!("invalid policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    #[must_use]
    pub fn classify_risk(&self, event_type: EventType, changed_fields: &[String]) -> RiskLevel {
        let base = self
            .event_risk
            .iter()
            .find(|(candidate, _)| *candidate == event_type)
            .map_or(RiskLevel::Medium, |(_, risk)| *risk);

        let touches_protected = changed_fields
            .iter()
            .any(|field| self.protected_fields.iter().any(|name| name == field));

        if touches_protected {
            base.max(RiskLevel::High)
        } else {
            base
        }
    }

    #[must_use]
    pub fn requires_approval(&self, event_type: EventType, risk_level: RiskLevel) -> bool {
        risk_level >= self.approval_required_min_risk
            || self.always_approve_events.contains(&event_type)
    }

    #[must_use]
    pub fn expiry_for(&self, priority: Priority, now: OffsetDateTime) -> OffsetDateTime {
        let days = match priority {
            Priority::Low | Priority::Normal => self.normal_expiry_days,
            Priority::High => self.high_expiry_days,
            Priority::Urgent | Priority::Critical => self.urgent_expiry_days,
        };
        now + Duration::days(days)
    }

    #[must_use]
    pub fn approver_for_level(&self, level: u32) -> Option<&str> {
        self.approver_chain
            .iter()
            .find(|entry| entry.level == level)
            .map(|entry| entry.approver.as_str())
    }

    /// Levels to issue requests for when an audit entry first requires
    /// approval. Sequential mode starts at level 1 only; the other modes
    /// issue the whole chain up front.
    #[must_use]
    pub fn initial_levels(&self, criteria: ApprovalCriteria) -> Vec<u32> {
        match criteria {
            ApprovalCriteria::AllLevelsSequential => vec![1],
            ApprovalCriteria::AnyOneApprover | ApprovalCriteria::Majority => {
                self.approver_chain.iter().map(|entry| entry.level).collect()
            }
        }
    }
}

#[must_use]
pub fn majority_reached(approved: usize, issued: usize) -> bool {
    issued > 0 && approved * 2 > issued
}

/// True when a pending request has entered its reminder window but has not
/// yet expired.
#[must_use]
pub fn needs_reminder(request: &ApprovalRequest, fraction: f32, now: OffsetDateTime) -> bool {
    if !request.outcome.is_pending() || now >= request.expires_at {
        return false;
    }

    let total = request.expires_at - request.created_at;
    if total <= Duration::ZERO {
        return false;
    }

    let window = total.as_seconds_f64() * f64::from(fraction);
    let remaining = (request.expires_at - now).as_seconds_f64();
    remaining <= window
}

/// Computes the set of top-level fields whose values differ between two
/// payloads. Object payloads diff by key; map equality is structural, so key
/// ordering never produces a false diff. Non-object payloads compare as a
/// whole under the pseudo-field `"$"`.
#[must_use]
pub fn changed_fields(old_value: &Value, new_value: &Value) -> Vec<String> {
    match (old_value, new_value) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut fields = BTreeSet::new();
            for (key, value) in old_map {
                if new_map.get(key) != Some(value) {
                    fields.insert(key.clone());
                }
            }
            for key in new_map.keys() {
                if !old_map.contains_key(key) {
                    fields.insert(key.clone());
                }
            }
            fields.into_iter().collect()
        }
        (old, new) if old == new => Vec::new(),
        _ => vec!["$".to_string()],
    }
}

/// Rebuilds a JSON value with all object keys sorted, recursively, so two
/// structurally equal payloads serialize to identical bytes.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut ordered = serde_json::Map::new();
            for key in keys {
                if let Some(inner) = map.get(key) {
                    ordered.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 checksum of the canonical serialization of a payload.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when the payload cannot be
/// serialized.
pub fn payload_checksum(value: &Value) -> Result<String, WorkflowError> {
    let bytes = serde_json::to_vec(&canonicalize(value))
        .map_err(|err| WorkflowError::Validation(format!("unserializable payload: {err}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Serialized size of the canonical payload in bytes.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when the payload cannot be
/// serialized.
pub fn payload_size(value: &Value) -> Result<u64, WorkflowError> {
    let bytes = serde_json::to_vec(&canonicalize(value))
        .map_err(|err| WorkflowError::Validation(format!("unserializable payload: {err}")))?;
    Ok(u64::try_from(bytes.len()).unwrap_or(u64::MAX))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, WorkflowError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| WorkflowError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(WorkflowError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, WorkflowError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            WorkflowError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_actor() -> ActorRef {
        ActorRef {
            user_id: "u-100".to_string(),
            role: "registrar".to_string(),
            name: "Registrar".to_string(),
        }
    }

    fn fixture_attempt(event_type: EventType) -> AttemptInput {
        AttemptInput {
            entity_id: EntityId::new(),
            event_type,
            new_value: json!({"name": "Class 10A", "capacity": 32}),
            actor: fixture_actor(),
            request_meta: RequestMeta::default(),
            tags: Vec::new(),
            batch_id: None,
            parent_audit_id: None,
            expected_checksum: None,
        }
    }

    #[test]
    fn changed_fields_ignores_key_order() {
        let old_value = json!({"a": 1, "b": {"x": 1, "y": 2}});
        let new_value = json!({"b": {"y": 2, "x": 1}, "a": 1});
        assert!(changed_fields(&old_value, &new_value).is_empty());
    }

    #[test]
    fn changed_fields_reports_added_removed_and_modified_keys() {
        let old_value = json!({"a": 1, "b": 2, "c": 3});
        let new_value = json!({"a": 1, "b": 5, "d": 4});
        assert_eq!(
            changed_fields(&old_value, &new_value),
            vec!["b".to_string(), "c".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn changed_fields_on_scalar_payloads_uses_whole_value_marker() {
        assert_eq!(
            changed_fields(&json!(1), &json!(2)),
            vec!["$".to_string()]
        );
        assert!(changed_fields(&json!(1), &json!(1)).is_empty());
    }

    #[test]
    fn checksum_is_stable_across_key_order() {
        let first = must_ok(payload_checksum(&json!({"a": 1, "b": [1, 2]})));
        let second = must_ok(payload_checksum(&json!({"b": [1, 2], "a": 1})));
        assert_eq!(first, second);
    }

    #[test]
    fn checksum_differs_for_different_payloads() {
        let first = must_ok(payload_checksum(&json!({"a": 1})));
        let second = must_ok(payload_checksum(&json!({"a": 2})));
        assert_ne!(first, second);
    }

    #[test]
    fn v1_policy_validates() {
        assert!(RiskPolicy::v1().validate().is_ok());
    }

    #[test]
    fn expiry_ordering_invariant_is_enforced() {
        let mut policy = RiskPolicy::v1();
        policy.urgent_expiry_days = 5;
        policy.high_expiry_days = 2;
        assert!(matches!(
            policy.validate(),
            Err(WorkflowError::Configuration(_))
        ));
    }

    #[test]
    fn routine_update_is_low_risk_and_auto_approved() {
        let policy = RiskPolicy::v1();
        let fields = vec!["capacity".to_string()];
        let risk = policy.classify_risk(EventType::Updated, &fields);
        assert_eq!(risk, RiskLevel::Low);
        assert!(!policy.requires_approval(EventType::Updated, risk));
    }

    #[test]
    fn delete_is_critical_and_requires_approval() {
        let policy = RiskPolicy::v1();
        let risk = policy.classify_risk(EventType::Deleted, &[]);
        assert_eq!(risk, RiskLevel::Critical);
        assert!(policy.requires_approval(EventType::Deleted, risk));
    }

    #[test]
    fn protected_field_raises_risk_to_at_least_high() {
        let mut policy = RiskPolicy::v1();
        policy.protected_fields = vec!["fee_total".to_string()];
        let fields = vec!["fee_total".to_string()];
        let risk = policy.classify_risk(EventType::Updated, &fields);
        assert_eq!(risk, RiskLevel::High);
        assert!(policy.requires_approval(EventType::Updated, risk));
    }

    #[test]
    fn expiry_shrinks_as_priority_rises() {
        let policy = RiskPolicy::v1();
        let now = now_utc();
        let normal = policy.expiry_for(Priority::Normal, now);
        let high = policy.expiry_for(Priority::High, now);
        let urgent = policy.expiry_for(Priority::Urgent, now);
        let critical = policy.expiry_for(Priority::Critical, now);
        assert!(urgent < high);
        assert!(high < normal);
        assert_eq!(urgent, critical);
        assert_eq!(normal, now + Duration::days(30));
    }

    #[test]
    fn sequential_criteria_issues_level_one_only() {
        let mut policy = RiskPolicy::v1();
        policy.approver_chain = vec![
            ApproverLevel {
                level: 1,
                approver: "a1".to_string(),
            },
            ApproverLevel {
                level: 2,
                approver: "a2".to_string(),
            },
        ];
        assert_eq!(
            policy.initial_levels(ApprovalCriteria::AllLevelsSequential),
            vec![1]
        );
        assert_eq!(
            policy.initial_levels(ApprovalCriteria::AnyOneApprover),
            vec![1, 2]
        );
    }

    #[test]
    fn majority_needs_strictly_more_than_half() {
        assert!(!majority_reached(1, 2));
        assert!(majority_reached(2, 3));
        assert!(!majority_reached(0, 0));
        assert!(majority_reached(3, 5));
    }

    #[test]
    fn attempt_validation_rejects_created_events() {
        let input = fixture_attempt(EventType::Created);
        assert!(matches!(
            input.validate(),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn attempt_validation_requires_batch_for_bulk_events() {
        let mut input = fixture_attempt(EventType::BulkUpdate);
        assert!(input.validate().is_err());
        input.batch_id = Some("batch-1".to_string());
        assert!(input.validate().is_ok());
    }

    #[test]
    fn attempt_validation_requires_actor_identity() {
        let mut input = fixture_attempt(EventType::Updated);
        input.actor.user_id = "  ".to_string();
        assert!(input.validate().is_err());
    }

    #[test]
    fn request_outcome_round_trips_through_tagged_json() {
        let outcome = RequestOutcome::Rejected {
            by: "u-2".to_string(),
            at: must_ok(parse_rfc3339_utc("2026-03-01T10:00:00Z")),
            reason: "invalid".to_string(),
        };
        let raw = must_ok(serde_json::to_string(&outcome));
        let parsed: RequestOutcome = must_ok(serde_json::from_str(&raw));
        assert_eq!(parsed, outcome);
        assert_eq!(parsed.state(), RequestState::Rejected);
    }

    #[test]
    fn reminder_window_opens_near_expiry() {
        let created_at = must_ok(parse_rfc3339_utc("2026-03-01T00:00:00Z"));
        let request = ApprovalRequest {
            request_id: RequestId::new(),
            audit_id: AuditId::new(),
            approver: "a1".to_string(),
            level: 1,
            priority: Priority::Normal,
            outcome: RequestOutcome::Pending,
            expires_at: created_at + Duration::days(10),
            reminder_count: 0,
            created_at,
        };

        let early = created_at + Duration::days(2);
        let late = created_at + Duration::days(9);
        let past = created_at + Duration::days(11);
        assert!(!needs_reminder(&request, 0.2, early));
        assert!(needs_reminder(&request, 0.2, late));
        assert!(!needs_reminder(&request, 0.2, past));
    }

    #[test]
    fn policy_from_json_round_trip() {
        let policy = RiskPolicy::v1();
        let value = must_ok(serde_json::to_value(&policy));
        let parsed = must_ok(RiskPolicy::from_json(&value));
        assert_eq!(parsed, policy);
    }
}
