#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use change_ledger_core::{
    changed_fields, format_rfc3339, majority_reached, needs_reminder, now_utc, parse_rfc3339_utc,
    payload_checksum, payload_size, ActorRef, ApprovalCriteria, ApprovalRequest, ApprovalStatus,
    ApproverLevel, AttemptInput, AuditEntry, AuditId, EntityId, EntityStatus, EventType, Priority,
    RequestId, RequestMeta, RequestOutcome, RequestState, RiskLevel, RiskPolicy, SnapshotId,
    TrackedEntity, VersionSnapshot, VersionType, WorkflowError,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

const WORKFLOW_MIGRATION_VERSION: i64 = 1;

const SCHEMA_WORKFLOW_V1: &str = r"
CREATE TABLE IF NOT EXISTS risk_policies (
  policy_version INTEGER PRIMARY KEY,
  policy_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tracked_entities (
  entity_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  current_version INTEGER NOT NULL CHECK (current_version >= 1),
  status TEXT NOT NULL CHECK (status IN ('active', 'archived')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_entries (
  audit_id TEXT PRIMARY KEY,
  entity_id TEXT NOT NULL REFERENCES tracked_entities(entity_id),
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'created',
      'updated',
      'deleted',
      'restored',
      'bulk_update',
      'bulk_delete',
      'import',
      'export',
      'merge',
      'split'
    )
  ),
  old_value_json TEXT NOT NULL,
  new_value_json TEXT NOT NULL,
  changed_fields_json TEXT NOT NULL DEFAULT '[]',
  actor_user_id TEXT NOT NULL,
  actor_role TEXT NOT NULL,
  actor_name TEXT NOT NULL,
  meta_ip TEXT,
  meta_user_agent TEXT,
  meta_session_id TEXT,
  risk_level TEXT NOT NULL CHECK (risk_level IN ('low', 'medium', 'high', 'critical')),
  requires_approval INTEGER NOT NULL CHECK (requires_approval IN (0, 1)),
  approval_status TEXT NOT NULL CHECK (
    approval_status IN ('pending', 'approved', 'rejected', 'auto_approved')
  ),
  approval_criteria TEXT NOT NULL CHECK (
    approval_criteria IN ('all_levels_sequential', 'any_one_approver', 'majority')
  ),
  decided_by TEXT,
  decided_at TEXT,
  decision_reason TEXT,
  batch_id TEXT,
  parent_audit_id TEXT REFERENCES audit_entries(audit_id),
  policy_version INTEGER NOT NULL REFERENCES risk_policies(policy_version),
  checksum TEXT NOT NULL,
  tags_json TEXT NOT NULL DEFAULT '[]',
  context_json TEXT NOT NULL DEFAULT '{}',
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_audit_entries_no_delete
BEFORE DELETE ON audit_entries
BEGIN
  SELECT RAISE(FAIL, 'audit_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_entries_immutable_columns
BEFORE UPDATE ON audit_entries
WHEN OLD.entity_id != NEW.entity_id
  OR OLD.event_type != NEW.event_type
  OR OLD.old_value_json != NEW.old_value_json
  OR OLD.new_value_json != NEW.new_value_json
  OR OLD.changed_fields_json != NEW.changed_fields_json
  OR OLD.actor_user_id != NEW.actor_user_id
  OR OLD.actor_role != NEW.actor_role
  OR OLD.risk_level != NEW.risk_level
  OR OLD.requires_approval != NEW.requires_approval
  OR OLD.policy_version != NEW.policy_version
  OR OLD.checksum != NEW.checksum
  OR OLD.context_json != NEW.context_json
  OR OLD.recorded_at != NEW.recorded_at
BEGIN
  SELECT RAISE(FAIL, 'audit_entries allows only approval decision updates');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_entries_terminal_frozen
BEFORE UPDATE OF approval_status ON audit_entries
WHEN OLD.approval_status IN ('approved', 'rejected', 'auto_approved')
BEGIN
  SELECT RAISE(FAIL, 'audit_entries approval_status is terminal');
END;

CREATE INDEX IF NOT EXISTS idx_audit_entries_entity
  ON audit_entries(entity_id, recorded_at);
CREATE INDEX IF NOT EXISTS idx_audit_entries_status
  ON audit_entries(approval_status, recorded_at);
CREATE INDEX IF NOT EXISTS idx_audit_entries_batch
  ON audit_entries(batch_id);

CREATE TABLE IF NOT EXISTS version_snapshots (
  snapshot_id TEXT PRIMARY KEY,
  entity_id TEXT NOT NULL REFERENCES tracked_entities(entity_id),
  audit_id TEXT NOT NULL REFERENCES audit_entries(audit_id),
  version_no INTEGER NOT NULL CHECK (version_no >= 1),
  payload_json TEXT NOT NULL,
  checksum TEXT NOT NULL,
  size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
  compressed INTEGER NOT NULL DEFAULT 0 CHECK (compressed IN (0, 1)),
  is_current INTEGER NOT NULL CHECK (is_current IN (0, 1)),
  version_type TEXT NOT NULL CHECK (
    version_type IN ('automatic', 'manual', 'scheduled', 'rollback', 'merge')
  ),
  parent_snapshot_id TEXT REFERENCES version_snapshots(snapshot_id),
  merge_sources_json TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  UNIQUE (entity_id, version_no)
);

CREATE TRIGGER IF NOT EXISTS trg_version_snapshots_no_delete
BEFORE DELETE ON version_snapshots
BEGIN
  SELECT RAISE(FAIL, 'version_snapshots is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_version_snapshots_immutable_columns
BEFORE UPDATE ON version_snapshots
WHEN OLD.entity_id != NEW.entity_id
  OR OLD.audit_id != NEW.audit_id
  OR OLD.version_no != NEW.version_no
  OR OLD.payload_json != NEW.payload_json
  OR OLD.checksum != NEW.checksum
  OR OLD.version_type != NEW.version_type
  OR OLD.merge_sources_json != NEW.merge_sources_json
  OR OLD.created_at != NEW.created_at
BEGIN
  SELECT RAISE(FAIL, 'version_snapshots allows only is_current updates');
END;

CREATE UNIQUE INDEX IF NOT EXISTS idx_version_snapshots_current
  ON version_snapshots(entity_id) WHERE is_current = 1;
CREATE INDEX IF NOT EXISTS idx_version_snapshots_entity
  ON version_snapshots(entity_id, version_no);

CREATE TABLE IF NOT EXISTS approval_requests (
  request_id TEXT PRIMARY KEY,
  audit_id TEXT NOT NULL REFERENCES audit_entries(audit_id),
  approver TEXT NOT NULL,
  level INTEGER NOT NULL CHECK (level >= 1),
  priority TEXT NOT NULL CHECK (priority IN ('low', 'normal', 'high', 'urgent', 'critical')),
  state TEXT NOT NULL CHECK (
    state IN ('pending', 'approved', 'rejected', 'delegated', 'escalated', 'expired', 'cancelled')
  ),
  outcome_json TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  reminder_count INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_approval_requests_audit
  ON approval_requests(audit_id, state);
CREATE INDEX IF NOT EXISTS idx_approval_requests_approver
  ON approval_requests(approver, state, expires_at);
";

/// Workflow state transitions a notification sink can be told about.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RequestCreated,
    RequestApproved,
    RequestRejected,
    RequestDelegated,
    RequestEscalated,
    RequestExpiringSoon,
    RequestExpired,
    ChangeCommitted,
    ChangeRejected,
}

impl NotificationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestCreated => "request_created",
            Self::RequestApproved => "request_approved",
            Self::RequestRejected => "request_rejected",
            Self::RequestDelegated => "request_delegated",
            Self::RequestEscalated => "request_escalated",
            Self::RequestExpiringSoon => "request_expiring_soon",
            Self::RequestExpired => "request_expired",
            Self::ChangeCommitted => "change_committed",
            Self::ChangeRejected => "change_rejected",
        }
    }
}

/// External delivery seam. Sends run strictly after the owning transaction
/// commits and their failures never propagate to the caller.
pub trait NotificationSink {
    fn notify(&self, recipient: &str, kind: NotificationKind, payload: &Value) -> Result<()>;
}

#[derive(Debug, Clone)]
struct QueuedNotification {
    recipient: String,
    kind: NotificationKind,
    payload: Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CreateReceipt {
    pub entity: TrackedEntity,
    pub audit: AuditEntry,
    pub snapshot: VersionSnapshot,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct AttemptReceipt {
    pub audit: AuditEntry,
    pub committed: Option<VersionSnapshot>,
    pub requests: Vec<ApprovalRequest>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct DecisionReceipt {
    pub request: ApprovalRequest,
    pub audit_finalized: bool,
    pub committed: Option<VersionSnapshot>,
    pub spawned: Option<ApprovalRequest>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_requests: usize,
    pub rejected_audits: usize,
    pub reminders_sent: usize,
    pub notify_failures: usize,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub healthy: bool,
    pub entities_checked: usize,
    pub snapshots_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

pub struct SqliteWorkflowStore {
    conn: Connection,
    sink: Option<Box<dyn NotificationSink>>,
}

impl SqliteWorkflowStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, sink: None })
    }

    pub fn set_sink(&mut self, sink: Box<dyn NotificationSink>) {
        self.sink = Some(sink);
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_WORKFLOW_V1)
            .context("failed to apply workflow schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![WORKFLOW_MIGRATION_VERSION, now],
            )
            .context("failed to register workflow schema migration")?;

        let policy_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM risk_policies", [], |row| row.get(0))
            .context("failed to count risk policies")?;
        if policy_count == 0 {
            self.upsert_policy(&RiskPolicy::v1())?;
        }

        Ok(())
    }

    pub fn upsert_policy(&self, policy: &RiskPolicy) -> Result<()> {
        policy
            .validate()
            .map_err(|err| anyhow!("invalid risk policy: {err}"))?;

        let payload = serde_json::to_string(policy).context("failed to serialize risk policy")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO risk_policies(policy_version, policy_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(policy_version) DO UPDATE SET
                   policy_json = excluded.policy_json,
                   created_at = excluded.created_at",
                params![i64::from(policy.policy_version), payload, now],
            )
            .context("failed to upsert risk policy")?;

        Ok(())
    }

    pub fn get_policies(&self) -> Result<BTreeMap<u32, RiskPolicy>> {
        policies(&self.conn)
    }

    /// The highest-versioned policy governs new attempts.
    pub fn current_policy(&self) -> Result<RiskPolicy> {
        let map = policies(&self.conn)?;
        map.into_iter()
            .next_back()
            .map(|(_, policy)| policy)
            .ok_or_else(|| anyhow!("no risk policy configured; run migrate first"))
    }

    pub fn create_entity(
        &mut self,
        name: &str,
        payload: &Value,
        actor: &ActorRef,
        meta: &RequestMeta,
    ) -> Result<CreateReceipt> {
        if name.trim().is_empty() {
            return Err(workflow_err(WorkflowError::Validation(
                "entity name MUST be non-empty".to_string(),
            )));
        }

        let policy = self.current_policy()?;
        let now = now_utc();
        let entity_id = EntityId::new();
        let audit_id = AuditId::new();
        let snapshot_id = SnapshotId::new();
        let checksum = payload_checksum(payload).map_err(workflow_err)?;
        let size_bytes = payload_size(payload).map_err(workflow_err)?;
        let fields = changed_fields(&json!({}), payload);

        let tx = self
            .conn
            .transaction()
            .context("failed to start create transaction")?;

        insert_entity(&tx, entity_id, name, payload, 1, EntityStatus::Active, now)?;

        // Creation is never held for approval; the policy applies from version 2 on.
        let audit = AuditEntry {
            audit_id,
            entity_id,
            event_type: EventType::Created,
            old_value: json!({}),
            new_value: payload.clone(),
            changed_fields: fields,
            actor: actor.clone(),
            request_meta: meta.clone(),
            risk_level: policy.classify_risk(EventType::Created, &[]),
            requires_approval: false,
            approval_status: ApprovalStatus::AutoApproved,
            approval_criteria: policy.default_criteria,
            decided_by: None,
            decided_at: None,
            decision_reason: None,
            batch_id: None,
            parent_audit_id: None,
            policy_version: policy.policy_version,
            checksum: checksum.clone(),
            tags: Vec::new(),
            context: json!({}),
            recorded_at: now,
        };
        insert_audit(&tx, &audit)?;

        let snapshot = VersionSnapshot {
            snapshot_id,
            entity_id,
            audit_id,
            version_no: 1,
            payload: payload.clone(),
            checksum,
            size_bytes,
            compressed: false,
            is_current: true,
            version_type: VersionType::Automatic,
            parent_snapshot_id: None,
            merge_source_versions: Vec::new(),
            created_at: now,
        };
        insert_snapshot(&tx, &snapshot)?;

        tx.commit().context("failed to commit create transaction")?;

        let entity = TrackedEntity {
            entity_id,
            name: name.to_string(),
            payload: payload.clone(),
            current_version: 1,
            status: EntityStatus::Active,
            created_at: now,
            updated_at: now,
        };

        Ok(CreateReceipt {
            entity,
            audit,
            snapshot,
        })
    }

    /// Records an attempted mutation. Low-risk attempts commit a snapshot in
    /// the same transaction; risky ones are held behind approval requests.
    pub fn record_attempt(&mut self, input: &AttemptInput) -> Result<AttemptReceipt> {
        self.record_attempt_with_context(input, json!({}))
    }

    pub fn approve(
        &mut self,
        request_id: RequestId,
        approver: &str,
        comments: Option<String>,
    ) -> Result<DecisionReceipt> {
        let now = now_utc();
        let mut queued = Vec::new();

        let tx = self
            .conn
            .transaction()
            .context("failed to start approve transaction")?;

        let mut request = load_request(&tx, request_id)?;
        if request.outcome.state() != RequestState::Pending {
            return Err(workflow_err(WorkflowError::NotPendingApproval(request_id)));
        }
        if request.approver != approver {
            return Err(workflow_err(WorkflowError::WrongApprover {
                request_id,
                approver: approver.to_string(),
            }));
        }

        let outcome = RequestOutcome::Approved {
            by: approver.to_string(),
            at: now,
            comments,
        };
        finalize_request(&tx, request_id, &outcome)?;
        request.outcome = outcome;

        let audit = load_audit(&tx, request.audit_id)?;
        if audit.approval_status.is_terminal() {
            return Err(workflow_err(WorkflowError::AlreadyFinalized(audit.audit_id)));
        }

        let policy = policy_for(&tx, audit.policy_version)?;
        let chain_len = u32::try_from(policy.approver_chain.len())
            .map_err(|_| anyhow!("approver chain too long"))?;

        let (finalized, spawned) = match audit.approval_criteria {
            ApprovalCriteria::AllLevelsSequential => {
                if request.level < chain_len {
                    let next_level = request.level + 1;
                    let next_approver = policy
                        .approver_for_level(next_level)
                        .ok_or_else(|| anyhow!("no approver configured for level {next_level}"))?
                        .to_string();
                    let spawned = new_request(
                        &policy,
                        audit.audit_id,
                        &next_approver,
                        next_level,
                        request.priority,
                        now,
                    );
                    insert_request(&tx, &spawned)?;
                    queued.push(QueuedNotification {
                        recipient: spawned.approver.clone(),
                        kind: NotificationKind::RequestCreated,
                        payload: request_payload(&spawned),
                    });
                    (false, Some(spawned))
                } else {
                    (true, None)
                }
            }
            ApprovalCriteria::AnyOneApprover => (true, None),
            ApprovalCriteria::Majority => {
                let approved = count_requests_in_state(&tx, audit.audit_id, RequestState::Approved)?;
                (majority_reached(approved, policy.approver_chain.len()), None)
            }
        };

        let committed = if finalized {
            cancel_pending_siblings(&tx, audit.audit_id, request_id, now, "decision_reached")?;
            mark_audit_decided(
                &tx,
                audit.audit_id,
                ApprovalStatus::Approved,
                approver,
                now,
                None,
            )?;
            let snapshot = commit_change(&tx, &audit, now)?;
            queued.push(QueuedNotification {
                recipient: audit.actor.user_id.clone(),
                kind: NotificationKind::ChangeCommitted,
                payload: audit_payload(&audit),
            });
            Some(snapshot)
        } else {
            None
        };

        queued.push(QueuedNotification {
            recipient: audit.actor.user_id.clone(),
            kind: NotificationKind::RequestApproved,
            payload: request_payload(&request),
        });

        tx.commit().context("failed to commit approve transaction")?;
        self.deliver(queued);

        Ok(DecisionReceipt {
            request,
            audit_finalized: finalized,
            committed,
            spawned,
        })
    }

    pub fn reject(
        &mut self,
        request_id: RequestId,
        approver: &str,
        reason: &str,
    ) -> Result<DecisionReceipt> {
        if reason.trim().is_empty() {
            return Err(workflow_err(WorkflowError::MissingReason));
        }

        let now = now_utc();
        let mut queued = Vec::new();

        let tx = self
            .conn
            .transaction()
            .context("failed to start reject transaction")?;

        let mut request = load_request(&tx, request_id)?;
        if request.outcome.state() != RequestState::Pending {
            return Err(workflow_err(WorkflowError::NotPendingApproval(request_id)));
        }
        if request.approver != approver {
            return Err(workflow_err(WorkflowError::WrongApprover {
                request_id,
                approver: approver.to_string(),
            }));
        }

        let outcome = RequestOutcome::Rejected {
            by: approver.to_string(),
            at: now,
            reason: reason.to_string(),
        };
        finalize_request(&tx, request_id, &outcome)?;
        request.outcome = outcome;

        let audit = load_audit(&tx, request.audit_id)?;
        if audit.approval_status.is_terminal() {
            return Err(workflow_err(WorkflowError::AlreadyFinalized(audit.audit_id)));
        }

        cancel_pending_siblings(&tx, audit.audit_id, request_id, now, "sibling_rejected")?;
        mark_audit_decided(
            &tx,
            audit.audit_id,
            ApprovalStatus::Rejected,
            approver,
            now,
            Some(reason),
        )?;

        queued.push(QueuedNotification {
            recipient: audit.actor.user_id.clone(),
            kind: NotificationKind::ChangeRejected,
            payload: audit_payload(&audit),
        });
        queued.push(QueuedNotification {
            recipient: audit.actor.user_id.clone(),
            kind: NotificationKind::RequestRejected,
            payload: request_payload(&request),
        });

        tx.commit().context("failed to commit reject transaction")?;
        self.deliver(queued);

        Ok(DecisionReceipt {
            request,
            audit_finalized: true,
            committed: None,
            spawned: None,
        })
    }

    pub fn delegate(
        &mut self,
        request_id: RequestId,
        from_approver: &str,
        to_approver: &str,
        reason: Option<String>,
    ) -> Result<DecisionReceipt> {
        if from_approver == to_approver {
            return Err(workflow_err(WorkflowError::SelfDelegation(
                from_approver.to_string(),
            )));
        }

        let now = now_utc();
        let tx = self
            .conn
            .transaction()
            .context("failed to start delegate transaction")?;

        let mut request = load_request(&tx, request_id)?;
        if request.outcome.state() != RequestState::Pending {
            return Err(workflow_err(WorkflowError::NotPendingApproval(request_id)));
        }
        if request.approver != from_approver {
            return Err(workflow_err(WorkflowError::WrongApprover {
                request_id,
                approver: from_approver.to_string(),
            }));
        }

        let audit = load_audit(&tx, request.audit_id)?;
        let policy = policy_for(&tx, audit.policy_version)?;

        let outcome = RequestOutcome::Delegated {
            to: to_approver.to_string(),
            at: now,
            reason,
        };
        finalize_request(&tx, request_id, &outcome)?;
        request.outcome = outcome;

        // Replacement keeps the level and gets an independent expiry window.
        let spawned = new_request(
            &policy,
            request.audit_id,
            to_approver,
            request.level,
            request.priority,
            now,
        );
        insert_request(&tx, &spawned)?;

        tx.commit().context("failed to commit delegate transaction")?;
        self.deliver(vec![QueuedNotification {
            recipient: to_approver.to_string(),
            kind: NotificationKind::RequestDelegated,
            payload: request_payload(&spawned),
        }]);

        Ok(DecisionReceipt {
            request,
            audit_finalized: false,
            committed: None,
            spawned: Some(spawned),
        })
    }

    pub fn escalate(
        &mut self,
        request_id: RequestId,
        to_approver: &str,
        reason: Option<String>,
    ) -> Result<DecisionReceipt> {
        let now = now_utc();
        let tx = self
            .conn
            .transaction()
            .context("failed to start escalate transaction")?;

        let mut request = load_request(&tx, request_id)?;
        if request.outcome.state() != RequestState::Pending {
            return Err(workflow_err(WorkflowError::NotPendingApproval(request_id)));
        }

        let audit = load_audit(&tx, request.audit_id)?;
        let policy = policy_for(&tx, audit.policy_version)?;
        if request.level >= policy.max_escalation_level {
            return Err(workflow_err(WorkflowError::MaxLevelExceeded {
                level: request.level,
                ceiling: policy.max_escalation_level,
            }));
        }

        let outcome = RequestOutcome::Escalated {
            to: to_approver.to_string(),
            at: now,
            reason,
        };
        finalize_request(&tx, request_id, &outcome)?;
        request.outcome = outcome;

        let spawned = new_request(
            &policy,
            request.audit_id,
            to_approver,
            request.level + 1,
            request.priority,
            now,
        );
        insert_request(&tx, &spawned)?;

        tx.commit().context("failed to commit escalate transaction")?;
        self.deliver(vec![QueuedNotification {
            recipient: to_approver.to_string(),
            kind: NotificationKind::RequestEscalated,
            payload: request_payload(&spawned),
        }]);

        Ok(DecisionReceipt {
            request,
            audit_finalized: false,
            committed: None,
            spawned: Some(spawned),
        })
    }

    /// Expires overdue pending requests and reminds approvers whose requests
    /// are inside the reminder window. Run periodically by an external
    /// scheduler.
    pub fn expire_sweep(&mut self, now: time::OffsetDateTime) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut queued = Vec::new();

        let tx = self
            .conn
            .transaction()
            .context("failed to start sweep transaction")?;

        let pending = list_requests_in_state(&tx, RequestState::Pending)?;
        for request in &pending {
            if request.expires_at < now {
                let outcome = RequestOutcome::Expired { at: now };
                if finalize_request_if_pending(&tx, request.request_id, &outcome)? == 0 {
                    continue;
                }
                report.expired_requests += 1;
                queued.push(QueuedNotification {
                    recipient: request.approver.clone(),
                    kind: NotificationKind::RequestExpired,
                    payload: request_payload(request),
                });

                let remaining =
                    count_requests_in_state(&tx, request.audit_id, RequestState::Pending)?;
                if remaining == 0 {
                    let audit = load_audit(&tx, request.audit_id)?;
                    if !audit.approval_status.is_terminal() {
                        mark_audit_decided(
                            &tx,
                            request.audit_id,
                            ApprovalStatus::Rejected,
                            "system",
                            now,
                            Some("expired"),
                        )?;
                        report.rejected_audits += 1;
                        queued.push(QueuedNotification {
                            recipient: audit.actor.user_id.clone(),
                            kind: NotificationKind::ChangeRejected,
                            payload: audit_payload(&audit),
                        });
                    }
                }
                continue;
            }

            let audit = load_audit(&tx, request.audit_id)?;
            let policy = policy_for(&tx, audit.policy_version)?;
            if needs_reminder(request, policy.reminder_window_fraction, now) {
                tx.execute(
                    "UPDATE approval_requests
                     SET reminder_count = reminder_count + 1
                     WHERE request_id = ?1 AND state = 'pending'",
                    params![request.request_id.to_string()],
                )
                .context("failed to bump reminder_count")?;
                report.reminders_sent += 1;
                queued.push(QueuedNotification {
                    recipient: request.approver.clone(),
                    kind: NotificationKind::RequestExpiringSoon,
                    payload: request_payload(request),
                });
            }
        }

        tx.commit().context("failed to commit sweep transaction")?;
        report.notify_failures = self.deliver(queued);

        Ok(report)
    }

    /// Restores a prior version by committing a new rollback snapshot. The
    /// rollback itself is audited as a `restored` event and goes through the
    /// same risk policy as any other attempt.
    pub fn rollback(
        &mut self,
        entity_id: EntityId,
        target_version: u32,
        actor: &ActorRef,
        meta: &RequestMeta,
    ) -> Result<AttemptReceipt> {
        let target = snapshot_for_version(&self.conn, entity_id, target_version)?.ok_or_else(
            || {
                workflow_err(WorkflowError::VersionNotFound {
                    entity_id,
                    version_no: target_version,
                })
            },
        )?;

        let input = AttemptInput {
            entity_id,
            event_type: EventType::Restored,
            new_value: target.payload.clone(),
            actor: actor.clone(),
            request_meta: meta.clone(),
            tags: Vec::new(),
            batch_id: None,
            parent_audit_id: None,
            expected_checksum: None,
        };
        self.record_attempt_with_context(&input, json!({ "rollback_of_version": target_version }))
    }

    /// Commits a caller-resolved merge of two or more prior versions.
    /// Conflict resolution happens upstream; the store records the sources
    /// and the supplied conflict count.
    pub fn merge_versions(
        &mut self,
        entity_id: EntityId,
        source_versions: &[u32],
        resolved_payload: &Value,
        actor: &ActorRef,
        meta: &RequestMeta,
        conflict_count: u32,
    ) -> Result<AttemptReceipt> {
        if source_versions.len() < 2 {
            return Err(workflow_err(WorkflowError::Validation(
                "merge requires at least two source versions".to_string(),
            )));
        }

        for version_no in source_versions {
            if snapshot_for_version(&self.conn, entity_id, *version_no)?.is_none() {
                return Err(workflow_err(WorkflowError::VersionNotFound {
                    entity_id,
                    version_no: *version_no,
                }));
            }
        }

        let input = AttemptInput {
            entity_id,
            event_type: EventType::Merge,
            new_value: resolved_payload.clone(),
            actor: actor.clone(),
            request_meta: meta.clone(),
            tags: Vec::new(),
            batch_id: None,
            parent_audit_id: None,
            expected_checksum: None,
        };
        self.record_attempt_with_context(
            &input,
            json!({
                "merge_sources": source_versions,
                "conflict_count": conflict_count,
            }),
        )
    }

    pub fn get_entity(&self, entity_id: EntityId) -> Result<TrackedEntity> {
        load_entity(&self.conn, entity_id)
    }

    pub fn get_audit(&self, audit_id: AuditId) -> Result<AuditEntry> {
        load_audit(&self.conn, audit_id)
    }

    pub fn get_request(&self, request_id: RequestId) -> Result<ApprovalRequest> {
        load_request(&self.conn, request_id)
    }

    pub fn history_for_entity(
        &self,
        entity_id: EntityId,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>> {
        let mut query = "SELECT
                audit_id, entity_id, event_type, old_value_json, new_value_json,
                changed_fields_json, actor_user_id, actor_role, actor_name,
                meta_ip, meta_user_agent, meta_session_id, risk_level,
                requires_approval, approval_status, approval_criteria,
                decided_by, decided_at, decision_reason, batch_id, parent_audit_id,
                policy_version, checksum, tags_json, context_json, recorded_at
             FROM audit_entries
             WHERE entity_id = ?1
             ORDER BY recorded_at ASC, audit_id ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![entity_id.to_string()], parse_audit_row)?;
        collect_rows(rows)
    }

    pub fn versions_for_entity(&self, entity_id: EntityId) -> Result<Vec<VersionSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                snapshot_id, entity_id, audit_id, version_no, payload_json,
                checksum, size_bytes, compressed, is_current, version_type,
                parent_snapshot_id, merge_sources_json, created_at
             FROM version_snapshots
             WHERE entity_id = ?1
             ORDER BY version_no ASC",
        )?;
        let rows = stmt.query_map(params![entity_id.to_string()], parse_snapshot_row)?;
        collect_rows(rows)
    }

    pub fn list_pending_for_approver(&self, approver: &str) -> Result<Vec<ApprovalRequest>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                request_id, audit_id, approver, level, priority, state,
                outcome_json, expires_at, reminder_count, created_at
             FROM approval_requests
             WHERE approver = ?1 AND state = 'pending'
             ORDER BY expires_at ASC, request_id ASC",
        )?;
        let rows = stmt.query_map(params![approver], parse_request_row)?;
        collect_rows(rows)
    }

    /// Recomputes checksums and structural invariants across the whole store.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut issues = Vec::new();

        let mut stmt = self.conn.prepare(
            "SELECT entity_id, payload_json, current_version FROM tracked_entities",
        )?;
        let entity_rows: Vec<(String, String, i64)> = collect_rows(stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?)?;

        let entities_checked = entity_rows.len();
        for (entity_raw, _, current_version) in &entity_rows {
            let currents: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM version_snapshots WHERE entity_id = ?1 AND is_current = 1",
                params![entity_raw],
                |row| row.get(0),
            )?;
            if currents != 1 {
                issues.push(IntegrityIssue {
                    code: "current_version_cardinality".to_string(),
                    severity: IntegrityIssueSeverity::Error,
                    message: format!(
                        "entity {entity_raw} has {currents} current snapshots, expected exactly 1"
                    ),
                });
                continue;
            }

            let current_no: i64 = self.conn.query_row(
                "SELECT version_no FROM version_snapshots WHERE entity_id = ?1 AND is_current = 1",
                params![entity_raw],
                |row| row.get(0),
            )?;
            if current_no != *current_version {
                issues.push(IntegrityIssue {
                    code: "current_version_drift".to_string(),
                    severity: IntegrityIssueSeverity::Error,
                    message: format!(
                        "entity {entity_raw} current_version={current_version} but current snapshot is {current_no}"
                    ),
                });
            }

            let max_no: i64 = self.conn.query_row(
                "SELECT MAX(version_no) FROM version_snapshots WHERE entity_id = ?1",
                params![entity_raw],
                |row| row.get(0),
            )?;
            if current_no != max_no {
                issues.push(IntegrityIssue {
                    code: "current_not_latest".to_string(),
                    severity: IntegrityIssueSeverity::Error,
                    message: format!(
                        "entity {entity_raw} current snapshot {current_no} is behind max {max_no}"
                    ),
                });
            }
        }

        let mut stmt = self
            .conn
            .prepare("SELECT snapshot_id, payload_json, checksum FROM version_snapshots")?;
        let snapshot_rows: Vec<(String, String, String)> =
            collect_rows(stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?)?;

        let snapshots_checked = snapshot_rows.len();
        for (snapshot_raw, payload_raw, stored_checksum) in &snapshot_rows {
            let payload: Value = serde_json::from_str(payload_raw)
                .with_context(|| format!("invalid stored payload for snapshot {snapshot_raw}"))?;
            let recomputed = payload_checksum(&payload).map_err(workflow_err)?;
            if recomputed != *stored_checksum {
                issues.push(IntegrityIssue {
                    code: "snapshot_checksum_mismatch".to_string(),
                    severity: IntegrityIssueSeverity::Error,
                    message: format!("snapshot {snapshot_raw} payload does not match checksum"),
                });
            }
        }

        let inconsistent_auto: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM audit_entries
             WHERE (requires_approval = 0 AND approval_status != 'auto_approved')
                OR (requires_approval = 1 AND approval_status = 'auto_approved')",
            [],
            |row| row.get(0),
        )?;
        if inconsistent_auto > 0 {
            issues.push(IntegrityIssue {
                code: "auto_approval_inconsistency".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!(
                    "{inconsistent_auto} audit entries violate the auto-approval invariant"
                ),
            });
        }

        let orphan_pending: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM approval_requests requests
             JOIN audit_entries audits ON audits.audit_id = requests.audit_id
             WHERE requests.state = 'pending'
               AND audits.approval_status != 'pending'",
            [],
            |row| row.get(0),
        )?;
        if orphan_pending > 0 {
            issues.push(IntegrityIssue {
                code: "pending_requests_on_decided_audit".to_string(),
                severity: IntegrityIssueSeverity::Warning,
                message: format!(
                    "{orphan_pending} pending requests reference already-decided audit entries"
                ),
            });
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == IntegrityIssueSeverity::Error);

        Ok(IntegrityReport {
            healthy,
            entities_checked,
            snapshots_checked,
            issues,
        })
    }

    fn record_attempt_with_context(
        &mut self,
        input: &AttemptInput,
        context: Value,
    ) -> Result<AttemptReceipt> {
        input.validate().map_err(workflow_err)?;

        let policy = self.current_policy()?;
        let now = now_utc();
        let mut queued = Vec::new();

        let tx = self
            .conn
            .transaction()
            .context("failed to start attempt transaction")?;

        let entity = load_entity(&tx, input.entity_id)?;

        if let Some(expected) = &input.expected_checksum {
            let actual = payload_checksum(&entity.payload).map_err(workflow_err)?;
            if *expected != actual {
                return Err(workflow_err(WorkflowError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                }));
            }
        }

        let fields = changed_fields(&entity.payload, &input.new_value);
        let risk_level = policy.classify_risk(input.event_type, &fields);
        let requires_approval = policy.requires_approval(input.event_type, risk_level);
        let checksum = payload_checksum(&input.new_value).map_err(workflow_err)?;

        let audit = AuditEntry {
            audit_id: AuditId::new(),
            entity_id: input.entity_id,
            event_type: input.event_type,
            old_value: entity.payload.clone(),
            new_value: input.new_value.clone(),
            changed_fields: fields,
            actor: input.actor.clone(),
            request_meta: input.request_meta.clone(),
            risk_level,
            requires_approval,
            approval_status: if requires_approval {
                ApprovalStatus::Pending
            } else {
                ApprovalStatus::AutoApproved
            },
            approval_criteria: policy.default_criteria,
            decided_by: None,
            decided_at: None,
            decision_reason: None,
            batch_id: input.batch_id.clone(),
            parent_audit_id: input.parent_audit_id,
            policy_version: policy.policy_version,
            checksum,
            tags: input.tags.clone(),
            context,
            recorded_at: now,
        };
        insert_audit(&tx, &audit)?;

        let (committed, requests) = if requires_approval {
            let mut requests = Vec::new();
            for level in policy.initial_levels(audit.approval_criteria) {
                let approver = policy
                    .approver_for_level(level)
                    .ok_or_else(|| anyhow!("no approver configured for level {level}"))?
                    .to_string();
                let request = new_request(
                    &policy,
                    audit.audit_id,
                    &approver,
                    level,
                    policy.default_priority,
                    now,
                );
                insert_request(&tx, &request)?;
                queued.push(QueuedNotification {
                    recipient: request.approver.clone(),
                    kind: NotificationKind::RequestCreated,
                    payload: request_payload(&request),
                });
                requests.push(request);
            }
            (None, requests)
        } else if matches!(audit.event_type, EventType::Export) {
            // Exports are observed, not applied; the audit row is the whole record.
            (None, Vec::new())
        } else {
            let snapshot = commit_change(&tx, &audit, now)?;
            (Some(snapshot), Vec::new())
        };

        tx.commit().context("failed to commit attempt transaction")?;
        self.deliver(queued);

        Ok(AttemptReceipt {
            audit,
            committed,
            requests,
        })
    }

    fn deliver(&self, queued: Vec<QueuedNotification>) -> usize {
        let Some(sink) = &self.sink else {
            return 0;
        };

        let mut failures = 0;
        for item in queued {
            // Best-effort by contract: a failed send never unwinds state.
            if sink
                .notify(&item.recipient, item.kind, &item.payload)
                .is_err()
            {
                failures += 1;
            }
        }
        failures
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Applies a decided audit entry: next snapshot, current-flag flip, and the
/// entity update, all inside the caller's transaction.
fn commit_change(
    conn: &Connection,
    audit: &AuditEntry,
    now: time::OffsetDateTime,
) -> Result<VersionSnapshot> {
    let prior_current = current_snapshot(conn, audit.entity_id)?;
    let next_version = prior_current
        .as_ref()
        .map_or(1, |snapshot| snapshot.version_no + 1);

    let version_type = match audit.event_type {
        EventType::Restored => VersionType::Rollback,
        EventType::Merge => VersionType::Merge,
        EventType::Import => VersionType::Manual,
        _ => VersionType::Automatic,
    };

    let merge_source_versions: Vec<u32> = audit
        .context
        .get("merge_sources")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|value| u32::try_from(value).ok())
                .collect()
        })
        .unwrap_or_default();

    if let Some(prior) = &prior_current {
        conn.execute(
            "UPDATE version_snapshots SET is_current = 0 WHERE snapshot_id = ?1",
            params![prior.snapshot_id.to_string()],
        )
        .map_err(|err| {
            workflow_err(WorkflowError::CommitFailed(format!(
                "failed to clear prior current snapshot: {err}"
            )))
        })?;
    }

    let snapshot = VersionSnapshot {
        snapshot_id: SnapshotId::new(),
        entity_id: audit.entity_id,
        audit_id: audit.audit_id,
        version_no: next_version,
        payload: audit.new_value.clone(),
        checksum: audit.checksum.clone(),
        size_bytes: payload_size(&audit.new_value).map_err(workflow_err)?,
        compressed: false,
        is_current: true,
        version_type,
        parent_snapshot_id: prior_current.map(|prior| prior.snapshot_id),
        merge_source_versions,
        created_at: now,
    };
    insert_snapshot(conn, &snapshot)?;

    let status = match audit.event_type {
        EventType::Deleted | EventType::BulkDelete => EntityStatus::Archived,
        _ => EntityStatus::Active,
    };

    conn.execute(
        "UPDATE tracked_entities
         SET payload_json = ?1, current_version = ?2, status = ?3, updated_at = ?4
         WHERE entity_id = ?5",
        params![
            serde_json::to_string(&audit.new_value).context("failed to serialize payload")?,
            i64::from(next_version),
            status.as_str(),
            format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?,
            audit.entity_id.to_string(),
        ],
    )
    .map_err(|err| {
        workflow_err(WorkflowError::CommitFailed(format!(
            "failed to update tracked entity: {err}"
        )))
    })?;

    Ok(snapshot)
}

fn new_request(
    policy: &RiskPolicy,
    audit_id: AuditId,
    approver: &str,
    level: u32,
    priority: Priority,
    now: time::OffsetDateTime,
) -> ApprovalRequest {
    ApprovalRequest {
        request_id: RequestId::new(),
        audit_id,
        approver: approver.to_string(),
        level,
        priority,
        outcome: RequestOutcome::Pending,
        expires_at: policy.expiry_for(priority, now),
        reminder_count: 0,
        created_at: now,
    }
}

fn insert_entity(
    conn: &Connection,
    entity_id: EntityId,
    name: &str,
    payload: &Value,
    version: u32,
    status: EntityStatus,
    now: time::OffsetDateTime,
) -> Result<()> {
    let now_raw = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO tracked_entities(
            entity_id, name, payload_json, current_version, status, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entity_id.to_string(),
            name,
            serde_json::to_string(payload).context("failed to serialize payload")?,
            i64::from(version),
            status.as_str(),
            now_raw,
            now_raw,
        ],
    )
    .context("failed to insert tracked entity")?;
    Ok(())
}

fn insert_audit(conn: &Connection, audit: &AuditEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_entries(
            audit_id, entity_id, event_type, old_value_json, new_value_json,
            changed_fields_json, actor_user_id, actor_role, actor_name,
            meta_ip, meta_user_agent, meta_session_id, risk_level,
            requires_approval, approval_status, approval_criteria,
            decided_by, decided_at, decision_reason, batch_id, parent_audit_id,
            policy_version, checksum, tags_json, context_json, recorded_at
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9,
            ?10, ?11, ?12, ?13,
            ?14, ?15, ?16,
            ?17, ?18, ?19, ?20, ?21,
            ?22, ?23, ?24, ?25, ?26
         )",
        params![
            audit.audit_id.to_string(),
            audit.entity_id.to_string(),
            audit.event_type.as_str(),
            serde_json::to_string(&audit.old_value).context("failed to serialize old_value")?,
            serde_json::to_string(&audit.new_value).context("failed to serialize new_value")?,
            serde_json::to_string(&audit.changed_fields)
                .context("failed to serialize changed_fields")?,
            audit.actor.user_id,
            audit.actor.role,
            audit.actor.name,
            audit.request_meta.ip,
            audit.request_meta.user_agent,
            audit.request_meta.session_id,
            audit.risk_level.as_str(),
            i64::from(audit.requires_approval),
            audit.approval_status.as_str(),
            audit.approval_criteria.as_str(),
            audit.decided_by,
            audit
                .decided_at
                .map(format_rfc3339)
                .transpose()
                .map_err(|err| anyhow!(err.to_string()))?,
            audit.decision_reason,
            audit.batch_id,
            audit.parent_audit_id.map(|id| id.to_string()),
            i64::from(audit.policy_version),
            audit.checksum,
            serde_json::to_string(&audit.tags).context("failed to serialize tags")?,
            serde_json::to_string(&audit.context).context("failed to serialize context")?,
            format_rfc3339(audit.recorded_at).map_err(|err| anyhow!(err.to_string()))?,
        ],
    )
    .context("failed to insert audit entry")?;
    Ok(())
}

fn insert_snapshot(conn: &Connection, snapshot: &VersionSnapshot) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO version_snapshots(
            snapshot_id, entity_id, audit_id, version_no, payload_json,
            checksum, size_bytes, compressed, is_current, version_type,
            parent_snapshot_id, merge_sources_json, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            snapshot.snapshot_id.to_string(),
            snapshot.entity_id.to_string(),
            snapshot.audit_id.to_string(),
            i64::from(snapshot.version_no),
            serde_json::to_string(&snapshot.payload).context("failed to serialize payload")?,
            snapshot.checksum,
            i64::try_from(snapshot.size_bytes).unwrap_or(i64::MAX),
            i64::from(snapshot.compressed),
            i64::from(snapshot.is_current),
            snapshot.version_type.as_str(),
            snapshot.parent_snapshot_id.map(|id| id.to_string()),
            serde_json::to_string(&snapshot.merge_source_versions)
                .context("failed to serialize merge sources")?,
            format_rfc3339(snapshot.created_at).map_err(|err| anyhow!(err.to_string()))?,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(err) if is_constraint_violation(&err) => Err(workflow_err(
            WorkflowError::VersionNumberConflict {
                entity_id: snapshot.entity_id,
                version_no: snapshot.version_no,
            },
        )),
        Err(err) => Err(workflow_err(WorkflowError::CommitFailed(format!(
            "failed to insert version snapshot: {err}"
        )))),
    }
}

fn insert_request(conn: &Connection, request: &ApprovalRequest) -> Result<()> {
    conn.execute(
        "INSERT INTO approval_requests(
            request_id, audit_id, approver, level, priority, state,
            outcome_json, expires_at, reminder_count, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            request.request_id.to_string(),
            request.audit_id.to_string(),
            request.approver,
            i64::from(request.level),
            request.priority.as_str(),
            request.outcome.state().as_str(),
            serde_json::to_string(&request.outcome).context("failed to serialize outcome")?,
            format_rfc3339(request.expires_at).map_err(|err| anyhow!(err.to_string()))?,
            i64::from(request.reminder_count),
            format_rfc3339(request.created_at).map_err(|err| anyhow!(err.to_string()))?,
        ],
    )
    .context("failed to insert approval request")?;
    Ok(())
}

/// Guarded terminal transition. The `state = 'pending'` predicate is the
/// serialization point for racing deciders; zero affected rows means another
/// transaction already decided this request.
fn finalize_request(
    conn: &Connection,
    request_id: RequestId,
    outcome: &RequestOutcome,
) -> Result<()> {
    if finalize_request_if_pending(conn, request_id, outcome)? == 0 {
        return Err(workflow_err(WorkflowError::NotPendingApproval(request_id)));
    }
    Ok(())
}

fn finalize_request_if_pending(
    conn: &Connection,
    request_id: RequestId,
    outcome: &RequestOutcome,
) -> Result<usize> {
    conn.execute(
        "UPDATE approval_requests
         SET state = ?1, outcome_json = ?2
         WHERE request_id = ?3 AND state = 'pending'",
        params![
            outcome.state().as_str(),
            serde_json::to_string(outcome).context("failed to serialize outcome")?,
            request_id.to_string(),
        ],
    )
    .context("failed to finalize approval request")
}

fn cancel_pending_siblings(
    conn: &Connection,
    audit_id: AuditId,
    winner: RequestId,
    now: time::OffsetDateTime,
    reason: &str,
) -> Result<usize> {
    let outcome = RequestOutcome::Cancelled {
        at: now,
        reason: reason.to_string(),
    };
    conn.execute(
        "UPDATE approval_requests
         SET state = 'cancelled', outcome_json = ?1
         WHERE audit_id = ?2 AND request_id != ?3 AND state = 'pending'",
        params![
            serde_json::to_string(&outcome).context("failed to serialize outcome")?,
            audit_id.to_string(),
            winner.to_string(),
        ],
    )
    .context("failed to cancel sibling requests")
}

fn mark_audit_decided(
    conn: &Connection,
    audit_id: AuditId,
    status: ApprovalStatus,
    decided_by: &str,
    now: time::OffsetDateTime,
    reason: Option<&str>,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE audit_entries
             SET approval_status = ?1, decided_by = ?2, decided_at = ?3, decision_reason = ?4
             WHERE audit_id = ?5 AND approval_status = 'pending'",
            params![
                status.as_str(),
                decided_by,
                format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?,
                reason,
                audit_id.to_string(),
            ],
        )
        .context("failed to mark audit entry decided")?;

    if changed == 0 {
        return Err(workflow_err(WorkflowError::AlreadyFinalized(audit_id)));
    }
    Ok(())
}

fn policies(conn: &Connection) -> Result<BTreeMap<u32, RiskPolicy>> {
    let mut stmt = conn.prepare(
        "SELECT policy_version, policy_json FROM risk_policies ORDER BY policy_version ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut map = BTreeMap::new();

    while let Some(row) = rows.next()? {
        let version_i64: i64 = row.get(0)?;
        let version = u32::try_from(version_i64)
            .with_context(|| format!("invalid policy_version: {version_i64}"))?;
        let raw: String = row.get(1)?;
        let value: Value = serde_json::from_str(&raw).context("invalid stored policy JSON")?;
        let policy = RiskPolicy::from_json(&value)
            .map_err(|err| anyhow!("failed to parse policy {version}: {err}"))?;
        map.insert(version, policy);
    }

    Ok(map)
}

fn policy_for(conn: &Connection, policy_version: u32) -> Result<RiskPolicy> {
    policies(conn)?
        .remove(&policy_version)
        .ok_or_else(|| anyhow!("missing risk policy version {policy_version}"))
}

fn load_entity(conn: &Connection, entity_id: EntityId) -> Result<TrackedEntity> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, name, payload_json, current_version, status, created_at, updated_at
         FROM tracked_entities
         WHERE entity_id = ?1",
    )?;
    stmt.query_row(params![entity_id.to_string()], parse_entity_row)
        .optional()?
        .ok_or_else(|| workflow_err(WorkflowError::EntityNotFound(entity_id)))
}

fn load_audit(conn: &Connection, audit_id: AuditId) -> Result<AuditEntry> {
    let mut stmt = conn.prepare(
        "SELECT
            audit_id, entity_id, event_type, old_value_json, new_value_json,
            changed_fields_json, actor_user_id, actor_role, actor_name,
            meta_ip, meta_user_agent, meta_session_id, risk_level,
            requires_approval, approval_status, approval_criteria,
            decided_by, decided_at, decision_reason, batch_id, parent_audit_id,
            policy_version, checksum, tags_json, context_json, recorded_at
         FROM audit_entries
         WHERE audit_id = ?1",
    )?;
    stmt.query_row(params![audit_id.to_string()], parse_audit_row)
        .optional()?
        .ok_or_else(|| workflow_err(WorkflowError::AuditNotFound(audit_id)))
}

fn load_request(conn: &Connection, request_id: RequestId) -> Result<ApprovalRequest> {
    let mut stmt = conn.prepare(
        "SELECT
            request_id, audit_id, approver, level, priority, state,
            outcome_json, expires_at, reminder_count, created_at
         FROM approval_requests
         WHERE request_id = ?1",
    )?;
    stmt.query_row(params![request_id.to_string()], parse_request_row)
        .optional()?
        .ok_or_else(|| workflow_err(WorkflowError::RequestNotFound(request_id)))
}

fn current_snapshot(conn: &Connection, entity_id: EntityId) -> Result<Option<VersionSnapshot>> {
    let mut stmt = conn.prepare(
        "SELECT
            snapshot_id, entity_id, audit_id, version_no, payload_json,
            checksum, size_bytes, compressed, is_current, version_type,
            parent_snapshot_id, merge_sources_json, created_at
         FROM version_snapshots
         WHERE entity_id = ?1 AND is_current = 1",
    )?;
    Ok(stmt
        .query_row(params![entity_id.to_string()], parse_snapshot_row)
        .optional()?)
}

fn snapshot_for_version(
    conn: &Connection,
    entity_id: EntityId,
    version_no: u32,
) -> Result<Option<VersionSnapshot>> {
    let mut stmt = conn.prepare(
        "SELECT
            snapshot_id, entity_id, audit_id, version_no, payload_json,
            checksum, size_bytes, compressed, is_current, version_type,
            parent_snapshot_id, merge_sources_json, created_at
         FROM version_snapshots
         WHERE entity_id = ?1 AND version_no = ?2",
    )?;
    Ok(stmt
        .query_row(
            params![entity_id.to_string(), i64::from(version_no)],
            parse_snapshot_row,
        )
        .optional()?)
}

fn count_requests_in_state(
    conn: &Connection,
    audit_id: AuditId,
    state: RequestState,
) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM approval_requests WHERE audit_id = ?1 AND state = ?2",
        params![audit_id.to_string(), state.as_str()],
        |row| row.get(0),
    )?;
    usize::try_from(count).with_context(|| format!("invalid request count: {count}"))
}

fn list_requests_in_state(conn: &Connection, state: RequestState) -> Result<Vec<ApprovalRequest>> {
    let mut stmt = conn.prepare(
        "SELECT
            request_id, audit_id, approver, level, priority, state,
            outcome_json, expires_at, reminder_count, created_at
         FROM approval_requests
         WHERE state = ?1
         ORDER BY expires_at ASC, request_id ASC",
    )?;
    let rows = stmt.query_map(params![state.as_str()], parse_request_row)?;
    collect_rows(rows)
}

fn request_payload(request: &ApprovalRequest) -> Value {
    json!({
        "request_id": request.request_id.to_string(),
        "audit_id": request.audit_id.to_string(),
        "level": request.level,
        "priority": request.priority.as_str(),
        "state": request.outcome.state().as_str(),
    })
}

fn audit_payload(audit: &AuditEntry) -> Value {
    json!({
        "audit_id": audit.audit_id.to_string(),
        "entity_id": audit.entity_id.to_string(),
        "event_type": audit.event_type.as_str(),
        "approval_status": audit.approval_status.as_str(),
    })
}

fn parse_entity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackedEntity> {
    let entity_id = parse_ulid_column(row, 0, "entity_id")?;
    let payload = parse_json_column(row, 2)?;
    let version_i64: i64 = row.get(3)?;
    let status_raw: String = row.get(4)?;

    let current_version = u32::try_from(version_i64)
        .map_err(|_| column_error(3, format!("invalid current_version: {version_i64}")))?;
    let status = EntityStatus::parse(&status_raw)
        .ok_or_else(|| column_error(4, format!("invalid status: {status_raw}")))?;

    Ok(TrackedEntity {
        entity_id: EntityId(entity_id),
        name: row.get(1)?,
        payload,
        current_version,
        status,
        created_at: parse_time_column(row, 5)?,
        updated_at: parse_time_column(row, 6)?,
    })
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let event_type_raw: String = row.get(2)?;
    let risk_raw: String = row.get(12)?;
    let status_raw: String = row.get(14)?;
    let criteria_raw: String = row.get(15)?;
    let policy_i64: i64 = row.get(21)?;

    let event_type = EventType::parse(&event_type_raw)
        .ok_or_else(|| column_error(2, format!("invalid event_type: {event_type_raw}")))?;
    let risk_level = RiskLevel::parse(&risk_raw)
        .ok_or_else(|| column_error(12, format!("invalid risk_level: {risk_raw}")))?;
    let approval_status = ApprovalStatus::parse(&status_raw)
        .ok_or_else(|| column_error(14, format!("invalid approval_status: {status_raw}")))?;
    let approval_criteria = ApprovalCriteria::parse(&criteria_raw)
        .ok_or_else(|| column_error(15, format!("invalid approval_criteria: {criteria_raw}")))?;
    let policy_version = u32::try_from(policy_i64)
        .map_err(|_| column_error(21, format!("invalid policy_version: {policy_i64}")))?;

    let changed: Vec<String> = parse_json_typed_column(row, 5)?;
    let tags: Vec<String> = parse_json_typed_column(row, 23)?;

    let decided_at = row
        .get::<_, Option<String>>(17)?
        .as_deref()
        .map(|value| {
            parse_rfc3339_utc(value).map_err(|err| column_error(17, err.to_string()))
        })
        .transpose()?;

    let parent_audit_id = row
        .get::<_, Option<String>>(20)?
        .as_deref()
        .map(|raw| {
            ulid::Ulid::from_string(raw)
                .map(AuditId)
                .map_err(|_| column_error(20, format!("invalid parent_audit_id: {raw}")))
        })
        .transpose()?;

    Ok(AuditEntry {
        audit_id: AuditId(parse_ulid_column(row, 0, "audit_id")?),
        entity_id: EntityId(parse_ulid_column(row, 1, "entity_id")?),
        event_type,
        old_value: parse_json_column(row, 3)?,
        new_value: parse_json_column(row, 4)?,
        changed_fields: changed,
        actor: ActorRef {
            user_id: row.get(6)?,
            role: row.get(7)?,
            name: row.get(8)?,
        },
        request_meta: RequestMeta {
            ip: row.get(9)?,
            user_agent: row.get(10)?,
            session_id: row.get(11)?,
        },
        risk_level,
        requires_approval: row.get::<_, i64>(13)? == 1,
        approval_status,
        approval_criteria,
        decided_by: row.get(16)?,
        decided_at,
        decision_reason: row.get(18)?,
        batch_id: row.get(19)?,
        parent_audit_id,
        policy_version,
        checksum: row.get(22)?,
        tags,
        context: parse_json_column(row, 24)?,
        recorded_at: parse_time_column(row, 25)?,
    })
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionSnapshot> {
    let version_i64: i64 = row.get(3)?;
    let size_i64: i64 = row.get(6)?;
    let version_type_raw: String = row.get(9)?;

    let version_no = u32::try_from(version_i64)
        .map_err(|_| column_error(3, format!("invalid version_no: {version_i64}")))?;
    let size_bytes = u64::try_from(size_i64)
        .map_err(|_| column_error(6, format!("invalid size_bytes: {size_i64}")))?;
    let version_type = VersionType::parse(&version_type_raw)
        .ok_or_else(|| column_error(9, format!("invalid version_type: {version_type_raw}")))?;

    let parent_snapshot_id = row
        .get::<_, Option<String>>(10)?
        .as_deref()
        .map(|raw| {
            ulid::Ulid::from_string(raw)
                .map(SnapshotId)
                .map_err(|_| column_error(10, format!("invalid parent_snapshot_id: {raw}")))
        })
        .transpose()?;

    let merge_source_versions: Vec<u32> = parse_json_typed_column(row, 11)?;

    Ok(VersionSnapshot {
        snapshot_id: SnapshotId(parse_ulid_column(row, 0, "snapshot_id")?),
        entity_id: EntityId(parse_ulid_column(row, 1, "entity_id")?),
        audit_id: AuditId(parse_ulid_column(row, 2, "audit_id")?),
        version_no,
        payload: parse_json_column(row, 4)?,
        checksum: row.get(5)?,
        size_bytes,
        compressed: row.get::<_, i64>(7)? == 1,
        is_current: row.get::<_, i64>(8)? == 1,
        version_type,
        parent_snapshot_id,
        merge_source_versions,
        created_at: parse_time_column(row, 12)?,
    })
}

fn parse_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let level_i64: i64 = row.get(3)?;
    let priority_raw: String = row.get(4)?;
    let state_raw: String = row.get(5)?;
    let reminder_i64: i64 = row.get(8)?;

    let level = u32::try_from(level_i64)
        .map_err(|_| column_error(3, format!("invalid level: {level_i64}")))?;
    let priority = Priority::parse(&priority_raw)
        .ok_or_else(|| column_error(4, format!("invalid priority: {priority_raw}")))?;
    let reminder_count = u32::try_from(reminder_i64)
        .map_err(|_| column_error(8, format!("invalid reminder_count: {reminder_i64}")))?;

    let outcome: RequestOutcome = parse_json_typed_column(row, 6)?;
    if RequestState::parse(&state_raw) != Some(outcome.state()) {
        return Err(column_error(
            5,
            format!("state column {state_raw} disagrees with stored outcome"),
        ));
    }

    Ok(ApprovalRequest {
        request_id: RequestId(parse_ulid_column(row, 0, "request_id")?),
        audit_id: AuditId(parse_ulid_column(row, 1, "audit_id")?),
        approver: row.get(2)?,
        level,
        priority,
        outcome,
        expires_at: parse_time_column(row, 7)?,
        reminder_count,
        created_at: parse_time_column(row, 9)?,
    })
}

fn parse_ulid_column(
    row: &rusqlite::Row<'_>,
    index: usize,
    name: &str,
) -> rusqlite::Result<ulid::Ulid> {
    let raw: String = row.get(index)?;
    ulid::Ulid::from_string(&raw)
        .map_err(|_| column_error(index, format!("invalid {name} ULID: {raw}")))
}

fn parse_json_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| column_error(index, format!("invalid JSON: {err}")))
}

fn parse_json_typed_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| column_error(index, format!("invalid JSON: {err}")))
}

fn parse_time_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<time::OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| column_error(index, err.to_string()))
}

fn column_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn workflow_err(err: WorkflowError) -> anyhow::Error {
    anyhow::Error::new(err)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
