use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::instance::{InstanceId, InstanceStatus, StepStatus};
use crate::store::StoreError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Submitted,
    StepEntered,
    Decided,
    Delegated,
    StepCompleted,
    Escalated,
    Approved,
    Rejected,
    Cancelled,
    ActionDispatched,
    ActionFailed,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::StepEntered => "step_entered",
            Self::Decided => "decided",
            Self::Delegated => "delegated",
            Self::StepCompleted => "step_completed",
            Self::Escalated => "escalated",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::ActionDispatched => "action_dispatched",
            Self::ActionFailed => "action_failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "submitted" => Some(Self::Submitted),
            "step_entered" => Some(Self::StepEntered),
            "decided" => Some(Self::Decided),
            "delegated" => Some(Self::Delegated),
            "step_completed" => Some(Self::StepCompleted),
            "escalated" => Some(Self::Escalated),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "action_dispatched" => Some(Self::ActionDispatched),
            "action_failed" => Some(Self::ActionFailed),
            _ => None,
        }
    }
}

/// Transition event material produced by the state machine, before the
/// audit chain assigns it a sequence number and hashes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: AuditKind,
    pub actor: String,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(kind: AuditKind, actor: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self { kind, actor: actor.into(), metadata: BTreeMap::new(), occurred_at }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Append-only audit record. Entries for an instance form a hash chain:
/// each entry hashes its material plus the previous entry's hash, and
/// carries an HMAC signature under the engine's signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub instance_id: InstanceId,
    pub seq: u64,
    pub kind: AuditKind,
    pub actor: String,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainVerification {
    pub instance_id: InstanceId,
    pub valid: bool,
    pub verified_entries: usize,
    pub failure_reason: Option<String>,
}

/// Seals event records into chained, signed audit entries.
#[derive(Clone)]
pub struct AuditChain {
    signing_key: Vec<u8>,
}

impl AuditChain {
    pub fn new(signing_key: impl AsRef<[u8]>) -> Self {
        Self { signing_key: signing_key.as_ref().to_vec() }
    }

    pub fn seal(
        &self,
        instance_id: &InstanceId,
        seq: u64,
        prev_hash: Option<String>,
        record: EventRecord,
    ) -> AuditEntry {
        let entry_hash = hash_entry_material(
            instance_id,
            seq,
            record.kind,
            &record.actor,
            &record.metadata,
            record.occurred_at,
            prev_hash.as_deref(),
        );
        let signature = hmac_hex(&self.signing_key, entry_hash.as_bytes());

        AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            instance_id: instance_id.clone(),
            seq,
            kind: record.kind,
            actor: record.actor,
            metadata: record.metadata,
            occurred_at: record.occurred_at,
            prev_hash,
            entry_hash,
            signature,
        }
    }

    /// Walks one instance's history in order, recomputing hashes and
    /// signatures. Any break means the log was mutated after the fact.
    pub fn verify(&self, instance_id: &InstanceId, entries: &[AuditEntry]) -> ChainVerification {
        let mut prev_hash: Option<String> = None;

        for (position, entry) in entries.iter().enumerate() {
            let expected_seq = position as u64 + 1;
            if entry.seq != expected_seq {
                return failed(
                    instance_id,
                    position,
                    format!("entry {} has seq {} (expected {})", position, entry.seq, expected_seq),
                );
            }
            if entry.prev_hash != prev_hash {
                return failed(instance_id, position, format!("entry {position} breaks the chain"));
            }
            let recomputed = hash_entry_material(
                &entry.instance_id,
                entry.seq,
                entry.kind,
                &entry.actor,
                &entry.metadata,
                entry.occurred_at,
                entry.prev_hash.as_deref(),
            );
            if recomputed != entry.entry_hash {
                return failed(instance_id, position, format!("entry {position} hash mismatch"));
            }
            if hmac_hex(&self.signing_key, entry.entry_hash.as_bytes()) != entry.signature {
                return failed(
                    instance_id,
                    position,
                    format!("entry {position} signature mismatch"),
                );
            }
            prev_hash = Some(entry.entry_hash.clone());
        }

        ChainVerification {
            instance_id: instance_id.clone(),
            valid: true,
            verified_entries: entries.len(),
            failure_reason: None,
        }
    }
}

fn failed(instance_id: &InstanceId, verified: usize, reason: String) -> ChainVerification {
    ChainVerification {
        instance_id: instance_id.clone(),
        valid: false,
        verified_entries: verified,
        failure_reason: Some(reason),
    }
}

fn hash_entry_material(
    instance_id: &InstanceId,
    seq: u64,
    kind: AuditKind,
    actor: &str,
    metadata: &BTreeMap<String, String>,
    occurred_at: DateTime<Utc>,
    prev_hash: Option<&str>,
) -> String {
    let metadata_json = serde_json::to_string(metadata).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(instance_id.0.as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(actor.as_bytes());
    hasher.update(metadata_json.as_bytes());
    hasher.update(occurred_at.to_rfc3339().as_bytes());
    hasher.update(prev_hash.unwrap_or("genesis").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn hmac_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length; new_from_slice cannot fail.
        Err(_) => return String::new(),
    };
    mac.update(message);
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Instance state reconstructed purely from the audit trail. Comparing it
/// to the live aggregate is the engine's consistency self-check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayedInstance {
    pub status: Option<InstanceStatus>,
    pub current_step: Option<usize>,
    pub steps: Vec<(String, StepStatus)>,
}

pub fn replay(entries: &[AuditEntry]) -> ReplayedInstance {
    let mut replayed = ReplayedInstance::default();

    for entry in entries {
        match entry.kind {
            AuditKind::Submitted => {
                replayed.status = Some(InstanceStatus::Pending);
            }
            AuditKind::StepEntered => {
                let step_id = entry.metadata.get("step_id").cloned().unwrap_or_default();
                replayed.current_step =
                    entry.metadata.get("step_index").and_then(|raw| raw.parse::<usize>().ok());
                replayed.steps.push((step_id, StepStatus::Pending));
            }
            AuditKind::StepCompleted => {
                let step_id = entry.metadata.get("step_id").map(String::as_str).unwrap_or("");
                let status = entry
                    .metadata
                    .get("status")
                    .and_then(|raw| parse_step_status(raw))
                    .unwrap_or(StepStatus::Approved);
                if let Some(slot) = replayed.steps.iter_mut().rev().find(|(id, _)| id == step_id) {
                    slot.1 = status;
                }
            }
            AuditKind::Approved => {
                replayed.status = Some(InstanceStatus::Approved);
                replayed.current_step = None;
            }
            AuditKind::Rejected => {
                replayed.status = Some(InstanceStatus::Rejected);
                replayed.current_step = None;
            }
            AuditKind::Cancelled => {
                replayed.status = Some(InstanceStatus::Cancelled);
                replayed.current_step = None;
            }
            AuditKind::Decided
            | AuditKind::Delegated
            | AuditKind::Escalated
            | AuditKind::ActionDispatched
            | AuditKind::ActionFailed => {}
        }
    }

    replayed
}

fn parse_step_status(raw: &str) -> Option<StepStatus> {
    match raw {
        "pending" => Some(StepStatus::Pending),
        "approved" => Some(StepStatus::Approved),
        "rejected" => Some(StepStatus::Rejected),
        "skipped" => Some(StepStatus::Skipped),
        _ => None,
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append-only; implementations must never update or delete entries.
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError>;

    /// Entries for one instance ordered by sequence number.
    async fn history(&self, instance_id: &InstanceId) -> Result<Vec<AuditEntry>, StoreError>;

    async fn latest(&self, instance_id: &InstanceId) -> Result<Option<AuditEntry>, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut Vec<AuditEntry>) -> T) -> T {
        match self.entries.lock() {
            Ok(mut entries) => f(&mut entries),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.with_entries(|entries| entries.push(entry));
        Ok(())
    }

    async fn history(&self, instance_id: &InstanceId) -> Result<Vec<AuditEntry>, StoreError> {
        let mut entries = self.with_entries(|entries| {
            entries
                .iter()
                .filter(|entry| &entry.instance_id == instance_id)
                .cloned()
                .collect::<Vec<_>>()
        });
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries)
    }

    async fn latest(&self, instance_id: &InstanceId) -> Result<Option<AuditEntry>, StoreError> {
        let history = self.history(instance_id).await?;
        Ok(history.into_iter().last())
    }
}
